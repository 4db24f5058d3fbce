//! Per-book download lifecycle
//!
//! `NotDownloaded -> Pending -> Downloading -> Downloaded`, with `Failed` reachable from the
//! in-flight states. This module only validates and records; it never touches media bytes.

use crate::core::error::{MirrorError, Result};
use crate::db::models::{storage_precision, BookLocalState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Download status of a single book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum DownloadStatus {
    NotDownloaded,
    Pending,
    Downloading { progress: f64 },
    Downloaded,
    Failed { error: String },
}

impl DownloadStatus {
    /// Raw value stored in `status_raw`
    pub fn raw(&self) -> &'static str {
        match self {
            DownloadStatus::NotDownloaded => "notDownloaded",
            DownloadStatus::Pending => "pending",
            DownloadStatus::Downloading { .. } => "downloading",
            DownloadStatus::Downloaded => "downloaded",
            DownloadStatus::Failed { .. } => "failed",
        }
    }

    /// Rebuild a status from its stored columns
    pub fn from_parts(raw: &str, progress: Option<f64>, error: Option<String>) -> Result<Self> {
        match raw {
            "notDownloaded" => Ok(DownloadStatus::NotDownloaded),
            "pending" => Ok(DownloadStatus::Pending),
            "downloading" => Ok(DownloadStatus::Downloading {
                progress: progress.unwrap_or(0.0),
            }),
            "downloaded" => Ok(DownloadStatus::Downloaded),
            "failed" => Ok(DownloadStatus::Failed {
                error: error.unwrap_or_default(),
            }),
            other => Err(MirrorError::ValidationError(format!(
                "unknown download status: {}",
                other
            ))),
        }
    }

    pub fn progress(&self) -> Option<f64> {
        match self {
            DownloadStatus::Downloading { progress } => Some(*progress),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            DownloadStatus::Failed { error } => Some(error.as_str()),
            _ => None,
        }
    }

    pub fn is_downloaded(&self) -> bool {
        matches!(self, DownloadStatus::Downloaded)
    }

    /// Pending and Downloading both count as pending in aggregates
    pub fn is_pending(&self) -> bool {
        matches!(self, DownloadStatus::Pending | DownloadStatus::Downloading { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DownloadStatus::Failed { .. })
    }
}

/// A requested status change with its optional recorded values
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    pub status: DownloadStatus,
    pub downloaded_size: Option<i64>,
    pub download_at: Option<DateTime<Utc>>,
}

impl TransitionRequest {
    pub fn to(status: DownloadStatus) -> Self {
        Self {
            status,
            downloaded_size: None,
            download_at: None,
        }
    }

    pub fn downloaded(size: i64, at: Option<DateTime<Utc>>) -> Self {
        Self {
            status: DownloadStatus::Downloaded,
            downloaded_size: Some(size),
            download_at: at,
        }
    }

    pub fn queued_at(at: DateTime<Utc>) -> Self {
        Self {
            status: DownloadStatus::Pending,
            downloaded_size: None,
            download_at: Some(at),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::to(DownloadStatus::Failed {
            error: error.into(),
        })
    }
}

/// Result of a transition request as seen by callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransitionOutcome {
    Applied,
    Unchanged,
    Rejected,
    MissingEntity,
}

/// Validate `from -> to`. `Ok(false)` means the request is an accepted no-op.
fn is_allowed(from: &DownloadStatus, to: &DownloadStatus) -> Result<bool> {
    use DownloadStatus::*;

    let allowed = match (from, to) {
        (NotDownloaded, NotDownloaded) | (Pending, Pending) => return Ok(false),
        (NotDownloaded, Pending) => true,
        (Pending, Downloading { .. } | Downloaded | Failed { .. } | NotDownloaded) => true,
        (Downloading { .. }, _) => true,
        (Downloaded, NotDownloaded | Downloaded) => true,
        (Failed { .. }, Pending | NotDownloaded | Failed { .. }) => true,
        _ => false,
    };

    if allowed {
        Ok(true)
    } else {
        Err(MirrorError::InvalidTransition {
            from: from.raw().to_string(),
            to: to.raw().to_string(),
        })
    }
}

/// Compute the local state after `request`.
///
/// Returns `Ok(None)` for an accepted request that changes nothing and
/// `MirrorError::InvalidTransition` for a transition the lifecycle forbids.
pub fn apply_transition(
    state: &BookLocalState,
    request: &TransitionRequest,
    now: DateTime<Utc>,
) -> Result<Option<BookLocalState>> {
    if !is_allowed(&state.download_status, &request.status)? {
        return Ok(None);
    }

    let mut next = state.clone();
    let stamp = request.download_at.map(storage_precision);

    match &request.status {
        DownloadStatus::NotDownloaded => {
            next.download_status = DownloadStatus::NotDownloaded;
            next.downloaded_size = 0;
            next.download_at = None;
            next.clear_artifacts();
        }
        DownloadStatus::Pending => {
            next.download_status = DownloadStatus::Pending;
            next.downloaded_size = 0;
            next.download_at = Some(stamp.unwrap_or(now));
        }
        DownloadStatus::Downloading { progress } => {
            let progress = if progress.is_finite() {
                progress.clamp(0.0, 1.0)
            } else {
                0.0
            };
            next.download_status = DownloadStatus::Downloading { progress };
            if next.download_at.is_none() {
                next.download_at = Some(stamp.unwrap_or(now));
            }
        }
        DownloadStatus::Downloaded if state.download_status.is_downloaded() => {
            if let Some(size) = request.downloaded_size {
                next.downloaded_size = size.max(0);
            }
            if let Some(at) = stamp {
                next.download_at = Some(at);
            }
        }
        DownloadStatus::Downloaded => {
            next.download_status = DownloadStatus::Downloaded;
            next.downloaded_size = request.downloaded_size.unwrap_or(0).max(0);
            next.download_at = Some(stamp.unwrap_or(now));
            next.clear_artifacts();
        }
        DownloadStatus::Failed { error } => {
            next.download_status = DownloadStatus::Failed {
                error: error.clone(),
            };
            next.downloaded_size = 0;
        }
    }

    if next == *state {
        Ok(None)
    } else {
        Ok(Some(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::EntityKey;
    use chrono::Duration;

    fn state(status: DownloadStatus) -> BookLocalState {
        let mut state = BookLocalState::empty(&EntityKey::new("inst", "b1"));
        state.download_status = status;
        state
    }

    fn now() -> DateTime<Utc> {
        storage_precision(Utc::now())
    }

    #[test]
    fn test_raw_roundtrip() {
        for status in [
            DownloadStatus::NotDownloaded,
            DownloadStatus::Pending,
            DownloadStatus::Downloading { progress: 0.5 },
            DownloadStatus::Downloaded,
            DownloadStatus::Failed { error: "disk".into() },
        ] {
            let parsed = DownloadStatus::from_parts(
                status.raw(),
                status.progress(),
                status.error().map(str::to_string),
            )
            .unwrap();
            assert_eq!(parsed, status);
        }
        assert!(DownloadStatus::from_parts("bogus", None, None).is_err());
    }

    #[test]
    fn test_happy_path() {
        let now = now();
        let s = state(DownloadStatus::NotDownloaded);
        let s = apply_transition(&s, &TransitionRequest::to(DownloadStatus::Pending), now)
            .unwrap()
            .unwrap();
        assert_eq!(s.download_at, Some(now));

        let s = apply_transition(
            &s,
            &TransitionRequest::to(DownloadStatus::Downloading { progress: 0.2 }),
            now,
        )
        .unwrap()
        .unwrap();
        assert_eq!(s.download_status.progress(), Some(0.2));

        let mut with_artifacts = s.clone();
        with_artifacts.pages = Some(vec![1, 2, 3]);
        let done = apply_transition(&with_artifacts, &TransitionRequest::downloaded(4096, None), now)
            .unwrap()
            .unwrap();
        assert!(done.download_status.is_downloaded());
        assert_eq!(done.downloaded_size, 4096);
        assert_eq!(done.pages, None);
        assert_eq!(done.download_at, Some(now));
    }

    #[test]
    fn test_rejects_skipping_the_queue() {
        let err = apply_transition(
            &state(DownloadStatus::NotDownloaded),
            &TransitionRequest::downloaded(1, None),
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, MirrorError::InvalidTransition { .. }));

        let err = apply_transition(
            &state(DownloadStatus::Failed { error: "x".into() }),
            &TransitionRequest::to(DownloadStatus::Downloading { progress: 0.1 }),
            now(),
        )
        .unwrap_err();
        assert!(matches!(err, MirrorError::InvalidTransition { .. }));

        assert!(apply_transition(
            &state(DownloadStatus::Downloaded),
            &TransitionRequest::to(DownloadStatus::Pending),
            now(),
        )
        .is_err());
    }

    #[test]
    fn test_failed_exits() {
        let failed = state(DownloadStatus::Failed { error: "timeout".into() });
        let retried = apply_transition(&failed, &TransitionRequest::to(DownloadStatus::Pending), now())
            .unwrap()
            .unwrap();
        assert_eq!(retried.download_status, DownloadStatus::Pending);

        let cancelled = apply_transition(
            &failed,
            &TransitionRequest::to(DownloadStatus::NotDownloaded),
            now(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(cancelled.download_status, DownloadStatus::NotDownloaded);
        assert_eq!(cancelled.download_at, None);
    }

    #[test]
    fn test_self_transitions() {
        let pending = state(DownloadStatus::Pending);
        assert!(apply_transition(&pending, &TransitionRequest::to(DownloadStatus::Pending), now())
            .unwrap()
            .is_none());

        let downloading = state(DownloadStatus::Downloading { progress: 0.4 });
        let next = apply_transition(
            &downloading,
            &TransitionRequest::to(DownloadStatus::Downloading { progress: 3.0 }),
            now(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(next.download_status.progress(), Some(1.0));

        let mut downloaded = state(DownloadStatus::Downloaded);
        downloaded.downloaded_size = 10;
        downloaded.pages = Some(vec![9]);
        let refreshed = apply_transition(&downloaded, &TransitionRequest::downloaded(20, None), now())
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.downloaded_size, 20);
        assert_eq!(refreshed.pages, Some(vec![9]));
    }

    #[test]
    fn test_repeated_failure_keeps_latest_error() {
        let failed = state(DownloadStatus::Failed { error: "timeout".into() });
        let next = apply_transition(&failed, &TransitionRequest::failed("disk full"), now())
            .unwrap()
            .unwrap();
        assert_eq!(next.download_status.error(), Some("disk full"));

        assert!(apply_transition(&next, &TransitionRequest::failed("disk full"), now())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_removal_clears_everything() {
        let now = now();
        let mut downloaded = state(DownloadStatus::Downloaded);
        downloaded.downloaded_size = 100;
        downloaded.download_at = Some(now - Duration::hours(1));
        downloaded.toc = Some(vec![1]);
        downloaded.epub_progression = Some(vec![2]);

        let removed = apply_transition(
            &downloaded,
            &TransitionRequest::to(DownloadStatus::NotDownloaded),
            now,
        )
        .unwrap()
        .unwrap();
        assert_eq!(removed.downloaded_size, 0);
        assert_eq!(removed.download_at, None);
        assert_eq!(removed.toc, None);
        assert_eq!(removed.epub_progression, None);
    }

    #[test]
    fn test_cancel_downloading_requeues() {
        let now = now();
        let downloading = state(DownloadStatus::Downloading { progress: 0.7 });
        let cancelled = apply_transition(&downloading, &TransitionRequest::queued_at(now), now)
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.download_status, DownloadStatus::Pending);
        assert_eq!(cancelled.download_at, Some(now));
    }
}
