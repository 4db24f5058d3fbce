//! Retention policy evaluation
//!
//! Decides which books of a series should be queued for download and which should leave the
//! device. Evaluation is a pure function of the policy, the series' books and the settings;
//! the store applies the resulting plan.

use crate::core::config::OfflineConfig;
use crate::core::download_state::DownloadStatus;
use crate::core::error::{MirrorError, Result};
use crate::db::models::{Book, BookLocalState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Time a finished download is kept after its book was read, before cleanup may evict it
pub const CLEANUP_GRACE_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Per-series offline policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum OfflinePolicy {
    Manual,
    UnreadOnly { limit: u32 },
    UnreadOnlyAndCleanupRead { limit: u32 },
    All,
}

impl OfflinePolicy {
    pub fn raw(&self) -> &'static str {
        match self {
            OfflinePolicy::Manual => "manual",
            OfflinePolicy::UnreadOnly { .. } => "unreadOnly",
            OfflinePolicy::UnreadOnlyAndCleanupRead { .. } => "unreadOnlyAndCleanupRead",
            OfflinePolicy::All => "all",
        }
    }

    /// 0 means unlimited
    pub fn limit(&self) -> u32 {
        match self {
            OfflinePolicy::UnreadOnly { limit } | OfflinePolicy::UnreadOnlyAndCleanupRead { limit } => *limit,
            OfflinePolicy::Manual | OfflinePolicy::All => 0,
        }
    }

    pub fn from_parts(raw: &str, limit: u32) -> Result<Self> {
        match raw {
            "manual" => Ok(OfflinePolicy::Manual),
            "unreadOnly" => Ok(OfflinePolicy::UnreadOnly { limit }),
            "unreadOnlyAndCleanupRead" => Ok(OfflinePolicy::UnreadOnlyAndCleanupRead { limit }),
            "all" => Ok(OfflinePolicy::All),
            other => Err(MirrorError::ValidationError(format!(
                "unknown offline policy: {}",
                other
            ))),
        }
    }

    pub fn cleans_up_read(&self) -> bool {
        matches!(self, OfflinePolicy::UnreadOnlyAndCleanupRead { .. })
    }
}

/// Tunables passed into every evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionSettings {
    pub cleanup_grace: Duration,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            cleanup_grace: CLEANUP_GRACE_PERIOD,
        }
    }
}

impl From<&OfflineConfig> for RetentionSettings {
    fn from(config: &OfflineConfig) -> Self {
        Self {
            cleanup_grace: config.cleanup_grace(),
        }
    }
}

/// What the evaluator needs to know about one book
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionBook {
    pub book_id: String,
    pub number_sort: f64,
    pub completed: bool,
    pub deleted: bool,
    pub status: DownloadStatus,
    pub download_at: Option<DateTime<Utc>>,
}

impl RetentionBook {
    pub fn from_member(book: &Book, state: &BookLocalState) -> Self {
        Self {
            book_id: book.book_id.clone(),
            number_sort: book.number_sort,
            completed: book.read_progress.as_ref().map(|p| p.completed).unwrap_or(false),
            deleted: book.deleted,
            status: state.download_status.clone(),
            download_at: state.download_at,
        }
    }
}

/// Decisions for one series
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetentionPlan {
    /// Books to queue, with their queue timestamps
    pub enqueue: Vec<(String, DateTime<Utc>)>,
    /// Queued books to drop from the queue
    pub dequeue: Vec<String>,
    /// Downloaded books whose bytes may be removed
    pub evict: Vec<String>,
}

impl RetentionPlan {
    pub fn is_empty(&self) -> bool {
        self.enqueue.is_empty() && self.dequeue.is_empty() && self.evict.is_empty()
    }
}

fn reading_order(books: &[RetentionBook]) -> Vec<&RetentionBook> {
    let mut ordered: Vec<&RetentionBook> = books.iter().collect();
    ordered.sort_by(|a, b| {
        a.number_sort
            .total_cmp(&b.number_sort)
            .then_with(|| a.book_id.cmp(&b.book_id))
    });
    ordered
}

/// Ids of the books the policy wants on the device
pub fn targets(policy: &OfflinePolicy, books: &[RetentionBook]) -> HashSet<String> {
    let candidates = reading_order(books).into_iter().filter(|b| !b.deleted);

    match policy {
        OfflinePolicy::Manual => HashSet::new(),
        OfflinePolicy::All => candidates.map(|b| b.book_id.clone()).collect(),
        OfflinePolicy::UnreadOnly { limit } | OfflinePolicy::UnreadOnlyAndCleanupRead { limit } => {
            let unread = candidates.filter(|b| !b.completed);
            let take = if *limit > 0 { *limit as usize } else { usize::MAX };
            unread.take(take).map(|b| b.book_id.clone()).collect()
        }
    }
}

/// True once `settings.cleanup_grace` has elapsed since `download_at`
pub fn cleanup_due(download_at: Option<DateTime<Utc>>, settings: &RetentionSettings, now: DateTime<Utc>) -> bool {
    match download_at {
        Some(at) => (now - at)
            .to_std()
            .map(|elapsed| elapsed >= settings.cleanup_grace)
            .unwrap_or(false),
        None => true,
    }
}

/// Evaluate a series policy over its books
pub fn evaluate(
    policy: &OfflinePolicy,
    books: &[RetentionBook],
    settings: &RetentionSettings,
    now: DateTime<Utc>,
) -> RetentionPlan {
    let mut plan = RetentionPlan::default();
    if *policy == OfflinePolicy::Manual {
        return plan;
    }

    let wanted = targets(policy, books);
    for book in reading_order(books) {
        if wanted.contains(&book.book_id) {
            if book.status == DownloadStatus::NotDownloaded {
                let queued_at = now + chrono::Duration::milliseconds(plan.enqueue.len() as i64);
                plan.enqueue.push((book.book_id.clone(), queued_at));
            }
            continue;
        }

        if policy.cleans_up_read() && book.completed {
            if book.status.is_pending() {
                plan.dequeue.push(book.book_id.clone());
            } else if book.status.is_downloaded() && cleanup_due(book.download_at, settings, now) {
                plan.evict.push(book.book_id.clone());
            }
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn book(id: &str, n: f64, completed: bool, status: DownloadStatus) -> RetentionBook {
        RetentionBook {
            book_id: id.to_string(),
            number_sort: n,
            completed,
            deleted: false,
            status,
            download_at: None,
        }
    }

    fn series(count: usize) -> Vec<RetentionBook> {
        (1..=count)
            .rev()
            .map(|i| book(&format!("b{}", i), i as f64, false, DownloadStatus::NotDownloaded))
            .collect()
    }

    #[test]
    fn test_policy_raw_roundtrip() {
        for policy in [
            OfflinePolicy::Manual,
            OfflinePolicy::UnreadOnly { limit: 3 },
            OfflinePolicy::UnreadOnlyAndCleanupRead { limit: 0 },
            OfflinePolicy::All,
        ] {
            assert_eq!(OfflinePolicy::from_parts(policy.raw(), policy.limit()).unwrap(), policy);
        }
        assert!(OfflinePolicy::from_parts("sometimes", 0).is_err());
    }

    #[test]
    fn test_manual_does_nothing() {
        let plan = evaluate(&OfflinePolicy::Manual, &series(4), &RetentionSettings::default(), now());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_all_enqueues_in_reading_order() {
        let plan = evaluate(&OfflinePolicy::All, &series(3), &RetentionSettings::default(), now());
        let ids: Vec<_> = plan.enqueue.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2", "b3"]);
        assert!(plan.enqueue.windows(2).all(|w| w[0].1 < w[1].1));
    }

    #[test]
    fn test_unread_only_respects_limit() {
        let mut books = series(10);
        books.iter_mut().find(|b| b.book_id == "b1").unwrap().completed = true;
        books.iter_mut().find(|b| b.book_id == "b2").unwrap().status = DownloadStatus::Downloaded;

        let policy = OfflinePolicy::UnreadOnly { limit: 3 };
        let wanted = targets(&policy, &books);
        assert_eq!(
            wanted,
            ["b2", "b3", "b4"].iter().map(|s| s.to_string()).collect::<HashSet<_>>()
        );

        let plan = evaluate(&policy, &books, &RetentionSettings::default(), now());
        let ids: Vec<_> = plan.enqueue.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["b3", "b4"]);
        assert!(plan.evict.is_empty());
    }

    #[test]
    fn test_failed_and_queued_books_are_not_requeued() {
        let books = vec![
            book("b1", 1.0, false, DownloadStatus::Failed { error: "x".into() }),
            book("b2", 2.0, false, DownloadStatus::Pending),
            book("b3", 3.0, false, DownloadStatus::Downloading { progress: 0.5 }),
        ];
        let plan = evaluate(&OfflinePolicy::All, &books, &RetentionSettings::default(), now());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_cleanup_waits_for_grace_period() {
        let mut read_recently = book("b1", 1.0, true, DownloadStatus::Downloaded);
        read_recently.download_at = Some(now() - chrono::Duration::minutes(1));
        let mut read_long_ago = book("b2", 2.0, true, DownloadStatus::Downloaded);
        read_long_ago.download_at = Some(now() - chrono::Duration::minutes(10));
        let queued_but_read = book("b3", 3.0, true, DownloadStatus::Pending);

        let books = vec![read_recently, read_long_ago, queued_but_read];
        let plan = evaluate(
            &OfflinePolicy::UnreadOnlyAndCleanupRead { limit: 0 },
            &books,
            &RetentionSettings::default(),
            now(),
        );
        assert_eq!(plan.evict, vec!["b2".to_string()]);
        assert_eq!(plan.dequeue, vec!["b3".to_string()]);

        let plan = evaluate(&OfflinePolicy::UnreadOnly { limit: 0 }, &books, &RetentionSettings::default(), now());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_grace_period_is_configurable() {
        let settings = RetentionSettings { cleanup_grace: Duration::from_secs(0) };
        assert!(cleanup_due(Some(now()), &settings, now()));
        assert!(!cleanup_due(Some(now()), &RetentionSettings::default(), now()));
        assert!(cleanup_due(None, &RetentionSettings::default(), now()));
    }

    #[test]
    fn test_deleted_books_are_never_targeted() {
        let mut books = series(2);
        books[0].deleted = true;
        let wanted = targets(&OfflinePolicy::All, &books);
        assert_eq!(wanted.len(), 1);
    }
}
