//! Collaborator interfaces
//!
//! The store decides what should be downloaded or evicted; these traits are how the
//! download worker and the media deletion layer hear about it. They are called after the
//! deciding transaction has committed, never from inside the writer.

use crate::db::models::EntityKey;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

/// Why a downloaded book should leave the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EvictionReason {
    /// Read and past the cleanup grace period
    CleanupRead,
    SeriesRemoved,
    ReadListRemoved,
    ManualDelete,
    /// The book no longer exists on the server
    EntityRemoved,
}

/// A book whose media bytes may be deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictionCandidate {
    pub book: EntityKey,
    pub downloaded_size: i64,
    pub reason: EvictionReason,
}

/// Receives books that were just queued for download
#[async_trait]
pub trait DownloadScheduler: Send + Sync {
    async fn schedule(&self, instance_id: &str, book_ids: &[String]);
}

/// Receives books whose downloaded media should be removed
///
/// Once the bytes are gone the sink reports back with a `NotDownloaded` transition.
#[async_trait]
pub trait EvictionSink: Send + Sync {
    async fn evict(&self, candidates: &[EvictionCandidate]);
}

/// Collaborator that ignores every decision
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollaborator;

#[async_trait]
impl DownloadScheduler for NoopCollaborator {
    async fn schedule(&self, _instance_id: &str, _book_ids: &[String]) {}
}

#[async_trait]
impl EvictionSink for NoopCollaborator {
    async fn evict(&self, _candidates: &[EvictionCandidate]) {}
}

/// Collaborator that keeps every decision it receives
#[derive(Debug, Default)]
pub struct RecordingCollaborator {
    scheduled: Mutex<Vec<(String, Vec<String>)>>,
    evicted: Mutex<Vec<EvictionCandidate>>,
}

impl RecordingCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scheduled book ids in announcement order
    pub async fn scheduled_books(&self) -> Vec<String> {
        self.scheduled
            .lock()
            .await
            .iter()
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }

    pub async fn evicted(&self) -> Vec<EvictionCandidate> {
        self.evicted.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.scheduled.lock().await.clear();
        self.evicted.lock().await.clear();
    }
}

#[async_trait]
impl DownloadScheduler for RecordingCollaborator {
    async fn schedule(&self, instance_id: &str, book_ids: &[String]) {
        self.scheduled
            .lock()
            .await
            .push((instance_id.to_string(), book_ids.to_vec()));
    }
}

#[async_trait]
impl EvictionSink for RecordingCollaborator {
    async fn evict(&self, candidates: &[EvictionCandidate]) {
        self.evicted.lock().await.extend_from_slice(candidates);
    }
}
