//! Database models
//!
//! Data structures representing mirrored catalog rows and their device-only local state.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::aggregates::AggregateStatus;
use crate::core::download_state::DownloadStatus;
use crate::core::retention::OfflinePolicy;

/// Composite key used for every mirrored entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub instance_id: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(instance_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.instance_id, self.id)
    }
}

/// Timestamps are persisted as epoch milliseconds
pub fn to_millis(ts: &DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Drop sub-millisecond precision so in-memory rows compare equal to stored ones
pub fn storage_precision(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

/// Remote server identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub server_url: String,
    pub username: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub series_last_synced_at: DateTime<Utc>,
    pub books_last_synced_at: DateTime<Utc>,
}

/// Library record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Library {
    pub instance_id: String,
    pub library_id: String,
    pub name: String,
}

/// Series record (mirrored fields only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub instance_id: String,
    pub series_id: String,
    pub library_id: String,
    pub name: String,
    pub url: String,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub books_count: i64,
    pub books_read_count: i64,
    pub books_unread_count: i64,
    pub books_in_progress_count: i64,
    pub metadata: serde_json::Value,
    pub books_metadata: serde_json::Value,
    pub deleted: bool,
    pub oneshot: bool,
}

impl Series {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.instance_id, &self.series_id)
    }
}

/// Device-only state of a series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesLocalState {
    pub instance_id: String,
    pub series_id: String,
    pub download_status: AggregateStatus,
    pub downloaded_books: i64,
    pub pending_books: i64,
    pub downloaded_size: i64,
    pub download_at: Option<DateTime<Utc>>,
    pub offline_policy: OfflinePolicy,
    pub collection_ids: Vec<String>,
}

impl SeriesLocalState {
    pub fn empty(key: &EntityKey) -> Self {
        Self {
            instance_id: key.instance_id.clone(),
            series_id: key.id.clone(),
            download_status: AggregateStatus::NotDownloaded,
            downloaded_books: 0,
            pending_books: 0,
            downloaded_size: 0,
            download_at: None,
            offline_policy: OfflinePolicy::Manual,
            collection_ids: Vec::new(),
        }
    }
}

/// Server-side reading progress of a book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadProgress {
    pub page: i64,
    pub completed: bool,
    pub read_date: Option<DateTime<Utc>>,
    pub last_modified: DateTime<Utc>,
}

/// Book record (mirrored fields only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub instance_id: String,
    pub book_id: String,
    pub series_id: String,
    pub library_id: String,
    pub name: String,
    pub url: String,
    pub number: f64,
    pub number_sort: f64,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: i64,
    pub media: serde_json::Value,
    pub metadata: serde_json::Value,
    pub read_progress: Option<ReadProgress>,
    pub deleted: bool,
    pub oneshot: bool,
    pub series_title: String,
}

impl Book {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.instance_id, &self.book_id)
    }

    pub fn series_key(&self) -> EntityKey {
        EntityKey::new(&self.instance_id, &self.series_id)
    }
}

/// Device-only state of a book
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLocalState {
    pub instance_id: String,
    pub book_id: String,
    pub download_status: DownloadStatus,
    pub downloaded_size: i64,
    pub download_at: Option<DateTime<Utc>>,
    pub pages: Option<Vec<u8>>,
    pub toc: Option<Vec<u8>>,
    pub webpub_manifest: Option<Vec<u8>>,
    pub epub_progression: Option<Vec<u8>>,
    pub read_list_ids: Vec<String>,
}

impl BookLocalState {
    pub fn empty(key: &EntityKey) -> Self {
        Self {
            instance_id: key.instance_id.clone(),
            book_id: key.id.clone(),
            download_status: DownloadStatus::NotDownloaded,
            downloaded_size: 0,
            download_at: None,
            pages: None,
            toc: None,
            webpub_manifest: None,
            epub_progression: None,
            read_list_ids: Vec::new(),
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.instance_id, &self.book_id)
    }

    pub fn clear_artifacts(&mut self) {
        self.pages = None;
        self.toc = None;
        self.webpub_manifest = None;
        self.epub_progression = None;
    }
}

/// Collection record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub instance_id: String,
    pub collection_id: String,
    pub name: String,
    pub ordered: bool,
    pub filtered: bool,
    pub created_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
    pub series_ids: Vec<String>,
}

/// Read list record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadList {
    pub instance_id: String,
    pub read_list_id: String,
    pub name: String,
    pub summary: String,
    pub ordered: bool,
    pub filtered: bool,
    pub created_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
    pub book_ids: Vec<String>,
}

impl ReadList {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.instance_id, &self.read_list_id)
    }
}

/// Device-only state of a read list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadListLocalState {
    pub instance_id: String,
    pub read_list_id: String,
    pub download_status: AggregateStatus,
    pub downloaded_books: i64,
    pub pending_books: i64,
    pub downloaded_size: i64,
    pub download_at: Option<DateTime<Utc>>,
    pub retain_offline: bool,
}

impl ReadListLocalState {
    pub fn empty(key: &EntityKey) -> Self {
        Self {
            instance_id: key.instance_id.clone(),
            read_list_id: key.id.clone(),
            download_status: AggregateStatus::NotDownloaded,
            downloaded_books: 0,
            pending_books: 0,
            downloaded_size: 0,
            download_at: None,
            retain_offline: false,
        }
    }
}

/// Reading progress waiting to be uploaded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingProgress {
    pub id: String,
    pub instance_id: String,
    pub book_id: String,
    pub page: i64,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub progression: Option<Vec<u8>>,
}

/// Book counts per download status for one instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadQueueSummary {
    pub pending: i64,
    pub downloading: i64,
    pub downloaded: i64,
    pub failed: i64,
    pub downloaded_size: i64,
}
