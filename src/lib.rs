//! Shelf Mirror Library
//!
//! Offline mirror and download-retention engine for a remote comics and ebook library server:
//! mirrors the remote catalog into SQLite, tracks per-book downloads, keeps series and read-list
//! aggregates in step and decides what should be fetched or evicted.

pub mod core;
pub mod db;

// Re-export commonly used types
pub use crate::core::{
    Config, DownloadScheduler, DownloadStatus, EvictionSink, MirrorError, OfflinePolicy,
    OfflineStore, ProgressUpdate, TransitionRequest,
};
pub use db::{DatabaseManager, EntityKey};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
