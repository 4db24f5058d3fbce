//! Core engine module
//!
//! This module provides the offline mirror engine including:
//! - Mirror upserts of remote catalog snapshots
//! - The per-book download state machine
//! - Rolling download and reading aggregates
//! - Retention policy evaluation
//! - The reading progress outbox
//! - Configuration management
//! - Structured logging system
//! - Error handling and type system

pub mod aggregates;
pub mod collaborators;
pub mod config;
pub mod download_state;
pub mod error;
pub mod logging;
pub mod mirror;
pub mod offline_store;
pub mod outbox;
pub mod retention;
pub mod session;
pub mod snapshots;

pub use aggregates::{AggregateStatus, ReadingCounters, ReadingState};
pub use collaborators::{
    DownloadScheduler, EvictionCandidate, EvictionReason, EvictionSink, NoopCollaborator,
    RecordingCollaborator,
};
pub use config::Config;
pub use download_state::{DownloadStatus, TransitionOutcome, TransitionRequest};
pub use error::{MirrorError, Result};
pub use logging::Logger;
pub use mirror::{BatchReport, UpsertOutcome};
pub use offline_store::OfflineStore;
pub use outbox::ProgressUpdate;
pub use retention::{OfflinePolicy, RetentionSettings, CLEANUP_GRACE_PERIOD};
pub use session::{Decisions, RepairReport, ToggleOutcome, WriteSession};
