//! Database module
//!
//! This module provides the entity store:
//! - Read pool management
//! - The single store writer
//! - Repository implementations
//! - Database migrations
//! - Data models

pub mod manager;
pub mod migrations;
pub mod models;
pub mod repository;
pub mod writer;

pub use manager::DatabaseManager;
pub use models::{
    Book, BookLocalState, Collection, DownloadQueueSummary, EntityKey, Instance, Library,
    PendingProgress, ReadList, ReadListLocalState, ReadProgress, Series, SeriesLocalState,
};
pub use repository::{
    BookRepository, CollectionRepository, InstanceRepository, LibraryRepository,
    ProgressRepository, ReadListRepository, SeriesRepository,
};
pub use writer::StoreWriter;
