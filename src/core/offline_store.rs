//! Offline store facade
//!
//! The async API collaborators talk to. Every mutation is decided on the writer thread inside its
//! own transaction; the resulting decisions are handed to the download scheduler and the eviction
//! sink once the transaction has committed. Queries go through the read pool.

use crate::core::collaborators::{DownloadScheduler, EvictionSink, NoopCollaborator};
use crate::core::config::{DatabaseConfig, OfflineConfig};
use crate::core::download_state::{DownloadStatus, TransitionOutcome, TransitionRequest};
use crate::core::error::{MirrorError, Result};
use crate::core::mirror::{upsert_batch, BatchReport, SeriesRecompute, UpsertOutcome};
use crate::core::outbox::ProgressUpdate;
use crate::core::retention::{OfflinePolicy, RetentionSettings};
use crate::core::session::{run_in_transaction, Decisions, RepairReport, ToggleOutcome, WriteSession};
use crate::core::snapshots::{
    BookSnapshot, CollectionSnapshot, InstanceSnapshot, LibrarySnapshot, ReadListSnapshot,
    SeriesSnapshot,
};
use crate::db::models::{
    Book, BookLocalState, Collection, DownloadQueueSummary, EntityKey, Instance, Library,
    PendingProgress, ReadList, ReadListLocalState, Series, SeriesLocalState,
};
use crate::db::repository::{
    BookRepository, CollectionRepository, InstanceRepository, LibraryRepository, ProgressRepository,
    ReadListRepository, SeriesRepository,
};
use crate::db::{DatabaseManager, StoreWriter};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// Offline mirror and download-retention engine
pub struct OfflineStore {
    db: DatabaseManager,
    writer: StoreWriter,
    settings: RetentionSettings,
    scheduler: Arc<dyn DownloadScheduler>,
    evictions: Arc<dyn EvictionSink>,
    paused: AtomicBool,
}

impl OfflineStore {
    /// Open (and migrate) the store and start its writer
    pub fn open(
        database: &DatabaseConfig,
        offline: &OfflineConfig,
        scheduler: Arc<dyn DownloadScheduler>,
        evictions: Arc<dyn EvictionSink>,
    ) -> Result<Self> {
        let pool_size = u32::try_from(database.connection_pool_size)
            .map_err(|_| MirrorError::ConfigError("connection_pool_size is too large".to_string()))?;
        let db = DatabaseManager::new(
            &database.path,
            pool_size,
            Duration::from_millis(database.busy_timeout),
        )?;
        let writer = StoreWriter::spawn(db.open_writer_connection()?, offline.writer_queue_depth)?;

        info!(
            path = %db.db_path().display(),
            pool_size = db.pool_size(),
            cleanup_grace_secs = offline.cleanup_grace_seconds,
            downloads_paused = offline.downloads_paused,
            "Offline store opened"
        );

        Ok(Self {
            db,
            writer,
            settings: RetentionSettings::from(offline),
            scheduler,
            evictions,
            paused: AtomicBool::new(offline.downloads_paused),
        })
    }

    /// Open the store without collaborators, for maintenance tools
    pub fn open_detached(database: &DatabaseConfig, offline: &OfflineConfig) -> Result<Self> {
        let noop = Arc::new(NoopCollaborator);
        Self::open(database, offline, noop.clone(), noop)
    }

    pub fn settings(&self) -> &RetentionSettings {
        &self.settings
    }

    /// Run a write session on the writer and act on its decisions after commit
    async fn mutate<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteSession<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let settings = self.settings;
        let result = self
            .writer
            .submit(move |conn| run_in_transaction(conn, settings, f))
            .await;
        self.settle(op, result).await
    }

    /// Run a batch on the writer; the batch manages its own transactions
    async fn batch<F>(&self, op: &'static str, f: F) -> Result<BatchReport>
    where
        F: FnOnce(&mut Connection, RetentionSettings) -> Result<(BatchReport, Decisions)> + Send + 'static,
    {
        let settings = self.settings;
        let result = self.writer.submit(move |conn| f(conn, settings)).await;
        self.settle(op, result).await
    }

    async fn settle<T>(&self, op: &'static str, result: Result<(T, Decisions)>) -> Result<T> {
        match result {
            Ok((value, decisions)) => {
                self.dispatch(decisions).await;
                Ok(value)
            }
            Err(e) => {
                error!(
                    op,
                    error = %e,
                    error_type = e.error_type(),
                    retryable = e.is_retryable(),
                    "Store operation failed"
                );
                Err(e)
            }
        }
    }

    async fn dispatch(&self, decisions: Decisions) {
        if decisions.is_empty() {
            return;
        }

        if !decisions.scheduled.is_empty() {
            if self.paused.load(Ordering::SeqCst) {
                debug!(books = decisions.scheduled.len(), "Downloads paused, scheduling deferred");
            } else {
                for (instance_id, book_ids) in decisions.scheduled_by_instance() {
                    self.scheduler.schedule(&instance_id, &book_ids).await;
                }
            }
        }

        if !decisions.evictions.is_empty() {
            debug!(books = decisions.evictions.len(), "Reporting eviction candidates");
            self.evictions.evict(&decisions.evictions).await;
        }
    }

    // Mirror

    pub async fn upsert_instance(&self, snapshot: InstanceSnapshot) -> Result<Instance> {
        self.mutate("upsert_instance", move |session| session.upsert_instance(snapshot))
            .await
    }

    pub async fn update_sync_watermarks(
        &self,
        instance_id: &str,
        series_synced_at: Option<DateTime<Utc>>,
        books_synced_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let instance_id = instance_id.to_string();
        self.mutate("update_sync_watermarks", move |session| {
            session.update_sync_watermarks(&instance_id, series_synced_at, books_synced_at)
        })
        .await
    }

    pub async fn replace_libraries(&self, instance_id: &str, snapshots: Vec<LibrarySnapshot>) -> Result<usize> {
        let instance_id = instance_id.to_string();
        let rows: Vec<Library> = snapshots.into_iter().map(|s| s.into_row(&instance_id)).collect();
        self.mutate("replace_libraries", move |session| {
            session.replace_libraries(&instance_id, &rows)
        })
        .await
    }

    pub async fn upsert_series(&self, instance_id: &str, snapshot: SeriesSnapshot) -> Result<UpsertOutcome> {
        let row = snapshot.into_row(instance_id);
        self.mutate("upsert_series", move |session| {
            let existing = SeriesRepository::new(session.conn()).find(&row.key())?;
            let mut recompute = SeriesRecompute::new();
            let outcome = session.upsert_series(&row, existing.as_ref(), &mut recompute)?;
            session.flush_recompute(recompute)?;
            Ok(outcome)
        })
        .await
    }

    pub async fn upsert_series_batch(&self, instance_id: &str, snapshots: Vec<SeriesSnapshot>) -> Result<BatchReport> {
        let instance_id = instance_id.to_string();
        let rows: Vec<Series> = snapshots.into_iter().map(|s| s.into_row(&instance_id)).collect();
        self.batch("upsert_series_batch", move |conn, settings| {
            let ids: Vec<String> = rows.iter().map(|r| r.series_id.clone()).collect();
            let existing = SeriesRepository::new(conn).find_many(&instance_id, &ids)?;
            upsert_batch(
                conn,
                settings,
                "series",
                rows,
                existing,
                |s: &Series| s.series_id.as_str(),
                |session, row, previous, recompute| session.upsert_series(row, previous, recompute),
            )
        })
        .await
    }

    pub async fn upsert_book(&self, instance_id: &str, snapshot: BookSnapshot) -> Result<UpsertOutcome> {
        let row = snapshot.into_row(instance_id);
        self.mutate("upsert_book", move |session| {
            let existing = BookRepository::new(session.conn()).find(&row.key())?;
            let mut recompute = SeriesRecompute::new();
            let outcome = session.upsert_book(&row, existing.as_ref(), &mut recompute)?;
            session.flush_recompute(recompute)?;
            Ok(outcome)
        })
        .await
    }

    pub async fn upsert_book_batch(&self, instance_id: &str, snapshots: Vec<BookSnapshot>) -> Result<BatchReport> {
        let instance_id = instance_id.to_string();
        let rows: Vec<Book> = snapshots.into_iter().map(|s| s.into_row(&instance_id)).collect();
        self.batch("upsert_book_batch", move |conn, settings| {
            let ids: Vec<String> = rows.iter().map(|r| r.book_id.clone()).collect();
            let existing = BookRepository::new(conn).find_many(&instance_id, &ids)?;
            upsert_batch(
                conn,
                settings,
                "book",
                rows,
                existing,
                |b: &Book| b.book_id.as_str(),
                |session, row, previous, recompute| session.upsert_book(row, previous, recompute),
            )
        })
        .await
    }

    pub async fn upsert_collection(&self, instance_id: &str, snapshot: CollectionSnapshot) -> Result<UpsertOutcome> {
        let row = snapshot.into_row(instance_id);
        self.mutate("upsert_collection", move |session| {
            let key = EntityKey::new(&row.instance_id, &row.collection_id);
            let existing = CollectionRepository::new(session.conn()).find(&key)?;
            session.upsert_collection(&row, existing.as_ref())
        })
        .await
    }

    pub async fn upsert_collection_batch(
        &self,
        instance_id: &str,
        snapshots: Vec<CollectionSnapshot>,
    ) -> Result<BatchReport> {
        let instance_id = instance_id.to_string();
        let rows: Vec<Collection> = snapshots.into_iter().map(|s| s.into_row(&instance_id)).collect();
        self.batch("upsert_collection_batch", move |conn, settings| {
            let ids: Vec<String> = rows.iter().map(|r| r.collection_id.clone()).collect();
            let existing = CollectionRepository::new(conn).find_many(&instance_id, &ids)?;
            upsert_batch(
                conn,
                settings,
                "collection",
                rows,
                existing,
                |c: &Collection| c.collection_id.as_str(),
                |session, row, previous, _| session.upsert_collection(row, previous),
            )
        })
        .await
    }

    pub async fn upsert_read_list(&self, instance_id: &str, snapshot: ReadListSnapshot) -> Result<UpsertOutcome> {
        let row = snapshot.into_row(instance_id);
        self.mutate("upsert_read_list", move |session| {
            let existing = ReadListRepository::new(session.conn()).find(&row.key())?;
            session.upsert_read_list(&row, existing.as_ref())
        })
        .await
    }

    pub async fn upsert_read_list_batch(
        &self,
        instance_id: &str,
        snapshots: Vec<ReadListSnapshot>,
    ) -> Result<BatchReport> {
        let instance_id = instance_id.to_string();
        let rows: Vec<ReadList> = snapshots.into_iter().map(|s| s.into_row(&instance_id)).collect();
        self.batch("upsert_read_list_batch", move |conn, settings| {
            let ids: Vec<String> = rows.iter().map(|r| r.read_list_id.clone()).collect();
            let existing = ReadListRepository::new(conn).find_many(&instance_id, &ids)?;
            upsert_batch(
                conn,
                settings,
                "read_list",
                rows,
                existing,
                |r: &ReadList| r.read_list_id.as_str(),
                |session, row, previous, _| session.upsert_read_list(row, previous),
            )
        })
        .await
    }

    pub async fn delete_series(&self, key: &EntityKey) -> Result<bool> {
        let key = key.clone();
        self.mutate("delete_series", move |session| session.delete_series(&key)).await
    }

    pub async fn delete_book(&self, key: &EntityKey) -> Result<bool> {
        let key = key.clone();
        self.mutate("delete_book", move |session| session.delete_book(&key)).await
    }

    pub async fn delete_collection(&self, key: &EntityKey) -> Result<bool> {
        let key = key.clone();
        self.mutate("delete_collection", move |session| session.delete_collection(&key)).await
    }

    pub async fn delete_read_list(&self, key: &EntityKey) -> Result<bool> {
        let key = key.clone();
        self.mutate("delete_read_list", move |session| session.delete_read_list(&key)).await
    }

    pub async fn purge_instance(&self, instance_id: &str) -> Result<usize> {
        let instance_id = instance_id.to_string();
        self.mutate("purge_instance", move |session| session.purge_instance(&instance_id))
            .await
    }

    // Downloads

    /// Download worker report for a book
    pub async fn set_download_status(&self, key: &EntityKey, request: TransitionRequest) -> Result<TransitionOutcome> {
        let key = key.clone();
        self.mutate("set_download_status", move |session| {
            session.transition_book(&key, &request)
        })
        .await
    }

    pub async fn cancel_download(&self, key: &EntityKey) -> Result<TransitionOutcome> {
        let key = key.clone();
        self.mutate("cancel_download", move |session| session.cancel_download(&key))
            .await
    }

    /// Explicitly queue one book. Books already on the device or in the queue are left alone.
    pub async fn enqueue_book(&self, key: &EntityKey) -> Result<TransitionOutcome> {
        let key = key.clone();
        self.mutate("enqueue_book", move |session| {
            match BookRepository::new(session.conn()).find_state(&key)? {
                None => Ok(TransitionOutcome::MissingEntity),
                Some(state) if state.download_status.is_downloaded() || state.download_status.is_pending() => {
                    Ok(TransitionOutcome::Unchanged)
                }
                Some(_) => session.enqueue_book(&key),
            }
        })
        .await
    }

    pub async fn delete_book_download(&self, key: &EntityKey) -> Result<TransitionOutcome> {
        let key = key.clone();
        self.mutate("delete_book_download", move |session| session.delete_book_download(&key))
            .await
    }

    pub async fn set_offline_policy(&self, key: &EntityKey, policy: OfflinePolicy) -> Result<bool> {
        let key = key.clone();
        self.mutate("set_offline_policy", move |session| {
            session.set_offline_policy(&key, policy)
        })
        .await
    }

    pub async fn download_series(&self, key: &EntityKey) -> Result<bool> {
        let key = key.clone();
        self.mutate("download_series", move |session| session.download_series(&key))
            .await
    }

    pub async fn remove_series_downloads(&self, key: &EntityKey) -> Result<bool> {
        let key = key.clone();
        self.mutate("remove_series_downloads", move |session| {
            session.remove_series_downloads(&key)
        })
        .await
    }

    pub async fn toggle_series_download(&self, key: &EntityKey) -> Result<ToggleOutcome> {
        let key = key.clone();
        self.mutate("toggle_series_download", move |session| {
            session.toggle_series_download(&key)
        })
        .await
    }

    pub async fn download_read_list(&self, key: &EntityKey) -> Result<bool> {
        let key = key.clone();
        self.mutate("download_read_list", move |session| session.download_read_list(&key))
            .await
    }

    pub async fn remove_read_list_downloads(&self, key: &EntityKey) -> Result<bool> {
        let key = key.clone();
        self.mutate("remove_read_list_downloads", move |session| {
            session.remove_read_list_downloads(&key)
        })
        .await
    }

    pub async fn cleanup_read_books(&self, instance_id: &str) -> Result<usize> {
        let instance_id = instance_id.to_string();
        self.mutate("cleanup_read_books", move |session| {
            session.cleanup_read_books(&instance_id)
        })
        .await
    }

    pub async fn retry_failed(&self, instance_id: &str) -> Result<usize> {
        let instance_id = instance_id.to_string();
        self.mutate("retry_failed", move |session| session.retry_failed(&instance_id))
            .await
    }

    pub async fn cancel_failed(&self, instance_id: &str) -> Result<usize> {
        let instance_id = instance_id.to_string();
        self.mutate("cancel_failed", move |session| session.cancel_failed(&instance_id))
            .await
    }

    pub async fn repair(&self, instance_id: &str) -> Result<RepairReport> {
        let instance_id = instance_id.to_string();
        self.mutate("repair", move |session| session.repair(&instance_id)).await
    }

    /// Stop handing newly queued books to the download scheduler
    pub fn pause_downloads(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("Downloads paused");
    }

    /// Resume scheduling and re-announce the whole pending queue. Returns the books announced.
    pub async fn resume_downloads(&self) -> Result<usize> {
        self.paused.store(false, Ordering::SeqCst);

        let queued = self
            .db
            .execute(|conn| {
                let books = BookRepository::new(conn);
                let mut queued = Vec::new();
                for instance_id in books.instances_with_status(&["pending"])? {
                    let ids: Vec<String> = books
                        .states_with_status(&instance_id, &["pending"], None)?
                        .into_iter()
                        .map(|s| s.book_id)
                        .collect();
                    queued.push((instance_id, ids));
                }
                Ok(queued)
            })
            .await?;

        let mut announced = 0;
        for (instance_id, book_ids) in &queued {
            announced += book_ids.len();
            self.scheduler.schedule(instance_id, book_ids).await;
        }
        info!(announced, "Downloads resumed");
        Ok(announced)
    }

    pub fn downloads_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // Progress outbox

    pub async fn record_progress(&self, update: ProgressUpdate) -> Result<PendingProgress> {
        self.mutate("record_progress", move |session| session.record_progress(&update))
            .await
    }

    /// Oldest queued progress entries, optionally for one instance
    pub async fn drain_pending_progress(&self, instance_id: Option<&str>, limit: usize) -> Result<Vec<PendingProgress>> {
        let instance_id = instance_id.map(str::to_string);
        self.db
            .execute(move |conn| ProgressRepository::new(conn).drain(instance_id.as_deref(), limit))
            .await
    }

    /// Remove an uploaded entry. `false` when it was superseded or already removed.
    pub async fn remove_pending_progress(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.mutate("remove_pending_progress", move |session| {
            ProgressRepository::new(session.conn()).remove(&id)
        })
        .await
    }

    pub async fn pending_progress_count(&self, instance_id: Option<&str>) -> Result<i64> {
        let instance_id = instance_id.map(str::to_string);
        self.db
            .execute(move |conn| ProgressRepository::new(conn).count(instance_id.as_deref()))
            .await
    }

    // Queries

    /// Look up a registered instance
    pub async fn instance(&self, id: &str) -> Result<Instance> {
        let id = id.to_string();
        self.db
            .execute(move |conn| {
                InstanceRepository::new(conn)
                    .find(&id)?
                    .ok_or_else(|| MirrorError::NotFound(format!("instance {}", id)))
            })
            .await
    }

    pub async fn instances(&self) -> Result<Vec<Instance>> {
        self.db.execute(|conn| InstanceRepository::new(conn).list()).await
    }

    pub async fn libraries(&self, instance_id: &str) -> Result<Vec<Library>> {
        let instance_id = instance_id.to_string();
        self.db
            .execute(move |conn| LibraryRepository::new(conn).list(&instance_id))
            .await
    }

    pub async fn download_queue_summary(&self, instance_id: &str) -> Result<DownloadQueueSummary> {
        let instance_id = instance_id.to_string();
        self.db
            .execute(move |conn| BookRepository::new(conn).queue_summary(&instance_id))
            .await
    }

    /// Queued and in-flight books in queue order
    pub async fn pending_downloads(&self, instance_id: &str, limit: Option<usize>) -> Result<Vec<BookLocalState>> {
        let instance_id = instance_id.to_string();
        self.db
            .execute(move |conn| {
                BookRepository::new(conn).states_with_status(&instance_id, &["pending", "downloading"], limit)
            })
            .await
    }

    pub async fn downloaded_books(&self, instance_id: &str) -> Result<Vec<(Book, BookLocalState)>> {
        let instance_id = instance_id.to_string();
        self.db
            .execute(move |conn| BookRepository::new(conn).downloaded(&instance_id))
            .await
    }

    pub async fn series(&self, key: &EntityKey) -> Result<Option<Series>> {
        let key = key.clone();
        self.db.execute(move |conn| SeriesRepository::new(conn).find(&key)).await
    }

    pub async fn series_state(&self, key: &EntityKey) -> Result<Option<SeriesLocalState>> {
        let key = key.clone();
        self.db
            .execute(move |conn| SeriesRepository::new(conn).find_state(&key))
            .await
    }

    /// Books of a series with their local state, in reading order
    pub async fn series_books(&self, key: &EntityKey) -> Result<Vec<(Book, BookLocalState)>> {
        let key = key.clone();
        self.db
            .execute(move |conn| BookRepository::new(conn).series_members(&key))
            .await
    }

    pub async fn book(&self, key: &EntityKey) -> Result<Option<Book>> {
        let key = key.clone();
        self.db.execute(move |conn| BookRepository::new(conn).find(&key)).await
    }

    pub async fn book_state(&self, key: &EntityKey) -> Result<Option<BookLocalState>> {
        let key = key.clone();
        self.db
            .execute(move |conn| BookRepository::new(conn).find_state(&key))
            .await
    }

    pub async fn read_list_state(&self, key: &EntityKey) -> Result<Option<ReadListLocalState>> {
        let key = key.clone();
        self.db
            .execute(move |conn| ReadListRepository::new(conn).find_state(&key))
            .await
    }

    pub async fn book_status(&self, key: &EntityKey) -> Result<Option<DownloadStatus>> {
        Ok(self.book_state(key).await?.map(|s| s.download_status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::aggregates::{AggregateStatus, ReadingState};
    use crate::core::collaborators::{EvictionReason, RecordingCollaborator};
    use crate::core::snapshots::ReadProgressSnapshot;
    use proptest::prelude::*;
    use tempfile::TempDir;

    const INSTANCE: &str = "inst";

    struct Fixture {
        store: OfflineStore,
        recorder: Arc<RecordingCollaborator>,
        _dir: TempDir,
    }

    fn fixture_with(grace_seconds: u64, paused: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let database = DatabaseConfig {
            path: dir.path().join("mirror.db"),
            connection_pool_size: 2,
            busy_timeout: 5000,
        };
        let offline = OfflineConfig {
            cleanup_grace_seconds: grace_seconds,
            writer_queue_depth: 16,
            downloads_paused: paused,
        };
        let recorder = Arc::new(RecordingCollaborator::new());
        let store = OfflineStore::open(&database, &offline, recorder.clone(), recorder.clone()).unwrap();
        Fixture { store, recorder, _dir: dir }
    }

    fn fixture() -> Fixture {
        fixture_with(300, false)
    }

    fn series_snapshot(id: &str, books: i64) -> SeriesSnapshot {
        let now = Utc::now();
        SeriesSnapshot {
            id: id.into(),
            library_id: "lib".into(),
            name: format!("Series {}", id),
            url: String::new(),
            created: now,
            last_modified: now,
            books_count: books,
            books_read_count: 0,
            books_unread_count: books,
            books_in_progress_count: 0,
            metadata: serde_json::json!({"status": "ONGOING"}),
            books_metadata: serde_json::Value::Null,
            deleted: false,
            oneshot: false,
        }
    }

    fn book_snapshot(id: &str, series: &str, number: f64) -> BookSnapshot {
        let now = Utc::now();
        BookSnapshot {
            id: id.into(),
            series_id: series.into(),
            library_id: "lib".into(),
            name: format!("Book {}", id),
            url: String::new(),
            number,
            number_sort: number,
            created: now,
            last_modified: now,
            size_bytes: 1000,
            media: serde_json::json!({"pagesCount": 20}),
            metadata: serde_json::Value::Null,
            read_progress: None,
            deleted: false,
            oneshot: false,
            series_title: format!("Series {}", series),
        }
    }

    fn read_list_snapshot(id: &str, books: &[&str]) -> ReadListSnapshot {
        let now = Utc::now();
        ReadListSnapshot {
            id: id.into(),
            name: "Arc".into(),
            summary: String::new(),
            ordered: true,
            filtered: false,
            created_date: now,
            last_modified_date: now,
            book_ids: books.iter().map(|b| b.to_string()).collect(),
        }
    }

    fn key(id: &str) -> EntityKey {
        EntityKey::new(INSTANCE, id)
    }

    async fn mirror_series(store: &OfflineStore, series: &str, count: usize) {
        store.upsert_series(INSTANCE, series_snapshot(series, count as i64)).await.unwrap();
        let books = (1..=count)
            .map(|i| book_snapshot(&format!("b{}", i), series, i as f64))
            .collect();
        let report = store.upsert_book_batch(INSTANCE, books).await.unwrap();
        assert_eq!(report.inserted, count);
    }

    async fn mark_downloaded(store: &OfflineStore, book: &str) {
        store.enqueue_book(&key(book)).await.unwrap();
        let outcome = store
            .set_download_status(&key(book), TransitionRequest::downloaded(1000, None))
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Applied);
    }

    #[tokio::test]
    async fn test_unread_only_advances_after_completion() {
        let f = fixture();
        mirror_series(&f.store, "s1", 10).await;

        let policy = OfflinePolicy::UnreadOnly { limit: 3 };
        assert!(f.store.set_offline_policy(&key("s1"), policy).await.unwrap());
        assert_eq!(f.recorder.scheduled_books().await, vec!["b1", "b2", "b3"]);
        f.recorder.clear().await;

        let update = ProgressUpdate {
            instance_id: INSTANCE.into(),
            book_id: "b1".into(),
            page: 20,
            completed: true,
            progression: None,
        };
        f.store.record_progress(update).await.unwrap();

        let series = f.store.series(&key("s1")).await.unwrap().unwrap();
        assert_eq!(series.books_unread_count, 9);
        assert_eq!(series.books_read_count, 1);
        assert_eq!(series.books_in_progress_count, 0);

        assert_eq!(f.store.book_status(&key("b4")).await.unwrap(), Some(DownloadStatus::Pending));
        assert_eq!(f.store.book_status(&key("b5")).await.unwrap(), Some(DownloadStatus::NotDownloaded));
        assert_eq!(f.recorder.scheduled_books().await, vec!["b4"]);

        let state = f.store.series_state(&key("s1")).await.unwrap().unwrap();
        assert_eq!(state.pending_books, 4);
        assert_eq!(state.download_status, AggregateStatus::Pending);
    }

    #[tokio::test]
    async fn test_read_list_partially_downloaded_after_book_removed() {
        let f = fixture();
        mirror_series(&f.store, "s1", 5).await;
        f.store
            .upsert_read_list(INSTANCE, read_list_snapshot("rl1", &["b1", "b2", "b3", "b4", "b5"]))
            .await
            .unwrap();

        for i in 1..=5 {
            mark_downloaded(&f.store, &format!("b{}", i)).await;
        }
        let state = f.store.read_list_state(&key("rl1")).await.unwrap().unwrap();
        assert_eq!(state.download_status, AggregateStatus::Downloaded);
        assert_eq!(state.downloaded_books, 5);
        assert_eq!(state.downloaded_size, 5000);

        assert!(f.store.delete_book(&key("b3")).await.unwrap());

        let state = f.store.read_list_state(&key("rl1")).await.unwrap().unwrap();
        assert_eq!(state.download_status, AggregateStatus::PartiallyDownloaded);
        assert_eq!(state.downloaded_books, 4);
        assert_eq!(state.downloaded_size, 4000);

        let evicted = f.recorder.evicted().await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].book, key("b3"));
        assert_eq!(evicted[0].reason, EvictionReason::EntityRemoved);
    }

    #[tokio::test]
    async fn test_cancel_download_is_idempotent() {
        let f = fixture();
        mirror_series(&f.store, "s1", 1).await;
        f.store.enqueue_book(&key("b1")).await.unwrap();
        f.store
            .set_download_status(&key("b1"), TransitionRequest::to(DownloadStatus::Downloading { progress: 0.4 }))
            .await
            .unwrap();

        assert_eq!(f.store.cancel_download(&key("b1")).await.unwrap(), TransitionOutcome::Applied);
        assert_eq!(f.store.book_status(&key("b1")).await.unwrap(), Some(DownloadStatus::Pending));
        assert_eq!(f.store.cancel_download(&key("b1")).await.unwrap(), TransitionOutcome::Unchanged);
        assert_eq!(f.store.cancel_download(&key("missing")).await.unwrap(), TransitionOutcome::MissingEntity);

        let state = f.store.series_state(&key("s1")).await.unwrap().unwrap();
        assert_eq!(state.pending_books, 1);
    }

    #[tokio::test]
    async fn test_rejected_transition_leaves_state() {
        let f = fixture();
        mirror_series(&f.store, "s1", 1).await;

        let outcome = f
            .store
            .set_download_status(&key("b1"), TransitionRequest::failed("no network"))
            .await
            .unwrap();
        assert_eq!(outcome, TransitionOutcome::Rejected);
        assert_eq!(f.store.book_status(&key("b1")).await.unwrap(), Some(DownloadStatus::NotDownloaded));
    }

    #[tokio::test]
    async fn test_remirroring_is_idempotent() {
        let f = fixture();
        let series = series_snapshot("s1", 2);
        let books = vec![book_snapshot("b1", "s1", 1.0), book_snapshot("b2", "s1", 2.0)];

        assert_eq!(f.store.upsert_series(INSTANCE, series.clone()).await.unwrap(), UpsertOutcome::Inserted);
        f.store.upsert_book_batch(INSTANCE, books.clone()).await.unwrap();

        assert_eq!(f.store.upsert_series(INSTANCE, series).await.unwrap(), UpsertOutcome::Unchanged);
        let report = f.store.upsert_book_batch(INSTANCE, books.clone()).await.unwrap();
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.inserted + report.updated + report.failed, 0);

        let mut renamed = books[0].clone();
        renamed.name = "Renamed".into();
        assert_eq!(f.store.upsert_book(INSTANCE, renamed).await.unwrap(), UpsertOutcome::Updated);
    }

    #[tokio::test]
    async fn test_mirrored_progress_moves_reading_counters() {
        let f = fixture();
        mirror_series(&f.store, "s1", 3).await;

        let mut book = book_snapshot("b2", "s1", 2.0);
        book.read_progress = Some(ReadProgressSnapshot {
            page: 5,
            completed: false,
            read_date: None,
            last_modified: Utc::now(),
        });
        f.store.upsert_book(INSTANCE, book).await.unwrap();

        let series = f.store.series(&key("s1")).await.unwrap().unwrap();
        assert_eq!(series.books_in_progress_count, 1);
        assert_eq!(series.books_unread_count, 2);
    }

    #[tokio::test]
    async fn test_remote_read_after_series_refresh_counts_once() {
        let f = fixture();
        mirror_series(&f.store, "s1", 3).await;

        // the server's refreshed series arrives before the book that changed
        let mut series = series_snapshot("s1", 3);
        series.books_read_count = 1;
        series.books_unread_count = 2;
        assert_eq!(f.store.upsert_series(INSTANCE, series).await.unwrap(), UpsertOutcome::Updated);

        let mut book = book_snapshot("b1", "s1", 1.0);
        book.read_progress = Some(ReadProgressSnapshot {
            page: 20,
            completed: true,
            read_date: None,
            last_modified: Utc::now(),
        });
        assert_eq!(f.store.upsert_book(INSTANCE, book).await.unwrap(), UpsertOutcome::Updated);

        let series = f.store.series(&key("s1")).await.unwrap().unwrap();
        assert_eq!(series.books_read_count, 1);
        assert_eq!(series.books_unread_count, 2);
        assert_eq!(series.books_in_progress_count, 0);

        f.store.repair(INSTANCE).await.unwrap();
        assert_eq!(f.store.series(&key("s1")).await.unwrap().unwrap(), series);
    }

    #[tokio::test]
    async fn test_outbox_coalesces_through_store() {
        let f = fixture();
        let update = |page| ProgressUpdate {
            instance_id: INSTANCE.into(),
            book_id: "unmirrored".into(),
            page,
            completed: false,
            progression: Some(vec![1, 2, 3]),
        };

        let first = f.store.record_progress(update(1)).await.unwrap();
        let drained = f.store.drain_pending_progress(Some(INSTANCE), 10).await.unwrap();
        assert_eq!(drained.len(), 1);

        // a newer position arrives while the first copy is uploading
        let second = f.store.record_progress(update(8)).await.unwrap();
        assert!(!f.store.remove_pending_progress(&first.id).await.unwrap());
        assert_eq!(f.store.pending_progress_count(None).await.unwrap(), 1);

        let drained = f.store.drain_pending_progress(None, 10).await.unwrap();
        assert_eq!(drained[0].page, 8);
        assert_eq!(drained[0].progression, Some(vec![1, 2, 3]));
        assert!(f.store.remove_pending_progress(&second.id).await.unwrap());
        assert_eq!(f.store.pending_progress_count(Some(INSTANCE)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_policy_reports_read_books() {
        let f = fixture_with(0, false);
        mirror_series(&f.store, "s1", 2).await;
        let policy = OfflinePolicy::UnreadOnlyAndCleanupRead { limit: 0 };
        f.store.set_offline_policy(&key("s1"), policy).await.unwrap();
        f.store
            .set_download_status(&key("b1"), TransitionRequest::downloaded(1000, None))
            .await
            .unwrap();

        let update = ProgressUpdate {
            instance_id: INSTANCE.into(),
            book_id: "b1".into(),
            page: 20,
            completed: true,
            progression: None,
        };
        f.store.record_progress(update).await.unwrap();

        let evicted = f.recorder.evicted().await;
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].book, key("b1"));
        assert_eq!(evicted[0].reason, EvictionReason::CleanupRead);
        // bytes are gone only once the sink reports back
        assert_eq!(f.store.book_status(&key("b1")).await.unwrap(), Some(DownloadStatus::Downloaded));

        f.store
            .set_download_status(&key("b1"), TransitionRequest::to(DownloadStatus::NotDownloaded))
            .await
            .unwrap();
        let state = f.store.series_state(&key("s1")).await.unwrap().unwrap();
        assert_eq!(state.downloaded_books, 0);
        assert_eq!(state.pending_books, 1);
    }

    #[tokio::test]
    async fn test_read_list_retention_protects_books() {
        let f = fixture();
        mirror_series(&f.store, "s1", 2).await;
        f.store
            .upsert_read_list(INSTANCE, read_list_snapshot("rl1", &["b2"]))
            .await
            .unwrap();

        assert!(f.store.download_read_list(&key("rl1")).await.unwrap());
        assert!(f.store.download_series(&key("s1")).await.unwrap());
        mark_downloaded(&f.store, "b1").await;
        f.store
            .set_download_status(&key("b2"), TransitionRequest::downloaded(1000, None))
            .await
            .unwrap();
        f.recorder.clear().await;

        assert!(f.store.remove_series_downloads(&key("s1")).await.unwrap());
        let evicted: Vec<_> = f.recorder.evicted().await.into_iter().map(|c| c.book.id).collect();
        assert_eq!(evicted, vec!["b1".to_string()]);
    }

    #[tokio::test]
    async fn test_paused_downloads_are_announced_on_resume() {
        let f = fixture_with(300, true);
        mirror_series(&f.store, "s1", 3).await;

        f.store.set_offline_policy(&key("s1"), OfflinePolicy::All).await.unwrap();
        assert!(f.recorder.scheduled_books().await.is_empty());
        assert_eq!(f.store.pending_downloads(INSTANCE, None).await.unwrap().len(), 3);

        assert_eq!(f.store.resume_downloads().await.unwrap(), 3);
        assert_eq!(f.recorder.scheduled_books().await, vec!["b1", "b2", "b3"]);
        assert!(!f.store.downloads_paused());
    }

    #[tokio::test]
    async fn test_queue_summary_and_retry() {
        let f = fixture();
        mirror_series(&f.store, "s1", 3).await;
        f.store.download_series(&key("s1")).await.unwrap();
        f.store
            .set_download_status(&key("b1"), TransitionRequest::failed("timeout"))
            .await
            .unwrap();
        f.store
            .set_download_status(&key("b2"), TransitionRequest::downloaded(2048, None))
            .await
            .unwrap();

        let summary = f.store.download_queue_summary(INSTANCE).await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.downloaded, 1);
        assert_eq!(summary.downloaded_size, 2048);

        assert_eq!(f.store.retry_failed(INSTANCE).await.unwrap(), 1);
        let queue: Vec<_> = f
            .store
            .pending_downloads(INSTANCE, None)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.book_id)
            .collect();
        assert_eq!(queue, vec!["b3".to_string(), "b1".to_string()]);
    }

    #[tokio::test]
    async fn test_purge_instance_removes_everything() {
        let f = fixture();
        let instance = f
            .store
            .upsert_instance(InstanceSnapshot {
                name: "Home".into(),
                server_url: "https://komga.local".into(),
                username: "reader".into(),
                is_admin: false,
            })
            .await
            .unwrap();
        let again = f
            .store
            .upsert_instance(InstanceSnapshot {
                name: "Home server".into(),
                server_url: "https://komga.local".into(),
                username: "reader".into(),
                is_admin: true,
            })
            .await
            .unwrap();
        assert_eq!(instance.id, again.id);

        let id = instance.id.clone();
        f.store.upsert_series(&id, series_snapshot("s1", 1)).await.unwrap();
        f.store.upsert_book(&id, book_snapshot("b1", "s1", 1.0)).await.unwrap();
        assert_eq!(f.store.instance(&id).await.unwrap().name, "Home server");
        assert!(f.store.purge_instance(&id).await.unwrap() >= 4);
        assert!(f.store.instances().await.unwrap().is_empty());
        assert!(matches!(f.store.instance(&id).await, Err(MirrorError::NotFound(_))));
        assert!(f.store.series_books(&EntityKey::new(&id, "s1")).await.unwrap().is_empty());
    }

    const BOOKS: usize = 4;

    #[derive(Debug, Clone)]
    enum StoreOp {
        Enqueue(usize),
        Start(usize),
        Finish(usize, i64),
        Fail(usize),
        Cancel(usize),
        Remove(usize),
        RetryFailed,
        Progress(usize, i64, bool),
        RemoteRead(usize, ReadingState),
        ReadListMembers(u8),
    }

    fn book_id(index: usize) -> String {
        format!("b{}", index + 1)
    }

    fn remote_progress(state: ReadingState) -> Option<ReadProgressSnapshot> {
        let (page, completed) = match state {
            ReadingState::Unread => return None,
            ReadingState::InProgress => (5, false),
            ReadingState::Read => (20, true),
        };
        Some(ReadProgressSnapshot {
            page,
            completed,
            read_date: None,
            last_modified: Utc::now(),
        })
    }

    fn count_of(reading: &[ReadingState; BOOKS], state: ReadingState) -> i64 {
        reading.iter().filter(|r| **r == state).count() as i64
    }

    fn arb_op() -> impl Strategy<Value = StoreOp> {
        let book = 0..BOOKS;
        prop_oneof![
            book.clone().prop_map(StoreOp::Enqueue),
            book.clone().prop_map(StoreOp::Start),
            (book.clone(), 1..5_000i64).prop_map(|(b, size)| StoreOp::Finish(b, size)),
            book.clone().prop_map(StoreOp::Fail),
            book.clone().prop_map(StoreOp::Cancel),
            book.clone().prop_map(StoreOp::Remove),
            Just(StoreOp::RetryFailed),
            (book.clone(), 0..20i64, any::<bool>())
                .prop_map(|(b, page, completed)| StoreOp::Progress(b, page, completed)),
            (
                book,
                prop_oneof![
                    Just(ReadingState::Unread),
                    Just(ReadingState::InProgress),
                    Just(ReadingState::Read),
                ]
            )
                .prop_map(|(b, state)| StoreOp::RemoteRead(b, state)),
            (0..16u8).prop_map(StoreOp::ReadListMembers),
        ]
    }

    async fn apply_op(store: &OfflineStore, reading: &mut [ReadingState; BOOKS], list_total: &mut i64, op: &StoreOp) {
        match op {
            StoreOp::Enqueue(i) => {
                store.enqueue_book(&key(&book_id(*i))).await.unwrap();
            }
            StoreOp::Start(i) => {
                let request = TransitionRequest::to(DownloadStatus::Downloading { progress: 0.5 });
                store.set_download_status(&key(&book_id(*i)), request).await.unwrap();
            }
            StoreOp::Finish(i, size) => {
                let request = TransitionRequest::downloaded(*size, None);
                store.set_download_status(&key(&book_id(*i)), request).await.unwrap();
            }
            StoreOp::Fail(i) => {
                let request = TransitionRequest::failed("connection reset");
                store.set_download_status(&key(&book_id(*i)), request).await.unwrap();
            }
            StoreOp::Cancel(i) => {
                store.cancel_download(&key(&book_id(*i))).await.unwrap();
            }
            StoreOp::Remove(i) => {
                let request = TransitionRequest::to(DownloadStatus::NotDownloaded);
                store.set_download_status(&key(&book_id(*i)), request).await.unwrap();
            }
            StoreOp::RetryFailed => {
                store.retry_failed(INSTANCE).await.unwrap();
            }
            StoreOp::Progress(i, page, completed) => {
                let update = ProgressUpdate {
                    instance_id: INSTANCE.into(),
                    book_id: book_id(*i),
                    page: *page,
                    completed: *completed,
                    progression: None,
                };
                store.record_progress(update).await.unwrap();
                reading[*i] = if *completed {
                    ReadingState::Read
                } else if *page > 0 {
                    ReadingState::InProgress
                } else {
                    ReadingState::Unread
                };
            }
            StoreOp::RemoteRead(i, state) => {
                reading[*i] = *state;
                let mut series = series_snapshot("s1", BOOKS as i64);
                series.books_read_count = count_of(reading, ReadingState::Read);
                series.books_unread_count = count_of(reading, ReadingState::Unread);
                series.books_in_progress_count = count_of(reading, ReadingState::InProgress);
                store.upsert_series(INSTANCE, series).await.unwrap();

                let mut book = book_snapshot(&book_id(*i), "s1", (*i + 1) as f64);
                book.read_progress = remote_progress(*state);
                store.upsert_book(INSTANCE, book).await.unwrap();
            }
            StoreOp::ReadListMembers(mask) => {
                let mut list = read_list_snapshot("rl1", &[]);
                list.book_ids = (0..BOOKS).filter(|i| mask & (1 << i) != 0).map(book_id).collect();
                *list_total = list.book_ids.len() as i64;
                store.upsert_read_list(INSTANCE, list).await.unwrap();
            }
        }
    }

    async fn run_ops(ops: Vec<StoreOp>) {
        let f = fixture();
        mirror_series(&f.store, "s1", BOOKS).await;
        f.store
            .upsert_read_list(INSTANCE, read_list_snapshot("rl1", &["b1", "b2"]))
            .await
            .unwrap();

        let mut reading = [ReadingState::Unread; BOOKS];
        let mut list_total = 2;
        for op in &ops {
            apply_op(&f.store, &mut reading, &mut list_total, op).await;
        }

        let series = f.store.series(&key("s1")).await.unwrap().unwrap();
        assert_eq!(series.books_read_count, count_of(&reading, ReadingState::Read));
        assert_eq!(series.books_unread_count, count_of(&reading, ReadingState::Unread));
        assert_eq!(series.books_in_progress_count, count_of(&reading, ReadingState::InProgress));

        let series_state = f.store.series_state(&key("s1")).await.unwrap().unwrap();
        let list_state = f.store.read_list_state(&key("rl1")).await.unwrap().unwrap();
        let total = BOOKS as i64;
        assert!((0..=total).contains(&series_state.downloaded_books));
        assert!(series_state.pending_books >= 0);
        assert!(series_state.downloaded_books + series_state.pending_books <= total);
        assert!((0..=list_total).contains(&list_state.downloaded_books));
        assert!(list_state.pending_books >= 0);
        assert!(list_state.downloaded_books + list_state.pending_books <= list_total);

        f.store.repair(INSTANCE).await.unwrap();
        assert_eq!(f.store.series(&key("s1")).await.unwrap().unwrap(), series);
        assert_eq!(f.store.series_state(&key("s1")).await.unwrap().unwrap(), series_state);
        assert_eq!(f.store.read_list_state(&key("rl1")).await.unwrap().unwrap(), list_state);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_store_counters_match_repair(ops in prop::collection::vec(arb_op(), 1..40)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(run_ops(ops));
        }
    }
}
