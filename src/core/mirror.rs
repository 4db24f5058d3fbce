//! Mirror upserter
//!
//! Writes remote snapshots into the entity store without touching device-only state, and keeps
//! back-references and aggregates in step with catalog changes. Batches load the existing rows
//! once and commit every item on its own, so a failing item never takes the batch down.

use crate::core::aggregates::{self, ReadingState};
use crate::core::collaborators::EvictionReason;
use crate::core::download_state::DownloadStatus;
use crate::core::error::Result;
use crate::core::retention::RetentionSettings;
use crate::core::session::{run_in_transaction, Decisions, WriteSession};
use crate::core::snapshots::InstanceSnapshot;
use crate::db::models::{
    from_millis, storage_precision, Book, Collection, EntityKey, Instance, Library, ReadList, Series,
};
use crate::db::repository::{
    BookRepository, CollectionRepository, InstanceRepository, LibraryRepository, ProgressRepository,
    ReadListRepository, SeriesRepository,
};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, error, info};
use uuid::Uuid;

/// What an upsert did to the stored row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Per-item outcomes of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Series whose download aggregate must be recomputed once the current write is done
pub type SeriesRecompute = BTreeSet<EntityKey>;

/// Apply `apply` to every row in its own transaction, then recompute the touched series once
pub fn upsert_batch<T, F>(
    conn: &mut Connection,
    settings: RetentionSettings,
    kind: &'static str,
    rows: Vec<T>,
    existing: HashMap<String, T>,
    id_of: fn(&T) -> &str,
    mut apply: F,
) -> Result<(BatchReport, Decisions)>
where
    F: FnMut(&mut WriteSession<'_>, &T, Option<&T>, &mut SeriesRecompute) -> Result<UpsertOutcome>,
{
    let mut report = BatchReport::default();
    let mut decisions = Decisions::default();
    let mut recompute = SeriesRecompute::new();

    for row in &rows {
        let id = id_of(row);
        let previous = existing.get(id);
        let result = run_in_transaction(conn, settings, |session| {
            apply(session, row, previous, &mut recompute)
        });

        match result {
            Ok((outcome, item_decisions)) => {
                report.record(outcome);
                decisions.merge(item_decisions);
            }
            Err(e) => {
                error!(kind, id, error = %e, error_type = e.error_type(), "Batch item abandoned");
                report.failed += 1;
            }
        }
    }

    if !recompute.is_empty() {
        let series = recompute.len();
        match run_in_transaction(conn, settings, |session| session.flush_recompute(recompute)) {
            Ok(((), flushed)) => decisions.merge(flushed),
            Err(e) => error!(kind, series, error = %e, "Deferred series recompute failed"),
        }
    }

    info!(
        kind,
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        failed = report.failed,
        "Batch mirrored"
    );
    Ok((report, decisions))
}

fn diff_ids(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let old_set: HashSet<&String> = old.iter().collect();
    let new_set: HashSet<&String> = new.iter().collect();
    let added = new.iter().filter(|id| !old_set.contains(id)).cloned().collect();
    let removed = old.iter().filter(|id| !new_set.contains(id)).cloned().collect();
    (added, removed)
}

impl WriteSession<'_> {
    /// Recompute and re-evaluate every deferred series
    pub fn flush_recompute(&mut self, recompute: SeriesRecompute) -> Result<()> {
        for key in recompute {
            self.recompute_series(&key)?;
        }
        Ok(())
    }

    /// Register an instance or refresh it, keyed by (server URL, username)
    pub fn upsert_instance(&mut self, snapshot: InstanceSnapshot) -> Result<Instance> {
        let repo = InstanceRepository::new(self.conn());
        let instance = match repo.find_by_identity(&snapshot.server_url, &snapshot.username)? {
            Some(mut existing) => {
                existing.name = snapshot.name;
                existing.is_admin = snapshot.is_admin;
                existing.last_used_at = self.now();
                existing
            }
            None => Instance {
                id: Uuid::new_v4().to_string(),
                name: snapshot.name,
                server_url: snapshot.server_url,
                username: snapshot.username,
                is_admin: snapshot.is_admin,
                created_at: self.now(),
                last_used_at: self.now(),
                series_last_synced_at: from_millis(0),
                books_last_synced_at: from_millis(0),
            },
        };
        repo.save(&instance)?;
        info!(instance_id = %instance.id, server_url = %instance.server_url, "Instance registered");
        Ok(instance)
    }

    /// Record how far incremental sync got. `false` when the instance is unknown.
    pub fn update_sync_watermarks(
        &mut self,
        instance_id: &str,
        series_synced_at: Option<DateTime<Utc>>,
        books_synced_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let repo = InstanceRepository::new(self.conn());
        let Some(mut instance) = repo.find(instance_id)? else {
            return Ok(false);
        };
        if let Some(at) = series_synced_at {
            instance.series_last_synced_at = storage_precision(at);
        }
        if let Some(at) = books_synced_at {
            instance.books_last_synced_at = storage_precision(at);
        }
        repo.save(&instance)?;
        Ok(true)
    }

    /// Make the stored libraries of an instance match `libraries`. Returns the rows changed.
    pub fn replace_libraries(&mut self, instance_id: &str, libraries: &[Library]) -> Result<usize> {
        let repo = LibraryRepository::new(self.conn());
        let existing: HashMap<String, Library> = repo
            .list(instance_id)?
            .into_iter()
            .map(|l| (l.library_id.clone(), l))
            .collect();

        let mut changed = 0;
        for library in libraries {
            if existing.get(&library.library_id) != Some(library) {
                repo.save(library)?;
                changed += 1;
            }
        }

        let keep: HashSet<&str> = libraries.iter().map(|l| l.library_id.as_str()).collect();
        for id in existing.keys().filter(|id| !keep.contains(id.as_str())) {
            repo.delete(instance_id, id)?;
            changed += 1;
        }
        Ok(changed)
    }

    pub fn upsert_series(
        &mut self,
        row: &Series,
        existing: Option<&Series>,
        recompute: &mut SeriesRecompute,
    ) -> Result<UpsertOutcome> {
        if existing == Some(row) {
            return Ok(UpsertOutcome::Unchanged);
        }

        let repo = SeriesRepository::new(self.conn());
        let key = row.key();
        repo.save(row)?;
        repo.ensure_state(&key)?;

        match existing {
            None => {
                let collections = CollectionRepository::new(self.conn())
                    .containing_series(&key.instance_id, &key.id)?;
                if !collections.is_empty() {
                    if let Some(mut state) = repo.find_state(&key)? {
                        state.collection_ids = collections;
                        repo.save_state(&state)?;
                    }
                }
                recompute.insert(key);
                Ok(UpsertOutcome::Inserted)
            }
            Some(previous) => {
                if previous.books_count != row.books_count {
                    recompute.insert(key);
                }
                Ok(UpsertOutcome::Updated)
            }
        }
    }

    pub fn upsert_book(
        &mut self,
        row: &Book,
        existing: Option<&Book>,
        recompute: &mut SeriesRecompute,
    ) -> Result<UpsertOutcome> {
        if existing == Some(row) {
            return Ok(UpsertOutcome::Unchanged);
        }

        let repo = BookRepository::new(self.conn());
        let key = row.key();
        repo.save(row)?;
        repo.ensure_state(&key)?;

        let Some(previous) = existing else {
            self.seed_read_list_refs(&key)?;
            recompute.insert(row.series_key());
            return Ok(UpsertOutcome::Inserted);
        };

        let old_reading = ReadingState::of(previous.read_progress.as_ref());
        let new_reading = ReadingState::of(row.read_progress.as_ref());

        if previous.series_id != row.series_id {
            aggregates::recompute_series_reading(self.conn(), &previous.series_key())?;
            aggregates::recompute_series_reading(self.conn(), &row.series_key())?;
            recompute.insert(previous.series_key());
            recompute.insert(row.series_key());
        } else {
            let reading_changed = old_reading != new_reading;
            // Mirrored series counters may already include this change; recount from members
            if reading_changed {
                aggregates::recompute_series_reading(self.conn(), &row.series_key())?;
            }
            if reading_changed
                || previous.deleted != row.deleted
                || previous.number_sort != row.number_sort
            {
                recompute.insert(row.series_key());
            }
        }

        Ok(UpsertOutcome::Updated)
    }

    /// Fill a new book's read-list back-references from the mirrored read lists
    fn seed_read_list_refs(&mut self, key: &EntityKey) -> Result<()> {
        let read_lists = ReadListRepository::new(self.conn());
        let ids = read_lists.containing_book(&key.instance_id, &key.id)?;
        if ids.is_empty() {
            return Ok(());
        }

        let books = BookRepository::new(self.conn());
        if let Some(mut state) = books.find_state(key)? {
            state.read_list_ids = ids.clone();
            books.save_state(&state)?;
        }

        let mut retained = false;
        for id in &ids {
            let list_key = EntityKey::new(&key.instance_id, id);
            if let Some(state) = aggregates::recompute_read_list(self.conn(), &list_key)? {
                retained |= state.retain_offline;
            }
        }
        if retained {
            self.enqueue_book(key)?;
        }
        Ok(())
    }

    pub fn upsert_collection(&mut self, row: &Collection, existing: Option<&Collection>) -> Result<UpsertOutcome> {
        if existing == Some(row) {
            return Ok(UpsertOutcome::Unchanged);
        }

        CollectionRepository::new(self.conn()).save(row)?;

        let old_ids = existing.map(|c| c.series_ids.as_slice()).unwrap_or(&[]);
        let (added, removed) = diff_ids(old_ids, &row.series_ids);
        let series = SeriesRepository::new(self.conn());

        for id in &added {
            if let Some(mut state) = series.find_state(&EntityKey::new(&row.instance_id, id))? {
                if !state.collection_ids.contains(&row.collection_id) {
                    state.collection_ids.push(row.collection_id.clone());
                    series.save_state(&state)?;
                }
            }
        }
        for id in &removed {
            if let Some(mut state) = series.find_state(&EntityKey::new(&row.instance_id, id))? {
                state.collection_ids.retain(|c| *c != row.collection_id);
                series.save_state(&state)?;
            }
        }

        debug!(collection = %row.collection_id, added = added.len(), removed = removed.len(), "Collection mirrored");
        Ok(if existing.is_some() { UpsertOutcome::Updated } else { UpsertOutcome::Inserted })
    }

    pub fn upsert_read_list(&mut self, row: &ReadList, existing: Option<&ReadList>) -> Result<UpsertOutcome> {
        if existing == Some(row) {
            return Ok(UpsertOutcome::Unchanged);
        }

        let repo = ReadListRepository::new(self.conn());
        let key = row.key();
        repo.save(row)?;
        repo.ensure_state(&key)?;

        let old_ids = existing.map(|r| r.book_ids.as_slice()).unwrap_or(&[]);
        let (added, removed) = diff_ids(old_ids, &row.book_ids);
        let books = BookRepository::new(self.conn());

        for id in &added {
            if let Some(mut state) = books.find_state(&EntityKey::new(&row.instance_id, id))? {
                if !state.read_list_ids.contains(&row.read_list_id) {
                    state.read_list_ids.push(row.read_list_id.clone());
                    books.save_state(&state)?;
                }
            }
        }
        for id in &removed {
            if let Some(mut state) = books.find_state(&EntityKey::new(&row.instance_id, id))? {
                state.read_list_ids.retain(|r| *r != row.read_list_id);
                books.save_state(&state)?;
            }
        }

        let membership_changed = existing.map(|r| r.book_ids != row.book_ids).unwrap_or(true);
        if membership_changed {
            let state = aggregates::recompute_read_list(self.conn(), &key)?;
            if state.map(|s| s.retain_offline).unwrap_or(false) {
                for id in &added {
                    let book_key = EntityKey::new(&row.instance_id, id);
                    let queueable = books
                        .find_state(&book_key)?
                        .map(|s| matches!(s.download_status, DownloadStatus::NotDownloaded | DownloadStatus::Failed { .. }))
                        .unwrap_or(false);
                    if queueable {
                        self.enqueue_book(&book_key)?;
                    }
                }
            }
        }

        Ok(if existing.is_some() { UpsertOutcome::Updated } else { UpsertOutcome::Inserted })
    }

    /// Remove a book and its device state. A downloaded book is reported for eviction.
    pub fn delete_book(&mut self, key: &EntityKey) -> Result<bool> {
        let Some(series_key) = self.remove_book(key)? else {
            return Ok(false);
        };
        self.recompute_series(&series_key)?;
        Ok(true)
    }

    /// Delete the book rows and fix read lists; returns the owning series
    fn remove_book(&mut self, key: &EntityKey) -> Result<Option<EntityKey>> {
        let books = BookRepository::new(self.conn());
        let Some(book) = books.find(key)? else {
            return Ok(None);
        };
        let state = books.find_state(key)?;

        books.delete(key)?;
        ProgressRepository::new(self.conn()).remove_for_book(key)?;

        if let Some(state) = state {
            self.report_eviction(&state, EvictionReason::EntityRemoved);
            for id in &state.read_list_ids {
                aggregates::recompute_read_list(self.conn(), &EntityKey::new(&key.instance_id, id))?;
            }
        }

        info!(book = %key, "Book removed from mirror");
        Ok(Some(book.series_key()))
    }

    /// Remove a series together with its books
    pub fn delete_series(&mut self, key: &EntityKey) -> Result<bool> {
        let repo = SeriesRepository::new(self.conn());
        if repo.find(key)?.is_none() {
            return Ok(false);
        }

        let members = BookRepository::new(self.conn()).series_members(key)?;
        for (book, _) in &members {
            self.remove_book(&book.key())?;
        }
        repo.delete(key)?;

        info!(series = %key, books = members.len(), "Series removed from mirror");
        Ok(true)
    }

    pub fn delete_collection(&mut self, key: &EntityKey) -> Result<bool> {
        let repo = CollectionRepository::new(self.conn());
        let Some(collection) = repo.find(key)? else {
            return Ok(false);
        };

        let series = SeriesRepository::new(self.conn());
        for id in &collection.series_ids {
            if let Some(mut state) = series.find_state(&EntityKey::new(&key.instance_id, id))? {
                state.collection_ids.retain(|c| *c != key.id);
                series.save_state(&state)?;
            }
        }
        repo.delete(key)
    }

    pub fn delete_read_list(&mut self, key: &EntityKey) -> Result<bool> {
        let repo = ReadListRepository::new(self.conn());
        let Some(read_list) = repo.find(key)? else {
            return Ok(false);
        };

        let books = BookRepository::new(self.conn());
        for id in &read_list.book_ids {
            if let Some(mut state) = books.find_state(&EntityKey::new(&key.instance_id, id))? {
                state.read_list_ids.retain(|r| *r != key.id);
                books.save_state(&state)?;
            }
        }
        repo.delete(key)
    }

    /// Remove everything stored for an instance. Returns the number of rows deleted.
    pub fn purge_instance(&mut self, instance_id: &str) -> Result<usize> {
        let repo = InstanceRepository::new(self.conn());
        let mut removed = repo.purge(instance_id)?;
        if repo.delete(instance_id)? {
            removed += 1;
        }
        info!(instance_id, removed, "Instance purged");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_ids() {
        let old = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let new = vec!["c".to_string(), "d".to_string(), "a".to_string()];
        let (added, removed) = diff_ids(&old, &new);
        assert_eq!(added, vec!["d".to_string()]);
        assert_eq!(removed, vec!["b".to_string()]);
    }

    #[test]
    fn test_batch_report_counts() {
        let mut report = BatchReport::default();
        report.record(UpsertOutcome::Inserted);
        report.record(UpsertOutcome::Unchanged);
        report.record(UpsertOutcome::Unchanged);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.unchanged, 2);
        assert_eq!(report.updated, 0);
    }
}
