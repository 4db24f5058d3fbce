//! Write session
//!
//! Everything that mutates the mirror runs inside a [`WriteSession`]: one transaction on the
//! writer's connection plus the decisions collected while it ran. Decisions are handed to the
//! collaborators only after the transaction committed.

use crate::core::aggregates::{self, AggregateStatus};
use crate::core::collaborators::{EvictionCandidate, EvictionReason};
use crate::core::download_state::{apply_transition, DownloadStatus, TransitionOutcome, TransitionRequest};
use crate::core::error::{MirrorError, Result};
use crate::core::retention::{self, OfflinePolicy, RetentionBook, RetentionSettings};
use crate::db::models::{storage_precision, Book, BookLocalState, EntityKey, SeriesLocalState};
use crate::db::repository::{BookRepository, ReadListRepository, SeriesRepository};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Decisions produced by a committed write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decisions {
    /// Books that just entered the download queue
    pub scheduled: Vec<EntityKey>,
    pub evictions: Vec<EvictionCandidate>,
}

impl Decisions {
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty() && self.evictions.is_empty()
    }

    pub fn merge(&mut self, other: Decisions) {
        self.scheduled.extend(other.scheduled);
        self.evictions.extend(other.evictions);
    }

    /// Scheduled book ids grouped per instance, in queue order
    pub fn scheduled_by_instance(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for key in &self.scheduled {
            let ids = grouped.entry(key.instance_id.clone()).or_default();
            if !ids.contains(&key.id) {
                ids.push(key.id.clone());
            }
        }
        grouped
    }
}

/// Who is asking a book to leave the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionOrigin {
    Series(EntityKey),
    ReadList(EntityKey),
    User,
}

/// Outcome of a series download toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ToggleOutcome {
    Queued,
    Removed,
    MissingEntity,
}

/// Counts reported by a repair pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    pub series: usize,
    pub read_lists: usize,
}

/// Run `f` in its own transaction on the writer connection.
///
/// Nothing `f` decided escapes unless the transaction commits.
pub fn run_in_transaction<T, F>(conn: &mut Connection, settings: RetentionSettings, f: F) -> Result<(T, Decisions)>
where
    F: FnOnce(&mut WriteSession<'_>) -> Result<T>,
{
    let tx = conn.transaction()?;
    let mut session = WriteSession::new(&tx, settings);
    let value = f(&mut session)?;
    let decisions = session.into_decisions();
    tx.commit()?;
    Ok((value, decisions))
}

pub struct WriteSession<'c> {
    conn: &'c Connection,
    settings: RetentionSettings,
    now: DateTime<Utc>,
    queue_base: Option<DateTime<Utc>>,
    queue_offset: i64,
    decisions: Decisions,
}

impl<'c> WriteSession<'c> {
    pub fn new(conn: &'c Connection, settings: RetentionSettings) -> Self {
        Self::at(conn, settings, Utc::now())
    }

    pub fn at(conn: &'c Connection, settings: RetentionSettings, now: DateTime<Utc>) -> Self {
        Self {
            conn,
            settings,
            now: storage_precision(now),
            queue_base: None,
            queue_offset: 0,
            decisions: Decisions::default(),
        }
    }

    pub fn conn(&self) -> &'c Connection {
        self.conn
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn settings(&self) -> &RetentionSettings {
        &self.settings
    }

    pub fn into_decisions(self) -> Decisions {
        self.decisions
    }

    /// First queue timestamp of this session: behind every book already in the queue
    fn queue_base(&mut self) -> Result<DateTime<Utc>> {
        if let Some(base) = self.queue_base {
            return Ok(base);
        }
        let base = match BookRepository::new(self.conn).latest_queue_stamp()? {
            Some(latest) if latest >= self.now => latest + chrono::Duration::milliseconds(1),
            _ => self.now,
        };
        self.queue_base = Some(base);
        Ok(base)
    }

    /// Next strictly increasing queue timestamp of this session
    fn next_queue_stamp(&mut self) -> Result<DateTime<Utc>> {
        let stamp = self.queue_base()? + chrono::Duration::milliseconds(self.queue_offset);
        self.queue_offset += 1;
        Ok(stamp)
    }

    pub(crate) fn report_eviction(&mut self, state: &BookLocalState, reason: EvictionReason) {
        if state.download_status.is_downloaded() {
            self.decisions.evictions.push(EvictionCandidate {
                book: state.key(),
                downloaded_size: state.downloaded_size,
                reason,
            });
        }
    }

    /// Validate, record and propagate a book's download status change
    pub fn transition_book(&mut self, key: &EntityKey, request: &TransitionRequest) -> Result<TransitionOutcome> {
        let books = BookRepository::new(self.conn);
        let Some(state) = books.find_state(key)? else {
            debug!(book = %key, "Transition for unknown book ignored");
            return Ok(TransitionOutcome::MissingEntity);
        };

        let next = match apply_transition(&state, request, self.now) {
            Ok(Some(next)) => next,
            Ok(None) => return Ok(TransitionOutcome::Unchanged),
            Err(e @ MirrorError::InvalidTransition { .. }) => {
                warn!(book = %key, error = %e, "Rejected download transition");
                return Ok(TransitionOutcome::Rejected);
            }
            Err(e) => return Err(e),
        };

        books.save_state(&next)?;
        let book = books.find(key)?;
        aggregates::propagate_download(self.conn, book.as_ref(), &state, &next)?;

        if next.download_status == DownloadStatus::Pending && !state.download_status.is_pending() {
            self.decisions.scheduled.push(key.clone());
        }

        debug!(
            book = %key,
            from = state.download_status.raw(),
            to = next.download_status.raw(),
            "Download status changed"
        );
        Ok(TransitionOutcome::Applied)
    }

    /// Queue a book that is not on the device yet
    pub fn enqueue_book(&mut self, key: &EntityKey) -> Result<TransitionOutcome> {
        let stamp = self.next_queue_stamp()?;
        self.transition_book(key, &TransitionRequest::queued_at(stamp))
    }

    /// Put an in-flight download back in the queue. Only `Downloading` is affected.
    pub fn cancel_download(&mut self, key: &EntityKey) -> Result<TransitionOutcome> {
        match BookRepository::new(self.conn).find_state(key)? {
            None => Ok(TransitionOutcome::MissingEntity),
            Some(state) if matches!(state.download_status, DownloadStatus::Downloading { .. }) => {
                let stamp = self.next_queue_stamp()?;
                self.transition_book(key, &TransitionRequest::queued_at(stamp))
            }
            Some(_) => Ok(TransitionOutcome::Unchanged),
        }
    }

    /// Full recompute of a series aggregate, followed by policy evaluation
    pub fn recompute_series(&mut self, key: &EntityKey) -> Result<Option<SeriesLocalState>> {
        if aggregates::recompute_series(self.conn, key)?.is_none() {
            return Ok(None);
        }
        self.evaluate_series(key)?;
        SeriesRepository::new(self.conn).find_state(key)
    }

    /// Apply the series' offline policy to its books
    pub fn evaluate_series(&mut self, key: &EntityKey) -> Result<()> {
        let Some(state) = SeriesRepository::new(self.conn).find_state(key)? else {
            return Ok(());
        };
        if state.offline_policy == OfflinePolicy::Manual {
            return Ok(());
        }

        let members = BookRepository::new(self.conn).series_members(key)?;
        let books: Vec<RetentionBook> = members
            .iter()
            .map(|(book, local)| RetentionBook::from_member(book, local))
            .collect();

        let base = self.queue_base()? + chrono::Duration::milliseconds(self.queue_offset);
        let plan = retention::evaluate(&state.offline_policy, &books, &self.settings, base);
        if plan.is_empty() {
            return Ok(());
        }
        self.queue_offset += plan.enqueue.len() as i64;

        debug!(
            series = %key,
            policy = state.offline_policy.raw(),
            enqueue = plan.enqueue.len(),
            dequeue = plan.dequeue.len(),
            evict = plan.evict.len(),
            "Retention policy evaluated"
        );

        let origin = RetentionOrigin::Series(key.clone());
        let lookup: BTreeMap<&str, &(Book, BookLocalState)> =
            members.iter().map(|m| (m.0.book_id.as_str(), m)).collect();

        for (book_id, queued_at) in &plan.enqueue {
            let book_key = EntityKey::new(&key.instance_id, book_id);
            self.transition_book(&book_key, &TransitionRequest::queued_at(*queued_at))?;
        }

        for book_id in &plan.dequeue {
            let Some((book, local)) = lookup.get(book_id.as_str()) else { continue };
            if !self.retained_elsewhere(Some(book), local, &origin)? {
                self.transition_book(&local.key(), &TransitionRequest::to(DownloadStatus::NotDownloaded))?;
            }
        }

        for book_id in &plan.evict {
            let Some((book, local)) = lookup.get(book_id.as_str()) else { continue };
            if !self.retained_elsewhere(Some(book), local, &origin)? {
                self.report_eviction(local, EvictionReason::CleanupRead);
            }
        }

        Ok(())
    }

    /// True when a policy other than `origin` still wants the book on the device
    pub fn retained_elsewhere(
        &self,
        book: Option<&Book>,
        state: &BookLocalState,
        origin: &RetentionOrigin,
    ) -> Result<bool> {
        let read_lists = ReadListRepository::new(self.conn);
        for id in &state.read_list_ids {
            let key = EntityKey::new(&state.instance_id, id);
            if *origin == RetentionOrigin::ReadList(key.clone()) {
                continue;
            }
            if read_lists.find_state(&key)?.map(|s| s.retain_offline).unwrap_or(false) {
                return Ok(true);
            }
        }

        let Some(book) = book else {
            return Ok(false);
        };
        let series_key = book.series_key();
        if *origin == RetentionOrigin::Series(series_key.clone()) {
            return Ok(false);
        }

        let policy = SeriesRepository::new(self.conn)
            .find_state(&series_key)?
            .map(|s| s.offline_policy)
            .unwrap_or(OfflinePolicy::Manual);
        if policy == OfflinePolicy::Manual {
            return Ok(false);
        }

        let books: Vec<RetentionBook> = BookRepository::new(self.conn)
            .series_members(&series_key)?
            .iter()
            .map(|(b, s)| RetentionBook::from_member(b, s))
            .collect();
        Ok(retention::targets(&policy, &books).contains(&book.book_id))
    }

    /// Change a series' offline policy and apply it. `false` when the series is not mirrored.
    pub fn set_offline_policy(&mut self, key: &EntityKey, policy: OfflinePolicy) -> Result<bool> {
        let repo = SeriesRepository::new(self.conn);
        if repo.find(key)?.is_none() {
            return Ok(false);
        }
        repo.ensure_state(key)?;
        let mut state = repo.find_state(key)?.unwrap_or_else(|| SeriesLocalState::empty(key));
        if state.offline_policy != policy {
            state.offline_policy = policy;
            repo.save_state(&state)?;
            info!(series = %key, policy = policy.raw(), limit = policy.limit(), "Offline policy changed");
        }
        self.evaluate_series(key)?;
        Ok(true)
    }

    fn reset_policy_to_manual(&mut self, key: &EntityKey) -> Result<()> {
        let repo = SeriesRepository::new(self.conn);
        if let Some(mut state) = repo.find_state(key)? {
            if state.offline_policy != OfflinePolicy::Manual {
                state.offline_policy = OfflinePolicy::Manual;
                repo.save_state(&state)?;
            }
        }
        Ok(())
    }

    /// Queue every book of the series that is not already on the device or in the queue
    pub fn download_series(&mut self, key: &EntityKey) -> Result<bool> {
        if SeriesRepository::new(self.conn).find(key)?.is_none() {
            return Ok(false);
        }
        self.reset_policy_to_manual(key)?;

        let members = BookRepository::new(self.conn).series_members(key)?;
        for (book, state) in &members {
            let status = &state.download_status;
            if book.deleted || status.is_downloaded() || status.is_pending() {
                continue;
            }
            self.enqueue_book(&book.key())?;
        }
        info!(series = %key, "Series queued for download");
        Ok(true)
    }

    /// Dequeue and evict every book of the series that nothing else retains
    pub fn remove_series_downloads(&mut self, key: &EntityKey) -> Result<bool> {
        if SeriesRepository::new(self.conn).find(key)?.is_none() {
            return Ok(false);
        }
        self.reset_policy_to_manual(key)?;

        let origin = RetentionOrigin::Series(key.clone());
        let members = BookRepository::new(self.conn).series_members(key)?;
        for (book, state) in &members {
            self.remove_member(book, state, &origin, EvictionReason::SeriesRemoved)?;
        }
        info!(series = %key, "Series downloads removed");
        Ok(true)
    }

    fn remove_member(
        &mut self,
        book: &Book,
        state: &BookLocalState,
        origin: &RetentionOrigin,
        reason: EvictionReason,
    ) -> Result<()> {
        let status = &state.download_status;
        if *status == DownloadStatus::NotDownloaded {
            return Ok(());
        }
        if self.retained_elsewhere(Some(book), state, origin)? {
            return Ok(());
        }
        if status.is_downloaded() {
            self.report_eviction(state, reason);
        } else {
            self.transition_book(&state.key(), &TransitionRequest::to(DownloadStatus::NotDownloaded))?;
        }
        Ok(())
    }

    /// Queue the series when nothing of it is on the device, remove it otherwise
    pub fn toggle_series_download(&mut self, key: &EntityKey) -> Result<ToggleOutcome> {
        let Some(state) = SeriesRepository::new(self.conn).find_state(key)? else {
            return Ok(ToggleOutcome::MissingEntity);
        };
        if state.download_status == AggregateStatus::NotDownloaded {
            self.download_series(key)?;
            Ok(ToggleOutcome::Queued)
        } else {
            self.remove_series_downloads(key)?;
            Ok(ToggleOutcome::Removed)
        }
    }

    /// User removal of a single book. The owning series falls back to manual.
    pub fn delete_book_download(&mut self, key: &EntityKey) -> Result<TransitionOutcome> {
        let books = BookRepository::new(self.conn);
        let (Some(book), Some(state)) = (books.find(key)?, books.find_state(key)?) else {
            return Ok(TransitionOutcome::MissingEntity);
        };
        self.reset_policy_to_manual(&book.series_key())?;

        match &state.download_status {
            DownloadStatus::Downloaded => {
                self.report_eviction(&state, EvictionReason::ManualDelete);
                Ok(TransitionOutcome::Applied)
            }
            DownloadStatus::NotDownloaded => Ok(TransitionOutcome::Unchanged),
            _ => self.transition_book(key, &TransitionRequest::to(DownloadStatus::NotDownloaded)),
        }
    }

    /// Keep every book of the read list on the device
    pub fn download_read_list(&mut self, key: &EntityKey) -> Result<bool> {
        let repo = ReadListRepository::new(self.conn);
        let Some(read_list) = repo.find(key)? else {
            return Ok(false);
        };
        repo.ensure_state(key)?;
        if let Some(mut state) = repo.find_state(key)? {
            if !state.retain_offline {
                state.retain_offline = true;
                repo.save_state(&state)?;
            }
        }

        let members = BookRepository::new(self.conn).members_by_ids(&key.instance_id, &read_list.book_ids)?;
        for (book, state) in &members {
            let status = &state.download_status;
            if book.deleted || status.is_downloaded() || status.is_pending() {
                continue;
            }
            self.enqueue_book(&book.key())?;
        }
        info!(read_list = %key, books = members.len(), "Read list queued for download");
        Ok(true)
    }

    /// Stop retaining the read list and remove members nothing else retains
    pub fn remove_read_list_downloads(&mut self, key: &EntityKey) -> Result<bool> {
        let repo = ReadListRepository::new(self.conn);
        let Some(read_list) = repo.find(key)? else {
            return Ok(false);
        };
        if let Some(mut state) = repo.find_state(key)? {
            if state.retain_offline {
                state.retain_offline = false;
                repo.save_state(&state)?;
            }
        }

        let origin = RetentionOrigin::ReadList(key.clone());
        let members = BookRepository::new(self.conn).members_by_ids(&key.instance_id, &read_list.book_ids)?;
        for (book, state) in &members {
            self.remove_member(book, state, &origin, EvictionReason::ReadListRemoved)?;
        }
        info!(read_list = %key, "Read list downloads removed");
        Ok(true)
    }

    /// Report every read, downloaded book of the instance that is past the grace period
    pub fn cleanup_read_books(&mut self, instance_id: &str) -> Result<usize> {
        let downloaded = BookRepository::new(self.conn).downloaded(instance_id)?;
        let mut reported = 0;
        for (book, state) in &downloaded {
            let completed = book.read_progress.as_ref().map(|p| p.completed).unwrap_or(false);
            if !completed || !retention::cleanup_due(state.download_at, &self.settings, self.now) {
                continue;
            }
            if self.retained_elsewhere(Some(book), state, &RetentionOrigin::User)? {
                continue;
            }
            self.report_eviction(state, EvictionReason::CleanupRead);
            reported += 1;
        }
        info!(instance_id, reported, "Read books cleanup evaluated");
        Ok(reported)
    }

    /// Move every failed download of the instance back into the queue
    pub fn retry_failed(&mut self, instance_id: &str) -> Result<usize> {
        let failed = BookRepository::new(self.conn).states_with_status(instance_id, &["failed"], None)?;
        let mut retried = 0;
        for state in &failed {
            if self.enqueue_book(&state.key())? == TransitionOutcome::Applied {
                retried += 1;
            }
        }
        info!(instance_id, retried, "Failed downloads retried");
        Ok(retried)
    }

    /// Give up on every failed download of the instance
    pub fn cancel_failed(&mut self, instance_id: &str) -> Result<usize> {
        let failed = BookRepository::new(self.conn).states_with_status(instance_id, &["failed"], None)?;
        let mut cancelled = 0;
        for state in &failed {
            let request = TransitionRequest::to(DownloadStatus::NotDownloaded);
            if self.transition_book(&state.key(), &request)? == TransitionOutcome::Applied {
                cancelled += 1;
            }
        }
        info!(instance_id, cancelled, "Failed downloads cancelled");
        Ok(cancelled)
    }

    /// Recompute every aggregate of the instance from its members
    pub fn repair(&mut self, instance_id: &str) -> Result<RepairReport> {
        let mut report = RepairReport::default();

        for id in SeriesRepository::new(self.conn).ids(instance_id)? {
            let key = EntityKey::new(instance_id, id);
            aggregates::recompute_series_reading(self.conn, &key)?;
            if self.recompute_series(&key)?.is_some() {
                report.series += 1;
            }
        }

        for id in ReadListRepository::new(self.conn).ids(instance_id)? {
            if aggregates::recompute_read_list(self.conn, &EntityKey::new(instance_id, id))?.is_some() {
                report.read_lists += 1;
            }
        }

        info!(instance_id, series = report.series, read_lists = report.read_lists, "Aggregates repaired");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduled_grouping() {
        let mut decisions = Decisions::default();
        decisions.scheduled.push(EntityKey::new("a", "b2"));
        decisions.scheduled.push(EntityKey::new("b", "b9"));
        decisions.scheduled.push(EntityKey::new("a", "b1"));
        decisions.scheduled.push(EntityKey::new("a", "b2"));

        let grouped = decisions.scheduled_by_instance();
        assert_eq!(grouped["a"], vec!["b2".to_string(), "b1".to_string()]);
        assert_eq!(grouped["b"], vec!["b9".to_string()]);
    }

    #[test]
    fn test_merge() {
        let mut first = Decisions::default();
        first.scheduled.push(EntityKey::new("a", "b1"));
        let mut second = Decisions::default();
        second.evictions.push(EvictionCandidate {
            book: EntityKey::new("a", "b2"),
            downloaded_size: 5,
            reason: EvictionReason::ManualDelete,
        });

        first.merge(second);
        assert!(!first.is_empty());
        assert_eq!(first.evictions.len(), 1);
        assert_eq!(first.scheduled.len(), 1);
    }
}
