//! Rolling aggregate counters
//!
//! Series and read lists carry download counters, and series carry reading counters. Both are
//! maintained by applying per-book deltas. A delta that would leave the counters outside their
//! bounds is discarded and the aggregate is recomputed from its members instead.

use crate::core::error::{MirrorError, Result};
use crate::db::models::{
    Book, BookLocalState, EntityKey, ReadListLocalState, ReadProgress, Series, SeriesLocalState,
};
use crate::db::repository::{BookRepository, ReadListRepository, SeriesRepository};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Derived download status of a series or read list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AggregateStatus {
    NotDownloaded,
    Pending,
    PartiallyDownloaded,
    Downloaded,
}

impl AggregateStatus {
    pub fn raw(&self) -> &'static str {
        match self {
            AggregateStatus::NotDownloaded => "notDownloaded",
            AggregateStatus::Pending => "pending",
            AggregateStatus::PartiallyDownloaded => "partiallyDownloaded",
            AggregateStatus::Downloaded => "downloaded",
        }
    }

    pub fn from_raw(raw: &str) -> Result<Self> {
        match raw {
            "notDownloaded" => Ok(AggregateStatus::NotDownloaded),
            "pending" => Ok(AggregateStatus::Pending),
            "partiallyDownloaded" => Ok(AggregateStatus::PartiallyDownloaded),
            "downloaded" => Ok(AggregateStatus::Downloaded),
            other => Err(MirrorError::ValidationError(format!(
                "unknown aggregate status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    Series,
    ReadList,
}

/// Download counters shared by series and read lists
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadCounters {
    pub downloaded_books: i64,
    pub pending_books: i64,
    pub downloaded_size: i64,
    pub download_at: Option<DateTime<Utc>>,
}

impl DownloadCounters {
    pub fn of_series(state: &SeriesLocalState) -> Self {
        Self {
            downloaded_books: state.downloaded_books,
            pending_books: state.pending_books,
            downloaded_size: state.downloaded_size,
            download_at: state.download_at,
        }
    }

    pub fn of_read_list(state: &ReadListLocalState) -> Self {
        Self {
            downloaded_books: state.downloaded_books,
            pending_books: state.pending_books,
            downloaded_size: state.downloaded_size,
            download_at: state.download_at,
        }
    }

    fn store_series(&self, state: &mut SeriesLocalState, total: i64) {
        state.downloaded_books = self.downloaded_books;
        state.pending_books = self.pending_books;
        state.downloaded_size = self.downloaded_size;
        state.download_at = self.download_at;
        state.download_status = derive_status(self, total, AggregateKind::Series);
    }

    fn store_read_list(&self, state: &mut ReadListLocalState, total: i64) {
        state.downloaded_books = self.downloaded_books;
        state.pending_books = self.pending_books;
        state.downloaded_size = self.downloaded_size;
        state.download_at = self.download_at;
        state.download_status = derive_status(self, total, AggregateKind::ReadList);
    }

    fn within_bounds(&self, total: i64) -> bool {
        (0..=total).contains(&self.downloaded_books)
            && (0..=total).contains(&self.pending_books)
            && self.downloaded_books + self.pending_books <= total
            && self.downloaded_size >= 0
    }
}

/// The part of a book's local state that aggregates care about
#[derive(Debug, Clone, PartialEq)]
pub struct MemberDownload {
    pub downloaded: bool,
    pub pending: bool,
    pub size: i64,
    pub download_at: Option<DateTime<Utc>>,
}

impl From<&BookLocalState> for MemberDownload {
    fn from(state: &BookLocalState) -> Self {
        Self {
            downloaded: state.download_status.is_downloaded(),
            pending: state.download_status.is_pending(),
            size: state.downloaded_size,
            download_at: state.download_at,
        }
    }
}

impl MemberDownload {
    fn counted_size(&self) -> i64 {
        if self.downloaded {
            self.size
        } else {
            0
        }
    }
}

/// Derive the aggregate status from its counters
pub fn derive_status(counters: &DownloadCounters, total: i64, kind: AggregateKind) -> AggregateStatus {
    if total > 0 && counters.downloaded_books == total {
        AggregateStatus::Downloaded
    } else if counters.pending_books > 0 {
        AggregateStatus::Pending
    } else if kind == AggregateKind::ReadList && counters.downloaded_books > 0 {
        AggregateStatus::PartiallyDownloaded
    } else {
        AggregateStatus::NotDownloaded
    }
}

/// Apply one member's change to the counters.
///
/// Returns `None` when the result cannot be trusted and a full recompute is required.
pub fn apply_download_delta(
    current: &DownloadCounters,
    total: i64,
    old: &MemberDownload,
    new: &MemberDownload,
) -> Option<DownloadCounters> {
    let mut next = DownloadCounters {
        downloaded_books: current.downloaded_books + new.downloaded as i64 - old.downloaded as i64,
        pending_books: current.pending_books + new.pending as i64 - old.pending as i64,
        downloaded_size: current.downloaded_size + new.counted_size() - old.counted_size(),
        download_at: current.download_at,
    };

    if !next.within_bounds(total) {
        return None;
    }

    if next.downloaded_books == 0 {
        next.download_at = None;
        return Some(next);
    }

    // The member holding the latest timestamp left or moved back; the next latest is unknown.
    let held_latest = old.downloaded && old.download_at.is_some() && old.download_at == current.download_at;
    if held_latest && (!new.downloaded || new.download_at < old.download_at) {
        return None;
    }

    if new.downloaded {
        let at = new.download_at?;
        next.download_at = Some(match current.download_at {
            Some(existing) if existing > at => existing,
            _ => at,
        });
    }

    Some(next)
}

/// Counters from scratch over every member
pub fn recompute_download<'a, I>(members: I) -> DownloadCounters
where
    I: IntoIterator<Item = &'a MemberDownload>,
{
    let mut counters = DownloadCounters::default();
    for member in members {
        if member.downloaded {
            counters.downloaded_books += 1;
            counters.downloaded_size += member.size;
            if member.download_at > counters.download_at {
                counters.download_at = member.download_at;
            }
        }
        if member.pending {
            counters.pending_books += 1;
        }
    }
    counters
}

/// Reading classification of a single book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadingState {
    Unread,
    InProgress,
    Read,
}

impl ReadingState {
    pub fn of(progress: Option<&ReadProgress>) -> Self {
        match progress {
            Some(p) if p.completed => ReadingState::Read,
            Some(p) if p.page > 0 => ReadingState::InProgress,
            _ => ReadingState::Unread,
        }
    }
}

/// Reading counters of a series
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingCounters {
    pub read: i64,
    pub unread: i64,
    pub in_progress: i64,
}

impl ReadingCounters {
    pub fn of_series(series: &Series) -> Self {
        Self {
            read: series.books_read_count,
            unread: series.books_unread_count,
            in_progress: series.books_in_progress_count,
        }
    }

    pub fn sum(&self) -> i64 {
        self.read + self.unread + self.in_progress
    }

    fn slot(&mut self, state: ReadingState) -> &mut i64 {
        match state {
            ReadingState::Unread => &mut self.unread,
            ReadingState::InProgress => &mut self.in_progress,
            ReadingState::Read => &mut self.read,
        }
    }
}

/// Move one book between reading classes; `None` means recompute
pub fn apply_reading_delta(
    current: &ReadingCounters,
    books_count: i64,
    old: ReadingState,
    new: ReadingState,
) -> Option<ReadingCounters> {
    if current.sum() != books_count {
        return None;
    }

    let mut next = *current;
    *next.slot(old) -= 1;
    *next.slot(new) += 1;

    let bounds = 0..=books_count;
    if bounds.contains(&next.read) && bounds.contains(&next.unread) && bounds.contains(&next.in_progress) {
        Some(next)
    } else {
        None
    }
}

/// Reading counters from scratch; books the mirror does not hold yet count as unread
pub fn recompute_reading(states: &[ReadingState], books_count: i64) -> ReadingCounters {
    let mut counters = ReadingCounters::default();
    for state in states {
        *counters.slot(*state) += 1;
    }
    let total = books_count.max(states.len() as i64);
    counters.unread = total - counters.read - counters.in_progress;
    counters
}

/// Full recompute of a series download aggregate. `None` when the series is not mirrored.
pub fn recompute_series(conn: &Connection, key: &EntityKey) -> Result<Option<SeriesLocalState>> {
    let series_repo = SeriesRepository::new(conn);
    let Some(series) = series_repo.find(key)? else {
        return Ok(None);
    };

    let members = BookRepository::new(conn).series_members(key)?;
    let downloads: Vec<MemberDownload> = members.iter().map(|(_, s)| MemberDownload::from(s)).collect();
    let total = series.books_count.max(members.len() as i64);

    let existing = series_repo.find_state(key)?;
    let mut state = existing.clone().unwrap_or_else(|| SeriesLocalState::empty(key));
    recompute_download(&downloads).store_series(&mut state, total);

    if existing.as_ref() != Some(&state) {
        series_repo.save_state(&state)?;
    }
    debug!(series = %key, downloaded = state.downloaded_books, pending = state.pending_books, "Series aggregate recomputed");
    Ok(Some(state))
}

/// Full recompute of a read-list download aggregate. `None` when the read list is not mirrored.
pub fn recompute_read_list(conn: &Connection, key: &EntityKey) -> Result<Option<ReadListLocalState>> {
    let repo = ReadListRepository::new(conn);
    let Some(read_list) = repo.find(key)? else {
        return Ok(None);
    };

    let members = BookRepository::new(conn).members_by_ids(&key.instance_id, &read_list.book_ids)?;
    let downloads: Vec<MemberDownload> = members.iter().map(|(_, s)| MemberDownload::from(s)).collect();
    let total = read_list.book_ids.len() as i64;

    let existing = repo.find_state(key)?;
    let mut state = existing.clone().unwrap_or_else(|| ReadListLocalState::empty(key));
    recompute_download(&downloads).store_read_list(&mut state, total);

    if existing.as_ref() != Some(&state) {
        repo.save_state(&state)?;
    }
    debug!(read_list = %key, downloaded = state.downloaded_books, pending = state.pending_books, "Read list aggregate recomputed");
    Ok(Some(state))
}

/// Propagate a book's download change to its series and every read list referencing it
pub fn propagate_download(
    conn: &Connection,
    book: Option<&Book>,
    old: &BookLocalState,
    new: &BookLocalState,
) -> Result<()> {
    let before = MemberDownload::from(old);
    let after = MemberDownload::from(new);
    if before == after {
        return Ok(());
    }

    if let Some(book) = book {
        propagate_to_series(conn, &book.series_key(), &before, &after)?;
    }

    let mut read_lists: Vec<&String> = new.read_list_ids.iter().chain(old.read_list_ids.iter()).collect();
    read_lists.sort();
    read_lists.dedup();
    for id in read_lists {
        propagate_to_read_list(conn, &EntityKey::new(&new.instance_id, id), &before, &after)?;
    }
    Ok(())
}

fn propagate_to_series(
    conn: &Connection,
    key: &EntityKey,
    before: &MemberDownload,
    after: &MemberDownload,
) -> Result<()> {
    let repo = SeriesRepository::new(conn);
    let (Some(series), Some(mut state)) = (repo.find(key)?, repo.find_state(key)?) else {
        recompute_series(conn, key)?;
        return Ok(());
    };

    let total = series.books_count.max(repo.member_count(key)?);
    match apply_download_delta(&DownloadCounters::of_series(&state), total, before, after) {
        Some(counters) => {
            counters.store_series(&mut state, total);
            repo.save_state(&state)
        }
        None => {
            debug!(series = %key, "Series download delta rejected, recomputing");
            recompute_series(conn, key).map(|_| ())
        }
    }
}

fn propagate_to_read_list(
    conn: &Connection,
    key: &EntityKey,
    before: &MemberDownload,
    after: &MemberDownload,
) -> Result<()> {
    let repo = ReadListRepository::new(conn);
    let (Some(read_list), Some(mut state)) = (repo.find(key)?, repo.find_state(key)?) else {
        recompute_read_list(conn, key)?;
        return Ok(());
    };

    let total = read_list.book_ids.len() as i64;
    match apply_download_delta(&DownloadCounters::of_read_list(&state), total, before, after) {
        Some(counters) => {
            counters.store_read_list(&mut state, total);
            repo.save_state(&state)
        }
        None => {
            debug!(read_list = %key, "Read list download delta rejected, recomputing");
            recompute_read_list(conn, key).map(|_| ())
        }
    }
}

/// Move one book between reading classes on its series
pub fn propagate_reading(
    conn: &Connection,
    series_key: &EntityKey,
    old: ReadingState,
    new: ReadingState,
) -> Result<()> {
    if old == new {
        return Ok(());
    }

    let repo = SeriesRepository::new(conn);
    let Some(series) = repo.find(series_key)? else {
        return Ok(());
    };

    match apply_reading_delta(&ReadingCounters::of_series(&series), series.books_count, old, new) {
        Some(counters) => repo.set_reading_counters(series_key, &counters),
        None => {
            debug!(series = %series_key, "Reading delta rejected, recomputing");
            recompute_series_reading(conn, series_key).map(|_| ())
        }
    }
}

/// Full recompute of a series' reading counters from its mirrored books
pub fn recompute_series_reading(conn: &Connection, key: &EntityKey) -> Result<Option<ReadingCounters>> {
    let repo = SeriesRepository::new(conn);
    let Some(series) = repo.find(key)? else {
        return Ok(None);
    };

    let states: Vec<ReadingState> = BookRepository::new(conn)
        .series_members(key)?
        .iter()
        .map(|(book, _)| ReadingState::of(book.read_progress.as_ref()))
        .collect();
    let counters = recompute_reading(&states, series.books_count);
    if counters != ReadingCounters::of_series(&series) {
        repo.set_reading_counters(key, &counters)?;
    }
    Ok(Some(counters))
}
