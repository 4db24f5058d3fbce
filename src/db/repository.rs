//! Repository pattern implementation for data access layer
//!
//! Repositories borrow a connection, so the same code serves the writer's transactions and the
//! read pool. Every SQL statement of the crate lives here.

use crate::core::aggregates::{AggregateStatus, ReadingCounters};
use crate::core::download_state::DownloadStatus;
use crate::core::error::{MirrorError, Result};
use crate::core::retention::OfflinePolicy;
use crate::db::models::{
    from_millis, to_millis, Book, BookLocalState, Collection, DownloadQueueSummary, EntityKey,
    Instance, Library, PendingProgress, ReadList, ReadListLocalState, ReadProgress, Series,
    SeriesLocalState,
};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

fn json_text<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(MirrorError::SerializationError)
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn converted<T>(idx: usize, value: Result<T>) -> rusqlite::Result<T> {
    value.map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn ts_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(from_millis(row.get(idx)?))
}

fn opt_ts_column(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row.get::<_, Option<i64>>(idx)?.map(from_millis))
}

fn opt_millis(ts: &Option<DateTime<Utc>>) -> Option<i64> {
    ts.as_ref().map(to_millis)
}

/// Repository for instances
pub struct InstanceRepository<'c> {
    conn: &'c Connection,
}

const INSTANCE_COLUMNS: &str = "id, name, server_url, username, is_admin, created_at, last_used_at, \
     series_last_synced_at, books_last_synced_at";

fn instance_from_row(row: &Row) -> rusqlite::Result<Instance> {
    Ok(Instance {
        id: row.get(0)?,
        name: row.get(1)?,
        server_url: row.get(2)?,
        username: row.get(3)?,
        is_admin: row.get(4)?,
        created_at: ts_column(row, 5)?,
        last_used_at: ts_column(row, 6)?,
        series_last_synced_at: ts_column(row, 7)?,
        books_last_synced_at: ts_column(row, 8)?,
    })
}

impl<'c> InstanceRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn find(&self, id: &str) -> Result<Option<Instance>> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM instances WHERE id = ?1", INSTANCE_COLUMNS),
                [id],
                instance_from_row,
            )
            .optional()
            .map_err(MirrorError::DatabaseError)
    }

    /// Instances are unique per (server URL, username)
    pub fn find_by_identity(&self, server_url: &str, username: &str) -> Result<Option<Instance>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM instances WHERE server_url = ?1 AND username = ?2",
                    INSTANCE_COLUMNS
                ),
                [server_url, username],
                instance_from_row,
            )
            .optional()
            .map_err(MirrorError::DatabaseError)
    }

    pub fn list(&self) -> Result<Vec<Instance>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM instances ORDER BY last_used_at DESC",
                INSTANCE_COLUMNS
            ))
            .map_err(MirrorError::DatabaseError)?;
        let instances = stmt
            .query_map([], instance_from_row)
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(instances)
    }

    pub fn save(&self, instance: &Instance) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO instances (id, name, server_url, username, is_admin, created_at, \
                 last_used_at, series_last_synced_at, books_last_synced_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, server_url = excluded.server_url, \
                 username = excluded.username, is_admin = excluded.is_admin, \
                 last_used_at = excluded.last_used_at, \
                 series_last_synced_at = excluded.series_last_synced_at, \
                 books_last_synced_at = excluded.books_last_synced_at",
                params![
                    instance.id,
                    instance.name,
                    instance.server_url,
                    instance.username,
                    instance.is_admin,
                    to_millis(&instance.created_at),
                    to_millis(&instance.last_used_at),
                    to_millis(&instance.series_last_synced_at),
                    to_millis(&instance.books_last_synced_at),
                ],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM instances WHERE id = ?1", [id])
            .map_err(MirrorError::DatabaseError)?;
        Ok(deleted > 0)
    }

    /// Remove every mirrored row, local state and queued progress of an instance
    pub fn purge(&self, instance_id: &str) -> Result<usize> {
        let mut removed = 0;
        for table in [
            "pending_progress",
            "book_local_state",
            "books",
            "series_local_state",
            "series",
            "read_list_local_state",
            "read_lists",
            "collections",
            "libraries",
        ] {
            removed += self
                .conn
                .execute(
                    &format!("DELETE FROM {} WHERE instance_id = ?1", table),
                    [instance_id],
                )
                .map_err(MirrorError::DatabaseError)?;
        }
        Ok(removed)
    }
}

/// Repository for libraries
pub struct LibraryRepository<'c> {
    conn: &'c Connection,
}

impl<'c> LibraryRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn list(&self, instance_id: &str) -> Result<Vec<Library>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT instance_id, library_id, name FROM libraries \
                 WHERE instance_id = ?1 ORDER BY name",
            )
            .map_err(MirrorError::DatabaseError)?;
        let libraries = stmt
            .query_map([instance_id], |row| {
                Ok(Library {
                    instance_id: row.get(0)?,
                    library_id: row.get(1)?,
                    name: row.get(2)?,
                })
            })
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(libraries)
    }

    pub fn save(&self, library: &Library) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO libraries (instance_id, library_id, name) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(instance_id, library_id) DO UPDATE SET name = excluded.name",
                params![library.instance_id, library.library_id, library.name],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(())
    }

    pub fn delete(&self, instance_id: &str, library_id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM libraries WHERE instance_id = ?1 AND library_id = ?2",
                [instance_id, library_id],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(deleted > 0)
    }
}

/// Repository for series and their local state
pub struct SeriesRepository<'c> {
    conn: &'c Connection,
}

const SERIES_COLUMNS: &str = "instance_id, series_id, library_id, name, url, created, last_modified, \
     books_count, books_read_count, books_unread_count, books_in_progress_count, metadata, \
     books_metadata, deleted, oneshot";

const SERIES_STATE_COLUMNS: &str = "instance_id, series_id, status_raw, downloaded_books, \
     pending_books, downloaded_size, download_at, policy_raw, policy_limit, collection_ids";

fn series_from_row(row: &Row) -> rusqlite::Result<Series> {
    Ok(Series {
        instance_id: row.get(0)?,
        series_id: row.get(1)?,
        library_id: row.get(2)?,
        name: row.get(3)?,
        url: row.get(4)?,
        created: ts_column(row, 5)?,
        last_modified: ts_column(row, 6)?,
        books_count: row.get(7)?,
        books_read_count: row.get(8)?,
        books_unread_count: row.get(9)?,
        books_in_progress_count: row.get(10)?,
        metadata: json_column(row, 11)?,
        books_metadata: json_column(row, 12)?,
        deleted: row.get(13)?,
        oneshot: row.get(14)?,
    })
}

fn series_state_from_row(row: &Row) -> rusqlite::Result<SeriesLocalState> {
    let raw: String = row.get(2)?;
    let policy_raw: String = row.get(7)?;
    Ok(SeriesLocalState {
        instance_id: row.get(0)?,
        series_id: row.get(1)?,
        download_status: converted(2, AggregateStatus::from_raw(&raw))?,
        downloaded_books: row.get(3)?,
        pending_books: row.get(4)?,
        downloaded_size: row.get(5)?,
        download_at: opt_ts_column(row, 6)?,
        offline_policy: converted(7, OfflinePolicy::from_parts(&policy_raw, row.get(8)?))?,
        collection_ids: json_column(row, 9)?,
    })
}

impl<'c> SeriesRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn find(&self, key: &EntityKey) -> Result<Option<Series>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM series WHERE instance_id = ?1 AND series_id = ?2",
                    SERIES_COLUMNS
                ),
                [&key.instance_id, &key.id],
                series_from_row,
            )
            .optional()
            .map_err(MirrorError::DatabaseError)
    }

    /// Load the existing rows for a batch, keyed by series id
    pub fn find_many(&self, instance_id: &str, ids: &[String]) -> Result<HashMap<String, Series>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM series WHERE instance_id = ?1 \
                 AND series_id IN (SELECT value FROM json_each(?2))",
                SERIES_COLUMNS
            ))
            .map_err(MirrorError::DatabaseError)?;
        let rows = stmt
            .query_map(params![instance_id, json_text(ids)?], series_from_row)
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(rows.into_iter().map(|s| (s.series_id.clone(), s)).collect())
    }

    pub fn ids(&self, instance_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT series_id FROM series WHERE instance_id = ?1 ORDER BY series_id")
            .map_err(MirrorError::DatabaseError)?;
        let ids = stmt
            .query_map([instance_id], |row| row.get(0))
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(ids)
    }

    pub fn save(&self, series: &Series) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO series ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15) \
                     ON CONFLICT(instance_id, series_id) DO UPDATE SET library_id = excluded.library_id, \
                     name = excluded.name, url = excluded.url, created = excluded.created, \
                     last_modified = excluded.last_modified, books_count = excluded.books_count, \
                     books_read_count = excluded.books_read_count, \
                     books_unread_count = excluded.books_unread_count, \
                     books_in_progress_count = excluded.books_in_progress_count, \
                     metadata = excluded.metadata, books_metadata = excluded.books_metadata, \
                     deleted = excluded.deleted, oneshot = excluded.oneshot",
                    SERIES_COLUMNS
                ),
                params![
                    series.instance_id,
                    series.series_id,
                    series.library_id,
                    series.name,
                    series.url,
                    to_millis(&series.created),
                    to_millis(&series.last_modified),
                    series.books_count,
                    series.books_read_count,
                    series.books_unread_count,
                    series.books_in_progress_count,
                    json_text(&series.metadata)?,
                    json_text(&series.books_metadata)?,
                    series.deleted,
                    series.oneshot,
                ],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(())
    }

    pub fn delete(&self, key: &EntityKey) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM series WHERE instance_id = ?1 AND series_id = ?2",
                [&key.instance_id, &key.id],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(deleted > 0)
    }

    /// Number of mirrored book rows belonging to the series
    pub fn member_count(&self, key: &EntityKey) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM books WHERE instance_id = ?1 AND series_id = ?2",
                [&key.instance_id, &key.id],
                |row| row.get(0),
            )
            .map_err(MirrorError::DatabaseError)
    }

    pub fn set_reading_counters(&self, key: &EntityKey, counters: &ReadingCounters) -> Result<()> {
        self.conn
            .execute(
                "UPDATE series SET books_read_count = ?3, books_unread_count = ?4, \
                 books_in_progress_count = ?5 WHERE instance_id = ?1 AND series_id = ?2",
                params![
                    key.instance_id,
                    key.id,
                    counters.read,
                    counters.unread,
                    counters.in_progress
                ],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(())
    }

    pub fn find_state(&self, key: &EntityKey) -> Result<Option<SeriesLocalState>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM series_local_state WHERE instance_id = ?1 AND series_id = ?2",
                    SERIES_STATE_COLUMNS
                ),
                [&key.instance_id, &key.id],
                series_state_from_row,
            )
            .optional()
            .map_err(MirrorError::DatabaseError)
    }

    /// Create the empty local state row if it does not exist yet
    pub fn ensure_state(&self, key: &EntityKey) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO series_local_state (instance_id, series_id) VALUES (?1, ?2)",
                [&key.instance_id, &key.id],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(inserted > 0)
    }

    pub fn save_state(&self, state: &SeriesLocalState) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO series_local_state ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
                     ON CONFLICT(instance_id, series_id) DO UPDATE SET status_raw = excluded.status_raw, \
                     downloaded_books = excluded.downloaded_books, pending_books = excluded.pending_books, \
                     downloaded_size = excluded.downloaded_size, download_at = excluded.download_at, \
                     policy_raw = excluded.policy_raw, policy_limit = excluded.policy_limit, \
                     collection_ids = excluded.collection_ids",
                    SERIES_STATE_COLUMNS
                ),
                params![
                    state.instance_id,
                    state.series_id,
                    state.download_status.raw(),
                    state.downloaded_books,
                    state.pending_books,
                    state.downloaded_size,
                    opt_millis(&state.download_at),
                    state.offline_policy.raw(),
                    state.offline_policy.limit(),
                    json_text(&state.collection_ids)?,
                ],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(())
    }
}

/// Repository for books and their local state
pub struct BookRepository<'c> {
    conn: &'c Connection,
}

const BOOK_COLUMNS: &str = "b.instance_id, b.book_id, b.series_id, b.library_id, b.name, b.url, \
     b.number, b.number_sort, b.created, b.last_modified, b.size_bytes, b.media, b.metadata, \
     b.progress_page, b.progress_completed, b.progress_read_date, b.progress_last_modified, \
     b.deleted, b.oneshot, b.series_title";

const BOOK_COLUMN_COUNT: usize = 20;

const BOOK_STATE_COLUMNS: &str = "s.instance_id, s.book_id, s.status_raw, s.download_progress, \
     s.download_error, s.downloaded_size, s.download_at, s.pages, s.toc, s.webpub_manifest, \
     s.epub_progression, s.read_list_ids";

fn book_from_row(row: &Row) -> rusqlite::Result<Book> {
    let read_progress = match row.get::<_, Option<i64>>(13)? {
        Some(page) => Some(ReadProgress {
            page,
            completed: row.get::<_, Option<bool>>(14)?.unwrap_or(false),
            read_date: opt_ts_column(row, 15)?,
            last_modified: opt_ts_column(row, 16)?.unwrap_or_default(),
        }),
        None => None,
    };

    Ok(Book {
        instance_id: row.get(0)?,
        book_id: row.get(1)?,
        series_id: row.get(2)?,
        library_id: row.get(3)?,
        name: row.get(4)?,
        url: row.get(5)?,
        number: row.get(6)?,
        number_sort: row.get(7)?,
        created: ts_column(row, 8)?,
        last_modified: ts_column(row, 9)?,
        size_bytes: row.get(10)?,
        media: json_column(row, 11)?,
        metadata: json_column(row, 12)?,
        read_progress,
        deleted: row.get(17)?,
        oneshot: row.get(18)?,
        series_title: row.get(19)?,
    })
}

fn book_state_from_row(row: &Row, offset: usize) -> rusqlite::Result<BookLocalState> {
    let raw: String = row.get(offset + 2)?;
    let status = DownloadStatus::from_parts(&raw, row.get(offset + 3)?, row.get(offset + 4)?);
    Ok(BookLocalState {
        instance_id: row.get(offset)?,
        book_id: row.get(offset + 1)?,
        download_status: converted(offset + 2, status)?,
        downloaded_size: row.get(offset + 5)?,
        download_at: opt_ts_column(row, offset + 6)?,
        pages: row.get(offset + 7)?,
        toc: row.get(offset + 8)?,
        webpub_manifest: row.get(offset + 9)?,
        epub_progression: row.get(offset + 10)?,
        read_list_ids: json_column(row, offset + 11)?,
    })
}

fn member_from_row(row: &Row) -> rusqlite::Result<(Book, BookLocalState)> {
    Ok((book_from_row(row)?, book_state_from_row(row, BOOK_COLUMN_COUNT)?))
}

impl<'c> BookRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn find(&self, key: &EntityKey) -> Result<Option<Book>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM books b WHERE b.instance_id = ?1 AND b.book_id = ?2",
                    BOOK_COLUMNS
                ),
                [&key.instance_id, &key.id],
                book_from_row,
            )
            .optional()
            .map_err(MirrorError::DatabaseError)
    }

    /// Load the existing rows for a batch, keyed by book id
    pub fn find_many(&self, instance_id: &str, ids: &[String]) -> Result<HashMap<String, Book>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM books b WHERE b.instance_id = ?1 \
                 AND b.book_id IN (SELECT value FROM json_each(?2))",
                BOOK_COLUMNS
            ))
            .map_err(MirrorError::DatabaseError)?;
        let rows = stmt
            .query_map(params![instance_id, json_text(ids)?], book_from_row)
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(rows.into_iter().map(|b| (b.book_id.clone(), b)).collect())
    }

    pub fn save(&self, book: &Book) -> Result<()> {
        let progress = book.read_progress.as_ref();
        self.conn
            .execute(
                "INSERT INTO books (instance_id, book_id, series_id, library_id, name, url, number, \
                 number_sort, created, last_modified, size_bytes, media, metadata, progress_page, \
                 progress_completed, progress_read_date, progress_last_modified, deleted, oneshot, \
                 series_title) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20) \
                 ON CONFLICT(instance_id, book_id) DO UPDATE SET series_id = excluded.series_id, \
                 library_id = excluded.library_id, name = excluded.name, url = excluded.url, \
                 number = excluded.number, number_sort = excluded.number_sort, \
                 created = excluded.created, last_modified = excluded.last_modified, \
                 size_bytes = excluded.size_bytes, media = excluded.media, \
                 metadata = excluded.metadata, progress_page = excluded.progress_page, \
                 progress_completed = excluded.progress_completed, \
                 progress_read_date = excluded.progress_read_date, \
                 progress_last_modified = excluded.progress_last_modified, \
                 deleted = excluded.deleted, oneshot = excluded.oneshot, \
                 series_title = excluded.series_title",
                params![
                    book.instance_id,
                    book.book_id,
                    book.series_id,
                    book.library_id,
                    book.name,
                    book.url,
                    book.number,
                    book.number_sort,
                    to_millis(&book.created),
                    to_millis(&book.last_modified),
                    book.size_bytes,
                    json_text(&book.media)?,
                    json_text(&book.metadata)?,
                    progress.map(|p| p.page),
                    progress.map(|p| p.completed),
                    progress.and_then(|p| p.read_date.as_ref().map(to_millis)),
                    progress.map(|p| to_millis(&p.last_modified)),
                    book.deleted,
                    book.oneshot,
                    book.series_title,
                ],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(())
    }

    pub fn delete(&self, key: &EntityKey) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM books WHERE instance_id = ?1 AND book_id = ?2",
                [&key.instance_id, &key.id],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(deleted > 0)
    }

    pub fn find_state(&self, key: &EntityKey) -> Result<Option<BookLocalState>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM book_local_state s WHERE s.instance_id = ?1 AND s.book_id = ?2",
                    BOOK_STATE_COLUMNS
                ),
                [&key.instance_id, &key.id],
                |row| book_state_from_row(row, 0),
            )
            .optional()
            .map_err(MirrorError::DatabaseError)
    }

    /// Create the empty local state row if it does not exist yet
    pub fn ensure_state(&self, key: &EntityKey) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO book_local_state (instance_id, book_id) VALUES (?1, ?2)",
                [&key.instance_id, &key.id],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(inserted > 0)
    }

    pub fn save_state(&self, state: &BookLocalState) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO book_local_state (instance_id, book_id, status_raw, download_progress, \
                 download_error, downloaded_size, download_at, pages, toc, webpub_manifest, \
                 epub_progression, read_list_ids) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                 ON CONFLICT(instance_id, book_id) DO UPDATE SET status_raw = excluded.status_raw, \
                 download_progress = excluded.download_progress, \
                 download_error = excluded.download_error, \
                 downloaded_size = excluded.downloaded_size, download_at = excluded.download_at, \
                 pages = excluded.pages, toc = excluded.toc, \
                 webpub_manifest = excluded.webpub_manifest, \
                 epub_progression = excluded.epub_progression, \
                 read_list_ids = excluded.read_list_ids",
                params![
                    state.instance_id,
                    state.book_id,
                    state.download_status.raw(),
                    state.download_status.progress(),
                    state.download_status.error(),
                    state.downloaded_size,
                    opt_millis(&state.download_at),
                    state.pages,
                    state.toc,
                    state.webpub_manifest,
                    state.epub_progression,
                    json_text(&state.read_list_ids)?,
                ],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(())
    }

    pub fn set_read_progress(&self, key: &EntityKey, progress: &ReadProgress) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE books SET progress_page = ?3, progress_completed = ?4, \
                 progress_read_date = ?5, progress_last_modified = ?6 \
                 WHERE instance_id = ?1 AND book_id = ?2",
                params![
                    key.instance_id,
                    key.id,
                    progress.page,
                    progress.completed,
                    opt_millis(&progress.read_date),
                    to_millis(&progress.last_modified),
                ],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(updated > 0)
    }

    /// Books of a series with their local state, in reading order
    pub fn series_members(&self, series: &EntityKey) -> Result<Vec<(Book, BookLocalState)>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {}, {} FROM books b JOIN book_local_state s \
                 ON s.instance_id = b.instance_id AND s.book_id = b.book_id \
                 WHERE b.instance_id = ?1 AND b.series_id = ?2 \
                 ORDER BY b.number_sort, b.book_id",
                BOOK_COLUMNS, BOOK_STATE_COLUMNS
            ))
            .map_err(MirrorError::DatabaseError)?;
        let members = stmt
            .query_map([&series.instance_id, &series.id], member_from_row)
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(members)
    }

    /// Mirrored books among `ids` with their local state
    pub fn members_by_ids(
        &self,
        instance_id: &str,
        ids: &[String],
    ) -> Result<Vec<(Book, BookLocalState)>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {}, {} FROM books b JOIN book_local_state s \
                 ON s.instance_id = b.instance_id AND s.book_id = b.book_id \
                 WHERE b.instance_id = ?1 AND b.book_id IN (SELECT value FROM json_each(?2)) \
                 ORDER BY b.number_sort, b.book_id",
                BOOK_COLUMNS, BOOK_STATE_COLUMNS
            ))
            .map_err(MirrorError::DatabaseError)?;
        let members = stmt
            .query_map(params![instance_id, json_text(ids)?], member_from_row)
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(members)
    }

    /// Local states of an instance in the given statuses, oldest `download_at` first
    pub fn states_with_status(
        &self,
        instance_id: &str,
        statuses: &[&str],
        limit: Option<usize>,
    ) -> Result<Vec<BookLocalState>> {
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM book_local_state s WHERE s.instance_id = ?1 \
                 AND s.status_raw IN (SELECT value FROM json_each(?2)) \
                 ORDER BY s.download_at IS NULL, s.download_at, s.book_id LIMIT ?3",
                BOOK_STATE_COLUMNS
            ))
            .map_err(MirrorError::DatabaseError)?;
        let states = stmt
            .query_map(params![instance_id, json_text(statuses)?, limit], |row| {
                book_state_from_row(row, 0)
            })
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(states)
    }

    /// Latest queue timestamp among queued and in-flight books
    pub fn latest_queue_stamp(&self) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<i64> = self
            .conn
            .query_row(
                "SELECT MAX(download_at) FROM book_local_state \
                 WHERE status_raw IN ('pending', 'downloading')",
                [],
                |row| row.get(0),
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(latest.map(from_millis))
    }

    /// Instances with at least one book in the given statuses
    pub fn instances_with_status(&self, statuses: &[&str]) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT DISTINCT instance_id FROM book_local_state \
                 WHERE status_raw IN (SELECT value FROM json_each(?1)) ORDER BY instance_id",
            )
            .map_err(MirrorError::DatabaseError)?;
        let ids = stmt
            .query_map([json_text(statuses)?], |row| row.get(0))
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(ids)
    }

    /// Downloaded books of an instance with their catalog rows, most recent first
    pub fn downloaded(&self, instance_id: &str) -> Result<Vec<(Book, BookLocalState)>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {}, {} FROM books b JOIN book_local_state s \
                 ON s.instance_id = b.instance_id AND s.book_id = b.book_id \
                 WHERE b.instance_id = ?1 AND s.status_raw = 'downloaded' \
                 ORDER BY s.download_at DESC, b.book_id",
                BOOK_COLUMNS, BOOK_STATE_COLUMNS
            ))
            .map_err(MirrorError::DatabaseError)?;
        let members = stmt
            .query_map([instance_id], member_from_row)
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(members)
    }

    pub fn queue_summary(&self, instance_id: &str) -> Result<DownloadQueueSummary> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT status_raw, COUNT(*), COALESCE(SUM(downloaded_size), 0) \
                 FROM book_local_state WHERE instance_id = ?1 GROUP BY status_raw",
            )
            .map_err(MirrorError::DatabaseError)?;
        let rows = stmt
            .query_map([instance_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
            })
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MirrorError::DatabaseError)?;

        let mut summary = DownloadQueueSummary::default();
        for (raw, count, size) in rows {
            match raw.as_str() {
                "pending" => summary.pending = count,
                "downloading" => summary.downloading = count,
                "downloaded" => {
                    summary.downloaded = count;
                    summary.downloaded_size = size;
                }
                "failed" => summary.failed = count,
                _ => {}
            }
        }
        Ok(summary)
    }
}

/// Repository for collections
pub struct CollectionRepository<'c> {
    conn: &'c Connection,
}

const COLLECTION_COLUMNS: &str = "instance_id, collection_id, name, ordered, filtered, \
     created_date, last_modified_date, series_ids";

fn collection_from_row(row: &Row) -> rusqlite::Result<Collection> {
    Ok(Collection {
        instance_id: row.get(0)?,
        collection_id: row.get(1)?,
        name: row.get(2)?,
        ordered: row.get(3)?,
        filtered: row.get(4)?,
        created_date: ts_column(row, 5)?,
        last_modified_date: ts_column(row, 6)?,
        series_ids: json_column(row, 7)?,
    })
}

impl<'c> CollectionRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn find(&self, key: &EntityKey) -> Result<Option<Collection>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM collections WHERE instance_id = ?1 AND collection_id = ?2",
                    COLLECTION_COLUMNS
                ),
                [&key.instance_id, &key.id],
                collection_from_row,
            )
            .optional()
            .map_err(MirrorError::DatabaseError)
    }

    pub fn find_many(&self, instance_id: &str, ids: &[String]) -> Result<HashMap<String, Collection>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM collections WHERE instance_id = ?1 \
                 AND collection_id IN (SELECT value FROM json_each(?2))",
                COLLECTION_COLUMNS
            ))
            .map_err(MirrorError::DatabaseError)?;
        let rows = stmt
            .query_map(params![instance_id, json_text(ids)?], collection_from_row)
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(rows.into_iter().map(|c| (c.collection_id.clone(), c)).collect())
    }

    pub fn save(&self, collection: &Collection) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO collections ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(instance_id, collection_id) DO UPDATE SET name = excluded.name, \
                     ordered = excluded.ordered, filtered = excluded.filtered, \
                     created_date = excluded.created_date, \
                     last_modified_date = excluded.last_modified_date, \
                     series_ids = excluded.series_ids",
                    COLLECTION_COLUMNS
                ),
                params![
                    collection.instance_id,
                    collection.collection_id,
                    collection.name,
                    collection.ordered,
                    collection.filtered,
                    to_millis(&collection.created_date),
                    to_millis(&collection.last_modified_date),
                    json_text(&collection.series_ids)?,
                ],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(())
    }

    pub fn delete(&self, key: &EntityKey) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM collections WHERE instance_id = ?1 AND collection_id = ?2",
                [&key.instance_id, &key.id],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(deleted > 0)
    }

    /// Ids of the collections listing `series_id`
    pub fn containing_series(&self, instance_id: &str, series_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT collection_id FROM collections WHERE instance_id = ?1 \
                 AND EXISTS (SELECT 1 FROM json_each(collections.series_ids) WHERE value = ?2) \
                 ORDER BY collection_id",
            )
            .map_err(MirrorError::DatabaseError)?;
        let ids = stmt
            .query_map([instance_id, series_id], |row| row.get(0))
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(ids)
    }
}

/// Repository for read lists and their local state
pub struct ReadListRepository<'c> {
    conn: &'c Connection,
}

const READ_LIST_COLUMNS: &str = "instance_id, read_list_id, name, summary, ordered, filtered, \
     created_date, last_modified_date, book_ids";

const READ_LIST_STATE_COLUMNS: &str = "instance_id, read_list_id, status_raw, downloaded_books, \
     pending_books, downloaded_size, download_at, retain_offline";

fn read_list_from_row(row: &Row) -> rusqlite::Result<ReadList> {
    Ok(ReadList {
        instance_id: row.get(0)?,
        read_list_id: row.get(1)?,
        name: row.get(2)?,
        summary: row.get(3)?,
        ordered: row.get(4)?,
        filtered: row.get(5)?,
        created_date: ts_column(row, 6)?,
        last_modified_date: ts_column(row, 7)?,
        book_ids: json_column(row, 8)?,
    })
}

fn read_list_state_from_row(row: &Row) -> rusqlite::Result<ReadListLocalState> {
    let raw: String = row.get(2)?;
    Ok(ReadListLocalState {
        instance_id: row.get(0)?,
        read_list_id: row.get(1)?,
        download_status: converted(2, AggregateStatus::from_raw(&raw))?,
        downloaded_books: row.get(3)?,
        pending_books: row.get(4)?,
        downloaded_size: row.get(5)?,
        download_at: opt_ts_column(row, 6)?,
        retain_offline: row.get(7)?,
    })
}

impl<'c> ReadListRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn find(&self, key: &EntityKey) -> Result<Option<ReadList>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM read_lists WHERE instance_id = ?1 AND read_list_id = ?2",
                    READ_LIST_COLUMNS
                ),
                [&key.instance_id, &key.id],
                read_list_from_row,
            )
            .optional()
            .map_err(MirrorError::DatabaseError)
    }

    pub fn find_many(&self, instance_id: &str, ids: &[String]) -> Result<HashMap<String, ReadList>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM read_lists WHERE instance_id = ?1 \
                 AND read_list_id IN (SELECT value FROM json_each(?2))",
                READ_LIST_COLUMNS
            ))
            .map_err(MirrorError::DatabaseError)?;
        let rows = stmt
            .query_map(params![instance_id, json_text(ids)?], read_list_from_row)
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(rows.into_iter().map(|r| (r.read_list_id.clone(), r)).collect())
    }

    pub fn ids(&self, instance_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT read_list_id FROM read_lists WHERE instance_id = ?1 ORDER BY read_list_id",
            )
            .map_err(MirrorError::DatabaseError)?;
        let ids = stmt
            .query_map([instance_id], |row| row.get(0))
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(ids)
    }

    pub fn save(&self, read_list: &ReadList) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO read_lists ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                     ON CONFLICT(instance_id, read_list_id) DO UPDATE SET name = excluded.name, \
                     summary = excluded.summary, ordered = excluded.ordered, \
                     filtered = excluded.filtered, created_date = excluded.created_date, \
                     last_modified_date = excluded.last_modified_date, book_ids = excluded.book_ids",
                    READ_LIST_COLUMNS
                ),
                params![
                    read_list.instance_id,
                    read_list.read_list_id,
                    read_list.name,
                    read_list.summary,
                    read_list.ordered,
                    read_list.filtered,
                    to_millis(&read_list.created_date),
                    to_millis(&read_list.last_modified_date),
                    json_text(&read_list.book_ids)?,
                ],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(())
    }

    pub fn delete(&self, key: &EntityKey) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM read_lists WHERE instance_id = ?1 AND read_list_id = ?2",
                [&key.instance_id, &key.id],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(deleted > 0)
    }

    /// Ids of the read lists listing `book_id`
    pub fn containing_book(&self, instance_id: &str, book_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT read_list_id FROM read_lists WHERE instance_id = ?1 \
                 AND EXISTS (SELECT 1 FROM json_each(read_lists.book_ids) WHERE value = ?2) \
                 ORDER BY read_list_id",
            )
            .map_err(MirrorError::DatabaseError)?;
        let ids = stmt
            .query_map([instance_id, book_id], |row| row.get(0))
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<String>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(ids)
    }

    pub fn find_state(&self, key: &EntityKey) -> Result<Option<ReadListLocalState>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM read_list_local_state WHERE instance_id = ?1 AND read_list_id = ?2",
                    READ_LIST_STATE_COLUMNS
                ),
                [&key.instance_id, &key.id],
                read_list_state_from_row,
            )
            .optional()
            .map_err(MirrorError::DatabaseError)
    }

    pub fn ensure_state(&self, key: &EntityKey) -> Result<bool> {
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO read_list_local_state (instance_id, read_list_id) VALUES (?1, ?2)",
                [&key.instance_id, &key.id],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(inserted > 0)
    }

    pub fn save_state(&self, state: &ReadListLocalState) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO read_list_local_state ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(instance_id, read_list_id) DO UPDATE SET status_raw = excluded.status_raw, \
                     downloaded_books = excluded.downloaded_books, pending_books = excluded.pending_books, \
                     downloaded_size = excluded.downloaded_size, download_at = excluded.download_at, \
                     retain_offline = excluded.retain_offline",
                    READ_LIST_STATE_COLUMNS
                ),
                params![
                    state.instance_id,
                    state.read_list_id,
                    state.download_status.raw(),
                    state.downloaded_books,
                    state.pending_books,
                    state.downloaded_size,
                    opt_millis(&state.download_at),
                    state.retain_offline,
                ],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(())
    }
}

/// Repository for the reading progress outbox
pub struct ProgressRepository<'c> {
    conn: &'c Connection,
}

const PROGRESS_COLUMNS: &str = "id, instance_id, book_id, page, completed, created_at, progression";

fn progress_from_row(row: &Row) -> rusqlite::Result<PendingProgress> {
    Ok(PendingProgress {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        book_id: row.get(2)?,
        page: row.get(3)?,
        completed: row.get(4)?,
        created_at: ts_column(row, 5)?,
        progression: row.get(6)?,
    })
}

impl<'c> ProgressRepository<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn find_for_book(&self, key: &EntityKey) -> Result<Option<PendingProgress>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM pending_progress WHERE instance_id = ?1 AND book_id = ?2",
                    PROGRESS_COLUMNS
                ),
                [&key.instance_id, &key.id],
                progress_from_row,
            )
            .optional()
            .map_err(MirrorError::DatabaseError)
    }

    /// Insert the entry, or overwrite the live entry of the same book including its id
    pub fn save(&self, entry: &PendingProgress) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO pending_progress ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                     ON CONFLICT(instance_id, book_id) DO UPDATE SET id = excluded.id, \
                     page = excluded.page, completed = excluded.completed, \
                     created_at = excluded.created_at, progression = excluded.progression",
                    PROGRESS_COLUMNS
                ),
                params![
                    entry.id,
                    entry.instance_id,
                    entry.book_id,
                    entry.page,
                    entry.completed,
                    to_millis(&entry.created_at),
                    entry.progression,
                ],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(())
    }

    /// Oldest entries first
    pub fn drain(&self, instance_id: Option<&str>, limit: usize) -> Result<Vec<PendingProgress>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {} FROM pending_progress WHERE (?1 IS NULL OR instance_id = ?1) \
                 ORDER BY created_at, id LIMIT ?2",
                PROGRESS_COLUMNS
            ))
            .map_err(MirrorError::DatabaseError)?;
        let entries = stmt
            .query_map(params![instance_id, limit as i64], progress_from_row)
            .map_err(MirrorError::DatabaseError)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MirrorError::DatabaseError)?;
        Ok(entries)
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM pending_progress WHERE id = ?1", [id])
            .map_err(MirrorError::DatabaseError)?;
        Ok(deleted > 0)
    }

    pub fn remove_for_book(&self, key: &EntityKey) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM pending_progress WHERE instance_id = ?1 AND book_id = ?2",
                [&key.instance_id, &key.id],
            )
            .map_err(MirrorError::DatabaseError)?;
        Ok(deleted > 0)
    }

    /// Newest `created_at` in the outbox
    pub fn latest_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<i64> = self
            .conn
            .query_row("SELECT MAX(created_at) FROM pending_progress", [], |row| row.get(0))
            .map_err(MirrorError::DatabaseError)?;
        Ok(latest.map(from_millis))
    }

    pub fn count(&self, instance_id: Option<&str>) -> Result<i64> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM pending_progress WHERE (?1 IS NULL OR instance_id = ?1)",
                params![instance_id],
                |row| row.get(0),
            )
            .map_err(MirrorError::DatabaseError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations::run_migrations;
    use crate::db::models::storage_precision;

    fn open() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA foreign_keys = ON;").unwrap();
        run_migrations(&mut conn).unwrap();
        conn
    }

    fn book(id: &str, series: &str, number: f64) -> Book {
        let now = storage_precision(Utc::now());
        Book {
            instance_id: "inst".into(),
            book_id: id.into(),
            series_id: series.into(),
            library_id: "lib".into(),
            name: format!("Book {}", id),
            url: format!("/books/{}", id),
            number,
            number_sort: number,
            created: now,
            last_modified: now,
            size_bytes: 1024,
            media: serde_json::json!({"pagesCount": 20}),
            metadata: serde_json::Value::Null,
            read_progress: None,
            deleted: false,
            oneshot: false,
            series_title: "Series".into(),
        }
    }

    #[test]
    fn test_book_roundtrip_with_progress() {
        let conn = open();
        let repo = BookRepository::new(&conn);
        let mut b = book("b1", "s1", 1.0);
        b.read_progress = Some(ReadProgress {
            page: 4,
            completed: false,
            read_date: None,
            last_modified: b.created,
        });
        repo.save(&b).unwrap();

        assert_eq!(repo.find(&b.key()).unwrap(), Some(b.clone()));

        let many = repo.find_many("inst", &["b1".to_string(), "missing".to_string()]).unwrap();
        assert_eq!(many.len(), 1);
        assert_eq!(many.get("b1"), Some(&b));
    }

    #[test]
    fn test_local_state_cascades_with_book() {
        let conn = open();
        let repo = BookRepository::new(&conn);
        let b = book("b1", "s1", 1.0);
        repo.save(&b).unwrap();
        assert!(repo.ensure_state(&b.key()).unwrap());
        assert!(!repo.ensure_state(&b.key()).unwrap());

        let mut state = repo.find_state(&b.key()).unwrap().unwrap();
        state.download_status = DownloadStatus::Failed { error: "timeout".into() };
        state.read_list_ids = vec!["rl1".into()];
        repo.save_state(&state).unwrap();
        assert_eq!(repo.find_state(&b.key()).unwrap(), Some(state));

        assert!(repo.delete(&b.key()).unwrap());
        assert_eq!(repo.find_state(&b.key()).unwrap(), None);
    }

    #[test]
    fn test_series_members_in_reading_order() {
        let conn = open();
        let repo = BookRepository::new(&conn);
        for (id, n) in [("b3", 3.0), ("b1", 1.0), ("b2", 2.0), ("x", 1.0)] {
            let series = if id == "x" { "other" } else { "s1" };
            let b = book(id, series, n);
            repo.save(&b).unwrap();
            repo.ensure_state(&b.key()).unwrap();
        }

        let members = repo.series_members(&EntityKey::new("inst", "s1")).unwrap();
        let ids: Vec<_> = members.iter().map(|(b, _)| b.book_id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2", "b3"]);
        assert_eq!(SeriesRepository::new(&conn).member_count(&EntityKey::new("inst", "s1")).unwrap(), 3);
    }

    #[test]
    fn test_containing_lookups() {
        let conn = open();
        let now = storage_precision(Utc::now());
        ReadListRepository::new(&conn)
            .save(&ReadList {
                instance_id: "inst".into(),
                read_list_id: "rl1".into(),
                name: "Arc".into(),
                summary: String::new(),
                ordered: true,
                filtered: false,
                created_date: now,
                last_modified_date: now,
                book_ids: vec!["b1".into(), "b2".into()],
            })
            .unwrap();

        let repo = ReadListRepository::new(&conn);
        assert_eq!(repo.containing_book("inst", "b2").unwrap(), vec!["rl1".to_string()]);
        assert!(repo.containing_book("inst", "b3").unwrap().is_empty());
        assert!(repo.containing_book("other", "b1").unwrap().is_empty());
    }

    #[test]
    fn test_progress_upsert_rotates_id() {
        let conn = open();
        let repo = ProgressRepository::new(&conn);
        let now = storage_precision(Utc::now());
        let mut entry = PendingProgress {
            id: "first".into(),
            instance_id: "inst".into(),
            book_id: "b1".into(),
            page: 3,
            completed: false,
            created_at: now,
            progression: None,
        };
        repo.save(&entry).unwrap();

        entry.id = "second".into();
        entry.page = 7;
        repo.save(&entry).unwrap();

        assert_eq!(repo.count(None).unwrap(), 1);
        assert!(!repo.remove("first").unwrap());
        let drained = repo.drain(Some("inst"), 10).unwrap();
        assert_eq!(drained, vec![entry]);
    }
}
