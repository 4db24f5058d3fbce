//! Database migrations
//!
//! Versioned schema changes tracked in `schema_migrations`. Each version is applied inside its
//! own transaction and recorded on success.

use crate::core::error::{MirrorError, Result};
use rusqlite::Connection;
use tracing::{info, warn};

/// Migration version tracking table
const MIGRATION_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
)
"#;

/// Initial schema migration (version 1)
///
/// Timestamps are epoch milliseconds. Id lists and opaque metadata are JSON text.
const MIGRATION_V1: &str = r#"
-- Remote servers
CREATE TABLE IF NOT EXISTS instances (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    server_url TEXT NOT NULL,
    username TEXT NOT NULL,
    is_admin INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    last_used_at INTEGER NOT NULL,
    series_last_synced_at INTEGER NOT NULL DEFAULT 0,
    books_last_synced_at INTEGER NOT NULL DEFAULT 0,
    UNIQUE(server_url, username)
);

CREATE TABLE IF NOT EXISTS libraries (
    instance_id TEXT NOT NULL,
    library_id TEXT NOT NULL,
    name TEXT NOT NULL,
    PRIMARY KEY (instance_id, library_id)
);

-- Mirrored series
CREATE TABLE IF NOT EXISTS series (
    instance_id TEXT NOT NULL,
    series_id TEXT NOT NULL,
    library_id TEXT NOT NULL,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    created INTEGER NOT NULL,
    last_modified INTEGER NOT NULL,
    books_count INTEGER NOT NULL DEFAULT 0,
    books_read_count INTEGER NOT NULL DEFAULT 0,
    books_unread_count INTEGER NOT NULL DEFAULT 0,
    books_in_progress_count INTEGER NOT NULL DEFAULT 0,
    metadata TEXT NOT NULL DEFAULT 'null',
    books_metadata TEXT NOT NULL DEFAULT 'null',
    deleted INTEGER NOT NULL DEFAULT 0,
    oneshot INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (instance_id, series_id)
);

CREATE TABLE IF NOT EXISTS series_local_state (
    instance_id TEXT NOT NULL,
    series_id TEXT NOT NULL,
    status_raw TEXT NOT NULL DEFAULT 'notDownloaded',
    downloaded_books INTEGER NOT NULL DEFAULT 0,
    pending_books INTEGER NOT NULL DEFAULT 0,
    downloaded_size INTEGER NOT NULL DEFAULT 0,
    download_at INTEGER,
    policy_raw TEXT NOT NULL DEFAULT 'manual',
    policy_limit INTEGER NOT NULL DEFAULT 0,
    collection_ids TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (instance_id, series_id),
    FOREIGN KEY (instance_id, series_id) REFERENCES series(instance_id, series_id) ON DELETE CASCADE
);

-- Mirrored books
CREATE TABLE IF NOT EXISTS books (
    instance_id TEXT NOT NULL,
    book_id TEXT NOT NULL,
    series_id TEXT NOT NULL,
    library_id TEXT NOT NULL,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    number REAL NOT NULL DEFAULT 0,
    number_sort REAL NOT NULL DEFAULT 0,
    created INTEGER NOT NULL,
    last_modified INTEGER NOT NULL,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    media TEXT NOT NULL DEFAULT 'null',
    metadata TEXT NOT NULL DEFAULT 'null',
    progress_page INTEGER,
    progress_completed INTEGER,
    progress_read_date INTEGER,
    progress_last_modified INTEGER,
    deleted INTEGER NOT NULL DEFAULT 0,
    oneshot INTEGER NOT NULL DEFAULT 0,
    series_title TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (instance_id, book_id)
);

CREATE INDEX IF NOT EXISTS idx_books_series ON books(instance_id, series_id, number_sort);

CREATE TABLE IF NOT EXISTS book_local_state (
    instance_id TEXT NOT NULL,
    book_id TEXT NOT NULL,
    status_raw TEXT NOT NULL DEFAULT 'notDownloaded',
    download_progress REAL,
    download_error TEXT,
    downloaded_size INTEGER NOT NULL DEFAULT 0,
    download_at INTEGER,
    pages BLOB,
    toc BLOB,
    webpub_manifest BLOB,
    epub_progression BLOB,
    read_list_ids TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (instance_id, book_id),
    FOREIGN KEY (instance_id, book_id) REFERENCES books(instance_id, book_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_book_local_state_queue ON book_local_state(instance_id, status_raw, download_at);

-- Collections and read lists
CREATE TABLE IF NOT EXISTS collections (
    instance_id TEXT NOT NULL,
    collection_id TEXT NOT NULL,
    name TEXT NOT NULL,
    ordered INTEGER NOT NULL DEFAULT 0,
    filtered INTEGER NOT NULL DEFAULT 0,
    created_date INTEGER NOT NULL,
    last_modified_date INTEGER NOT NULL,
    series_ids TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (instance_id, collection_id)
);

CREATE TABLE IF NOT EXISTS read_lists (
    instance_id TEXT NOT NULL,
    read_list_id TEXT NOT NULL,
    name TEXT NOT NULL,
    summary TEXT NOT NULL DEFAULT '',
    ordered INTEGER NOT NULL DEFAULT 0,
    filtered INTEGER NOT NULL DEFAULT 0,
    created_date INTEGER NOT NULL,
    last_modified_date INTEGER NOT NULL,
    book_ids TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (instance_id, read_list_id)
);

CREATE TABLE IF NOT EXISTS read_list_local_state (
    instance_id TEXT NOT NULL,
    read_list_id TEXT NOT NULL,
    status_raw TEXT NOT NULL DEFAULT 'notDownloaded',
    downloaded_books INTEGER NOT NULL DEFAULT 0,
    pending_books INTEGER NOT NULL DEFAULT 0,
    downloaded_size INTEGER NOT NULL DEFAULT 0,
    download_at INTEGER,
    retain_offline INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (instance_id, read_list_id),
    FOREIGN KEY (instance_id, read_list_id) REFERENCES read_lists(instance_id, read_list_id) ON DELETE CASCADE
);

-- Reading progress outbox
CREATE TABLE IF NOT EXISTS pending_progress (
    id TEXT PRIMARY KEY,
    instance_id TEXT NOT NULL,
    book_id TEXT NOT NULL,
    page INTEGER NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    progression BLOB,
    UNIQUE(instance_id, book_id)
);

CREATE INDEX IF NOT EXISTS idx_pending_progress_created ON pending_progress(created_at, id);
"#;

/// Run all database migrations
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    info!("Running database migrations");

    conn.execute_batch(MIGRATION_TABLE)
        .map_err(MirrorError::DatabaseError)?;

    let current_version = current_version(conn)?;
    info!(version = current_version, "Current database schema version");

    if current_version < 1 {
        info!("Applying migration v1: Offline mirror schema");
        apply_migration(conn, 1, MIGRATION_V1)?;
    }

    info!("Database migrations completed successfully");
    Ok(())
}

/// Highest applied schema version, 0 for a fresh database
pub fn current_version(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )
    .map_err(MirrorError::DatabaseError)
}

fn apply_migration(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    let tx = conn.transaction()
        .map_err(MirrorError::DatabaseError)?;

    tx.execute_batch(sql)
        .map_err(|e| {
            warn!("Migration v{} failed: {}", version, e);
            MirrorError::DatabaseError(e)
        })?;

    tx.execute(
        "INSERT INTO schema_migrations (version) VALUES (?)",
        [version],
    ).map_err(MirrorError::DatabaseError)?;

    tx.commit()
        .map_err(MirrorError::DatabaseError)?;

    info!("Migration v{} applied successfully", version);
    Ok(())
}
