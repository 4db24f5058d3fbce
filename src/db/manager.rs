//! Database manager implementation
//!
//! This module provides database connection management with:
//! - Schema migrations on a dedicated read-write connection
//! - SQLite read pool using r2d2 (connections are `query_only`)
//! - Async wrapper for read operations
//! - Error handling integration with MirrorError

use crate::core::error::{MirrorError, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task;
use tracing::info;

/// Open a read-write connection with the pragmas every store connection uses
pub fn open_connection(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Database manager with a read-only connection pool
pub struct DatabaseManager {
    pool: Pool<SqliteConnectionManager>,
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl DatabaseManager {
    /// Migrate the database at `db_path` and build the read pool over it
    pub fn new(db_path: &Path, pool_size: u32, busy_timeout: Duration) -> Result<Self> {
        let mut conn = open_connection(db_path, busy_timeout)?;
        crate::db::migrations::run_migrations(&mut conn)?;
        drop(conn);

        let manager = SqliteConnectionManager::file(db_path).with_init(move |conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            conn.busy_timeout(busy_timeout)?;
            // Readers never write; the writer thread owns every mutation
            conn.execute_batch("PRAGMA query_only = ON;")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(pool_size)
            .connection_timeout(Duration::from_secs(30))
            .build(manager)?;

        info!(path = %db_path.display(), pool_size, "Database opened");

        Ok(Self {
            pool,
            db_path: db_path.to_path_buf(),
            busy_timeout,
        })
    }

    /// Get a read connection from the pool
    pub fn get_connection(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(MirrorError::PoolError)
    }

    /// Open the read-write connection for the store writer
    pub fn open_writer_connection(&self) -> Result<Connection> {
        open_connection(&self.db_path, self.busy_timeout)
    }

    /// Execute a read operation asynchronously
    ///
    /// This wraps synchronous database operations in tokio::task::spawn_blocking
    /// to avoid blocking the async runtime.
    pub async fn execute<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();

        task::spawn_blocking(move || {
            let conn = pool.get().map_err(MirrorError::PoolError)?;
            f(&conn)
        })
        .await
        .map_err(|e| MirrorError::TaskError(format!("Database task panicked: {}", e)))?
    }

    /// Get the database file path
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Get the current pool size
    pub fn pool_size(&self) -> u32 {
        self.pool.max_size()
    }
}

impl Clone for DatabaseManager {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            db_path: self.db_path.clone(),
            busy_timeout: self.busy_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_db() -> (DatabaseManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("mirror.db");
        let manager = DatabaseManager::new(&db_path, 4, Duration::from_secs(5)).unwrap();
        (manager, temp_dir)
    }

    #[test]
    fn test_database_manager_creation() {
        let (manager, _temp_dir) = create_test_db();
        assert_eq!(manager.pool_size(), 4);
        assert!(manager.db_path().exists());
    }

    #[tokio::test]
    async fn test_execute_reads_migrated_schema() {
        let (manager, _temp_dir) = create_test_db();

        let count: i64 = manager
            .execute(|conn| {
                conn.query_row("SELECT COUNT(*) FROM instances", [], |row| row.get(0))
                    .map_err(MirrorError::DatabaseError)
            })
            .await
            .unwrap();

        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_pool_connections_are_read_only() {
        let (manager, _temp_dir) = create_test_db();

        let result = manager
            .execute(|conn| {
                conn.execute("DELETE FROM instances", [])
                    .map_err(MirrorError::DatabaseError)
            })
            .await;

        assert!(matches!(result, Err(MirrorError::DatabaseError(_))));
    }

    #[test]
    fn test_readers_see_writer_commits() {
        let (manager, _temp_dir) = create_test_db();

        let writer = manager.open_writer_connection().unwrap();
        writer
            .execute(
                "INSERT INTO libraries (instance_id, library_id, name) VALUES ('i', 'l', 'Comics')",
                [],
            )
            .unwrap();

        let reader = manager.get_connection().unwrap();
        let name: String = reader
            .query_row("SELECT name FROM libraries WHERE library_id = 'l'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "Comics");
    }
}
