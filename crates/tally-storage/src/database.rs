// SPDX-FileCopyrightText: 2026 Tally Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Database connection management with PRAGMA setup, WAL mode, and lifecycle.
//!
//! All statements for one [`Database`] run on tokio-rusqlite's single
//! background thread. Clone the handle instead of opening a second
//! connection in the same process.

use std::path::Path;
use std::time::Duration;

use tally_config::model::StorageConfig;
use tally_core::TallyError;
use tracing::debug;

use crate::migrations;

/// Connection options applied when a database is opened.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub wal_mode: bool,
    pub busy_timeout: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            wal_mode: true,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&StorageConfig> for OpenOptions {
    fn from(config: &StorageConfig) -> Self {
        Self {
            wal_mode: config.wal_mode,
            busy_timeout: Duration::from_millis(config.busy_timeout_ms),
        }
    }
}

/// Handle to the Tally SQLite database.
#[derive(Clone)]
pub struct Database {
    conn: tokio_rusqlite::Connection,
}

impl Database {
    /// Open (creating if needed) the database at `path` with default options
    /// and apply pending migrations.
    pub async fn open(path: &str) -> Result<Self, TallyError> {
        Self::open_with(path, OpenOptions::default()).await
    }

    /// Open the database described by the `[storage]` config section.
    pub async fn from_config(config: &StorageConfig) -> Result<Self, TallyError> {
        Self::open_with(&config.database_path, OpenOptions::from(config)).await
    }

    /// Open the database at `path` with explicit options.
    pub async fn open_with(path: &str, options: OpenOptions) -> Result<Self, TallyError> {
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| TallyError::Storage {
                source: Box::new(e),
            })?;
        }

        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .map_err(|e| TallyError::Storage {
                source: Box::new(e),
            })?;
        let db = Self::initialize(conn, options).await?;
        debug!(path, "database opened");
        Ok(db)
    }

    /// Open a private in-memory database (tests and dry runs).
    pub async fn open_in_memory() -> Result<Self, TallyError> {
        let conn = tokio_rusqlite::Connection::open_in_memory()
            .await
            .map_err(|e| TallyError::Storage {
                source: Box::new(e),
            })?;
        Self::initialize(
            conn,
            OpenOptions {
                wal_mode: false,
                ..OpenOptions::default()
            },
        )
        .await
    }

    async fn initialize(
        conn: tokio_rusqlite::Connection,
        options: OpenOptions,
    ) -> Result<Self, TallyError> {
        let busy_timeout = options.busy_timeout;
        let wal_mode = options.wal_mode;
        conn.call(move |conn| -> Result<(), rusqlite::Error> {
            conn.busy_timeout(busy_timeout)?;
            if wal_mode {
                conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
            }
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
            Ok(())
        })
        .await
        .map_err(map_tr_err)?;

        conn.call(|conn| migrations::run_migrations(conn))
            .await
            .map_err(|e| TallyError::Storage {
                source: e.to_string().into(),
            })?;

        Ok(Self { conn })
    }

    /// The underlying tokio-rusqlite connection.
    pub fn connection(&self) -> &tokio_rusqlite::Connection {
        &self.conn
    }

    /// Checkpoint the WAL and close the connection.
    pub async fn close(self) -> Result<(), TallyError> {
        self.conn
            .call(|conn| -> Result<(), rusqlite::Error> {
                conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                Ok(())
            })
            .await
            .map_err(map_tr_err)?;
        self.conn.close().await.map_err(|e| TallyError::Storage {
            source: e.to_string().into(),
        })?;
        debug!("database closed");
        Ok(())
    }
}

/// Convert a tokio-rusqlite error into [`TallyError::Storage`].
pub fn map_tr_err(e: tokio_rusqlite::Error<rusqlite::Error>) -> TallyError {
    TallyError::Storage {
        source: Box::new(e),
    }
}

/// Whether SQLite rejected the statement because another writer holds the lock.
pub fn is_lock_contention(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
    )
}

/// [`is_lock_contention`] for errors coming back through tokio-rusqlite.
pub fn is_tr_lock_contention(e: &tokio_rusqlite::Error<rusqlite::Error>) -> bool {
    matches!(e, tokio_rusqlite::Error::Error(inner) if is_lock_contention(inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn open_creates_file_and_schema() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("tally.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();
        assert!(db_path.exists(), "database file should be created");

        let tables: Vec<String> = db
            .connection()
            .call(|conn| -> Result<Vec<String>, rusqlite::Error> {
                let mut stmt = conn.prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' \
                     AND name IN ('usage_records', 'balances', 'notifications') ORDER BY name",
                )?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect()
            })
            .await
            .unwrap();
        assert_eq!(tables, vec!["balances", "notifications", "usage_records"]);

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn reopen_does_not_rerun_migrations() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("reopen.db");
        let path = db_path.to_str().unwrap();

        Database::open(path).await.unwrap().close().await.unwrap();
        let db = Database::open(path).await.unwrap();
        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn wal_mode_is_enabled_for_files() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("wal.db");
        let db = Database::open(db_path.to_str().unwrap()).await.unwrap();

        let mode: String = db
            .connection()
            .call(|conn| -> Result<String, rusqlite::Error> {
                conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))
            })
            .await
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[tokio::test]
    async fn in_memory_database_is_usable() {
        let db = Database::open_in_memory().await.unwrap();
        let count: i64 = db
            .connection()
            .call(|conn| -> Result<i64, rusqlite::Error> {
                conn.query_row("SELECT COUNT(*) FROM balances", [], |row| row.get(0))
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
