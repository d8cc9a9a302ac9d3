//! Shared SQLite handle for the region store and the series reconciler.
//!
//! A single connection is not safe for concurrent use, so every access goes through one mutex.
//! Cloning a [`Database`] clones the handle, not the connection.

use crate::data::{region_store, series};
use crate::error::FecResult;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Opens (creating if needed) the database file, and its parent directory.
    pub fn open(path: impl AsRef<Path>) -> FecResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "Opened buffer database");
        Self::initialise(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> FecResult<Self> {
        Self::initialise(Connection::open_in_memory()?, None)
    }

    fn initialise(conn: Connection, path: Option<PathBuf>) -> FecResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(region_store::SCHEMA)?;
        conn.execute_batch(series::SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// File backing this database, `None` when in memory.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` with exclusive access to the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> FecResult<T>) -> FecResult<T> {
        let mut guard = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}
