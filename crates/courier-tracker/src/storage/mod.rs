//! Storage layer for courier-tracker.
//!
//! This module provides a durable `SQLite`-backed key-value store holding the
//! current [`TrackingRecord`] and the last reported [`LocationFix`]. Writes
//! are flushed before returning so that a process killed right after a call
//! still observes the write on the next start.

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::tracking::{LocationFix, TrackingRecord};

/// Key holding the current tracking record.
pub const TRACKING_RECORD_KEY: &str = "tracking.record";

/// Key holding the last successfully reported fix.
pub const LAST_FIX_KEY: &str = "tracking.last_fix";

/// Durable key-value store for tracking state.
///
/// The connection is guarded by a mutex so that the foreground API and the
/// background fix handler can share one `Storage` behind an `Arc`.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
}

impl Storage {
    /// Open or create a storage database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        // A write must survive power loss once put() returns.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory storage instance for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("storage connection mutex poisoned"))
    }

    /// Store a raw value under a key, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            r"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            ",
            params![key, value],
        )?;
        debug!(key, "Stored value");
        Ok(())
    }

    /// Get the raw value stored under a key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()?
            .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    /// Delete the value stored under a key.
    ///
    /// Returns `true` if a value was deleted, `false` if the key was absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn delete(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn()?
            .execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
        Ok(affected > 0)
    }

    fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.put(key, &encoded)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &'static str) -> Result<Option<T>> {
        self.get(key)?
            .map(|raw| serde_json::from_str(&raw).map_err(|source| Error::CorruptRecord { key, source }))
            .transpose()
    }

    /// Persist the current tracking record.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the database operation fails.
    pub fn save_tracking_record(&self, record: &TrackingRecord) -> Result<()> {
        self.put_json(TRACKING_RECORD_KEY, record)
    }

    /// Read the current tracking record, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the stored value
    /// cannot be decoded.
    pub fn tracking_record(&self) -> Result<Option<TrackingRecord>> {
        self.get_json(TRACKING_RECORD_KEY)
    }

    /// Persist the last reported fix.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the database operation fails.
    pub fn save_last_fix(&self, fix: &LocationFix) -> Result<()> {
        self.put_json(LAST_FIX_KEY, fix)
    }

    /// Read the last reported fix, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails or the stored value
    /// cannot be decoded.
    pub fn last_fix(&self) -> Result<Option<LocationFix>> {
        self.get_json(LAST_FIX_KEY)
    }

    /// Delete the last reported fix.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn clear_last_fix(&self) -> Result<bool> {
        self.delete(LAST_FIX_KEY)
    }

    /// Delete both the tracking record and the last fix.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn clear_tracking_state(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM kv_store WHERE key IN (?1, ?2)",
            params![TRACKING_RECORD_KEY, LAST_FIX_KEY],
        )?;
        debug!("Cleared tracking state");
        Ok(())
    }

    /// Read both tracking values for status reporting.
    ///
    /// # Errors
    ///
    /// Returns an error if either value cannot be read.
    pub fn snapshot(&self) -> Result<TrackingSnapshot> {
        Ok(TrackingSnapshot {
            record: self.tracking_record()?,
            last_fix: self.last_fix()?,
        })
    }
}

/// The persisted tracking state at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackingSnapshot {
    /// The current tracking record.
    pub record: Option<TrackingRecord>,
    /// The last reported fix.
    pub last_fix: Option<LocationFix>,
}
