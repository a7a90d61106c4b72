//! SQLite persistence layer: one JSON value per key.

use directories::ProjectDirs;
use rusqlite::{Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::warn;

/// Names of the persisted values.
pub mod keys {
    pub const ACTIVE_TIMER: &str = "active_timer";
    pub const TIME_LOG: &str = "time_log";
    pub const LAST_ACTIVITY: &str = "last_timer_activity";
    pub const MUTE_SOUND: &str = "mute_sound";
    pub const MUTE_NOTIFICATIONS: &str = "mute_notifications";
    pub const MUTE_REMINDERS: &str = "mute_reminders";
    pub const DISPLAY_TZ: &str = "display_tz";
    pub const PENDING_FINALIZE: &str = "pending_countup";
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to create database directory")]
    DirectoryCreation,
    #[error("Database connection lock poisoned")]
    Poisoned,
}

/// Key/value store shared by the engine and the session log.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Opens (or creates) the database file, initializing tables if needed.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|_| DatabaseError::DirectoryCreation)?;
        }

        let conn = Connection::open(path)?;
        Self::initialize_tables(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Creates an in-memory database.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_tables(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_tables(conn: &Connection) -> Result<(), DatabaseError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
        "#,
        )?;
        Ok(())
    }

    /// Default database location in the platform data directory.
    pub fn default_path() -> PathBuf {
        ProjectDirs::from("com", "timetracker", "TimeTracker")
            .map(|dirs| dirs.data_dir().join("timetracker.db"))
            .unwrap_or_else(|| PathBuf::from("timetracker.db"))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DatabaseError> {
        self.conn.lock().map_err(|_| DatabaseError::Poisoned)
    }

    /// Returns the raw stored text for a key.
    pub fn get_raw(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let value = self
            .conn()?
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    /// Stores raw text for a key, replacing any previous value.
    pub fn set_raw(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
            [key, value],
        )?;
        Ok(())
    }

    /// Loads and decodes a value. Missing, unreadable and corrupt values all
    /// come back as `None`.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.get_raw(key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, error = %e, "Failed to read stored value");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Ignoring corrupt stored value");
                None
            }
        }
    }

    /// Encodes and stores a value.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), DatabaseError> {
        let json = serde_json::to_string(value)?;
        self.set_raw(key, &json)
    }

    /// Deletes a key. Deleting a missing key is not an error.
    pub fn remove(&self, key: &str) -> Result<(), DatabaseError> {
        self.conn()?.execute("DELETE FROM kv WHERE key = ?", [key])?;
        Ok(())
    }
}
