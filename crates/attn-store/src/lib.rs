//! Embedded store for the attn daemon.
//!
//! A single-file SQLite database guarded by a mutex; writers hold the lock
//! only for the duration of one statement. If the file database cannot be
//! opened or migrated, the store falls back to an in-memory connection and
//! the daemon keeps running in degraded mode — sessions registered while
//! degraded do not survive restart.

mod comments;
mod errors;
mod migrations;
mod prs;
mod sessions;
mod settings;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{error, info, warn};

pub use comments::ReviewComment;
pub use errors::StoreError;
pub use migrations::MIGRATIONS;

/// Details surfaced in the degraded-storage banner.
#[derive(Debug, Clone)]
pub struct DegradedInfo {
    pub db_path: String,
    pub hint: String,
}

pub struct Store {
    conn: Mutex<Connection>,
    degraded: Option<DegradedInfo>,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date. On failure, falls back to an in-memory database and records
    /// degraded-mode info instead of failing the daemon.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        match Self::open_file(path) {
            Ok(store) => Ok(store),
            Err(e) => {
                error!(
                    event = "store.open_failed",
                    path = %path.display(),
                    error = %e,
                );
                let mut store = Self::open_in_memory()?;
                store.degraded = Some(DegradedInfo {
                    db_path: path.display().to_string(),
                    hint: format!(
                        "falling back to in-memory storage; sessions will not survive restart ({e})"
                    ),
                });
                warn!(
                    event = "store.degraded_mode_entered",
                    path = %path.display(),
                );
                Ok(store)
            }
        }
    }

    fn open_file(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        migrations::initialize(&conn)?;
        info!(
            event = "store.open_completed",
            path = %path.display(),
        );
        Ok(Self {
            conn: Mutex::new(conn),
            degraded: None,
        })
    }

    /// Open a fresh in-memory store. Used directly by tests and as the
    /// degraded-mode fallback.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrations::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            degraded: None,
        })
    }

    /// Degraded-mode details, if the file database could not be used.
    pub fn degraded(&self) -> Option<&DegradedInfo> {
        self.degraded.as_ref()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!(event = "store.lock_poisoned");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("attn.db");
        let store = Store::open(&db).unwrap();
        assert!(store.degraded().is_none());
        assert!(db.exists());
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("nested").join("dirs").join("attn.db");
        let store = Store::open(&db).unwrap();
        assert!(store.degraded().is_none());
        assert!(db.exists());
    }

    #[test]
    fn test_open_unwritable_path_degrades() {
        // A directory path cannot be opened as a database file.
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let degraded = store.degraded().expect("should be degraded");
        assert_eq!(degraded.db_path, dir.path().display().to_string());
        assert!(degraded.hint.contains("in-memory"));
    }

    #[test]
    fn test_degraded_store_is_usable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert!(store.degraded().is_some());
        // Normal operations still work against the in-memory fallback.
        assert!(store.load_sessions().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_preserves_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("attn.db");
        drop(Store::open(&db).unwrap());
        let store = Store::open(&db).unwrap();
        assert!(store.degraded().is_none());
    }
}
