//! SQLite handle shared by the document and conversation repositories.
//!
//! Everything goes through one connection guarded by a mutex. Conversation
//! aggregates are read inside a single transaction, so a load never mixes
//! rows from before and after a concurrent message insert. Foreign keys are
//! switched on for every connection because deleting a conversation relies
//! on `ON DELETE CASCADE` to remove its child rows.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, Transaction};
use tracing::info;

use colloquy_core::error::ColloquyError;

use crate::migrations;

/// Pragmas applied to on-disk databases.
const FILE_PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open the database file, creating it and its directory if needed, and
    /// bring the schema up to date.
    pub fn new(path: &Path) -> Result<Self, ColloquyError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| ColloquyError::Storage(format!("Failed to open database: {}", e)))?;
        conn.execute_batch(FILE_PRAGMAS)
            .map_err(|e| ColloquyError::Storage(format!("Failed to set pragmas: {}", e)))?;

        info!(path = %path.display(), "Database opened");
        Self::migrated(conn)
    }

    /// Private in-memory database, used by tests.
    pub fn in_memory() -> Result<Self, ColloquyError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| ColloquyError::Storage(format!("Failed to open in-memory db: {}", e)))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| ColloquyError::Storage(format!("Failed to set pragmas: {}", e)))?;

        Self::migrated(conn)
    }

    fn migrated(conn: Connection) -> Result<Self, ColloquyError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Run `f` with exclusive use of the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, ColloquyError>
    where
        F: FnOnce(&Connection) -> Result<T, ColloquyError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ColloquyError::Storage(format!("Database lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Run `f` inside one transaction, committing only if it succeeds.
    ///
    /// An error from `f` rolls everything back, which keeps multi-row writes
    /// such as a message and its sub-processes all-or-nothing. Reads see one
    /// snapshot for the whole closure.
    pub fn transaction<F, T>(&self, context: &str, f: F) -> Result<T, ColloquyError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, ColloquyError>,
    {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction().map_err(|e| {
                ColloquyError::Storage(format!("Failed to begin {}: {}", context, e))
            })?;
            let value = f(&tx)?;
            tx.commit().map_err(|e| {
                ColloquyError::Storage(format!("Failed to commit {}: {}", context, e))
            })?;
            Ok(value)
        })
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}
