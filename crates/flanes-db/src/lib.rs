//! Shared SQLite database handle for Flanes.
//!
//! One repository owns exactly one `store.db`. The [`Database`] wrapper keeps
//! the connection behind a mutex: every writer serializes through it, which is
//! what gives `accept` its total order per lane and lets the garbage
//! collector's mark phase exclude concurrent accepts by holding the guard for
//! the duration of its transaction.
//!
//! The schema covers the CAS tables (blobs/trees/states), the metadata ledger
//! rows (intents/transitions/lanes/workspaces), and the snapshot stat cache.
//! Schema changes are ordered migrations; the applied version lives in the
//! `meta` table.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

mod migrations;

pub use migrations::SCHEMA_VERSION;

/// Errors from database open and migration.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Underlying SQLite failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The on-disk schema is newer than this binary understands.
    #[error("ledger schema version {found} is newer than supported version {supported}")]
    SchemaTooNew { found: i64, supported: i64 },

    /// The database file exists but its contents are not a Flanes ledger.
    #[error("corrupted ledger: {0}")]
    CorruptedLedger(String),
}

/// Result alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

/// SQLite busy timeout under contention, in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 30_000;

/// The shared database handle.
///
/// Cheap to share via `Arc`; the connection itself is exclusive and obtained
/// through [`Database::lock`].
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database at `path`, applying pending migrations.
    pub fn open(path: &Path) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        db.init()?;
        Ok(db)
    }

    /// Open a private in-memory database. Intended for tests and embedding.
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
            path: None,
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> DbResult<()> {
        let conn = self.lock();

        // DELETE journal mode keeps the database usable on shared
        // filesystems that mishandle WAL locking; the busy timeout covers
        // cross-process contention.
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=DELETE;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;
             PRAGMA busy_timeout={BUSY_TIMEOUT_MS};"
        ))?;

        migrations::apply(&conn)?;
        debug!(version = SCHEMA_VERSION, "database ready");
        Ok(())
    }

    /// Acquire the connection. Callers hold the guard only as long as their
    /// statement or transaction runs.
    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    /// The schema version recorded on disk.
    pub fn schema_version(&self) -> DbResult<i64> {
        let conn = self.lock();
        migrations::current_version(&conn)
    }

    /// Path of the backing file, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `VACUUM` to reclaim file space after large deletes.
    pub fn vacuum(&self) -> DbResult<()> {
        let conn = self.lock();
        conn.execute_batch("VACUUM;")?;
        info!("database vacuumed");
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}
