use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::{params, OptionalExtension};
use tracing::debug;

use flanes_db::Database;
use flanes_types::ObjectId;

use crate::error::{StoreError, StoreResult};
use crate::object::ObjectKind;
use crate::traits::ObjectStore;

/// Blobs at or below this size are inlined in the database; larger blobs
/// spill to hash-addressed files.
pub const DEFAULT_INLINE_THRESHOLD: usize = 256 * 1024;

/// Path of a spilled blob under `spill_dir`: a two-hex-character fan-out
/// directory followed by the full hash.
pub fn spill_path(spill_dir: &Path, id: &ObjectId) -> PathBuf {
    let hex = id.to_hex();
    spill_dir.join(&hex[0..2]).join(hex)
}

/// SQLite-backed object store.
///
/// Trees and states are always inlined (they are small canonical JSON).
/// Blob rows record size and whether the content was spilled; spilled
/// content lives in `spill_dir` and is integrity-checked on every read.
pub struct SqliteObjectStore {
    db: Arc<Database>,
    spill_dir: PathBuf,
    inline_threshold: usize,
}

impl SqliteObjectStore {
    /// Create a store over the shared database, spilling large blobs under
    /// `spill_dir`.
    pub fn new(db: Arc<Database>, spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            spill_dir: spill_dir.into(),
            inline_threshold: DEFAULT_INLINE_THRESHOLD,
        }
    }

    /// Override the inline threshold. Mostly useful in tests.
    pub fn with_inline_threshold(mut self, threshold: usize) -> Self {
        self.inline_threshold = threshold;
        self
    }

    /// The spill directory for large blobs.
    pub fn spill_dir(&self) -> &Path {
        &self.spill_dir
    }

    fn table(kind: ObjectKind) -> &'static str {
        match kind {
            ObjectKind::Blob => "blobs",
            ObjectKind::Tree => "trees",
            ObjectKind::State => "states",
        }
    }

    /// Write bytes to the spill location via temp file + fsync + rename, so
    /// a crash never leaves a partially written blob at its final path.
    fn write_spill(&self, id: &ObjectId, data: &[u8]) -> StoreResult<PathBuf> {
        let path = spill_path(&self.spill_dir, id);
        if path.exists() {
            return Ok(path);
        }
        let parent = path.parent().expect("spill path has a parent");
        fs::create_dir_all(parent)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        debug!(blob = %id.short_hex(), bytes = data.len(), "spilled blob");
        Ok(path)
    }

    fn read_spill(&self, id: &ObjectId) -> StoreResult<Vec<u8>> {
        let path = spill_path(&self.spill_dir, id);
        let data = fs::read(&path)?;
        let computed = ObjectId::from_bytes(&data);
        if computed != *id {
            return Err(StoreError::IntegrityMismatch {
                expected: *id,
                computed,
            });
        }
        Ok(data)
    }
}

impl ObjectStore for SqliteObjectStore {
    fn read(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<Option<Vec<u8>>> {
        match kind {
            ObjectKind::Blob => {
                let row: Option<(Option<Vec<u8>>, i64)> = {
                    let conn = self.db.lock();
                    conn.query_row(
                        "SELECT data, spilled FROM blobs WHERE hash=?1",
                        [id.to_hex()],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?
                };
                match row {
                    None => Ok(None),
                    Some((Some(data), 0)) => Ok(Some(data)),
                    Some((_, _)) => Ok(Some(self.read_spill(id)?)),
                }
            }
            _ => {
                let conn = self.db.lock();
                let data: Option<Vec<u8>> = conn
                    .query_row(
                        &format!("SELECT data FROM {} WHERE hash=?1", Self::table(kind)),
                        [id.to_hex()],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(data)
            }
        }
    }

    fn write(&self, kind: ObjectKind, id: &ObjectId, data: &[u8]) -> StoreResult<()> {
        match kind {
            ObjectKind::Blob => {
                if data.len() > self.inline_threshold {
                    // Spill before inserting the row: a crash in between
                    // leaves an orphan file for GC, never a dangling row.
                    self.write_spill(id, data)?;
                    let conn = self.db.lock();
                    conn.execute(
                        "INSERT OR IGNORE INTO blobs (hash, size, data, spilled)
                         VALUES (?1, ?2, NULL, 1)",
                        params![id.to_hex(), data.len() as i64],
                    )?;
                } else {
                    let conn = self.db.lock();
                    conn.execute(
                        "INSERT OR IGNORE INTO blobs (hash, size, data, spilled)
                         VALUES (?1, ?2, ?3, 0)",
                        params![id.to_hex(), data.len() as i64, data],
                    )?;
                }
            }
            _ => {
                let conn = self.db.lock();
                conn.execute(
                    &format!(
                        "INSERT OR IGNORE INTO {} (hash, data) VALUES (?1, ?2)",
                        Self::table(kind)
                    ),
                    params![id.to_hex(), data],
                )?;
            }
        }
        Ok(())
    }

    fn exists(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<bool> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM {} WHERE hash=?1",
                Self::table(kind)
            ),
            [id.to_hex()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn delete(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<bool> {
        let (deleted, spilled) = {
            let conn = self.db.lock();
            let spilled: Option<i64> = if kind == ObjectKind::Blob {
                conn.query_row(
                    "SELECT spilled FROM blobs WHERE hash=?1",
                    [id.to_hex()],
                    |row| row.get(0),
                )
                .optional()?
            } else {
                None
            };
            let n = conn.execute(
                &format!("DELETE FROM {} WHERE hash=?1", Self::table(kind)),
                [id.to_hex()],
            )?;
            (n > 0, spilled == Some(1))
        };
        if spilled {
            let path = spill_path(&self.spill_dir, id);
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(deleted)
    }

    fn list(&self, kind: ObjectKind) -> StoreResult<Vec<ObjectId>> {
        let conn = self.db.lock();
        let mut stmt =
            conn.prepare(&format!("SELECT hash FROM {}", Self::table(kind)))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for hex in rows {
            let hex = hex?;
            let id = ObjectId::from_hex(&hex)
                .map_err(|e| StoreError::Database(format!("bad stored hash {hex:?}: {e}")))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn size(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<Option<u64>> {
        let conn = self.db.lock();
        let size: Option<i64> = match kind {
            ObjectKind::Blob => conn
                .query_row(
                    "SELECT size FROM blobs WHERE hash=?1",
                    [id.to_hex()],
                    |row| row.get(0),
                )
                .optional()?,
            _ => conn
                .query_row(
                    &format!(
                        "SELECT LENGTH(data) FROM {} WHERE hash=?1",
                        Self::table(kind)
                    ),
                    [id.to_hex()],
                    |row| row.get(0),
                )
                .optional()?,
        };
        Ok(size.map(|s| s as u64))
    }
}

impl std::fmt::Debug for SqliteObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteObjectStore")
            .field("spill_dir", &self.spill_dir)
            .field("inline_threshold", &self.inline_threshold)
            .finish()
    }
}
