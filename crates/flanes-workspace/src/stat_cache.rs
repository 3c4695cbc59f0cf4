//! Snapshot stat cache.
//!
//! Maps `(workspace, path, size, mtime, inode)` to a blob hash so repeated
//! snapshots skip re-reading (and re-hashing) unchanged files. Any identity
//! mismatch is a miss; rows whose blobs were collected are pruned by GC.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use flanes_db::Database;
use flanes_types::ObjectId;

use crate::error::WorkspaceResult;

/// Identity of a file as cheaply observable from `stat`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileIdentity {
    /// Size in bytes.
    pub size: u64,
    /// Modification time in nanoseconds since the epoch.
    pub mtime_ns: i64,
    /// Inode number, or 0 where the platform has none.
    pub inode: u64,
}

/// The stat cache over the shared database.
pub struct StatCache {
    db: Arc<Database>,
}

impl StatCache {
    /// Create a cache handle.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Look up the blob hash for a path, hitting only when every identity
    /// component matches.
    pub fn lookup(
        &self,
        workspace: &str,
        path: &str,
        identity: &FileIdentity,
    ) -> WorkspaceResult<Option<ObjectId>> {
        let conn = self.db.lock();
        let row: Option<(i64, i64, i64, String)> = conn
            .query_row(
                "SELECT size, mtime_ns, inode, blob_hash
                 FROM stat_cache WHERE workspace = ?1 AND path = ?2",
                params![workspace, path],
                |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                },
            )
            .optional()?;

        match row {
            Some((size, mtime_ns, inode, hex))
                if size as u64 == identity.size
                    && mtime_ns == identity.mtime_ns
                    && inode as u64 == identity.inode =>
            {
                Ok(ObjectId::from_hex(&hex).ok())
            }
            _ => Ok(None),
        }
    }

    /// Record (or refresh) the identity-to-blob mapping for a path.
    pub fn record(
        &self,
        workspace: &str,
        path: &str,
        identity: &FileIdentity,
        blob: &ObjectId,
    ) -> WorkspaceResult<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO stat_cache (workspace, path, size, mtime_ns, inode, blob_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(workspace, path) DO UPDATE SET
                 size = excluded.size,
                 mtime_ns = excluded.mtime_ns,
                 inode = excluded.inode,
                 blob_hash = excluded.blob_hash",
            params![
                workspace,
                path,
                identity.size as i64,
                identity.mtime_ns,
                identity.inode as i64,
                blob.to_hex(),
            ],
        )?;
        Ok(())
    }

    /// Drop every cached row for a workspace (on removal or recovery).
    pub fn forget_workspace(&self, workspace: &str) -> WorkspaceResult<usize> {
        let conn = self.db.lock();
        let n = conn.execute("DELETE FROM stat_cache WHERE workspace = ?1", [workspace])?;
        Ok(n)
    }
}

impl std::fmt::Debug for StatCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatCache").finish()
    }
}
