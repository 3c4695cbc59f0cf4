//! Mark-and-sweep garbage collection.
//!
//! The mark phase runs inside a single database transaction while holding
//! the shared connection, so it cannot interleave with an `accept`: either
//! the accept lands first and its state is a root, or it lands after and
//! the next collection sees it. Roots are every lane head, every fork
//! base, and the `to_state` of every non-rejected transition; marking
//! walks parent chains and then each live state's tree closure down to
//! blobs.
//!
//! The sweep deletes, in the same transaction: rejected transitions older
//! than the age cutoff (and their now-orphaned intents), unmarked states,
//! unmarked trees and blobs, and stat-cache rows pointing at deleted
//! blobs. Spilled blob files are removed only after the transaction
//! commits; a crash between commit and file deletion leaves orphan files,
//! which the next run detects and removes. Dry-run (the default) performs
//! the whole computation and rolls back.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use flanes_db::Database;
use flanes_store::{spill_path, Tree, WorldState};
use flanes_types::{epoch_seconds, ObjectId};

/// Errors from garbage collection.
#[derive(Debug, thiserror::Error)]
pub enum GcError {
    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(String),

    /// A stored object failed to decode during marking.
    #[error("corrupt object {id}: {reason}")]
    CorruptObject { id: ObjectId, reason: String },

    /// Filesystem failure while deleting spilled blobs.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for GcError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Result alias for collection.
pub type GcResult<T> = Result<T, GcError>;

/// Collection options.
#[derive(Clone, Copy, Debug)]
pub struct GcOptions {
    /// Rejected transitions older than this many days are swept.
    pub max_age_days: u32,
    /// Compute and report without deleting anything. The default.
    pub dry_run: bool,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            max_age_days: 30,
            dry_run: true,
        }
    }
}

/// What a collection did (or, in dry-run, would have done).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Live objects (states + trees + blobs) found by the mark phase.
    pub reachable: usize,
    /// Trees and blobs deleted (including orphan spill files).
    pub deleted_objects: usize,
    /// Bytes reclaimed.
    pub deleted_bytes: u64,
    /// States deleted.
    pub deleted_states: usize,
    /// Rejected transitions deleted.
    pub deleted_transitions: usize,
    /// Stat-cache rows pruned.
    pub pruned_cache: usize,
    /// Wall-clock time of the run.
    pub elapsed_ms: u64,
}

/// The collector. Cheap to construct; owns nothing but handles.
pub struct Collector {
    db: Arc<Database>,
    spill_dir: PathBuf,
}

impl Collector {
    /// Create a collector over the shared database and blob spill directory.
    pub fn new(db: Arc<Database>, spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            db,
            spill_dir: spill_dir.into(),
        }
    }

    /// The blob spill directory this collector scans.
    pub fn spill_dir(&self) -> &std::path::Path {
        &self.spill_dir
    }

    /// Run a collection.
    pub fn collect(&self, opts: &GcOptions) -> GcResult<GcReport> {
        let start = Instant::now();
        let mut report = GcReport::default();

        // Spilled files to unlink after commit, and spilled hashes that
        // survive (for the orphan scan).
        let mut doomed_spills: Vec<ObjectId> = Vec::new();
        let mut surviving_spills: HashSet<ObjectId> = HashSet::new();

        {
            let mut conn = self.db.lock();
            // IMMEDIATE takes the write lock up front; accepts serialize
            // against this transaction.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            // ---- Sweep: rejected transitions past the age cutoff ----
            // Runs before the mark so that a swept transition no longer
            // anchors its states, while a surviving (young) rejection
            // still does.
            let cutoff = epoch_seconds() - (opts.max_age_days as i64) * 86_400;
            report.deleted_transitions = tx.execute(
                "DELETE FROM transitions WHERE status = 'rejected' AND created_at <= ?1",
                [cutoff],
            )?;
            tx.execute(
                "DELETE FROM intents WHERE id NOT IN (SELECT intent_id FROM transitions)",
                [],
            )?;

            // ---- Mark ----
            let (live_states, live_trees, live_blobs) = mark(&tx)?;
            report.reachable = live_states.len() + live_trees.len() + live_blobs.len();

            // ---- Sweep: states ----
            {
                let mut stmt = tx.prepare("SELECT hash, LENGTH(data) FROM states")?;
                let rows: Vec<(String, i64)> = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<_, _>>()?;
                for (hex, len) in rows {
                    let id = parse_hex(&hex)?;
                    if !live_states.contains(&id) {
                        tx.execute("DELETE FROM states WHERE hash = ?1", [&hex])?;
                        report.deleted_states += 1;
                        report.deleted_bytes += len as u64;
                    }
                }
            }

            // ---- Sweep: trees ----
            {
                let mut stmt = tx.prepare("SELECT hash, LENGTH(data) FROM trees")?;
                let rows: Vec<(String, i64)> = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<_, _>>()?;
                for (hex, len) in rows {
                    let id = parse_hex(&hex)?;
                    if !live_trees.contains(&id) {
                        tx.execute("DELETE FROM trees WHERE hash = ?1", [&hex])?;
                        report.deleted_objects += 1;
                        report.deleted_bytes += len as u64;
                    }
                }
            }

            // ---- Sweep: blobs ----
            {
                let mut stmt = tx.prepare("SELECT hash, size, spilled FROM blobs")?;
                let rows: Vec<(String, i64, i64)> = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                    .collect::<Result<_, _>>()?;
                for (hex, size, spilled) in rows {
                    let id = parse_hex(&hex)?;
                    if live_blobs.contains(&id) {
                        if spilled != 0 {
                            surviving_spills.insert(id);
                        }
                    } else {
                        tx.execute("DELETE FROM blobs WHERE hash = ?1", [&hex])?;
                        report.deleted_objects += 1;
                        report.deleted_bytes += size as u64;
                        if spilled != 0 {
                            doomed_spills.push(id);
                        }
                    }
                }
            }

            // ---- Sweep: stat cache rows referencing deleted blobs ----
            report.pruned_cache = tx.execute(
                "DELETE FROM stat_cache
                 WHERE blob_hash NOT IN (SELECT hash FROM blobs)",
                [],
            )?;

            if opts.dry_run {
                // Everything above was bookkeeping; undo it.
                tx.rollback()?;
                report.elapsed_ms = start.elapsed().as_millis() as u64;
                info!(?report, "garbage collection dry run");
                return Ok(report);
            }
            tx.commit()?;
        }

        // Filesystem deletes happen strictly after the database commit.
        for id in &doomed_spills {
            let path = spill_path(&self.spill_dir, id);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(blob = %id.short_hex(), error = %e, "spill unlink failed"),
            }
        }

        // Orphan scan: spill files whose row is gone (a previous run
        // crashed between commit and unlink, or a writer crashed before
        // inserting the row).
        report = self.sweep_orphan_spills(report, &surviving_spills)?;

        report.elapsed_ms = start.elapsed().as_millis() as u64;
        info!(?report, "garbage collection complete");
        Ok(report)
    }

    fn sweep_orphan_spills(
        &self,
        mut report: GcReport,
        surviving: &HashSet<ObjectId>,
    ) -> GcResult<GcReport> {
        if !self.spill_dir.exists() {
            return Ok(report);
        }
        for entry in WalkDir::new(&self.spill_dir).min_depth(2).max_depth(2) {
            let entry = entry.map_err(|e| GcError::Io(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Ok(id) = ObjectId::from_hex(name) else {
                continue;
            };
            if !surviving.contains(&id) {
                let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
                debug!(blob = %id.short_hex(), "removing orphan spill file");
                std::fs::remove_file(entry.path())?;
                report.deleted_objects += 1;
                report.deleted_bytes += len;
            }
        }
        Ok(report)
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("spill_dir", &self.spill_dir)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Mark phase
// ---------------------------------------------------------------------------

type LiveSets = (HashSet<ObjectId>, HashSet<ObjectId>, HashSet<ObjectId>);

fn mark(conn: &Connection) -> GcResult<LiveSets> {
    let mut roots: Vec<ObjectId> = Vec::new();

    {
        let mut stmt = conn.prepare("SELECT head_state, fork_base FROM lanes")?;
        let rows: Vec<(Option<String>, Option<String>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<_, _>>()?;
        for (head, fork) in rows {
            if let Some(hex) = head {
                roots.push(parse_hex(&hex)?);
            }
            if let Some(hex) = fork {
                roots.push(parse_hex(&hex)?);
            }
        }
    }
    {
        // Old rejections were already swept in this transaction, so every
        // remaining row anchors its state.
        let mut stmt = conn.prepare("SELECT to_state FROM transitions")?;
        let rows: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        for hex in rows {
            roots.push(parse_hex(&hex)?);
        }
    }

    let mut live_states = HashSet::new();
    let mut live_trees = HashSet::new();
    let mut live_blobs = HashSet::new();

    // States: walk parent chains from every root.
    let mut pending: Vec<ObjectId> = roots;
    while let Some(id) = pending.pop() {
        if !live_states.insert(id) {
            continue;
        }
        let Some(state) = read_state(conn, &id)? else {
            // A root that is not stored (e.g. already lost) marks nothing.
            warn!(state = %id.short_hex(), "root state missing from store");
            live_states.remove(&id);
            continue;
        };
        mark_tree(conn, &state.root_tree, &mut live_trees, &mut live_blobs)?;
        if let Some(parent) = state.parent_id {
            pending.push(parent);
        }
    }

    debug!(
        states = live_states.len(),
        trees = live_trees.len(),
        blobs = live_blobs.len(),
        "mark phase complete"
    );
    Ok((live_states, live_trees, live_blobs))
}

fn mark_tree(
    conn: &Connection,
    tree_id: &ObjectId,
    live_trees: &mut HashSet<ObjectId>,
    live_blobs: &mut HashSet<ObjectId>,
) -> GcResult<()> {
    if !live_trees.insert(*tree_id) {
        return Ok(());
    }
    let Some(tree) = read_tree(conn, tree_id)? else {
        warn!(tree = %tree_id.short_hex(), "referenced tree missing from store");
        return Ok(());
    };
    for entry in &tree.entries {
        match entry.kind {
            flanes_store::EntryKind::Blob => {
                live_blobs.insert(entry.hash);
            }
            flanes_store::EntryKind::Tree => {
                mark_tree(conn, &entry.hash, live_trees, live_blobs)?;
            }
        }
    }
    Ok(())
}

fn read_state(conn: &Connection, id: &ObjectId) -> GcResult<Option<WorldState>> {
    let data: Option<Vec<u8>> = conn
        .query_row(
            "SELECT data FROM states WHERE hash = ?1",
            [id.to_hex()],
            |row| row.get(0),
        )
        .optional()?;
    match data {
        None => Ok(None),
        Some(data) => WorldState::decode(&data)
            .map(Some)
            .map_err(|e| GcError::CorruptObject {
                id: *id,
                reason: e.to_string(),
            }),
    }
}

fn read_tree(conn: &Connection, id: &ObjectId) -> GcResult<Option<Tree>> {
    let data: Option<Vec<u8>> = conn
        .query_row(
            "SELECT data FROM trees WHERE hash = ?1",
            [id.to_hex()],
            |row| row.get(0),
        )
        .optional()?;
    match data {
        None => Ok(None),
        Some(data) => Tree::decode(&data)
            .map(Some)
            .map_err(|e| GcError::CorruptObject {
                id: *id,
                reason: e.to_string(),
            }),
    }
}

fn parse_hex(hex: &str) -> GcResult<ObjectId> {
    ObjectId::from_hex(hex).map_err(|e| GcError::Database(format!("bad stored hash {hex:?}: {e}")))
}
