//! The workspace manager: snapshot, materialize, and incremental update.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use flanes_db::Database;
use flanes_diff::{diff_trees, TreeDiff};
use flanes_store::{Cas, EntryMode, ObjectKind, TreeEntry};
use flanes_types::{CancelToken, ObjectId};

use crate::descriptor::read_descriptor;
use crate::dirty::{clear_dirty, read_dirty, write_dirty, DirtyMarker};
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::lock::{LockGuard, DEFAULT_LOCK_TIMEOUT};
use crate::rules::IgnoreRules;
use crate::stat_cache::{FileIdentity, StatCache};

/// The workspace mapped onto the repository root.
pub const MAIN_WORKSPACE: &str = "main";

/// What a snapshot produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotOutcome {
    /// The new world state.
    pub state: ObjectId,
    /// Its root tree.
    pub root_tree: ObjectId,
}

/// Counters from a materialize or update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Files written (added or modified).
    pub files_written: usize,
    /// Files removed.
    pub files_removed: usize,
    /// Directories created.
    pub dirs_created: usize,
}

/// Manages the physical directories of all workspaces in one repository.
pub struct WorkspaceManager {
    cas: Arc<Cas>,
    stat_cache: StatCache,
    repo_root: PathBuf,
    state_dir: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager rooted at the repository directory.
    pub fn new(cas: Arc<Cas>, db: Arc<Database>, repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let state_dir = repo_root.join(".state");
        Self {
            cas,
            stat_cache: StatCache::new(db),
            repo_root,
            state_dir,
        }
    }

    /// The repository root directory.
    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// The `.state` directory.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// The directory a workspace materializes into. `main` is the
    /// repository root; everything else lives under `.state/workspaces/`.
    pub fn workspace_dir(&self, name: &str) -> PathBuf {
        if name == MAIN_WORKSPACE {
            self.repo_root.clone()
        } else {
            self.state_dir.join("workspaces").join(name)
        }
    }

    /// Path of a workspace's JSON descriptor.
    pub fn descriptor_path(&self, name: &str) -> PathBuf {
        if name == MAIN_WORKSPACE {
            self.state_dir.join("main.json")
        } else {
            self.state_dir.join("workspaces").join(format!("{name}.json"))
        }
    }

    /// Path of a workspace's lock directory.
    pub fn lock_dir(&self, name: &str) -> PathBuf {
        if name == MAIN_WORKSPACE {
            self.state_dir.join("main.lockdir")
        } else {
            self.state_dir
                .join("workspaces")
                .join(format!("{name}.lockdir"))
        }
    }

    // -------------------------------------------------------------------
    // Locks and dirty markers
    // -------------------------------------------------------------------

    /// Acquire the workspace lock with the default timeout.
    pub fn acquire_lock(&self, name: &str) -> WorkspaceResult<LockGuard> {
        self.acquire_lock_timeout(name, DEFAULT_LOCK_TIMEOUT)
    }

    /// Acquire the workspace lock, waiting up to `timeout`.
    pub fn acquire_lock_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> WorkspaceResult<LockGuard> {
        let lock_dir = self.lock_dir(name);
        if let Some(parent) = lock_dir.parent() {
            fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;
        }
        LockGuard::acquire(name, &lock_dir, timeout)
    }

    /// The workspace's dirty marker, if an operation was interrupted.
    pub fn is_dirty(&self, name: &str) -> WorkspaceResult<Option<DirtyMarker>> {
        read_dirty(&self.workspace_dir(name))
    }

    /// Clear the dirty marker after explicit recovery.
    pub fn clear_dirty(&self, name: &str) -> WorkspaceResult<()> {
        clear_dirty(&self.workspace_dir(name))
    }

    // -------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------

    /// Hash the workspace directory into the CAS, producing a new world
    /// state whose parent is `parent`.
    ///
    /// Walks depth-first with entries sorted by name; symbolic links are
    /// never followed; ignore rules are the compiled defaults unioned with
    /// `.stateignore`. Unchanged files are resolved through the stat cache
    /// without re-reading.
    pub fn snapshot(
        &self,
        name: &str,
        parent: Option<ObjectId>,
        cancel: &CancelToken,
    ) -> WorkspaceResult<SnapshotOutcome> {
        let dir = self.workspace_dir(name);
        if let Some(marker) = read_dirty(&dir)? {
            return Err(WorkspaceError::Dirty {
                workspace: name.to_string(),
                target: marker.target_state,
            });
        }

        let rules = IgnoreRules::for_workspace(&dir)?;
        let root_tree = self.snapshot_dir(name, &dir, &dir, &rules, cancel)?;
        let state = self.cas.put_state(root_tree, parent)?;
        info!(workspace = name, state = %state.short_hex(), "snapshot complete");
        Ok(SnapshotOutcome { state, root_tree })
    }

    fn snapshot_dir(
        &self,
        workspace: &str,
        root: &Path,
        dir: &Path,
        rules: &IgnoreRules,
        cancel: &CancelToken,
    ) -> WorkspaceResult<ObjectId> {
        let mut children: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(|e| WorkspaceError::io(dir, e))?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<Result<_, _>>()
            .map_err(|e| WorkspaceError::io(dir, e))?;
        children.sort();

        let mut entries: Vec<TreeEntry> = Vec::with_capacity(children.len());
        for child in children {
            cancel.check()?;

            let Some(file_name) = child.file_name().and_then(|n| n.to_str()) else {
                warn!(path = %child.display(), "skipping non-UTF-8 file name");
                continue;
            };
            let meta =
                fs::symlink_metadata(&child).map_err(|e| WorkspaceError::io(&child, e))?;
            if meta.file_type().is_symlink() {
                debug!(path = %child.display(), "skipping symlink");
                continue;
            }

            let rel = child.strip_prefix(root).expect("child is under root");
            if rules.is_ignored(rel, meta.is_dir()) {
                continue;
            }

            if meta.is_dir() {
                let sub = self.snapshot_dir(workspace, root, &child, rules, cancel)?;
                entries.push(TreeEntry::tree(file_name, sub));
            } else if meta.is_file() {
                let rel_str = rel.to_string_lossy().replace('\\', "/");
                let identity = file_identity(&meta);
                let blob = self.blob_for_file(workspace, &child, &rel_str, &identity)?;
                entries.push(TreeEntry::blob(file_name, blob, entry_mode(&meta)));
            }
            // Sockets, fifos, devices: not project state; skipped.
        }

        Ok(self.cas.put_tree(entries)?)
    }

    /// Resolve a file to its blob hash, through the stat cache when the
    /// identity matches and the blob still exists.
    fn blob_for_file(
        &self,
        workspace: &str,
        path: &Path,
        rel: &str,
        identity: &FileIdentity,
    ) -> WorkspaceResult<ObjectId> {
        if let Some(blob) = self.stat_cache.lookup(workspace, rel, identity)? {
            if self.cas.has(ObjectKind::Blob, &blob)? {
                return Ok(blob);
            }
        }
        let bytes = fs::read(path).map_err(|e| WorkspaceError::io(path, e))?;
        let blob = self.cas.put_blob(&bytes)?;
        self.stat_cache.record(workspace, rel, identity, &blob)?;
        Ok(blob)
    }

    // -------------------------------------------------------------------
    // Materialize and update
    // -------------------------------------------------------------------

    /// Write the full tree of `state` into the workspace directory.
    ///
    /// Existing files at tree paths are overwritten; files outside the tree
    /// are left alone. The operation is bracketed by a dirty marker, so a
    /// crash mid-write is detected on restart.
    pub fn materialize(
        &self,
        name: &str,
        state: &ObjectId,
        cancel: &CancelToken,
    ) -> WorkspaceResult<ApplyStats> {
        let dir = self.workspace_dir(name);
        fs::create_dir_all(&dir).map_err(|e| WorkspaceError::io(&dir, e))?;

        let world = self.cas.get_state(state)?;
        write_dirty(&dir, *state)?;

        let mut stats = ApplyStats::default();
        self.write_tree(&dir, &world.root_tree, cancel, &mut stats)?;

        clear_dirty(&dir)?;
        info!(
            workspace = name,
            state = %state.short_hex(),
            files = stats.files_written,
            "materialized"
        );
        Ok(stats)
    }

    fn write_tree(
        &self,
        dir: &Path,
        tree_id: &ObjectId,
        cancel: &CancelToken,
        stats: &mut ApplyStats,
    ) -> WorkspaceResult<()> {
        let tree = self.cas.get_tree(tree_id)?;
        for entry in &tree.entries {
            cancel.check()?;
            let path = dir.join(&entry.name);
            match entry.kind {
                flanes_store::EntryKind::Tree => {
                    if !path.is_dir() {
                        fs::create_dir_all(&path)
                            .map_err(|e| WorkspaceError::io(&path, e))?;
                        stats.dirs_created += 1;
                    }
                    self.write_tree(&path, &entry.hash, cancel, stats)?;
                }
                flanes_store::EntryKind::Blob => {
                    self.write_file(&path, &entry.hash, entry.mode)?;
                    stats.files_written += 1;
                }
            }
        }
        Ok(())
    }

    /// Atomic per-file write: temp file in the same directory, then rename.
    fn write_file(&self, path: &Path, blob: &ObjectId, mode: EntryMode) -> WorkspaceResult<()> {
        let bytes = self.cas.get_blob(blob)?;
        let parent = path.parent().expect("file path has a parent");

        let mut tmp = tempfile::NamedTempFile::new_in(parent)
            .map_err(|e| WorkspaceError::io(parent, e))?;
        tmp.write_all(&bytes)
            .map_err(|e| WorkspaceError::io(tmp.path(), e))?;
        set_mode(tmp.as_file(), mode).map_err(|e| WorkspaceError::io(tmp.path(), e))?;
        tmp.persist(path)
            .map_err(|e| WorkspaceError::io(path, e.error))?;
        Ok(())
    }

    /// Apply the minimal diff taking the workspace from its recorded base
    /// state to `target_state`.
    ///
    /// Order: remove files, remove emptied directories, create directories,
    /// write modified and added files. Unchanged files are never touched,
    /// so their timestamps survive. Refuses (before any write) if an
    /// untracked file sits at a path the new tree defines.
    pub fn update(
        &self,
        name: &str,
        target_state: &ObjectId,
        cancel: &CancelToken,
    ) -> WorkspaceResult<ApplyStats> {
        let dir = self.workspace_dir(name);
        if let Some(marker) = read_dirty(&dir)? {
            return Err(WorkspaceError::Dirty {
                workspace: name.to_string(),
                target: marker.target_state,
            });
        }

        let descriptor_path = self.descriptor_path(name);
        let record = read_descriptor(&descriptor_path)?.ok_or_else(|| {
            WorkspaceError::CorruptMetadata {
                path: descriptor_path,
                reason: "workspace has no descriptor".into(),
            }
        })?;

        let base_tree = match record.base_state {
            Some(base) => Some(self.cas.get_state(&base)?.root_tree),
            None => None,
        };
        let target_tree = self.cas.get_state(target_state)?.root_tree;
        let diff = diff_trees(&self.cas, base_tree.as_ref(), Some(&target_tree))?;

        // Conservative stance on untracked files: a path the base tree did
        // not track but the new tree defines must not be silently clobbered.
        let mut collisions = Vec::new();
        for path in diff.added.keys() {
            if dir.join(path).exists() {
                collisions.push(path.clone());
            }
        }
        if !collisions.is_empty() {
            return Err(WorkspaceError::UntrackedCollision { paths: collisions });
        }

        write_dirty(&dir, *target_state)?;
        let stats = self.apply_diff(&dir, &diff, cancel)?;
        clear_dirty(&dir)?;

        info!(
            workspace = name,
            target = %target_state.short_hex(),
            written = stats.files_written,
            removed = stats.files_removed,
            "updated"
        );
        Ok(stats)
    }

    fn apply_diff(
        &self,
        dir: &Path,
        diff: &TreeDiff,
        cancel: &CancelToken,
    ) -> WorkspaceResult<ApplyStats> {
        let mut stats = ApplyStats::default();

        // 1. Remove deleted files.
        for path in diff.removed.keys() {
            cancel.check()?;
            let abs = dir.join(path);
            match fs::remove_file(&abs) {
                Ok(()) => stats.files_removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(WorkspaceError::io(&abs, e)),
            }
        }

        // 2. Remove directories emptied by the removals.
        for path in diff.removed.keys() {
            let mut cursor = Path::new(path).parent();
            while let Some(rel) = cursor {
                if rel.as_os_str().is_empty() {
                    break;
                }
                // Stops at the first non-empty directory.
                if fs::remove_dir(dir.join(rel)).is_err() {
                    break;
                }
                cursor = rel.parent();
            }
        }

        // 3. Create directories for incoming files.
        for path in diff.added.keys().chain(diff.modified.keys()) {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    let abs = dir.join(parent);
                    if !abs.is_dir() {
                        fs::create_dir_all(&abs)
                            .map_err(|e| WorkspaceError::io(&abs, e))?;
                        stats.dirs_created += 1;
                    }
                }
            }
        }

        // 4. Write added and modified files.
        for (path, entry) in diff
            .added
            .iter()
            .chain(diff.modified.iter().map(|(p, m)| (p, &m.new)))
        {
            cancel.check()?;
            self.write_file(&dir.join(path), &entry.hash, entry.mode)?;
            stats.files_written += 1;
        }

        Ok(stats)
    }

    /// Delete a workspace's directory and stat-cache rows. The CAS keeps
    /// every state the workspace ever snapshotted.
    pub fn remove_workspace_dir(&self, name: &str) -> WorkspaceResult<()> {
        let dir = self.workspace_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| WorkspaceError::io(&dir, e))?;
        }
        self.stat_cache.forget_workspace(name)?;
        Ok(())
    }

    /// The stat cache handle.
    pub fn stat_cache(&self) -> &StatCache {
        &self.stat_cache
    }
}

impl std::fmt::Debug for WorkspaceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkspaceManager")
            .field("repo_root", &self.repo_root)
            .finish()
    }
}

fn file_identity(meta: &fs::Metadata) -> FileIdentity {
    let mtime_ns = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    FileIdentity {
        size: meta.len(),
        mtime_ns,
        inode: inode_of(meta),
    }
}

#[cfg(unix)]
fn inode_of(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &fs::Metadata) -> u64 {
    0
}

#[cfg(unix)]
fn entry_mode(meta: &fs::Metadata) -> EntryMode {
    use std::os::unix::fs::PermissionsExt;
    if meta.permissions().mode() & 0o111 != 0 {
        EntryMode::Executable
    } else {
        EntryMode::Regular
    }
}

#[cfg(not(unix))]
fn entry_mode(_meta: &fs::Metadata) -> EntryMode {
    EntryMode::Regular
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: EntryMode) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let bits = match mode {
        EntryMode::Executable => 0o755,
        _ => 0o644,
    };
    file.set_permissions(fs::Permissions::from_mode(bits))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: EntryMode) -> std::io::Result<()> {
    Ok(())
}
