//! Promotion engine: compose one lane's work into another without content
//! merging.
//!
//! Promotion compares the source and target heads against their lowest
//! common ancestor in the state DAG. The conflict set is the intersection of
//! the two path-keyed diffs, minus changes that are identical on both sides.
//! Removal against modification is always a conflict. No file contents are
//! ever inspected; conflicts are reported at path granularity and resolution
//! is the caller's problem (or `force`, which lets the source side win).
//!
//! # Invariants
//!
//! - A plan with conflicts produces no writes unless forced.
//! - The composed tree equals the target tree with the source diff applied
//!   at every non-conflicting path.
//! - The state DAG is acyclic (parents must exist before children), so the
//!   ancestor walks terminate.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use flanes_diff::{diff_trees, ChangeKind, DiffEntry, DiffError, TreeDiff};
use flanes_store::{Cas, EntryMode, StoreError, TreeEntry};
use flanes_types::ObjectId;

/// Errors from promotion planning and application.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// The two heads share no ancestor; the lanes are unrelated.
    #[error("no common ancestor between {source_head} and {target}")]
    NoCommonAncestor { source_head: ObjectId, target: ObjectId },

    /// A referenced object was missing or unreadable.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Diff computation failed.
    #[error(transparent)]
    Diff(#[from] DiffError),
}

/// Result alias for merge operations.
pub type MergeResult<T> = Result<T, MergeError>;

/// A path changed on both sides in incompatible ways.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPath {
    /// The conflicting path.
    pub path: String,
    /// How the source side changed it.
    pub source: ChangeKind,
    /// How the target side changed it.
    pub target: ChangeKind,
}

/// The outcome of comparing two lane heads for promotion.
#[derive(Clone, Debug)]
pub struct PromotePlan {
    /// The lowest common ancestor state.
    pub ancestor: ObjectId,
    /// Changes on the source side since the ancestor.
    pub source_diff: TreeDiff,
    /// Changes on the target side since the ancestor.
    pub target_diff: TreeDiff,
    /// Paths changed incompatibly on both sides.
    pub conflicts: Vec<ConflictPath>,
}

impl PromotePlan {
    /// Returns `true` if the plan can apply without forcing.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Returns `true` if the source made no changes since the ancestor.
    pub fn is_noop(&self) -> bool {
        self.source_diff.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Ancestry
// ---------------------------------------------------------------------------

/// Walk `parent_id` links from `start`, yielding every ancestor including
/// `start` itself, nearest first.
pub fn ancestor_chain(cas: &Cas, start: &ObjectId) -> MergeResult<Vec<ObjectId>> {
    let mut chain = Vec::new();
    let mut cursor = Some(*start);
    while let Some(id) = cursor {
        chain.push(id);
        cursor = cas.get_state(&id)?.parent_id;
    }
    Ok(chain)
}

/// The lowest common ancestor of two states, or `None` if their histories
/// are disjoint.
///
/// Each state has at most one parent, so both histories are chains; the
/// first state on `b`'s chain that also appears on `a`'s chain is the LCA.
pub fn lowest_common_ancestor(
    cas: &Cas,
    a: &ObjectId,
    b: &ObjectId,
) -> MergeResult<Option<ObjectId>> {
    let seen: HashSet<ObjectId> = ancestor_chain(cas, a)?.into_iter().collect();
    let mut cursor = Some(*b);
    while let Some(id) = cursor {
        if seen.contains(&id) {
            return Ok(Some(id));
        }
        cursor = cas.get_state(&id)?.parent_id;
    }
    Ok(None)
}

/// Returns `true` if `ancestor` appears on `descendant`'s parent chain
/// (states are their own ancestors).
pub fn is_ancestor(cas: &Cas, ancestor: &ObjectId, descendant: &ObjectId) -> MergeResult<bool> {
    let mut cursor = Some(*descendant);
    while let Some(id) = cursor {
        if id == *ancestor {
            return Ok(true);
        }
        cursor = cas.get_state(&id)?.parent_id;
    }
    Ok(false)
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Compare `source_head` and `target_head` for promotion.
pub fn plan_promotion(
    cas: &Cas,
    source_head: &ObjectId,
    target_head: &ObjectId,
) -> MergeResult<PromotePlan> {
    let ancestor = lowest_common_ancestor(cas, source_head, target_head)?.ok_or(
        MergeError::NoCommonAncestor {
            source_head: *source_head,
            target: *target_head,
        },
    )?;

    let ancestor_tree = cas.get_state(&ancestor)?.root_tree;
    let source_tree = cas.get_state(source_head)?.root_tree;
    let target_tree = cas.get_state(target_head)?.root_tree;

    let source_diff = diff_trees(cas, Some(&ancestor_tree), Some(&source_tree))?;
    let target_diff = diff_trees(cas, Some(&ancestor_tree), Some(&target_tree))?;
    let conflicts = conflict_set(&source_diff, &target_diff);

    debug!(
        ancestor = %ancestor.short_hex(),
        source_changes = source_diff.len(),
        target_changes = target_diff.len(),
        conflicts = conflicts.len(),
        "promotion planned"
    );

    Ok(PromotePlan {
        ancestor,
        source_diff,
        target_diff,
        conflicts,
    })
}

/// Paths changed on both sides, minus changes identical on both sides.
fn conflict_set(source: &TreeDiff, target: &TreeDiff) -> Vec<ConflictPath> {
    let mut conflicts = Vec::new();
    for path in source.paths() {
        let Some(source_kind) = source.change_kind(path) else {
            continue;
        };
        let Some(target_kind) = target.change_kind(path) else {
            continue;
        };
        // An identical change on both sides is convergence, not conflict:
        // both removed, or both arrived at the same content and mode.
        let identical = match (source_kind, target_kind) {
            (ChangeKind::Removed, ChangeKind::Removed) => true,
            (ChangeKind::Added, ChangeKind::Added)
            | (ChangeKind::Modified, ChangeKind::Modified) => {
                source.resulting_entry(path) == target.resulting_entry(path)
            }
            _ => false,
        };
        if !identical {
            conflicts.push(ConflictPath {
                path: path.to_string(),
                source: source_kind,
                target: target_kind,
            });
        }
    }
    conflicts
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Flatten a stored tree into a path-keyed file map.
pub fn flatten_tree(cas: &Cas, tree_id: &ObjectId) -> MergeResult<BTreeMap<String, DiffEntry>> {
    let mut files = BTreeMap::new();
    flatten_into(cas, tree_id, "", &mut files)?;
    Ok(files)
}

fn flatten_into(
    cas: &Cas,
    tree_id: &ObjectId,
    prefix: &str,
    files: &mut BTreeMap<String, DiffEntry>,
) -> MergeResult<()> {
    let tree = cas.get_tree(tree_id)?;
    for entry in &tree.entries {
        let path = if prefix.is_empty() {
            entry.name.clone()
        } else {
            format!("{prefix}/{}", entry.name)
        };
        match entry.kind {
            flanes_store::EntryKind::Blob => {
                files.insert(
                    path,
                    DiffEntry {
                        hash: entry.hash,
                        mode: entry.mode,
                    },
                );
            }
            flanes_store::EntryKind::Tree => flatten_into(cas, &entry.hash, &path, files)?,
        }
    }
    Ok(())
}

/// Build nested trees bottom-up from a path-keyed file map and store them,
/// returning the root tree id.
pub fn build_tree_from_files(
    cas: &Cas,
    files: &BTreeMap<String, DiffEntry>,
) -> MergeResult<ObjectId> {
    #[derive(Default)]
    struct Dir {
        files: Vec<(String, DiffEntry)>,
        dirs: BTreeMap<String, Dir>,
    }

    fn insert(dir: &mut Dir, path: &str, entry: DiffEntry) {
        match path.split_once('/') {
            None => dir.files.push((path.to_string(), entry)),
            Some((head, rest)) => {
                insert(dir.dirs.entry(head.to_string()).or_default(), rest, entry)
            }
        }
    }

    fn ingest(cas: &Cas, dir: &Dir) -> MergeResult<ObjectId> {
        let mut entries = Vec::with_capacity(dir.files.len() + dir.dirs.len());
        for (name, sub) in &dir.dirs {
            entries.push(TreeEntry::tree(name.clone(), ingest(cas, sub)?));
        }
        for (name, entry) in &dir.files {
            let mode = match entry.mode {
                EntryMode::Directory => EntryMode::Regular,
                other => other,
            };
            entries.push(TreeEntry::blob(name.clone(), entry.hash, mode));
        }
        Ok(cas.put_tree(entries)?)
    }

    let mut root = Dir::default();
    for (path, entry) in files {
        insert(&mut root, path, *entry);
    }
    ingest(cas, &root)
}

/// Apply `diff` onto the tree at `base_tree`, path by path, and store the
/// resulting tree. The diff's removals delete paths, its additions and
/// modifications set them; everything else is carried over untouched.
pub fn apply_diff(cas: &Cas, base_tree: &ObjectId, diff: &TreeDiff) -> MergeResult<ObjectId> {
    let mut files = flatten_tree(cas, base_tree)?;
    for path in diff.removed.keys() {
        files.remove(path);
    }
    for (path, entry) in &diff.added {
        files.insert(path.clone(), *entry);
    }
    for (path, modified) in &diff.modified {
        files.insert(path.clone(), modified.new);
    }
    build_tree_from_files(cas, &files)
}
