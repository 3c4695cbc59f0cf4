//! Path-keyed tree diffing.
//!
//! Compares two trees recursively and produces three maps keyed by
//! slash-separated path: `added`, `removed`, and `modified`. Entries are
//! file-level; a directory rename shows up as removals and additions of the
//! files beneath it. A mode-only change (same blob, different execute bit)
//! counts as modified.
//!
//! This is the whole comparison vocabulary of the system: promotion detects
//! conflicts by intersecting these maps, and the workspace manager applies
//! them as its minimal write set. Nothing here reads file contents.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use flanes_store::{Cas, EntryKind, EntryMode, StoreError, Tree};
use flanes_types::ObjectId;

/// Errors from diff computation.
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// A referenced object was missing or unreadable.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for diff operations.
pub type DiffResult<T> = Result<T, DiffError>;

/// One side of a file at a path: its content address and mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// Blob hash.
    pub hash: ObjectId,
    /// File mode.
    pub mode: EntryMode,
}

/// Old and new sides of a modified file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifiedEntry {
    /// The entry before the change.
    pub old: DiffEntry,
    /// The entry after the change.
    pub new: DiffEntry,
}

/// How a path changed between two trees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Present only in the new tree.
    Added,
    /// Present only in the old tree.
    Removed,
    /// Present in both with different content or mode.
    Modified,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Added => write!(f, "added"),
            Self::Removed => write!(f, "removed"),
            Self::Modified => write!(f, "modified"),
        }
    }
}

/// The result of comparing two trees, keyed by path.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TreeDiff {
    /// Files present only in the new tree.
    pub added: BTreeMap<String, DiffEntry>,
    /// Files present only in the old tree.
    pub removed: BTreeMap<String, DiffEntry>,
    /// Files present in both trees with different content or mode.
    pub modified: BTreeMap<String, ModifiedEntry>,
}

impl TreeDiff {
    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// Total number of changed paths.
    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }

    /// How `path` changed, if it did.
    pub fn change_kind(&self, path: &str) -> Option<ChangeKind> {
        if self.added.contains_key(path) {
            Some(ChangeKind::Added)
        } else if self.removed.contains_key(path) {
            Some(ChangeKind::Removed)
        } else if self.modified.contains_key(path) {
            Some(ChangeKind::Modified)
        } else {
            None
        }
    }

    /// The entry a path should have after applying this diff, or `None` if
    /// the diff removes it.
    pub fn resulting_entry(&self, path: &str) -> Option<DiffEntry> {
        if let Some(e) = self.added.get(path) {
            Some(*e)
        } else {
            self.modified.get(path).map(|m| m.new)
        }
    }

    /// All changed paths, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self
            .added
            .keys()
            .chain(self.removed.keys())
            .chain(self.modified.keys())
            .map(String::as_str)
            .collect();
        paths.sort_unstable();
        paths
    }
}

/// Compare two trees by id. `None` stands for an empty tree.
pub fn diff_trees(
    cas: &Cas,
    old: Option<&ObjectId>,
    new: Option<&ObjectId>,
) -> DiffResult<TreeDiff> {
    let mut diff = TreeDiff::default();
    let old_tree = read_opt(cas, old)?;
    let new_tree = read_opt(cas, new)?;
    diff_level(cas, "", old_tree.as_ref(), new_tree.as_ref(), &mut diff)?;
    Ok(diff)
}

fn read_opt(cas: &Cas, id: Option<&ObjectId>) -> DiffResult<Option<Tree>> {
    match id {
        Some(id) => Ok(Some(cas.get_tree(id)?)),
        None => Ok(None),
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn diff_level(
    cas: &Cas,
    prefix: &str,
    old: Option<&Tree>,
    new: Option<&Tree>,
    diff: &mut TreeDiff,
) -> DiffResult<()> {
    let empty = Tree::empty();
    let old = old.unwrap_or(&empty);
    let new = new.unwrap_or(&empty);

    // Both entry lists are sorted by name; walk them like a merge.
    let mut oi = old.entries.iter().peekable();
    let mut ni = new.entries.iter().peekable();

    loop {
        match (oi.peek(), ni.peek()) {
            (None, None) => break,
            (Some(o), None) => {
                record_side(cas, prefix, o, diff, Side::Removed)?;
                oi.next();
            }
            (None, Some(n)) => {
                record_side(cas, prefix, n, diff, Side::Added)?;
                ni.next();
            }
            (Some(o), Some(n)) => match o.name.cmp(&n.name) {
                std::cmp::Ordering::Less => {
                    record_side(cas, prefix, o, diff, Side::Removed)?;
                    oi.next();
                }
                std::cmp::Ordering::Greater => {
                    record_side(cas, prefix, n, diff, Side::Added)?;
                    ni.next();
                }
                std::cmp::Ordering::Equal => {
                    let (o, n) = (*o, *n);
                    match (o.kind, n.kind) {
                        (EntryKind::Tree, EntryKind::Tree) => {
                            if o.hash != n.hash {
                                let old_sub = cas.get_tree(&o.hash)?;
                                let new_sub = cas.get_tree(&n.hash)?;
                                diff_level(
                                    cas,
                                    &join(prefix, &o.name),
                                    Some(&old_sub),
                                    Some(&new_sub),
                                    diff,
                                )?;
                            }
                        }
                        (EntryKind::Blob, EntryKind::Blob) => {
                            if o.hash != n.hash || o.mode != n.mode {
                                diff.modified.insert(
                                    join(prefix, &o.name),
                                    ModifiedEntry {
                                        old: DiffEntry {
                                            hash: o.hash,
                                            mode: o.mode,
                                        },
                                        new: DiffEntry {
                                            hash: n.hash,
                                            mode: n.mode,
                                        },
                                    },
                                );
                            }
                        }
                        // A file replaced a directory or vice versa: the
                        // old shape is removed, the new one added.
                        _ => {
                            record_side(cas, prefix, o, diff, Side::Removed)?;
                            record_side(cas, prefix, n, diff, Side::Added)?;
                        }
                    }
                    oi.next();
                    ni.next();
                }
            },
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Side {
    Added,
    Removed,
}

fn record_side(
    cas: &Cas,
    prefix: &str,
    entry: &flanes_store::TreeEntry,
    diff: &mut TreeDiff,
    side: Side,
) -> DiffResult<()> {
    match entry.kind {
        EntryKind::Blob => {
            let path = join(prefix, &entry.name);
            let e = DiffEntry {
                hash: entry.hash,
                mode: entry.mode,
            };
            match side {
                Side::Added => diff.added.insert(path, e),
                Side::Removed => diff.removed.insert(path, e),
            };
        }
        EntryKind::Tree => {
            let sub = cas.get_tree(&entry.hash)?;
            let sub_prefix = join(prefix, &entry.name);
            for child in &sub.entries {
                record_side(cas, &sub_prefix, child, diff, side)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use flanes_store::{InMemoryObjectStore, StoreLimits, TreeEntry};

    fn make_cas() -> Cas {
        Cas::new(Arc::new(InMemoryObjectStore::new()), StoreLimits::default())
    }

    /// Build a tree from `(path, contents, executable)` triples.
    fn build_tree(cas: &Cas, files: &[(&str, &str, bool)]) -> ObjectId {
        #[derive(Default)]
        struct Dir {
            files: Vec<(String, ObjectId, EntryMode)>,
            dirs: BTreeMap<String, Dir>,
        }
        fn insert(dir: &mut Dir, path: &str, blob: ObjectId, mode: EntryMode) {
            match path.split_once('/') {
                None => dir.files.push((path.to_string(), blob, mode)),
                Some((head, rest)) => {
                    insert(dir.dirs.entry(head.to_string()).or_default(), rest, blob, mode)
                }
            }
        }
        fn ingest(cas: &Cas, dir: &Dir) -> ObjectId {
            let mut entries = Vec::new();
            for (name, sub) in &dir.dirs {
                entries.push(TreeEntry::tree(name.clone(), ingest(cas, sub)));
            }
            for (name, blob, mode) in &dir.files {
                entries.push(TreeEntry::blob(name.clone(), *blob, *mode));
            }
            cas.put_tree(entries).unwrap()
        }

        let mut root = Dir::default();
        for (path, contents, exec) in files {
            let blob = cas.put_blob(contents.as_bytes()).unwrap();
            let mode = if *exec {
                EntryMode::Executable
            } else {
                EntryMode::Regular
            };
            insert(&mut root, path, blob, mode);
        }
        ingest(cas, &root)
    }

    #[test]
    fn identical_trees_produce_empty_diff() {
        let cas = make_cas();
        let t = build_tree(&cas, &[("a.txt", "A", false), ("dir/b.txt", "B", false)]);
        let diff = diff_trees(&cas, Some(&t), Some(&t)).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn empty_to_populated_is_all_additions() {
        let cas = make_cas();
        let t = build_tree(&cas, &[("a.txt", "A", false), ("dir/b.txt", "B", false)]);
        let diff = diff_trees(&cas, None, Some(&t)).unwrap();
        assert_eq!(diff.added.len(), 2);
        assert!(diff.added.contains_key("a.txt"));
        assert!(diff.added.contains_key("dir/b.txt"));
        assert!(diff.removed.is_empty());
        assert!(diff.modified.is_empty());
    }

    #[test]
    fn populated_to_empty_is_all_removals() {
        let cas = make_cas();
        let t = build_tree(&cas, &[("a.txt", "A", false), ("dir/b.txt", "B", false)]);
        let diff = diff_trees(&cas, Some(&t), None).unwrap();
        assert_eq!(diff.removed.len(), 2);
        assert!(diff.removed.contains_key("dir/b.txt"));
    }

    #[test]
    fn content_change_is_modified() {
        let cas = make_cas();
        let old = build_tree(&cas, &[("app.py", "v1", false)]);
        let new = build_tree(&cas, &[("app.py", "v2", false)]);
        let diff = diff_trees(&cas, Some(&old), Some(&new)).unwrap();
        assert_eq!(diff.len(), 1);
        let m = &diff.modified["app.py"];
        assert_ne!(m.old.hash, m.new.hash);
    }

    #[test]
    fn mode_only_change_is_modified() {
        let cas = make_cas();
        let old = build_tree(&cas, &[("run.sh", "#!/bin/sh", false)]);
        let new = build_tree(&cas, &[("run.sh", "#!/bin/sh", true)]);
        let diff = diff_trees(&cas, Some(&old), Some(&new)).unwrap();
        let m = &diff.modified["run.sh"];
        assert_eq!(m.old.hash, m.new.hash);
        assert_eq!(m.old.mode, EntryMode::Regular);
        assert_eq!(m.new.mode, EntryMode::Executable);
    }

    #[test]
    fn unchanged_subtrees_are_not_descended() {
        // Same subtree hash on both sides short-circuits; only the changed
        // directory contributes paths.
        let cas = make_cas();
        let old = build_tree(
            &cas,
            &[
                ("stable/one.txt", "1", false),
                ("stable/two.txt", "2", false),
                ("hot/app.py", "v1", false),
            ],
        );
        let new = build_tree(
            &cas,
            &[
                ("stable/one.txt", "1", false),
                ("stable/two.txt", "2", false),
                ("hot/app.py", "v2", false),
            ],
        );
        let diff = diff_trees(&cas, Some(&old), Some(&new)).unwrap();
        assert_eq!(diff.paths(), vec!["hot/app.py"]);
    }

    #[test]
    fn file_replaced_by_directory() {
        let cas = make_cas();
        let old = build_tree(&cas, &[("thing", "file", false)]);
        let new = build_tree(&cas, &[("thing/nested.txt", "dir", false)]);
        let diff = diff_trees(&cas, Some(&old), Some(&new)).unwrap();
        assert!(diff.removed.contains_key("thing"));
        assert!(diff.added.contains_key("thing/nested.txt"));
    }

    #[test]
    fn directory_removal_lists_every_file() {
        let cas = make_cas();
        let old = build_tree(
            &cas,
            &[
                ("pkg/a.py", "a", false),
                ("pkg/sub/b.py", "b", false),
                ("keep.txt", "k", false),
            ],
        );
        let new = build_tree(&cas, &[("keep.txt", "k", false)]);
        let diff = diff_trees(&cas, Some(&old), Some(&new)).unwrap();
        assert_eq!(diff.removed.len(), 2);
        assert!(diff.removed.contains_key("pkg/a.py"));
        assert!(diff.removed.contains_key("pkg/sub/b.py"));
    }

    #[test]
    fn change_kind_and_resulting_entry() {
        let cas = make_cas();
        let old = build_tree(&cas, &[("gone.txt", "x", false), ("mod.txt", "1", false)]);
        let new = build_tree(&cas, &[("new.txt", "y", false), ("mod.txt", "2", false)]);
        let diff = diff_trees(&cas, Some(&old), Some(&new)).unwrap();

        assert_eq!(diff.change_kind("new.txt"), Some(ChangeKind::Added));
        assert_eq!(diff.change_kind("gone.txt"), Some(ChangeKind::Removed));
        assert_eq!(diff.change_kind("mod.txt"), Some(ChangeKind::Modified));
        assert_eq!(diff.change_kind("absent.txt"), None);

        assert!(diff.resulting_entry("new.txt").is_some());
        assert!(diff.resulting_entry("gone.txt").is_none());
        assert_eq!(
            diff.resulting_entry("mod.txt").unwrap().hash,
            diff.modified["mod.txt"].new.hash
        );
    }

    #[test]
    fn paths_are_sorted() {
        let cas = make_cas();
        let old = build_tree(&cas, &[("z.txt", "z", false)]);
        let new = build_tree(&cas, &[("a.txt", "a", false), ("m.txt", "m", false)]);
        let diff = diff_trees(&cas, Some(&old), Some(&new)).unwrap();
        assert_eq!(diff.paths(), vec!["a.txt", "m.txt", "z.txt"]);
    }
}
