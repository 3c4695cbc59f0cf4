use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use flanes_types::canonical::to_canonical_json;
use flanes_types::ObjectId;

use crate::error::{StoreError, StoreResult};

/// The kind of object stored. Each kind lives in its own keyspace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Raw content (file bytes).
    Blob,
    /// Directory listing: sorted entries mapping names to object references.
    Tree,
    /// World state: root tree, parent pointer, timestamp.
    State,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blob => write!(f, "blob"),
            Self::Tree => write!(f, "tree"),
            Self::State => write!(f, "state"),
        }
    }
}

/// What a tree entry points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// The entry references a blob (a file).
    Blob,
    /// The entry references another tree (a directory).
    Tree,
}

/// File mode for a tree entry.
///
/// Symlinks are deliberately absent: snapshots skip them, so no tree ever
/// records one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EntryMode {
    /// Normal file (0o100644).
    Regular,
    /// Executable file (0o100755).
    Executable,
    /// Subtree / directory (0o040000).
    Directory,
}

impl EntryMode {
    /// Octal mode value used in the canonical encoding.
    pub fn mode_bits(&self) -> u32 {
        match self {
            Self::Regular => 0o100644,
            Self::Executable => 0o100755,
            Self::Directory => 0o040000,
        }
    }

    /// Parse from an octal mode value.
    pub fn from_mode_bits(bits: u32) -> Option<Self> {
        match bits {
            0o100644 => Some(Self::Regular),
            0o100755 => Some(Self::Executable),
            0o040000 => Some(Self::Directory),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:06o}", self.mode_bits())
    }
}

// Canonical encoding carries the numeric mode bits, not enum names.
impl Serialize for EntryMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.mode_bits())
    }
}

impl<'de> Deserialize<'de> for EntryMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bits = u32::deserialize(deserializer)?;
        Self::from_mode_bits(bits)
            .ok_or_else(|| D::Error::custom(format!("unknown mode bits {bits:o}")))
    }
}

/// A single entry in a tree object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Entry name (filename or directory name).
    pub name: String,
    /// Whether the entry references a blob or a subtree.
    pub kind: EntryKind,
    /// Content address of the referenced object.
    pub hash: ObjectId,
    /// File mode.
    pub mode: EntryMode,
}

impl TreeEntry {
    /// Create a blob (file) entry.
    pub fn blob(name: impl Into<String>, hash: ObjectId, mode: EntryMode) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Blob,
            hash,
            mode,
        }
    }

    /// Create a subtree (directory) entry.
    pub fn tree(name: impl Into<String>, hash: ObjectId) -> Self {
        Self {
            name: name.into(),
            kind: EntryKind::Tree,
            hash,
            mode: EntryMode::Directory,
        }
    }
}

impl PartialOrd for TreeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TreeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name.cmp(&other.name)
    }
}

/// Directory listing object.
///
/// Entries are kept sorted by name; the canonical JSON encoding of the
/// sorted list is what gets hashed, so entry order can never perturb the
/// tree's identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    /// Sorted entries in this directory.
    pub entries: Vec<TreeEntry>,
}

impl Tree {
    /// Build a tree from entries, sorting by name and collapsing exact
    /// duplicates. Two entries with the same name but different content are
    /// rejected.
    pub fn new(mut entries: Vec<TreeEntry>) -> StoreResult<Self> {
        entries.sort();
        entries.dedup();
        for pair in entries.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(StoreError::DuplicateEntry {
                    name: pair[0].name.clone(),
                });
            }
        }
        Ok(Self { entries })
    }

    /// An empty tree.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Canonical JSON bytes; hashing these yields the tree's id.
    pub fn canonical_bytes(&self) -> StoreResult<Vec<u8>> {
        to_canonical_json(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// The content address of this tree.
    pub fn id(&self) -> StoreResult<ObjectId> {
        Ok(ObjectId::from_bytes(&self.canonical_bytes()?))
    }

    /// Decode from stored bytes.
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the tree has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// World state: the unit of versioning.
///
/// `id = SHA-256(canonical JSON)`; states form a DAG through `parent_id`.
/// A state with no parent is a genesis state. `created_at` is seconds since
/// the epoch and is never less than the parent's, which keeps the DAG
/// acyclic by construction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldState {
    /// Content address of the root tree.
    pub root_tree: ObjectId,
    /// The state this one descends from, if any.
    pub parent_id: Option<ObjectId>,
    /// Creation time, in whole seconds since the Unix epoch.
    pub created_at: i64,
}

impl WorldState {
    /// Create a state record with an explicit timestamp.
    pub fn new(root_tree: ObjectId, parent_id: Option<ObjectId>, created_at: i64) -> Self {
        Self {
            root_tree,
            parent_id,
            created_at,
        }
    }

    /// Canonical JSON bytes; hashing these yields the state's id.
    pub fn canonical_bytes(&self) -> StoreResult<Vec<u8>> {
        to_canonical_json(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// The content address of this state.
    pub fn id(&self) -> StoreResult<ObjectId> {
        Ok(ObjectId::from_bytes(&self.canonical_bytes()?))
    }

    /// Decode from stored bytes.
    pub fn decode(data: &[u8]) -> StoreResult<Self> {
        serde_json::from_slice(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Returns `true` if this state has no parent.
    pub fn is_genesis(&self) -> bool {
        self.parent_id.is_none()
    }
}
