use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use flanes_types::{epoch_seconds, ObjectId};

use crate::error::{StoreError, StoreResult};
use crate::object::{ObjectKind, Tree, TreeEntry, WorldState};
use crate::traits::ObjectStore;

/// Compile-time default for the maximum blob size (100 MiB).
pub const DEFAULT_MAX_BLOB_SIZE: u64 = 100 * 1024 * 1024;

/// Compile-time default for the maximum tree nesting depth.
pub const DEFAULT_MAX_TREE_DEPTH: u32 = 100;

/// Ingest limits for the content-addressed store.
#[derive(Clone, Copy, Debug)]
pub struct StoreLimits {
    /// Largest blob accepted at ingest, in bytes.
    pub max_blob_size: u64,
    /// Deepest tree nesting accepted on construction.
    pub max_tree_depth: u32,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_blob_size: DEFAULT_MAX_BLOB_SIZE,
            max_tree_depth: DEFAULT_MAX_TREE_DEPTH,
        }
    }
}

/// The content-addressed store.
///
/// Wraps an [`ObjectStore`] backend with the semantic invariants: size and
/// depth limits, duplicate-name rejection, reference validation for states,
/// and integrity verification. Subtree depths are cached so repeated tree
/// ingests do not re-walk shared subtrees.
pub struct Cas {
    backend: Arc<dyn ObjectStore>,
    limits: StoreLimits,
    depth_cache: RwLock<HashMap<ObjectId, u32>>,
}

impl Cas {
    /// Create a store over the given backend.
    pub fn new(backend: Arc<dyn ObjectStore>, limits: StoreLimits) -> Self {
        Self {
            backend,
            limits,
            depth_cache: RwLock::new(HashMap::new()),
        }
    }

    /// The active limits.
    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    // -------------------------------------------------------------------
    // Ingest
    // -------------------------------------------------------------------

    /// Store raw file bytes, returning their content address.
    ///
    /// Presence is checked before the size limit: content already in the
    /// store stays addressable even if it exceeds the current limit, which
    /// lets a repository with legacy oversized blobs keep operating after
    /// the limit is tightened.
    pub fn put_blob(&self, bytes: &[u8]) -> StoreResult<ObjectId> {
        let id = ObjectId::from_bytes(bytes);
        if self.backend.exists(ObjectKind::Blob, &id)? {
            return Ok(id);
        }
        if bytes.len() as u64 > self.limits.max_blob_size {
            return Err(StoreError::BlobTooLarge {
                size: bytes.len() as u64,
                limit: self.limits.max_blob_size,
            });
        }
        self.backend.write(ObjectKind::Blob, &id, bytes)?;
        Ok(id)
    }

    /// Store a directory listing, returning its content address.
    ///
    /// Entries are sorted and exact duplicates collapsed; conflicting
    /// duplicate names fail. The resulting nesting depth (this tree plus
    /// its deepest referenced subtree) must not exceed the depth limit.
    pub fn put_tree(&self, entries: Vec<TreeEntry>) -> StoreResult<ObjectId> {
        let tree = Tree::new(entries)?;
        let depth = self.tree_object_depth(&tree)?;
        if depth > self.limits.max_tree_depth {
            return Err(StoreError::TreeTooDeep {
                depth,
                limit: self.limits.max_tree_depth,
            });
        }

        let bytes = tree.canonical_bytes()?;
        let id = ObjectId::from_bytes(&bytes);
        self.backend.write(ObjectKind::Tree, &id, &bytes)?;
        self.depth_cache
            .write()
            .expect("lock poisoned")
            .insert(id, depth);
        Ok(id)
    }

    /// Store a new world state over `root_tree`, returning its id.
    ///
    /// The root tree must exist; the parent, when given, must already be a
    /// stored state. The timestamp is the current clock, clamped to never
    /// run behind the parent's, which keeps the DAG acyclic by construction.
    pub fn put_state(
        &self,
        root_tree: ObjectId,
        parent_id: Option<ObjectId>,
    ) -> StoreResult<ObjectId> {
        let mut created_at = epoch_seconds();
        if let Some(parent) = parent_id {
            let parent_state = self.get_state(&parent)?;
            created_at = created_at.max(parent_state.created_at);
        }
        let state = WorldState::new(root_tree, parent_id, created_at);
        self.put_state_object(&state)
    }

    /// Store an already-constructed state record, validating its references.
    pub fn put_state_object(&self, state: &WorldState) -> StoreResult<ObjectId> {
        if !self.backend.exists(ObjectKind::Tree, &state.root_tree)? {
            return Err(StoreError::NotFound {
                kind: ObjectKind::Tree,
                id: state.root_tree,
            });
        }
        if let Some(parent) = state.parent_id {
            if !self.backend.exists(ObjectKind::State, &parent)? {
                return Err(StoreError::NotFound {
                    kind: ObjectKind::State,
                    id: parent,
                });
            }
        }
        let bytes = state.canonical_bytes()?;
        let id = ObjectId::from_bytes(&bytes);
        self.backend.write(ObjectKind::State, &id, &bytes)?;
        Ok(id)
    }

    // -------------------------------------------------------------------
    // Lookup
    // -------------------------------------------------------------------

    /// Read blob bytes.
    pub fn get_blob(&self, id: &ObjectId) -> StoreResult<Vec<u8>> {
        self.backend
            .read(ObjectKind::Blob, id)?
            .ok_or(StoreError::NotFound {
                kind: ObjectKind::Blob,
                id: *id,
            })
    }

    /// Read and decode a tree.
    pub fn get_tree(&self, id: &ObjectId) -> StoreResult<Tree> {
        let bytes = self
            .backend
            .read(ObjectKind::Tree, id)?
            .ok_or(StoreError::NotFound {
                kind: ObjectKind::Tree,
                id: *id,
            })?;
        Tree::decode(&bytes)
    }

    /// Read and decode a world state.
    pub fn get_state(&self, id: &ObjectId) -> StoreResult<WorldState> {
        let bytes = self
            .backend
            .read(ObjectKind::State, id)?
            .ok_or(StoreError::NotFound {
                kind: ObjectKind::State,
                id: *id,
            })?;
        WorldState::decode(&bytes)
    }

    /// Check whether a key of the given kind is present.
    pub fn has(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<bool> {
        self.backend.exists(kind, id)
    }

    /// All keys of a kind.
    pub fn iter_keys(&self, kind: ObjectKind) -> StoreResult<Vec<ObjectId>> {
        self.backend.list(kind)
    }

    /// Stored size of an object in bytes.
    pub fn size(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<Option<u64>> {
        self.backend.size(kind, id)
    }

    /// Delete an object. Garbage collection only.
    pub fn delete(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<bool> {
        self.depth_cache.write().expect("lock poisoned").remove(id);
        self.backend.delete(kind, id)
    }

    /// Recompute the SHA-256 of `bytes` and compare against `expected`.
    ///
    /// Used on pulls from external backends before ingesting an object.
    pub fn verify(&self, expected: &ObjectId, bytes: &[u8]) -> StoreResult<()> {
        let computed = ObjectId::from_bytes(bytes);
        if computed != *expected {
            return Err(StoreError::IntegrityMismatch {
                expected: *expected,
                computed,
            });
        }
        Ok(())
    }

    // -------------------------------------------------------------------
    // Depth
    // -------------------------------------------------------------------

    /// Nesting depth of a stored tree (a leaf directory has depth 1).
    pub fn tree_depth(&self, id: &ObjectId) -> StoreResult<u32> {
        if let Some(d) = self.depth_cache.read().expect("lock poisoned").get(id) {
            return Ok(*d);
        }
        let tree = self.get_tree(id)?;
        let depth = self.tree_object_depth(&tree)?;
        self.depth_cache
            .write()
            .expect("lock poisoned")
            .insert(*id, depth);
        Ok(depth)
    }

    fn tree_object_depth(&self, tree: &Tree) -> StoreResult<u32> {
        let mut depth = 1;
        for entry in &tree.entries {
            if entry.kind == crate::object::EntryKind::Tree {
                depth = depth.max(1 + self.tree_depth(&entry.hash)?);
            }
        }
        Ok(depth)
    }
}

impl std::fmt::Debug for Cas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cas").field("limits", &self.limits).finish()
    }
}
