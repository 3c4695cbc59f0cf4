use std::collections::HashMap;
use std::sync::RwLock;

use flanes_types::ObjectId;

use crate::error::StoreResult;
use crate::object::ObjectKind;
use crate::traits::ObjectStore;

/// In-memory, HashMap-based object store.
///
/// Intended for tests and embedding. All objects are held in memory behind a
/// `RwLock`; bytes are cloned on read.
pub struct InMemoryObjectStore {
    objects: RwLock<HashMap<(ObjectKind, ObjectId), Vec<u8>>>,
}

impl InMemoryObjectStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Number of objects currently stored, across all kinds.
    pub fn len(&self) -> usize {
        self.objects.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().expect("lock poisoned").is_empty()
    }

    /// Total bytes across all stored objects.
    pub fn total_bytes(&self) -> u64 {
        self.objects
            .read()
            .expect("lock poisoned")
            .values()
            .map(|data| data.len() as u64)
            .sum()
    }
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn read(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<Option<Vec<u8>>> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.get(&(kind, *id)).cloned())
    }

    fn write(&self, kind: ObjectKind, id: &ObjectId, data: &[u8]) -> StoreResult<()> {
        let mut map = self.objects.write().expect("lock poisoned");
        map.entry((kind, *id)).or_insert_with(|| data.to_vec());
        Ok(())
    }

    fn exists(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<bool> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.contains_key(&(kind, *id)))
    }

    fn delete(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<bool> {
        let mut map = self.objects.write().expect("lock poisoned");
        Ok(map.remove(&(kind, *id)).is_some())
    }

    fn list(&self, kind: ObjectKind) -> StoreResult<Vec<ObjectId>> {
        let map = self.objects.read().expect("lock poisoned");
        let mut ids: Vec<ObjectId> = map
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, id)| *id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn size(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<Option<u64>> {
        let map = self.objects.read().expect("lock poisoned");
        Ok(map.get(&(kind, *id)).map(|d| d.len() as u64))
    }
}

impl std::fmt::Debug for InMemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryObjectStore")
            .field("object_count", &self.len())
            .finish()
    }
}
