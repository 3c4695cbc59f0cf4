use flanes_types::ObjectId;

use crate::error::StoreResult;
use crate::object::ObjectKind;

/// Key-value boundary beneath the content-addressed store.
///
/// All implementations must satisfy these invariants:
/// - Objects are immutable once written; a key never maps to new bytes.
/// - Writes are idempotent: writing an existing key is a no-op.
/// - Each [`ObjectKind`] is its own keyspace.
/// - Concurrent reads are always safe; concurrent writes of identical
///   content are safe because both sides write the same bytes.
/// - The backend never interprets object contents.
pub trait ObjectStore: Send + Sync {
    /// Read an object's bytes. `Ok(None)` if the key is absent.
    fn read(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<Option<Vec<u8>>>;

    /// Insert-if-absent. The caller has already computed `id` from `data`.
    fn write(&self, kind: ObjectKind, id: &ObjectId, data: &[u8]) -> StoreResult<()>;

    /// Check whether a key is present.
    fn exists(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<bool>;

    /// Delete an object. Returns `true` if it existed.
    ///
    /// Intended for garbage collection only; deleting a referenced object
    /// corrupts the store.
    fn delete(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<bool>;

    /// All keys of a kind, in unspecified order.
    fn list(&self, kind: ObjectKind) -> StoreResult<Vec<ObjectId>>;

    /// Stored size in bytes, without reading the content. `Ok(None)` if absent.
    fn size(&self, kind: ObjectKind, id: &ObjectId) -> StoreResult<Option<u64>>;
}
