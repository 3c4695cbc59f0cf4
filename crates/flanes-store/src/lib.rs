//! Content-addressed object storage for Flanes.
//!
//! Three object kinds, all keyed by the SHA-256 of their content:
//!
//! - **Blob** — raw file bytes. No name, no mode, no timestamp.
//! - **Tree** — a sorted directory listing encoded as canonical JSON.
//! - **WorldState** — a root tree plus parent pointer and timestamp; the
//!   unit of versioning.
//!
//! The [`ObjectStore`] trait is a pure key-value layer with insert-if-absent
//! semantics. [`Cas`] sits above it and owns the semantic invariants: blob
//! size limits, tree depth limits, duplicate-name rejection, reference
//! validation for states, and integrity verification.
//!
//! Two backends are provided: [`InMemoryObjectStore`] for tests and
//! embedding, and [`SqliteObjectStore`] which inlines small values in the
//! shared database and spills large blobs to hash-addressed files under a
//! two-hex-prefix directory fan-out.

mod cas;
mod error;
mod memory;
mod object;
mod sqlite;
mod traits;

pub use cas::{Cas, StoreLimits, DEFAULT_MAX_BLOB_SIZE, DEFAULT_MAX_TREE_DEPTH};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryObjectStore;
pub use object::{EntryKind, EntryMode, ObjectKind, Tree, TreeEntry, WorldState};
pub use sqlite::{spill_path, SqliteObjectStore, DEFAULT_INLINE_THRESHOLD};
pub use traits::ObjectStore;
