use flanes_types::ObjectId;

use crate::object::ObjectKind;

/// Errors from object store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The requested object was not found.
    #[error("{kind} not found: {id}")]
    NotFound { kind: ObjectKind, id: ObjectId },

    /// A blob exceeded the configured size limit at ingest.
    #[error("blob too large: {size} bytes exceeds limit of {limit}")]
    BlobTooLarge { size: u64, limit: u64 },

    /// A tree would exceed the configured nesting depth.
    #[error("tree too deep: depth {depth} exceeds limit of {limit}")]
    TreeTooDeep { depth: u32, limit: u32 },

    /// Two tree entries shared a name but not content.
    #[error("duplicate tree entry name: {name:?}")]
    DuplicateEntry { name: String },

    /// Stored or received bytes do not hash to their key.
    #[error("integrity mismatch: expected {expected}, computed {computed}")]
    IntegrityMismatch {
        expected: ObjectId,
        computed: ObjectId,
    },

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the spill directory.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure in the backing database.
    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<flanes_db::DbError> for StoreError {
    fn from(e: flanes_db::DbError) -> Self {
        Self::Database(e.to_string())
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
