use std::path::PathBuf;

use flanes_store::StoreError;
use flanes_types::{Canceled, ObjectId, TypeError};

use crate::lock::LockOwner;

/// Errors from workspace operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// Name validation failure.
    #[error(transparent)]
    InvalidName(#[from] TypeError),

    /// The workspace lock is held by a live owner.
    #[error("workspace {workspace:?} is locked by pid {pid} on {host}", pid = .holder.pid, host = .holder.hostname)]
    LockBusy {
        workspace: String,
        holder: LockOwner,
    },

    /// Lock acquisition did not succeed within the timeout.
    #[error("timed out acquiring lock on workspace {workspace:?} after {waited_ms} ms")]
    LockTimeout { workspace: String, waited_ms: u64 },

    /// The workspace has an interrupted operation pending recovery.
    #[error("workspace {workspace:?} is dirty (interrupted write targeting {target})")]
    Dirty {
        workspace: String,
        target: ObjectId,
    },

    /// `update` would overwrite files it does not track.
    #[error("untracked files collide with incoming paths: {paths:?}")]
    UntrackedCollision { paths: Vec<String> },

    /// The operation's cancellation token fired.
    #[error(transparent)]
    Canceled(#[from] Canceled),

    /// Failure in the content-addressed store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Diff computation failed.
    #[error(transparent)]
    Diff(#[from] flanes_diff::DiffError),

    /// A descriptor or marker file could not be decoded.
    #[error("corrupt metadata file {path}: {reason}")]
    CorruptMetadata { path: PathBuf, reason: String },

    /// Stat cache database failure.
    #[error("database error: {0}")]
    Database(String),

    /// Filesystem failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl WorkspaceError {
    /// Attach a path to a raw I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<rusqlite::Error> for WorkspaceError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

/// Result alias for workspace operations.
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;
