use std::path::PathBuf;

use flanes_merge::ConflictPath;

/// Errors from repository operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Content-addressed store failure.
    #[error(transparent)]
    Store(#[from] flanes_store::StoreError),

    /// Ledger failure (including `StaleProposal`).
    #[error(transparent)]
    Ledger(#[from] flanes_ledger::LedgerError),

    /// Workspace failure (locks, dirty markers, I/O).
    #[error(transparent)]
    Workspace(#[from] flanes_workspace::WorkspaceError),

    /// Promotion planning failure (including `NoCommonAncestor`).
    #[error(transparent)]
    Merge(#[from] flanes_merge::MergeError),

    /// Diff computation failure.
    #[error(transparent)]
    Diff(#[from] flanes_diff::DiffError),

    /// Garbage collection failure.
    #[error(transparent)]
    Gc(#[from] flanes_gc::GcError),

    /// Database open or migration failure.
    #[error(transparent)]
    Db(#[from] flanes_db::DbError),

    /// Promotion found incompatible changes and was not forced.
    #[error("promotion conflicts on {} path(s)", paths.len())]
    PromoteConflict { paths: Vec<ConflictPath> },

    /// A lane's aggregated cost is at or over its budget.
    #[error("budget exceeded on lane {lane:?}: {dimensions:?}")]
    BudgetExceeded {
        lane: String,
        dimensions: Vec<&'static str>,
    },

    /// Promotion from a lane with no head.
    #[error("lane {0:?} has no head state")]
    EmptyLane(String),

    /// The repository is already open from another host.
    #[error("repository is open on host {host:?} (pid {pid})")]
    InstanceLocked { host: String, pid: u32 },

    /// The directory is not a Flanes repository.
    #[error("not a Flanes repository: {0}")]
    NotARepository(PathBuf),

    /// The directory already holds a Flanes repository.
    #[error("repository already initialized at {0}")]
    AlreadyInitialized(PathBuf),

    /// Configuration document problems.
    #[error("bad configuration at {path}: {reason}")]
    Config { path: PathBuf, reason: String },

    /// Filesystem failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RepoError {
    /// Attach a path to a raw I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;
