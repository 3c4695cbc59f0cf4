use uuid::Uuid;

use flanes_types::{ObjectId, TypeError};

use crate::types::TransitionStatus;

/// Errors from ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A lane row was not found.
    #[error("lane not found: {0:?}")]
    LaneNotFound(String),

    /// A lane with that name already exists.
    #[error("lane already exists: {0:?}")]
    LaneExists(String),

    /// A transition row was not found.
    #[error("transition not found: {0}")]
    TransitionNotFound(Uuid),

    /// A workspace row was not found.
    #[error("workspace not found: {0:?}")]
    WorkspaceNotFound(String),

    /// A workspace row with that name already exists.
    #[error("workspace already exists: {0:?}")]
    WorkspaceExists(String),

    /// A transition referenced a state that is not in the store.
    #[error("state not in store: {0}")]
    StateMissing(ObjectId),

    /// The requested status change is not a legal edge.
    #[error("illegal status change: {from} -> {to}")]
    IllegalStatusChange {
        from: TransitionStatus,
        to: TransitionStatus,
    },

    /// Cost accrual was attempted on a settled transition.
    #[error("cost is frozen on transition {id} (status {status})")]
    CostLocked { id: Uuid, status: TransitionStatus },

    /// The lane head moved since the transition was proposed.
    #[error(
        "stale proposal on lane {lane:?}: head is {head:?}, transition expected {expected:?}"
    )]
    StaleProposal {
        lane: String,
        expected: Option<ObjectId>,
        head: Option<ObjectId>,
    },

    /// Name validation failure.
    #[error(transparent)]
    InvalidName(#[from] TypeError),

    /// Stored row contents could not be decoded.
    #[error("corrupted ledger row: {0}")]
    CorruptedRow(String),

    /// Underlying database failure.
    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Database(e.to_string())
    }
}

impl From<flanes_db::DbError> for LedgerError {
    fn from(e: flanes_db::DbError) -> Self {
        Self::Database(e.to_string())
    }
}

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
