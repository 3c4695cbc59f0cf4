//! Durable metadata ledger for Flanes.
//!
//! The ledger is the only mutable structure in the system. Every edit is an
//! append except three pointer mutations: a lane's head, a transition's
//! status, and cost accrual on a still-open transition. Multi-row updates
//! (accepting a transition advances the lane head in the same breath) run
//! inside one SQLite transaction on the shared [`flanes_db::Database`].
//!
//! Rows live in `store.db` alongside the CAS tables, so integrity
//! constraints (`transition.to_state` must be a stored state) are checked
//! against the same database the objects live in.

mod error;
mod ledger;
mod types;

pub use error::{LedgerError, LedgerResult};
pub use ledger::{Ledger, NewTransition};
pub use types::{
    BudgetLimits, BudgetStanding, Lane, Transition, TransitionStatus, WorkspaceRecord,
    WorkspaceStatus, BUDGET_METADATA_KEY,
};
