//! Foundation types for Flanes.
//!
//! This crate provides the core identity and value types used throughout the
//! Flanes system. Every other Flanes crate depends on `flanes-types`.
//!
//! # Key Types
//!
//! - [`ObjectId`] — Content-addressed identifier (SHA-256 hash)
//! - [`Intent`] — Structured "why" attached to a transition
//! - [`CostRecord`] — Token/call/time accounting for a transition
//! - [`CancelToken`] — Cooperative cancellation for long-running operations
//!
//! # Key Functions
//!
//! - [`canonical::to_canonical_json`] — Deterministic JSON encoding for hashing
//! - [`names::validate_lane_name`] / [`names::validate_workspace_name`]

pub mod cancel;
pub mod canonical;
pub mod error;
pub mod intent;
pub mod names;
pub mod object;

pub use cancel::{CancelToken, Canceled};
pub use error::TypeError;
pub use intent::{CostRecord, Intent};
pub use object::ObjectId;

/// Current wall-clock time as whole seconds since the Unix epoch.
pub fn epoch_seconds() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
