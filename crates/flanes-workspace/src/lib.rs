//! Workspace manager: the bridge between the content-addressed store and
//! real directories on disk.
//!
//! A workspace is disposable; the CAS is the source of truth. The manager
//! provides:
//!
//! - **Snapshot** — hash a directory bottom-up into CAS trees and a new
//!   world state, with ignore rules, a stat cache, and symlink skipping.
//! - **Materialize / update** — write a state's full tree into a directory,
//!   or apply the minimal diff between two states.
//! - **Locks** — an atomically-created lock directory with an owner record
//!   and stale-lock reclamation.
//! - **Dirty markers** — a sentinel bracketing every mutation so an
//!   interrupted write is detected on restart instead of silently trusted.
//!
//! The filesystem is a collaborator with weak guarantees; the dirty marker
//! plus temp-file-and-rename writes plus the advisory lock are what make a
//! crash at any point recoverable.

mod descriptor;
mod dirty;
mod error;
mod lock;
mod manager;
mod rules;
mod stat_cache;

pub use descriptor::{read_descriptor, write_descriptor};
pub use dirty::{clear_dirty, read_dirty, write_dirty, DirtyMarker, DIRTY_MARKER_FILE};
pub use error::{WorkspaceError, WorkspaceResult};
pub use lock::{LockGuard, LockOwner, DEFAULT_LOCK_TIMEOUT, STALE_LOCK_AGE_SECS};
pub use manager::{ApplyStats, WorkspaceManager, MAIN_WORKSPACE};
pub use rules::IgnoreRules;
pub use stat_cache::StatCache;
