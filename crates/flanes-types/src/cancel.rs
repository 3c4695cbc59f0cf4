//! Cooperative cancellation for long-running operations.
//!
//! Snapshot and materialize walk arbitrarily large directory trees; callers
//! hand them a [`CancelToken`] and the operation checks it between files.
//! A canceled operation raises [`Canceled`] and leaves its workspace dirty,
//! which the recovery path handles like any interrupted write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Raised when an operation observes its token canceled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("operation canceled")]
pub struct Canceled;

/// Shared cancellation flag. Cloning yields a handle to the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A token that is never canceled unless [`CancelToken::cancel`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. All clones observe the flag.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Returns `true` if cancellation was requested.
    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Error if cancellation was requested.
    pub fn check(&self) -> Result<(), Canceled> {
        if self.is_canceled() {
            Err(Canceled)
        } else {
            Ok(())
        }
    }
}
