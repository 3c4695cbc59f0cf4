//! Advisory workspace locks built on atomically-created lock directories.
//!
//! A lock is an empty directory created with `mkdir` (atomic on every
//! filesystem that matters) containing an `owner.json` record. Reclamation
//! of a stale lock re-races the `mkdir`, so exactly one claimant wins.
//!
//! Staleness rules:
//! - the owner record is older than [`STALE_LOCK_AGE_SECS`], or
//! - the record names this host and its pid is not alive.
//!
//! On cross-host shared filesystems pid liveness means nothing, so only the
//! age check applies there.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use flanes_types::epoch_seconds;

use crate::error::{WorkspaceError, WorkspaceResult};

/// Locks older than this are reclaimable regardless of owner (4 hours).
pub const STALE_LOCK_AGE_SECS: i64 = 4 * 60 * 60;

/// Default wait for lock acquisition.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay between acquisition retries.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// The record written inside a lock directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockOwner {
    /// Owning process id.
    pub pid: u32,
    /// Host the owner runs on.
    pub hostname: String,
    /// When the lock was taken, seconds since the epoch.
    pub started_at: i64,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: local_hostname(),
            started_at: epoch_seconds(),
        }
    }

    /// Whether this record may be reclaimed by another process.
    pub fn is_stale(&self) -> bool {
        if epoch_seconds() - self.started_at > STALE_LOCK_AGE_SECS {
            return true;
        }
        self.hostname == local_hostname() && !pid_alive(self.pid)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes existence without delivering anything. EPERM means
    // the process exists but belongs to someone else.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // No portable liveness probe; fall back to the age rule alone.
    true
}

/// A held workspace lock. Dropping the guard releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    lock_dir: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Try to take the lock exactly once.
    pub fn try_acquire(workspace: &str, lock_dir: &Path) -> WorkspaceResult<Self> {
        match fs::create_dir(lock_dir) {
            Ok(()) => {
                let owner = LockOwner::current();
                let owner_path = lock_dir.join("owner.json");
                let json = serde_json::to_vec_pretty(&owner)
                    .expect("lock owner serializes");
                fs::write(&owner_path, json)
                    .map_err(|e| WorkspaceError::io(&owner_path, e))?;
                debug!(workspace, lock = %lock_dir.display(), "lock acquired");
                Ok(Self {
                    lock_dir: lock_dir.to_path_buf(),
                    released: false,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = read_owner(lock_dir);
                match holder {
                    Some(holder) if holder.is_stale() => {
                        warn!(
                            workspace,
                            pid = holder.pid,
                            host = %holder.hostname,
                            "reclaiming stale lock"
                        );
                        // Remove and re-race the mkdir; exactly one
                        // claimant creates the directory.
                        let _ = fs::remove_dir_all(lock_dir);
                        match fs::create_dir(lock_dir) {
                            Ok(()) => {
                                let owner = LockOwner::current();
                                let owner_path = lock_dir.join("owner.json");
                                let json = serde_json::to_vec_pretty(&owner)
                                    .expect("lock owner serializes");
                                fs::write(&owner_path, json)
                                    .map_err(|e| WorkspaceError::io(&owner_path, e))?;
                                Ok(Self {
                                    lock_dir: lock_dir.to_path_buf(),
                                    released: false,
                                })
                            }
                            Err(_) => Err(WorkspaceError::LockBusy {
                                workspace: workspace.to_string(),
                                holder,
                            }),
                        }
                    }
                    Some(holder) => Err(WorkspaceError::LockBusy {
                        workspace: workspace.to_string(),
                        holder,
                    }),
                    // Lock directory exists but the owner record is not
                    // readable yet; treat as busy and let the caller retry.
                    None => Err(WorkspaceError::LockBusy {
                        workspace: workspace.to_string(),
                        holder: LockOwner {
                            pid: 0,
                            hostname: "unknown".to_string(),
                            started_at: epoch_seconds(),
                        },
                    }),
                }
            }
            Err(e) => Err(WorkspaceError::io(lock_dir, e)),
        }
    }

    /// Acquire the lock, retrying with a bounded busy-wait up to `timeout`.
    pub fn acquire(
        workspace: &str,
        lock_dir: &Path,
        timeout: Duration,
    ) -> WorkspaceResult<Self> {
        let start = Instant::now();
        loop {
            match Self::try_acquire(workspace, lock_dir) {
                Ok(guard) => return Ok(guard),
                Err(WorkspaceError::LockBusy { .. }) if start.elapsed() < timeout => {
                    std::thread::sleep(RETRY_DELAY);
                }
                Err(WorkspaceError::LockBusy { .. }) => {
                    return Err(WorkspaceError::LockTimeout {
                        workspace: workspace.to_string(),
                        waited_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release explicitly. Dropping has the same effect.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = fs::remove_dir_all(&self.lock_dir) {
                warn!(lock = %self.lock_dir.display(), error = %e, "failed to release lock");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn read_owner(lock_dir: &Path) -> Option<LockOwner> {
    let data = fs::read(lock_dir.join("owner.json")).ok()?;
    serde_json::from_slice(&data).ok()
}
