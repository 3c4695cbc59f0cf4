//! Host fencing: one repository, one host at a time.
//!
//! Opening a repository writes `.state/instance.lock` naming the opener.
//! A second open from a different host fails while the marker is fresh;
//! multiple handles on the same host are allowed (the database serializes
//! them). Reuses the workspace lock's owner record and staleness rules, so
//! a crashed host stops fencing after the stale age passes and a dead pid
//! on this host never fences at all.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use flanes_workspace::LockOwner;
use flanes_types::epoch_seconds;

use crate::error::{RepoError, RepoResult};

/// Marker file name under `.state/`.
pub const INSTANCE_LOCK_FILE: &str = "instance.lock";

/// A held instance fence. Dropping removes the marker if this process
/// still owns it.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    owner: LockOwner,
}

impl InstanceLock {
    /// Take (or join) the fence for the repository whose state directory
    /// is `state_dir`.
    pub fn acquire(state_dir: &Path) -> RepoResult<Self> {
        let path = state_dir.join(INSTANCE_LOCK_FILE);
        let ours = LockOwner {
            pid: std::process::id(),
            hostname: local_hostname(),
            started_at: epoch_seconds(),
        };

        if let Some(existing) = read_marker(&path) {
            let same_host = existing.hostname == ours.hostname;
            if !same_host && !existing.is_stale() {
                return Err(RepoError::InstanceLocked {
                    host: existing.hostname,
                    pid: existing.pid,
                });
            }
            if !same_host {
                warn!(
                    host = %existing.hostname,
                    "replacing stale instance marker from another host"
                );
            }
            // Same host: concurrent handles are fine, the database
            // serializes them. Refresh the marker to this process.
        }

        let json = serde_json::to_vec_pretty(&ours).expect("owner serializes");
        fs::write(&path, json).map_err(|e| RepoError::io(&path, e))?;
        debug!(path = %path.display(), "instance fence taken");
        Ok(Self { path, owner: ours })
    }

    /// The marker path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Only remove the marker if it still names us; a same-host handle
        // opened later owns it now.
        if let Some(current) = read_marker(&self.path) {
            if current.pid == self.owner.pid && current.hostname == self.owner.hostname {
                let _ = fs::remove_file(&self.path);
            }
        }
    }
}

fn read_marker(path: &Path) -> Option<LockOwner> {
    let data = fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}
