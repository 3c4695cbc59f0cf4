//! Atomic workspace descriptor files.
//!
//! Each workspace's JSON descriptor (`<name>.json` under `.state/`) mirrors
//! its ledger row so a repository can be inspected and recovered with
//! nothing but the filesystem. Writes are temp file + fsync + rename; on
//! platforms where a rename can transiently fail under file-locking
//! programs, the rename is retried with bounded backoff.

use std::fs;
use std::io::Write as _;
use std::path::Path;
use std::time::Duration;

use tracing::warn;

use flanes_ledger::WorkspaceRecord;

use crate::error::{WorkspaceError, WorkspaceResult};

const RENAME_RETRIES: u32 = 5;
const RENAME_BACKOFF: Duration = Duration::from_millis(20);

/// Write a descriptor atomically.
pub fn write_descriptor(path: &Path, record: &WorkspaceRecord) -> WorkspaceResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| WorkspaceError::CorruptMetadata {
            path: path.to_path_buf(),
            reason: "descriptor path has no parent".into(),
        })?;
    fs::create_dir_all(parent).map_err(|e| WorkspaceError::io(parent, e))?;

    let json = serde_json::to_vec_pretty(record).expect("descriptor serializes");
    let mut tmp =
        tempfile::NamedTempFile::new_in(parent).map_err(|e| WorkspaceError::io(parent, e))?;
    tmp.write_all(&json)
        .map_err(|e| WorkspaceError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| WorkspaceError::io(tmp.path(), e))?;

    let (_file, tmp_path) = tmp.keep().map_err(|e| WorkspaceError::io(path, e.error))?;
    let mut attempt = 0;
    loop {
        match fs::rename(&tmp_path, path) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < RENAME_RETRIES => {
                attempt += 1;
                warn!(
                    target_path = %path.display(),
                    attempt,
                    error = %e,
                    "descriptor rename failed, retrying"
                );
                std::thread::sleep(RENAME_BACKOFF * attempt);
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(WorkspaceError::io(path, e));
            }
        }
    }
}

/// Read a descriptor, or `None` if the file does not exist.
pub fn read_descriptor(path: &Path) -> WorkspaceResult<Option<WorkspaceRecord>> {
    match fs::read(path) {
        Ok(data) => {
            let record =
                serde_json::from_slice(&data).map_err(|e| WorkspaceError::CorruptMetadata {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            Ok(Some(record))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WorkspaceError::io(path, e)),
    }
}
