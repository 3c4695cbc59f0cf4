//! Dirty markers: sentinels bracketing every workspace mutation.
//!
//! Before a materialize or update touches the directory, a marker naming
//! the target state is written; it is removed only after the operation
//! completes. A marker found on restart means the directory contents are
//! not trustworthy and must be re-materialized.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use flanes_types::{epoch_seconds, ObjectId};

use crate::error::{WorkspaceError, WorkspaceResult};

/// Marker file name, relative to the workspace root. Always ignored by
/// snapshots.
pub const DIRTY_MARKER_FILE: &str = ".state.dirty";

/// Contents of a dirty marker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyMarker {
    /// The state the interrupted operation was writing toward.
    pub target_state: ObjectId,
    /// When the operation started, seconds since the epoch.
    pub marked_at: i64,
}

fn marker_path(workspace_dir: &Path) -> PathBuf {
    workspace_dir.join(DIRTY_MARKER_FILE)
}

/// Write the marker. Called before the first destructive step.
pub fn write_dirty(workspace_dir: &Path, target_state: ObjectId) -> WorkspaceResult<()> {
    let marker = DirtyMarker {
        target_state,
        marked_at: epoch_seconds(),
    };
    let path = marker_path(workspace_dir);
    let json = serde_json::to_vec_pretty(&marker).expect("marker serializes");
    fs::write(&path, json).map_err(|e| WorkspaceError::io(&path, e))
}

/// Read the marker if one is present.
pub fn read_dirty(workspace_dir: &Path) -> WorkspaceResult<Option<DirtyMarker>> {
    let path = marker_path(workspace_dir);
    match fs::read(&path) {
        Ok(data) => {
            let marker =
                serde_json::from_slice(&data).map_err(|e| WorkspaceError::CorruptMetadata {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
            Ok(Some(marker))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WorkspaceError::io(&path, e)),
    }
}

/// Remove the marker. Called after the operation completes, or by explicit
/// recovery.
pub fn clear_dirty(workspace_dir: &Path) -> WorkspaceResult<()> {
    let path = marker_path(workspace_dir);
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WorkspaceError::io(&path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let target = ObjectId::from_bytes(b"target state");

        assert!(read_dirty(dir.path()).unwrap().is_none());

        write_dirty(dir.path(), target).unwrap();
        let marker = read_dirty(dir.path()).unwrap().unwrap();
        assert_eq!(marker.target_state, target);
        assert!(marker.marked_at > 0);

        clear_dirty(dir.path()).unwrap();
        assert!(read_dirty(dir.path()).unwrap().is_none());
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        clear_dirty(dir.path()).unwrap();
        clear_dirty(dir.path()).unwrap();
    }

    #[test]
    fn corrupt_marker_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(DIRTY_MARKER_FILE), b"not json").unwrap();
        let err = read_dirty(dir.path()).unwrap_err();
        assert!(matches!(err, WorkspaceError::CorruptMetadata { .. }));
    }
}
