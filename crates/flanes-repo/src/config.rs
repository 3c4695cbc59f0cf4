//! The canonical configuration document, `.state/config.json`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};

use flanes_gate::EvaluatorSpec;
use flanes_store::{StoreLimits, DEFAULT_MAX_BLOB_SIZE, DEFAULT_MAX_TREE_DEPTH};

use crate::error::{RepoError, RepoResult};

/// Configuration schema version written by this build.
pub const CONFIG_VERSION: &str = "1";

/// The repository configuration document.
///
/// Unknown fields (`embedding_*` collaborator settings and anything newer
/// builds may add) are preserved verbatim across load/save via the `extra`
/// map, so editing the file with a newer tool never loses them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Schema/version string.
    pub version: String,
    /// Lane used when none is named.
    pub default_lane: String,
    /// Maximum blob size in bytes; 0 means the compile-time default.
    #[serde(default)]
    pub max_blob_size: u64,
    /// Maximum tree depth; 0 means the compile-time default.
    #[serde(default)]
    pub max_tree_depth: u32,
    /// External evaluators run on every proposal.
    #[serde(default)]
    pub evaluators: Vec<EvaluatorSpec>,
    /// Opaque settings handed to the configured remote-storage adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_storage: Option<serde_json::Value>,
    /// Everything else, preserved round-trip (notably `embedding_*`).
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            default_lane: "main".to_string(),
            max_blob_size: 0,
            max_tree_depth: 0,
            evaluators: Vec::new(),
            remote_storage: None,
            extra: BTreeMap::new(),
        }
    }
}

impl RepoConfig {
    /// Store limits with zeros resolved to the compile-time defaults.
    pub fn store_limits(&self) -> StoreLimits {
        StoreLimits {
            max_blob_size: if self.max_blob_size == 0 {
                DEFAULT_MAX_BLOB_SIZE
            } else {
                self.max_blob_size
            },
            max_tree_depth: if self.max_tree_depth == 0 {
                DEFAULT_MAX_TREE_DEPTH
            } else {
                self.max_tree_depth
            },
        }
    }

    /// Load from `config.json`.
    pub fn load(path: &Path) -> RepoResult<Self> {
        let data = fs::read(path).map_err(|e| RepoError::io(path, e))?;
        serde_json::from_slice(&data).map_err(|e| RepoError::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save atomically (temp file + fsync + rename).
    pub fn save(&self, path: &Path) -> RepoResult<()> {
        let parent = path.parent().ok_or_else(|| RepoError::Config {
            path: path.to_path_buf(),
            reason: "config path has no parent".into(),
        })?;
        fs::create_dir_all(parent).map_err(|e| RepoError::io(parent, e))?;

        let json = serde_json::to_vec_pretty(self).expect("config serializes");
        let mut tmp =
            tempfile::NamedTempFile::new_in(parent).map_err(|e| RepoError::io(parent, e))?;
        tmp.write_all(&json).map_err(|e| RepoError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| RepoError::io(tmp.path(), e))?;
        tmp.persist(path).map_err(|e| RepoError::io(path, e.error))?;
        Ok(())
    }
}
