//! Snapshot ignore rules.
//!
//! A compile-time default set (VCS directories, environment and credential
//! patterns, OS noise, editor directories) unioned with user patterns from
//! `.stateignore` at the workspace root. `.stateignore` itself is tracked,
//! so ignore rules version with the project.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

use crate::error::{WorkspaceError, WorkspaceResult};

/// Built-in patterns, gitignore syntax, always active.
pub const DEFAULT_PATTERNS: &[&str] = &[
    // Version control internals.
    ".git/",
    ".hg/",
    ".svn/",
    ".bzr/",
    ".jj/",
    // Flanes' own on-disk state.
    ".state/",
    ".state.dirty",
    // Environment files and credentials.
    ".env",
    ".env.*",
    "*.pem",
    "*.key",
    ".aws/",
    ".ssh/",
    // OS noise.
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    // Editor directories and droppings.
    ".idea/",
    ".vscode/",
    "*.swp",
    "*.swo",
    "*~",
];

/// Name of the user pattern file at the workspace root.
pub const STATEIGNORE_FILE: &str = ".stateignore";

/// Compiled ignore matcher for one workspace.
pub struct IgnoreRules {
    matcher: Gitignore,
}

impl IgnoreRules {
    /// Build the rules for a workspace: defaults plus `.stateignore`.
    pub fn for_workspace(root: &Path) -> WorkspaceResult<Self> {
        let mut builder = GitignoreBuilder::new(root);
        for pattern in DEFAULT_PATTERNS {
            builder
                .add_line(None, pattern)
                .map_err(|e| WorkspaceError::CorruptMetadata {
                    path: root.to_path_buf(),
                    reason: format!("bad built-in ignore pattern {pattern:?}: {e}"),
                })?;
        }

        let user_file = root.join(STATEIGNORE_FILE);
        if user_file.is_file() {
            if let Some(e) = builder.add(&user_file) {
                return Err(WorkspaceError::CorruptMetadata {
                    path: user_file,
                    reason: e.to_string(),
                });
            }
        }

        let matcher = builder
            .build()
            .map_err(|e| WorkspaceError::CorruptMetadata {
                path: root.to_path_buf(),
                reason: e.to_string(),
            })?;
        Ok(Self { matcher })
    }

    /// Whether `rel_path` (relative to the workspace root) is ignored.
    pub fn is_ignored(&self, rel_path: &Path, is_dir: bool) -> bool {
        self.matcher.matched(rel_path, is_dir).is_ignore()
    }
}

impl std::fmt::Debug for IgnoreRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IgnoreRules")
            .field("num_patterns", &self.matcher.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules_in(dir: &Path) -> IgnoreRules {
        IgnoreRules::for_workspace(dir).unwrap()
    }

    #[test]
    fn default_patterns_cover_vcs_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let rules = rules_in(dir.path());
        assert!(rules.is_ignored(Path::new(".git"), true));
        assert!(rules.is_ignored(Path::new(".state"), true));
        assert!(rules.is_ignored(Path::new(".state.dirty"), false));
        assert!(rules.is_ignored(Path::new(".env"), false));
        assert!(rules.is_ignored(Path::new("secrets/prod.pem"), false));
        assert!(rules.is_ignored(Path::new(".DS_Store"), false));
        assert!(rules.is_ignored(Path::new(".idea"), true));
    }

    #[test]
    fn regular_files_are_not_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let rules = rules_in(dir.path());
        assert!(!rules.is_ignored(Path::new("src/main.rs"), false));
        assert!(!rules.is_ignored(Path::new("README.md"), false));
        // The user pattern file itself is tracked.
        assert!(!rules.is_ignored(Path::new(".stateignore"), false));
    }

    #[test]
    fn stateignore_patterns_are_unioned() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".stateignore"), "target/\n*.log\n").unwrap();
        let rules = rules_in(dir.path());
        assert!(rules.is_ignored(Path::new("target"), true));
        assert!(rules.is_ignored(Path::new("build/output.log"), false));
        // Defaults still apply.
        assert!(rules.is_ignored(Path::new(".git"), true));
    }

    #[test]
    fn missing_stateignore_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        let rules = rules_in(dir.path());
        assert!(!rules.is_ignored(Path::new("anything.txt"), false));
    }
}
