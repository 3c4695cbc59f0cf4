//! Lane and workspace name validation.
//!
//! Both lanes and workspaces accept names matching
//! `^[A-Za-z0-9][A-Za-z0-9._-]*$`: a leading alphanumeric character followed
//! by alphanumerics, dots, underscores, or dashes. Path separators, `..`,
//! and NUL bytes are rejected so a name can never escape its directory.

use crate::error::TypeError;

/// The pattern every lane and workspace name must match.
pub const NAME_PATTERN: &str = "^[A-Za-z0-9][A-Za-z0-9._-]*$";

fn validate_name(kind: &str, name: &str) -> Result<(), TypeError> {
    let reject = |reason: String| {
        Err(TypeError::InvalidName {
            kind: kind.to_string(),
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return reject(format!("must not be empty (allowed: {NAME_PATTERN})"));
    }

    if name.contains('\0') {
        return reject(format!("must not contain NUL (allowed: {NAME_PATTERN})"));
    }

    if name.contains('/') || name.contains('\\') {
        return reject(format!(
            "must not contain path separators (allowed: {NAME_PATTERN})"
        ));
    }

    if name.contains("..") {
        return reject(format!("must not contain '..' (allowed: {NAME_PATTERN})"));
    }

    let mut chars = name.chars();
    let first = chars.next().expect("non-empty checked above");
    if !first.is_ascii_alphanumeric() {
        return reject(format!(
            "must start with an ASCII alphanumeric character (allowed: {NAME_PATTERN})"
        ));
    }

    for ch in chars {
        if !(ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-') {
            return reject(format!(
                "contains forbidden character {ch:?} (allowed: {NAME_PATTERN})"
            ));
        }
    }

    Ok(())
}

/// Validate a lane name, returning `Ok(())` if valid.
///
/// # Examples
///
/// ```
/// use flanes_types::names::validate_lane_name;
///
/// assert!(validate_lane_name("main").is_ok());
/// assert!(validate_lane_name("agent-7.fix_auth").is_ok());
/// assert!(validate_lane_name("feature/auth").is_err());
/// assert!(validate_lane_name(".hidden").is_err());
/// ```
pub fn validate_lane_name(name: &str) -> Result<(), TypeError> {
    validate_name("lane", name)
}

/// Validate a workspace name. Same character rules as lane names; the name
/// is additionally guaranteed to resolve inside the workspaces directory
/// because separators and `..` are rejected.
pub fn validate_workspace_name(name: &str) -> Result<(), TypeError> {
    validate_name("workspace", name)
}
