//! Input validation for sandbox requests.
//!
//! Validates caller input before any host state is touched:
//!
//! - **Empty commands** - Would cause exec to fail
//! - **Null bytes** - Could cause string truncation attacks
//! - **Guest paths** - Must be absolute and must not climb above `/`
//! - **Hostnames** - Must fit the UTS field
//!
//! Guest paths are normalized lexically here. Symlink escapes are caught later,
//! against the real mount root, in [`crate::mounts`].
//!
//! ## Example
//!
//! ```ignore
//! use jailrun::validate::{normalize_guest, validate_cmd};
//!
//! assert!(validate_cmd(&["/bin/pwd"]).is_ok());
//! assert_eq!(normalize_guest("/tmp/./lim/")?, PathBuf::from("tmp/lim"));
//! assert!(normalize_guest("/tmp/../../etc").is_err()); // escapes root
//! ```

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Validation error for sandbox inputs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("command cannot be empty")]
    EmptyCommand,

    #[error("argument {0} is empty")]
    EmptyArgument(usize),

    #[error("null byte in input")]
    NullByte,

    #[error("path traversal not allowed: {0}")]
    PathTraversal(String),

    #[error("path must be absolute: {0}")]
    RelativePath(String),

    #[error("path cannot be empty")]
    EmptyPath,

    #[error("guest path must not be the sandbox root")]
    GuestIsRoot,

    #[error("malformed mount entry {0:?}, expected host:guest[:ro|:rw]")]
    MalformedEntry(String),

    #[error("invalid hostname {0:?}")]
    Hostname(String),

    #[error("invalid environment entry {0:?}")]
    Environment(String),

    #[error("{0} out of range")]
    Limit(&'static str),
}

/// Validate command and arguments.
pub fn validate_cmd(cmd: &[&str]) -> Result<(), ValidationError> {
    if cmd.is_empty() {
        return Err(ValidationError::EmptyCommand);
    }
    for (i, arg) in cmd.iter().enumerate() {
        if arg.is_empty() {
            return Err(ValidationError::EmptyArgument(i));
        }
        if arg.contains('\0') {
            return Err(ValidationError::NullByte);
        }
    }
    Ok(())
}

/// Lexically normalize an absolute guest path.
///
/// Returns the path relative to the sandbox root (`/tmp/lim` → `tmp/lim`).
/// `.` segments are dropped, `..` pops the previous segment, and popping past
/// the root is rejected.
pub fn normalize_guest(guest: impl AsRef<Path>) -> Result<PathBuf, ValidationError> {
    let guest = guest.as_ref();
    let display = guest.to_string_lossy().into_owned();
    if guest.as_os_str().is_empty() {
        return Err(ValidationError::EmptyPath);
    }
    if display.contains('\0') {
        return Err(ValidationError::NullByte);
    }
    if !guest.is_absolute() {
        return Err(ValidationError::RelativePath(display));
    }

    let mut normalized = PathBuf::new();
    for component in guest.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(ValidationError::PathTraversal(display));
                }
            }
            Component::Prefix(_) => return Err(ValidationError::RelativePath(display)),
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(ValidationError::GuestIsRoot);
    }
    Ok(normalized)
}

/// Validate a UTS hostname (1..=64 bytes, no NUL, no `/`).
pub fn validate_hostname(name: &str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > 64 || name.contains(['\0', '/']) {
        return Err(ValidationError::Hostname(name.into()));
    }
    Ok(())
}
