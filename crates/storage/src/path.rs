//! Name and handle validation.
//!
//! Folder and object names are single path components. Handles issued by
//! path-based services are relative paths that must never escape the
//! service root (no `..` traversal).

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a single folder or object name.
///
/// # Examples
///
/// ```
/// use cumulus_storage::validate_name;
/// assert!(validate_name("10_0.dat").is_ok());
/// assert!(validate_name("TEMP").is_ok());
/// assert!(validate_name("a/b").is_err());
/// assert!(validate_name("..").is_err());
/// assert!(validate_name("").is_err());
/// ```
pub fn validate_name(name: &str) -> Result<&str> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        exn::bail!(ErrorKind::InvalidName(name.to_string()));
    }
    Ok(name)
}

/// Validates a relative handle path, returning the normalized path.
///
/// An empty path (or one that normalizes to empty) refers to the root.
pub(crate) fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidName(path.display().to_string()));
                }
                components.push(s)
            },
            Component::CurDir => {},
            Component::RootDir | Component::Prefix(_) => {
                exn::bail!(ErrorKind::InvalidName(path.display().to_string()))
            },
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidName(path.display().to_string()));
                }
            },
        }
    }
    Ok(components.into_iter().collect())
}
