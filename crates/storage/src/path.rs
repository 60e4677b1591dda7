//! Path validation and prefix handling.
//!
//! Every path handed to a backend is relative to that backend's root. These
//! helpers make sure it stays that way (no `..` escaping the root) and
//! convert between backend-relative and prefix-relative paths.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a storage path for security and correctness.
/// Ensures that paths don't escape the storage root (no `..` traversal).
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// # Returns
/// Returns the normalized path if valid, or [`InvalidPath`](crate::error::ErrorKind::InvalidPath)
/// if invalid.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use ferry_storage::validate_path;
/// // Valid paths
/// assert!(validate_path("runs/2024/scan-001.h5").is_ok());
/// assert!(validate_path("a/../file.dat").is_ok()); // (never leaves the root)
/// // Invalid paths
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a/../../b").is_err()); // (leaves the root)
/// assert!(validate_path("a\0b").is_err());
/// // Paths get resolved
/// assert_eq!(
///     validate_path("wrong/../still-wrong/.././runs//./scan.h5/").unwrap(),
///     Path::new("runs/scan.h5")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    // Rust's own component parser deals with non-UTF8 and repeated separators.
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls, reject them explicitly.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

/// Validates an optional listing/sync prefix.
///
/// Unlike [`validate`], a prefix that normalizes to nothing (`""`, `"."`,
/// `"/"`) is allowed and means "the whole backend", returned as `None`.
///
/// ```
/// use std::path::Path;
/// use ferry_storage::validate_prefix;
/// assert_eq!(validate_prefix(None).unwrap(), None);
/// assert_eq!(validate_prefix(Some(Path::new("./"))).unwrap(), None);
/// assert_eq!(validate_prefix(Some(Path::new("raw/"))).unwrap().unwrap(), Path::new("raw"));
/// assert!(validate_prefix(Some(Path::new("../raw"))).is_err());
/// ```
pub fn validate_prefix(prefix: Option<&Path>) -> Result<Option<PathBuf>> {
    let Some(prefix) = prefix else {
        return Ok(None);
    };
    let is_root = prefix.components().all(|c| matches!(c, Component::CurDir | Component::RootDir));
    if is_root {
        return Ok(None);
    }
    validate(prefix).map(Some)
}

/// Strip a (validated) prefix from a backend-relative path.
///
/// Returns `None` when `path` is not strictly beneath `prefix`; the prefix
/// itself is not beneath itself.
///
/// ```
/// use std::path::Path;
/// use ferry_storage::relative_to;
/// let prefix = Some(Path::new("raw"));
/// assert_eq!(relative_to(prefix, Path::new("raw/a/b.dat")).unwrap(), Path::new("a/b.dat"));
/// assert!(relative_to(prefix, Path::new("raw")).is_none());
/// assert!(relative_to(prefix, Path::new("rawer/b.dat")).is_none());
/// assert_eq!(relative_to(None, Path::new("b.dat")).unwrap(), Path::new("b.dat"));
/// ```
pub fn relative_to<'a>(prefix: Option<&Path>, path: &'a Path) -> Option<&'a Path> {
    let relative = match prefix {
        Some(prefix) => path.strip_prefix(prefix).ok()?,
        None => path,
    };
    (relative.components().next().is_some()).then_some(relative)
}
