//! Storage Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::io::Error as IoError;
use std::path::PathBuf;

/// A storage error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// File does not exist
    #[display("file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// Access denied (permissions or credentials)
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Backend cannot be reached, has been closed, or rejected our credentials.
    #[display("backend unavailable: {_0}")]
    Unavailable(#[error(not(source))] String),
    /// A file exists where a directory is expected, or vice versa.
    #[display("file/directory conflict: {}", _0.display())]
    Conflict(#[error(not(source))] PathBuf),
    /// Stream handed to a write did not match the size it was announced with.
    #[display("size mismatch for {}: expected {expected} bytes, got {actual}", path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    /// Underlying I/O error
    #[display("I/O error: {_0}")]
    Io(IoError),
    /// Network-related error (S3 connections, etc.)
    #[display("network error: {_0}")]
    Network(#[error(not(source))] String),
    /// Path contains invalid characters or escapes root
    #[display("invalid path: {}", _0.display())]
    InvalidPath(#[error(not(source))] PathBuf),
    /// Locator string could not be parsed
    #[display("invalid locator: {_0}")]
    InvalidLocator(#[error(not(source))] String),
    /// No backend is registered for the locator scheme
    #[display("unsupported locator scheme: {_0}")]
    UnsupportedScheme(#[error(not(source))] String),
    /// Backend-specific error
    #[display("backend error: {_0}")]
    BackendError(#[error(not(source))] String),
}
impl From<IoError> for ErrorKind {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Network(_) | Self::Unavailable(_) | Self::BackendError(_) | Self::SizeMismatch { .. }
        )
    }

    /// Returns `true` for errors that mean the requested object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::NotFound(PathBuf::from("a")), false)]
    #[case(ErrorKind::Conflict(PathBuf::from("a")), false)]
    #[case(ErrorKind::InvalidPath(PathBuf::from("../a")), false)]
    #[case(ErrorKind::Unavailable("closed".to_string()), true)]
    #[case(ErrorKind::Network("reset".to_string()), true)]
    #[case(ErrorKind::SizeMismatch { path: PathBuf::from("a"), expected: 2, actual: 1 }, true)]
    fn test_retryable(#[case] kind: ErrorKind, #[case] expected: bool) {
        assert_eq!(kind.is_retryable(), expected);
    }

    #[test]
    fn test_display() {
        let kind = ErrorKind::SizeMismatch {
            path: PathBuf::from("dir/file.dat"),
            expected: 10,
            actual: 4,
        };
        assert_eq!(kind.to_string(), "size mismatch for dir/file.dat: expected 10 bytes, got 4");
    }
}
