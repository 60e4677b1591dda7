//! Watch Error Types
//!
//! Uses [`exn`] for automatic location tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A watch error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for watch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classifies the origin of a watch failure.
///
/// ### Operational Errors
/// - [`ErrorKind::DuplicateId`]
/// - [`ErrorKind::UnknownWatch`]
/// - [`ErrorKind::OverlappingRoots`]
/// - [`ErrorKind::InvalidDefinition`]
/// - [`ErrorKind::NotRunning`]
///
/// ### Dependency Errors
/// - [`ErrorKind::Watcher`] - filesystem notifications failed.
/// - [`ErrorKind::RootRemoved`]
/// - [`ErrorKind::Store`] - the persisted definitions could not be read or written.
/// - [`ErrorKind::Storage`]
/// - [`ErrorKind::Sync`]
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("filesystem watcher failed")]
    Watcher,
    /// The watched directory itself disappeared.
    #[display("watched root removed: {}", _0.display())]
    RootRemoved(#[error(not(source))] PathBuf),
    #[display("watch store failed")]
    Store,
    #[display("storage backend failed")]
    Storage,
    #[display("sync failed")]
    Sync,
    #[display("a watch with id `{_0}` already exists")]
    DuplicateId(#[error(not(source))] String),
    #[display("no watch with id `{_0}`")]
    UnknownWatch(#[error(not(source))] String),
    #[display("watch roots overlap with `{_0}`")]
    OverlappingRoots(#[error(not(source))] String),
    #[display("invalid watch definition: {_0}")]
    InvalidDefinition(#[error(not(source))] String),
    #[display("watch manager is not running")]
    NotRunning,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Watcher | Self::Store | Self::Storage | Self::Sync)
    }
}
