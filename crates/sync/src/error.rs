//! Sync Error Types
//!
//! Only failures that make the whole call meaningless are errors. Anything
//! that goes wrong for a single path is recorded in
//! [`SyncResult::errors`](crate::SyncResult::errors) instead.

use derive_more::{Display, Error};

/// A sync error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Which end of a sync an error relates to.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Side {
    #[display("source")]
    Source,
    #[display("destination")]
    Destination,
}

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// The baseline listing failed; nothing was mutated.
    #[display("could not list {_0}")]
    Listing(#[error(not(source))] Side),
    /// Options or locations that can never produce a valid sync.
    #[display("invalid sync options: {_0}")]
    InvalidOptions(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Listing(_))
    }
}
