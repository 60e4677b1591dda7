//! Config Error Types

use derive_more::{Display, Error};

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A source could not be read or parsed.
    #[display("failed to load configuration")]
    Load,
    /// Values were read but make no sense together.
    #[display("invalid configuration: {_0}")]
    Invalid(#[error(not(source))] String),
    /// No home directory to derive default locations from.
    #[display("could not determine a home directory")]
    NoHomeDirectory,
}

impl ErrorKind {
    /// Configuration problems never fix themselves.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
