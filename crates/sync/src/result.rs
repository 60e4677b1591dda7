use derive_more::Display;
use ferry_storage::error::ErrorKind as StorageErrorKind;
use std::path::PathBuf;
use std::time::Duration;

/// Why a single path could not be synced.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum FailureKind {
    /// Backend unreachable, closed, or refusing our credentials.
    #[display("unavailable")]
    Unavailable,
    /// The file vanished between listing and transfer.
    #[display("not found")]
    NotFound,
    /// A file on one side and a directory on the other.
    #[display("conflict")]
    Conflict,
    #[display("timed out")]
    Timeout,
    #[display("cancelled")]
    Cancelled,
    /// The bytes written did not match the size that was listed.
    #[display("integrity")]
    Integrity,
    #[display("failed")]
    Other,
}

impl FailureKind {
    /// Returns `true` if the next sync is likely to succeed where this one
    /// failed. Everything except a file/directory conflict is.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Conflict)
    }
}

impl From<&StorageErrorKind> for FailureKind {
    fn from(kind: &StorageErrorKind) -> Self {
        match kind {
            StorageErrorKind::NotFound(_) => Self::NotFound,
            StorageErrorKind::Unavailable(_) | StorageErrorKind::PermissionDenied(_) | StorageErrorKind::Network(_) => {
                Self::Unavailable
            },
            StorageErrorKind::Conflict(_) => Self::Conflict,
            StorageErrorKind::SizeMismatch { .. } => Self::Integrity,
            _ => Self::Other,
        }
    }
}

/// A failure confined to one path. The sync carried on without it.
#[derive(Clone, Debug, Display, PartialEq, Eq)]
#[display("{}: {kind}: {message}", path.display())]
pub struct PathError {
    /// Path relative to the sync prefix.
    pub path: PathBuf,
    pub kind: FailureKind,
    pub message: String,
}

impl PathError {
    pub fn new(path: impl Into<PathBuf>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of one [`sync`](crate::sync) call.
///
/// For a dry run, `transferred` and `deleted` hold what *would* have
/// happened and `bytes_transferred` what would have been copied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// Paths (relative to the prefixes) copied to the destination.
    pub transferred: Vec<PathBuf>,
    /// Paths (relative to the destination prefix) removed from the destination.
    pub deleted: Vec<PathBuf>,
    /// Source files the destination already had.
    pub skipped: usize,
    pub bytes_transferred: u64,
    /// Per-path failures, in the order they happened.
    pub errors: Vec<PathError>,
    pub duration: Duration,
    pub dry_run: bool,
    /// The call was cancelled before everything planned was attempted.
    pub cancelled: bool,
}

impl SyncResult {
    pub fn files_transferred(&self) -> usize {
        self.transferred.len()
    }

    pub fn files_deleted(&self) -> usize {
        self.deleted.len()
    }

    /// At least one path failed.
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Everything planned happened.
    pub fn is_clean(&self) -> bool {
        !self.is_partial() && !self.cancelled
    }
}
