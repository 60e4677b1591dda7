//! File records returned by storage backends.
//!
//! A [`FileRecord`] is a snapshot: built fresh by every `list`/`stat` call,
//! never mutated afterwards, and discarded once the sync pass that asked for
//! it is finished.

use std::fmt;
use std::path::{Component, Path, PathBuf};
use time::OffsetDateTime;

/// How a backend computed an [`Identity`].
///
/// Identities are only comparable when both sides used the same method. A
/// BLAKE3 digest of the content and an S3 ETag (which for multipart uploads
/// isn't even a digest of the content) can never be equated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    /// BLAKE3 hash of the full file content.
    Blake3,
    /// Entity tag assigned by an S3-compatible object store.
    ETag,
}
impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Blake3 => "blake3",
            Self::ETag => "etag",
        })
    }
}

/// Opaque, backend-supplied content fingerprint.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Identity {
    pub kind: IdentityKind,
    pub value: String,
}
impl Identity {
    pub fn new(kind: IdentityKind, value: impl Into<String>) -> Self {
        Self { kind, value: value.into() }
    }

    pub fn blake3(hash: blake3::Hash) -> Self {
        Self::new(IdentityKind::Blake3, hash.to_hex().to_string())
    }

    /// Whether the two identities were produced the same way, and therefore
    /// whether equality between them means anything.
    pub fn comparable(&self, other: &Identity) -> bool {
        self.kind == other.kind
    }

    /// `Some(true|false)` when the identities can be compared, `None` when
    /// they can't and the caller has to fall back to another heuristic.
    pub fn matches(&self, other: &Identity) -> Option<bool> {
        self.comparable(other).then(|| self.value == other.value)
    }
}
impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// One addressable object (file or directory marker) in a storage backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Relative path from storage root
    pub path: PathBuf,
    /// File size in bytes (zero for directories)
    pub size: u64,
    /// Last modified timestamp
    pub modified: OffsetDateTime,
    /// Content identity, when the backend can provide one cheaply
    pub identity: Option<Identity>,
    pub is_directory: bool,
    /// Backend-specific storage class (e.g. `GLACIER`)
    pub storage_tier: Option<String>,
}
impl FileRecord {
    /// Create a record for a regular file (no identity yet).
    pub fn file(path: impl Into<PathBuf>, size: u64, modified: OffsetDateTime) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
            identity: None,
            is_directory: false,
            storage_tier: None,
        }
    }

    /// Create a record for a directory (or directory marker object).
    pub fn directory(path: impl Into<PathBuf>, modified: OffsetDateTime) -> Self {
        Self {
            is_directory: true,
            ..Self::file(path, 0, modified)
        }
    }

    pub fn with_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_storage_tier(mut self, tier: impl Into<String>) -> Self {
        self.storage_tier = Some(tier.into());
        self
    }

    /// Forward-slash separated form of [`path`](Self::path), regardless of
    /// platform.
    pub fn key(&self) -> String {
        key_of(&self.path)
    }
}

/// Render a relative path as a forward-slash separated key.
///
/// ```
/// use std::path::Path;
/// use ferry_storage::file::key_of;
/// assert_eq!(key_of(Path::new("a/./b//c.txt")), "a/b/c.txt");
/// ```
pub fn key_of(path: &Path) -> String {
    let mut key = String::new();
    for component in path.components() {
        if let Component::Normal(part) = component {
            if !key.is_empty() {
                key.push('/');
            }
            key.push_str(&part.to_string_lossy());
        }
    }
    key
}
