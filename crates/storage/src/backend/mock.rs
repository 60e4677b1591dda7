//! In-memory storage backend for testing.

use super::{BoxRead, RecordStream};
use crate::StorageBackend;
use crate::error::{ErrorKind, Result};
use crate::file::{FileRecord, Identity};
use crate::path::{relative_to, validate as validate_path, validate_prefix};
use async_stream::stream;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use time::OffsetDateTime;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

#[derive(Clone)]
struct Entry {
    modified: OffsetDateTime,
    data: Vec<u8>,
}

/// In-memory storage backend for testing.
///
/// Files are stored in a `HashMap` behind a [`RwLock`], so all trait methods
/// can operate on `&self` without external synchronisation. Identities are
/// BLAKE3 hashes, same as [`LocalBackend`](super::LocalBackend), so two mock
/// backends compare by content.
///
/// # Examples
///
/// ```
/// use ferry_storage::backend::{MockBackend, StorageBackend};
/// use std::path::Path;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = MockBackend::with_files([
///     ("runs/001.h5", b"<data>"),
/// ]);
/// assert!(backend.exists(Path::new("runs/001.h5")).await?);
///
/// backend.write_bytes(Path::new("runs/002.h5"), b"more data").await?;
/// assert!(backend.exists(Path::new("runs/002.h5")).await?);
/// # Ok(())
/// # }
/// ```
pub struct MockBackend {
    name: String,
    storage: RwLock<HashMap<PathBuf, Entry>>,
    closed: AtomicBool,
}

impl MockBackend {
    /// Create a mock backend pre-populated with files.
    ///
    /// Panics if any path fails validation (e.g. path traversal). If test
    /// setup is wrong, then test should not pass.
    pub fn with_files(files: impl IntoIterator<Item = (impl Into<PathBuf>, impl Into<Vec<u8>>)>) -> Self {
        let mut map = HashMap::new();
        let modified = OffsetDateTime::now_utc();
        for (path, data) in files {
            let path = path.into();
            let Ok(validated) = validate_path(&path) else {
                // The panic here is DELIBERATE. MockBackend is intended to be
                // used in tests; panics are expected. There is no error result.
                panic!("MockBackend::with_files: invalid path {}", path.display());
            };
            map.insert(validated, Entry { modified, data: data.into() });
        }
        Self {
            name: "mock".to_string(),
            storage: RwLock::new(map),
            closed: AtomicBool::new(false),
        }
    }

    /// Change the name of the mock backend.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Backdate (or postdate) a file's modification time.
    ///
    /// Panics if the file doesn't exist.
    pub async fn set_modified(&self, path: impl AsRef<Path>, modified: OffsetDateTime) {
        let mut guard = self.storage.write().await;
        let Some(entry) = guard.get_mut(path.as_ref()) else {
            panic!("MockBackend::set_modified: no file at {}", path.as_ref().display());
        };
        entry.modified = modified;
    }

    /// Snapshot of every stored path, sorted. Handy for assertions.
    pub async fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.storage.read().await.keys().cloned().collect();
        paths.sort();
        paths
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            exn::bail!(ErrorKind::Unavailable(format!("backend `{}` is closed", self.name)));
        }
        Ok(())
    }

    fn record(path: &Path, entry: &Entry) -> FileRecord {
        FileRecord::file(path, entry.data.len() as u64, entry.modified)
            .with_identity(Identity::blake3(blake3::hash(&entry.data)))
    }
}
impl Default for MockBackend {
    fn default() -> Self {
        let files: [(&str, &str); 0] = [];
        Self::with_files(files)
    }
}

#[async_trait]
impl StorageBackend for MockBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> RecordStream<'a> {
        let validated_prefix = match self.ensure_open().and_then(|_| validate_prefix(prefix)) {
            Ok(pfx) => pfx,
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };

        Box::pin(stream! {
            // Snapshot matching entries under the read lock, then drop it
            // before yielding to avoid holding the lock across yield points.
            let records: Vec<FileRecord> = {
                let guard = self.storage.read().await;
                guard
                    .iter()
                    .filter(|(path, _)| relative_to(validated_prefix.as_deref(), path).is_some())
                    .map(|(path, entry)| Self::record(path, entry))
                    .collect()
            };
            for record in records {
                yield Ok(record);
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.ensure_open()?;
        let path = validate_path(path)?;
        Ok(self.storage.read().await.contains_key(&path))
    }

    async fn reader(&self, path: &Path) -> Result<BoxRead> {
        self.ensure_open()?;
        let path = validate_path(path)?;
        let entry = self.storage.read().await.get(&path).cloned().ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))?;
        Ok(Box::pin(Cursor::new(entry.data)))
    }

    async fn write(&self, path: &Path, mut reader: BoxRead, expected_size: u64) -> Result<u64> {
        self.ensure_open()?;
        let path = validate_path(path)?;
        let mut data = Vec::new();
        (&mut reader).take(expected_size.saturating_add(1)).read_to_end(&mut data).await.map_err(ErrorKind::Io)?;
        let actual = data.len() as u64;
        if actual != expected_size {
            exn::bail!(ErrorKind::SizeMismatch { path, expected: expected_size, actual });
        }
        let modified = OffsetDateTime::now_utc();
        self.storage.write().await.insert(path, Entry { modified, data });
        Ok(actual)
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let path = validate_path(path)?;
        self.storage.write().await.remove(&path).map(|_| ()).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path)))
    }

    async fn stat(&self, path: &Path) -> Result<FileRecord> {
        self.ensure_open()?;
        let path = validate_path(path)?;
        let guard = self.storage.read().await;
        let entry = guard.get(&path).ok_or_else(|| exn::Exn::from(ErrorKind::NotFound(path.clone())))?;
        Ok(Self::record(&path, entry))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
