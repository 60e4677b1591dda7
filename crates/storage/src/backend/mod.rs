//! Storage backend trait and implementations.
//!
//! This module defines the `StorageBackend` trait, which provides a unified
//! interface for storage operations across different backends (local filesystem,
//! S3-compatible services, etc.).

mod local;
#[cfg(feature = "mock")]
mod mock;
#[cfg(feature = "s3")]
mod s3;

pub use self::local::LocalBackend;
#[cfg(feature = "mock")]
pub use self::mock::MockBackend;
#[cfg(feature = "s3")]
pub use self::s3::S3Backend;
use crate::error::{ErrorKind, Result};
use crate::file::FileRecord;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use std::io::Cursor;
use std::path::Path;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

pub type RecordStream<'a> = Pin<Box<dyn Stream<Item = Result<FileRecord>> + Send + 'a>>;
/// Streaming reader handed out by [`StorageBackend::reader`]. Whatever the
/// backend holds open (file handle, HTTP body) is released when it's dropped.
pub type BoxRead = Pin<Box<dyn AsyncRead + Send + 'static>>;

/// Unified interface for storage backends.
///
/// All storage operations are asynchronous to efficiently handle network
/// operations and concurrent access. The trait supports both local filesystem
/// and remote storage backends.
///
/// # Path Handling
/// All paths are relative to the storage root and must be validated using
/// [`validate_path`](crate::validate_path) before use. Implementations should
/// enforce this validation.
///
/// # Concurrency
/// A backend may be shared between any number of concurrent readers and
/// writers, but concurrent writes to the *same* path are not supported.
///
/// # Examples
///
/// Copy one file between two backends without buffering it in memory:
///
/// ```
/// use std::path::Path;
/// use ferry_storage::{backend::StorageBackend, error::Result};
///
/// async fn copy(from: &dyn StorageBackend, to: &dyn StorageBackend, path: &Path) -> Result<u64> {
///     let record = from.stat(path).await?;
///     let reader = from.reader(path).await?;
///     to.write(path, reader, record.size).await
/// }
/// ```
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name of the configured backend. Used for logging only, uniqueness is
    /// not enforced.
    fn name(&self) -> &str;

    /// List all records strictly beneath an optional prefix.
    ///
    /// Default implementation of this method is to collect all the results
    /// from [`list_stream()`](Self::list_stream) into a [`Vec`] before
    /// returning.
    async fn list(&self, prefix: Option<&Path>) -> Result<Vec<FileRecord>> {
        self.list_stream(prefix).try_collect().await
    }

    /// Stream records beneath an optional prefix, recursively.
    ///
    /// # Notes
    /// - The prefix is treated as a directory: `raw` matches `raw/a.dat`
    ///   but neither `raw` itself nor `rawer/a.dat`.
    /// - A prefix that doesn't exist yields an empty stream rather than an
    ///   error, which is how S3-compatible stores behave anyway.
    /// - Every path is unique within one listing.
    ///
    /// # Examples
    ///
    /// ```
    /// use futures::TryStreamExt;
    /// use std::path::Path;
    /// # use ferry_storage::{backend::StorageBackend, error::Result};
    /// # async fn example(backend: &dyn StorageBackend) -> Result<()> {
    /// let mut stream = backend.list_stream(Some(Path::new("runs/")));
    /// while let Some(record) = stream.try_next().await? {
    ///     println!("{}: {} bytes", record.path.display(), record.size);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> RecordStream<'a>;

    /// Check if a file exists.
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Open a file for streaming reads.
    ///
    /// The async setup (opening the file, issuing the request) happens before
    /// returning. Returns [`NotFound`](crate::error::ErrorKind::NotFound) if
    /// the file does not exist.
    async fn reader(&self, path: &Path) -> Result<BoxRead>;

    /// Read a whole file into memory.
    ///
    /// Convenience wrapper around [`reader()`](Self::reader); prefer streaming
    /// for anything that might be large.
    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let mut reader = self.reader(path).await?;
        let mut buffer = Vec::new();
        reader.read_to_end(&mut buffer).await.map_err(ErrorKind::Io)?;
        Ok(buffer)
    }

    /// Stream exactly `expected_size` bytes from `reader` into `path`.
    ///
    /// # Notes
    /// - Implementations should create parent directories as needed.
    /// - The write must be atomic from the point of view of `list`/`stat`: a
    ///   partially written file never shows up as a complete record.
    /// - If the stream ends early or runs long, the write fails with
    ///   [`SizeMismatch`](crate::error::ErrorKind::SizeMismatch) and nothing
    ///   is left behind.
    ///
    /// Returns the number of bytes written.
    async fn write(&self, path: &Path, reader: BoxRead, expected_size: u64) -> Result<u64>;

    /// Write an in-memory buffer.
    async fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()> {
        let reader: BoxRead = Box::pin(Cursor::new(data.to_vec()));
        self.write(path, reader, data.len() as u64).await.map(|_| ())
    }

    /// Delete a file (or an empty directory / directory marker).
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if it does not
    /// exist.
    async fn delete(&self, path: &Path) -> Result<()>;

    /// Get file metadata without reading contents.
    ///
    /// Returns [`NotFound`](crate::error::ErrorKind::NotFound) if the file
    /// does not exist.
    async fn stat(&self, path: &Path) -> Result<FileRecord>;

    /// Release connections and handles held by the backend.
    ///
    /// Idempotent. Any operation issued after closing fails with
    /// [`Unavailable`](crate::error::ErrorKind::Unavailable).
    async fn close(&self) -> Result<()>;
}
