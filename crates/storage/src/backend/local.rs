//! Local filesystem storage backend.
//!
//! This module provides a storage backend implementation for the local filesystem.
//! Files are stored in a configured directory and accessed using standard filesystem
//! operations via `tokio::fs` for async I/O.

use crate::backend::{BoxRead, RecordStream};
use crate::error::ErrorKind;
use crate::file::{FileRecord, Identity};
use crate::path::{validate as validate_path, validate_prefix};
use crate::{StorageBackend, error::Result};
use async_stream::stream;
use async_trait::async_trait;
use exn::ResultExt;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs::{Metadata, create_dir_all as sync_create_dir};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::fs::{self, DirEntry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Name prefix of in-flight writes. Listings never report these.
const TEMP_PREFIX: &str = ".ferry-partial-";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// In-flight temp file, removed when dropped unless it was renamed into
/// place. Also covers writes whose future is dropped (timeouts, cancellation).
struct TempFile(PathBuf, bool);
impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self(path, false)
    }

    fn persisted(mut self) {
        self.1 = true;
    }
}
impl Drop for TempFile {
    fn drop(&mut self) {
        if !self.1 {
            _ = std::fs::remove_file(&self.0);
        }
    }
}

enum WalkEntry {
    File(FileRecord),
    Descend(PathBuf, FileRecord),
    Skip,
}

/// Local filesystem storage backend.
///
/// Stores files in a directory on the local filesystem. All paths are relative
/// to the configured root directory. Symbolic links are followed: a link is
/// listed (and copied) as whatever it points at.
///
/// # Examples
///
/// ```no_run
/// use ferry_storage::backend::LocalBackend;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = LocalBackend::new("instrument", "/data/instrument")?.with_hashing(false);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LocalBackend {
    name: String,
    /// Root directory all paths are relative to
    root: PathBuf,
    /// Compute BLAKE3 identities while listing
    hashing: bool,
    closed: Arc<AtomicBool>,
}
impl LocalBackend {
    /// Create a new local filesystem backend.
    ///
    /// # Arguments
    /// * `root` - Absolute path to the root directory
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, or exists but isn't a
    /// directory.
    pub fn new(name: impl Into<String>, root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidPath(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidPath(root));
            }
        } else {
            // Use non-async here; it'll only happen once on initialization
            // and it's not worth the hassle of making the constructor async.
            sync_create_dir(&root).map_err(|e| Self::map_io_error(e, &root))?;
        }
        Ok(Self {
            name: name.into(),
            root,
            hashing: true,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Enable or disable BLAKE3 identities (enabled by default).
    ///
    /// Hashing means reading every file during a listing. Without it, the
    /// sync engine falls back to comparing size and modification time.
    pub fn with_hashing(mut self, hashing: bool) -> Self {
        self.hashing = hashing;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            exn::bail!(ErrorKind::Unavailable(format!("backend `{}` is closed", self.name)));
        }
        Ok(())
    }

    /// Get the absolute path for a relative storage path.
    ///
    /// Validates the path and joins it with the root directory.
    fn absolute_path(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        let validated = validate_path(path.as_ref())?;
        Ok(self.root.join(validated))
    }

    /// Convert an absolute path back to a relative storage path.
    fn relative_path(&self, absolute: impl AsRef<Path>) -> Result<PathBuf> {
        let absolute = absolute.as_ref();
        let relative = absolute.strip_prefix(&self.root).or_raise(|| {
            ErrorKind::BackendError(format!("path `{:?}` is not within root `{:?}`", absolute, self.root))
        })?;
        validate_path(relative)
    }

    /// Re-use same data collection from file metadata for both list and stat functions
    fn record(path: &Path, metadata: &Metadata) -> Result<FileRecord> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?.into();
        Ok(match metadata.is_dir() {
            true => FileRecord::directory(path, modified),
            false => FileRecord::file(path, metadata.len(), modified),
        })
    }

    fn map_io_error(e: std::io::Error, path: &Path) -> ErrorKind {
        match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied(path.to_path_buf()),
            std::io::ErrorKind::NotADirectory
            | std::io::ErrorKind::IsADirectory
            | std::io::ErrorKind::DirectoryNotEmpty => ErrorKind::Conflict(path.to_path_buf()),
            _ => ErrorKind::Io(e),
        }
    }

    fn temp_path(target: &Path) -> PathBuf {
        let name = target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        target.with_file_name(format!("{TEMP_PREFIX}{}-{n}-{name}", std::process::id()))
    }

    fn is_temp(name: &OsStr) -> bool {
        name.to_string_lossy().starts_with(TEMP_PREFIX)
    }

    async fn identify(&self, record: FileRecord, absolute: &Path) -> Result<FileRecord> {
        if !self.hashing || record.is_directory {
            return Ok(record);
        }
        let source = absolute.to_path_buf();
        // Hashing is CPU-bound and blake3 wants a sync reader anyway.
        let hashed = tokio::task::spawn_blocking(move || -> std::io::Result<blake3::Hash> {
            let mut hasher = blake3::Hasher::new();
            hasher.update_reader(std::fs::File::open(&source)?)?;
            Ok(hasher.finalize())
        })
        .await
        .or_raise(|| ErrorKind::BackendError("hashing task panicked".to_string()))?;
        let hash = hashed.map_err(|e| Self::map_io_error(e, &record.path))?;
        Ok(record.with_identity(Identity::blake3(hash)))
    }

    /// One directory entry, resolved through symbolic links.
    async fn process_entry(&self, entry: DirEntry) -> Result<WalkEntry> {
        if Self::is_temp(&entry.file_name()) {
            return Ok(WalkEntry::Skip);
        }
        let path = entry.path();
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(backend = %self.name, path = %path.display(), "Skipping dangling symbolic link");
                return Ok(WalkEntry::Skip);
            },
            Err(e) => exn::bail!(Self::map_io_error(e, &path)),
        };
        let relative = self.relative_path(&path)?;
        let record = Self::record(&relative, &metadata)?;
        if metadata.is_dir() {
            return Ok(WalkEntry::Descend(path, record));
        }
        if metadata.is_file() {
            return Ok(WalkEntry::File(self.identify(record, &path).await?));
        }
        // Sockets, FIFOs, device nodes: nothing we can copy.
        Ok(WalkEntry::Skip)
    }

    async fn write_temp(temp: &Path, reader: &mut BoxRead, expected_size: u64) -> std::io::Result<u64> {
        let mut file = fs::File::create(temp).await?;
        // Read one byte past the expected size so an over-long stream is noticed.
        let mut limited = reader.take(expected_size.saturating_add(1));
        let written = tokio::io::copy(&mut limited, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> RecordStream<'a> {
        let start_dir = match self.ensure_open().and_then(|_| validate_prefix(prefix)) {
            Ok(Some(prefix)) => self.root.join(prefix),
            Ok(None) => self.root.clone(),
            Err(e) => return Box::pin(futures::stream::once(async { Err(e) })),
        };
        let mut stack = vec![start_dir];
        let mut visited = HashSet::new();

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                // Following symbolic links means directories can form cycles.
                match fs::canonicalize(&current).await {
                    Ok(real) => if !visited.insert(real) {
                        tracing::debug!(path = %current.display(), "Directory already visited; skipping link cycle");
                        continue 'dirs;
                    },
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue 'dirs,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    },
                }
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    // To stay consistent with the behaviour of S3-compatible
                    // backends, asking for the contents of a directory that
                    // doesn't exist results in an empty list not an error.
                    Err(err) if matches!(err.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::NotADirectory) => continue 'dirs,
                    Err(err) => {
                        yield Err(exn::Exn::from(Self::map_io_error(err, &current)));
                        continue 'dirs;
                    }
                };

                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(e) => { yield Err(exn::Exn::from(Self::map_io_error(e, &current))); continue 'entries; },
                    };
                    match self.process_entry(entry).await {
                        Ok(WalkEntry::File(f)) => yield Ok(f),
                        Ok(WalkEntry::Descend(d, record)) => {
                            stack.push(d);
                            yield Ok(record);
                        },
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    };
                }
            }
        })
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        self.ensure_open()?;
        let abs_path = self.absolute_path(path)?;
        Ok(fs::try_exists(&abs_path).await.map_err(ErrorKind::Io)?)
    }

    async fn reader(&self, path: &Path) -> Result<BoxRead> {
        self.ensure_open()?;
        let abs_path = self.absolute_path(path)?;
        let file = fs::File::open(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        let metadata = file.metadata().await.map_err(|e| Self::map_io_error(e, path))?;
        if metadata.is_dir() {
            exn::bail!(ErrorKind::Conflict(path.to_path_buf()));
        }
        Ok(Box::pin(file))
    }

    async fn write(&self, path: &Path, mut reader: BoxRead, expected_size: u64) -> Result<u64> {
        self.ensure_open()?;
        let abs_path = self.absolute_path(path)?;
        if let Ok(existing) = fs::metadata(&abs_path).await
            && existing.is_dir()
        {
            exn::bail!(ErrorKind::Conflict(path.to_path_buf()));
        }
        // Create parent directories if needed, to keep behaviour
        // consistent with S3-compatible storage.
        if let Some(parent) = abs_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| Self::map_io_error(e, path))?;
        }
        // Write next to the target and rename over it, so that listings only
        // ever see the old file or the complete new one.
        let temp = TempFile::new(Self::temp_path(&abs_path));
        let written = Self::write_temp(&temp.0, &mut reader, expected_size)
            .await
            .map_err(|e| Self::map_io_error(e, path))?;
        if written != expected_size {
            exn::bail!(ErrorKind::SizeMismatch {
                path: path.to_path_buf(),
                expected: expected_size,
                actual: written,
            });
        }
        fs::rename(&temp.0, &abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        temp.persisted();
        tracing::trace!(backend = %self.name, path = %path.display(), bytes = written, "Wrote file");
        Ok(written)
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let abs_path = self.absolute_path(path)?;
        let metadata = fs::symlink_metadata(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        let removed = match metadata.is_dir() {
            true => fs::remove_dir(&abs_path).await,
            false => fs::remove_file(&abs_path).await,
        };
        Ok(removed.map_err(|e| Self::map_io_error(e, path))?)
    }

    async fn stat(&self, path: &Path) -> Result<FileRecord> {
        self.ensure_open()?;
        let abs_path = self.absolute_path(path)?;
        let metadata = fs::metadata(&abs_path).await.map_err(|e| Self::map_io_error(e, path))?;
        let record = Self::record(&validate_path(path)?, &metadata)?;
        self.identify(record, &abs_path).await
    }

    async fn close(&self) -> Result<()> {
        // Nothing is held open between calls; closing only fences off
        // further use so behaviour matches the network backends.
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::IdentityKind;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new("name", temp_dir.path()).unwrap();
        (temp_dir, backend)
    }

    fn files(records: &[FileRecord]) -> Vec<String> {
        let mut keys: Vec<_> = records.iter().filter(|r| !r.is_directory).map(FileRecord::key).collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(LocalBackend::new("name", temp_dir.path()).is_ok());
        assert!(LocalBackend::new("name", "relative/path").is_err());
        assert!(LocalBackend::new("name", "./relative").is_err());
    }

    #[test]
    fn test_new_creates_missing_root() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path().join("a/b");
        LocalBackend::new("name", &root).unwrap();
        assert!(root.is_dir());
    }

    #[test]
    fn test_absolute_path() {
        let (temp_dir, backend) = backend();
        let expected = temp_dir.path().join("runs/scan.h5");
        assert_eq!(backend.absolute_path(Path::new("runs/scan.h5")).unwrap(), expected);
        // Path traversal is prevented
        assert!(backend.absolute_path(Path::new("../etc/passwd")).is_err());
    }

    #[test]
    fn test_relative_path() {
        let (temp_dir, backend) = backend();
        let abs = temp_dir.path().join("runs/scan.h5");
        assert_eq!(backend.relative_path(&abs).unwrap(), Path::new("runs/scan.h5"));
        assert!(backend.relative_path(Path::new("/other/file.dat")).is_err());
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (_temp_dir, backend) = backend();
        backend.write_bytes(Path::new("test.txt"), b"Hello, world!").await.unwrap();
        let read_data = backend.read(Path::new("test.txt")).await.unwrap();
        assert_eq!(read_data, b"Hello, world!");
    }

    #[tokio::test]
    async fn test_write_creates_directories() {
        let (_temp_dir, backend) = backend();
        backend.write_bytes(Path::new("a/b/c/file.txt"), b"data").await.unwrap();
        assert!(backend.exists(Path::new("a/b/c/file.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_zero_bytes() {
        let (_temp_dir, backend) = backend();
        backend.write_bytes(Path::new("empty.dat"), b"").await.unwrap();
        let record = backend.stat(Path::new("empty.dat")).await.unwrap();
        assert_eq!(record.size, 0);
        assert!(!record.is_directory);
    }

    #[tokio::test]
    async fn test_write_short_stream_leaves_nothing_behind() {
        let (temp_dir, backend) = backend();
        let reader: BoxRead = Box::pin(std::io::Cursor::new(b"abc".to_vec()));
        let err = backend.write(Path::new("dir/short.dat"), reader, 10).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::SizeMismatch { expected: 10, actual: 3, .. }));
        assert!(!backend.exists(Path::new("dir/short.dat")).await.unwrap());
        // No temp file left lying around either.
        let leftovers = std::fs::read_dir(temp_dir.path().join("dir")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_write_long_stream_is_rejected() {
        let (_temp_dir, backend) = backend();
        let reader: BoxRead = Box::pin(std::io::Cursor::new(b"abcdef".to_vec()));
        let err = backend.write(Path::new("long.dat"), reader, 2).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::SizeMismatch { expected: 2, actual: 3, .. }));
        assert!(!backend.exists(Path::new("long.dat")).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_over_directory_conflicts() {
        let (_temp_dir, backend) = backend();
        backend.write_bytes(Path::new("dir/file.txt"), b"data").await.unwrap();
        let err = backend.write_bytes(Path::new("dir"), b"data").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
    }

    #[tokio::test]
    async fn test_listing_ignores_temp_files() {
        let (temp_dir, backend) = backend();
        std::fs::write(temp_dir.path().join(format!("{TEMP_PREFIX}1-1-partial.dat")), b"half").unwrap();
        backend.write_bytes(Path::new("complete.dat"), b"whole").await.unwrap();
        let records = backend.list(None).await.unwrap();
        assert_eq!(files(&records), vec!["complete.dat"]);
    }

    #[tokio::test]
    async fn test_exists() {
        let (_temp_dir, backend) = backend();
        assert!(!backend.exists(Path::new("nonexistent.txt")).await.unwrap());
        backend.write_bytes(Path::new("exists.txt"), b"data").await.unwrap();
        assert!(backend.exists(Path::new("exists.txt")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let (_temp_dir, backend) = backend();
        backend.write_bytes(Path::new("file.txt"), b"data").await.unwrap();
        backend.delete(Path::new("file.txt")).await.unwrap();
        assert!(!backend.exists(Path::new("file.txt")).await.unwrap());
        // Deleting nonexistent file returns error
        let err = backend.delete(Path::new("nonexistent.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_directory() {
        let (_temp_dir, backend) = backend();
        backend.write_bytes(Path::new("dir/file.txt"), b"data").await.unwrap();
        // Not empty yet
        let err = backend.delete(Path::new("dir")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Conflict(_)));
        backend.delete(Path::new("dir/file.txt")).await.unwrap();
        backend.delete(Path::new("dir")).await.unwrap();
        assert!(!backend.exists(Path::new("dir")).await.unwrap());
    }

    #[tokio::test]
    async fn test_stat() {
        let (_temp_dir, backend) = backend();
        let data = b"Hello, world!";
        backend.write_bytes(Path::new("file.txt"), data).await.unwrap();
        let info = backend.stat(Path::new("file.txt")).await.unwrap();
        assert_eq!(info.path, PathBuf::from("file.txt"));
        assert_eq!(info.size, data.len() as u64);
        let identity = info.identity.unwrap();
        assert_eq!(identity.kind, IdentityKind::Blake3);
        assert_eq!(identity.value, blake3::hash(data).to_hex().to_string());
    }

    #[tokio::test]
    async fn test_stat_without_hashing() {
        let (_temp_dir, backend) = backend();
        let backend = backend.with_hashing(false);
        backend.write_bytes(Path::new("file.txt"), b"data").await.unwrap();
        assert!(backend.stat(Path::new("file.txt")).await.unwrap().identity.is_none());
    }

    #[tokio::test]
    async fn test_list_empty_directory() {
        let (_temp_dir, backend) = backend();
        assert!(backend.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_reports_directories() {
        let (_temp_dir, backend) = backend();
        backend.write_bytes(Path::new("a/b/file.txt"), b"data").await.unwrap();
        let records = backend.list(None).await.unwrap();
        let mut dirs: Vec<_> = records.iter().filter(|r| r.is_directory).map(FileRecord::key).collect();
        dirs.sort();
        assert_eq!(dirs, vec!["a", "a/b"]);
        assert_eq!(files(&records), vec!["a/b/file.txt"]);
    }

    #[tokio::test]
    async fn test_list_with_prefix_excludes_prefix_itself() {
        let (_temp_dir, backend) = backend();
        backend.write_bytes(Path::new("run1/a.dat"), b"data").await.unwrap();
        backend.write_bytes(Path::new("run1/sub/b.dat"), b"data").await.unwrap();
        backend.write_bytes(Path::new("run10/c.dat"), b"data").await.unwrap();
        let records = backend.list(Some(Path::new("run1/"))).await.unwrap();
        assert!(records.iter().all(|r| r.path != Path::new("run1")));
        assert_eq!(files(&records), vec!["run1/a.dat", "run1/sub/b.dat"]);
    }

    #[tokio::test]
    async fn test_list_nonexistent_prefix() {
        let (_temp_dir, backend) = backend();
        assert!(backend.list(Some(Path::new("nonexistent/"))).await.unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_dereferences_symlinks() {
        let (temp_dir, backend) = backend();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("target.dat"), b"linked").unwrap();
        std::os::unix::fs::symlink(outside.path().join("target.dat"), temp_dir.path().join("link.dat")).unwrap();
        std::os::unix::fs::symlink(temp_dir.path().join("missing"), temp_dir.path().join("dangling")).unwrap();
        // A loop back to the root must not hang the walk.
        std::os::unix::fs::symlink(temp_dir.path(), temp_dir.path().join("loop")).unwrap();
        let records = backend.list(None).await.unwrap();
        let link = records.iter().find(|r| r.path == Path::new("link.dat")).unwrap();
        assert_eq!(link.size, 6);
        assert!(!link.is_directory);
        assert!(records.iter().all(|r| r.path != Path::new("dangling")));
    }

    #[tokio::test]
    async fn test_path_security() {
        let (_temp_dir, backend) = backend();
        assert!(backend.read(Path::new("../etc/passwd")).await.is_err());
        assert!(backend.read(Path::new("etc/../../passwd")).await.is_err());
        assert!(backend.write_bytes(Path::new("../etc/passwd"), b"data").await.is_err());
        assert!(backend.delete(Path::new("../../file")).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fences_operations() {
        let (_temp_dir, backend) = backend();
        backend.close().await.unwrap();
        backend.close().await.unwrap();
        let err = backend.stat(Path::new("file.txt")).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Unavailable(_)));
        assert!(backend.list(None).await.is_err());
    }
}
