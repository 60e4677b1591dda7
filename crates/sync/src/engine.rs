use crate::error::{ErrorKind, Result, Side};
use crate::options::SyncOptions;
use crate::plan::plan;
use crate::progress::{Operation, ProgressEvent, ProgressReader};
use crate::result::{FailureKind, PathError, SyncResult};
use exn::ResultExt;
use ferry_storage::backend::BoxRead;
use ferry_storage::error::Error as StorageError;
use ferry_storage::{FileRecord, Location, relative_to, validate_prefix};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Make `destination` hold everything `source` holds.
///
/// 1. Both sides are listed concurrently. If either listing fails the call
///    fails, and nothing has been written or deleted.
/// 2. The listings are compared (see [`decide`](crate::decide)).
/// 3. Unless this is a dry run, files are copied with at most
///    `options.concurrency` transfers in flight, then (with
///    `delete_extraneous`) destination-only files are deleted one at a time.
///
/// Failures that only affect one path end up in [`SyncResult::errors`] and
/// never stop the rest of the sync. Cancellation stops scheduling new work,
/// aborts in-flight transfers at their next read, and returns what was done
/// so far with [`SyncResult::cancelled`] set.
///
/// ```
/// use ferry_storage::{Location, backend::LocalBackend};
/// use ferry_sync::{SyncOptions, sync};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let temp = tempfile::tempdir()?;
/// # let (from, to) = (temp.path().join("from"), temp.path().join("to"));
/// let source = Location::root(Arc::new(LocalBackend::new("instrument", &from)?));
/// let destination = Location::root(Arc::new(LocalBackend::new("archive", &to)?));
/// let result = sync(&source, &destination, &SyncOptions::default()).await?;
/// assert!(result.is_clean());
/// # Ok(())
/// # }
/// ```
#[tracing::instrument(
    skip_all,
    fields(source = source.backend.name(), destination = destination.backend.name(), dry_run = options.dry_run)
)]
pub async fn sync(source: &Location, destination: &Location, options: &SyncOptions) -> Result<SyncResult> {
    let started = Instant::now();
    let source_prefix = validate_prefix(source.prefix.as_deref())
        .or_raise(|| ErrorKind::InvalidOptions("invalid source prefix".to_string()))?;
    let destination_prefix = validate_prefix(destination.prefix.as_deref())
        .or_raise(|| ErrorKind::InvalidOptions("invalid destination prefix".to_string()))?;
    if overlaps(source, source_prefix.as_deref(), destination, destination_prefix.as_deref()) {
        exn::bail!(ErrorKind::InvalidOptions("source and destination overlap".to_string()));
    }

    let (source_records, destination_records) = tokio::try_join!(
        list(source, source_prefix.as_deref(), Side::Source),
        list(destination, destination_prefix.as_deref(), Side::Destination),
    )?;
    let plan = plan(&source_records, &destination_records, options)?;
    tracing::debug!(
        transfers = plan.transfers.len(),
        deletes = plan.deletes.len(),
        skipped = plan.skipped,
        conflicts = plan.conflicts.len(),
        "Planned sync"
    );

    let mut result = SyncResult {
        skipped: plan.skipped,
        dry_run: options.dry_run,
        errors: plan
            .conflicts
            .iter()
            .map(|path| PathError::new(path, FailureKind::Conflict, "file on one side, directory on the other"))
            .collect(),
        ..SyncResult::default()
    };

    if options.dry_run {
        result.bytes_transferred = plan.bytes();
        result.transferred = plan.transfers.into_iter().map(|r| r.path).collect();
        result.deleted = plan.deletes.into_iter().map(|r| r.path).collect();
        result.duration = started.elapsed();
        return Ok(result);
    }

    let transfer = Transfer {
        source,
        destination,
        source_prefix: source_prefix.as_deref(),
        destination_prefix: destination_prefix.as_deref(),
        options,
    };

    let mut queue = plan.transfers.into_iter();
    let mut processing = FuturesUnordered::new();
    if !options.cancel.is_cancelled() {
        processing.extend(queue.by_ref().take(options.concurrency.get()).map(|record| transfer.run(record)));
    }
    while let Some((path, outcome)) = processing.next().await {
        match outcome {
            Ok(bytes) => {
                result.bytes_transferred += bytes;
                result.transferred.push(path);
            },
            Err(error) => {
                tracing::warn!(path = %error.path.display(), kind = %error.kind, "{}", error.message);
                result.errors.push(error);
            },
        }
        // Pop-n-push, FIFO, until cancelled.
        if !options.cancel.is_cancelled()
            && let Some(record) = queue.next()
        {
            processing.push(transfer.run(record));
        }
    }

    // Deletes only start once every transfer has settled.
    for record in plan.deletes {
        if options.cancel.is_cancelled() {
            break;
        }
        let path = join(destination_prefix.as_deref(), &record.path);
        match destination.backend.delete(&path).await {
            Ok(()) => {},
            // Already gone is as good as deleted.
            Err(e) if e.is_not_found() => {},
            Err(e) => {
                let error = PathError::new(&record.path, FailureKind::from(&*e), e.to_string());
                tracing::warn!(path = %error.path.display(), kind = %error.kind, "{}", error.message);
                result.errors.push(error);
                continue;
            },
        }
        transfer.report(&record.path, record.size, record.size, Operation::Delete);
        result.deleted.push(record.path);
    }

    result.cancelled = options.cancel.is_cancelled();
    result.duration = started.elapsed();
    tracing::info!(
        transferred = result.files_transferred(),
        deleted = result.files_deleted(),
        skipped = result.skipped,
        errors = result.errors.len(),
        bytes = result.bytes_transferred,
        cancelled = result.cancelled,
        duration_ms = result.duration.as_millis() as u64,
        "Sync finished"
    );
    Ok(result)
}

async fn list(location: &Location, prefix: Option<&Path>, side: Side) -> Result<Vec<FileRecord>> {
    let records = location.backend.list(prefix).await.or_raise(|| ErrorKind::Listing(side))?;
    // Re-key every record relative to the prefix, so both sides line up.
    Ok(records
        .into_iter()
        .filter_map(|record| {
            let relative = relative_to(prefix, &record.path)?.to_path_buf();
            Some(FileRecord { path: relative, ..record })
        })
        .collect())
}

/// Same backend instance, and one prefix contains the other.
fn overlaps(source: &Location, source_prefix: Option<&Path>, destination: &Location, destination_prefix: Option<&Path>) -> bool {
    if !std::ptr::addr_eq(Arc::as_ptr(&source.backend), Arc::as_ptr(&destination.backend)) {
        return false;
    }
    match (source_prefix, destination_prefix) {
        (Some(a), Some(b)) => a.starts_with(b) || b.starts_with(a),
        _ => true,
    }
}

fn join(prefix: Option<&Path>, path: &Path) -> PathBuf {
    match prefix {
        Some(prefix) => prefix.join(path),
        None => path.to_path_buf(),
    }
}

/// Everything one file transfer needs, shared by all of them.
struct Transfer<'a> {
    source: &'a Location,
    destination: &'a Location,
    source_prefix: Option<&'a Path>,
    destination_prefix: Option<&'a Path>,
    options: &'a SyncOptions,
}

impl Transfer<'_> {
    async fn run(&self, record: FileRecord) -> (PathBuf, std::result::Result<u64, PathError>) {
        let outcome = match self.options.transfer_timeout {
            Some(limit) => match tokio::time::timeout(limit, self.copy(&record)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(PathError::new(
                    &record.path,
                    FailureKind::Timeout,
                    format!("transfer did not finish within {limit:?}"),
                )),
            },
            None => self.copy(&record).await,
        };
        if outcome.is_ok()
            && let Some(hook) = &self.options.hook
            && let Err(e) = hook.after_transfer(&record).await
        {
            tracing::warn!(path = %record.path.display(), error = %e, "Post-transfer hook failed");
        }
        (record.path, outcome)
    }

    async fn copy(&self, record: &FileRecord) -> std::result::Result<u64, PathError> {
        let from = join(self.source_prefix, &record.path);
        let to = join(self.destination_prefix, &record.path);
        let reader = self.source.backend.reader(&from).await.map_err(|e| self.failure(&record.path, &e))?;
        let reader: BoxRead = Box::pin(ProgressReader::new(
            reader,
            record.path.clone(),
            record.size,
            self.options.progress_interval,
            self.options.progress.clone(),
            &self.options.cancel,
        ));
        let written = self
            .destination
            .backend
            .write(&to, reader, record.size)
            .await
            .map_err(|e| self.failure(&record.path, &e))?;
        tracing::debug!(path = %record.path.display(), bytes = written, "Transferred");
        self.report(&record.path, written, record.size, Operation::Transfer);
        Ok(written)
    }

    fn failure(&self, path: &Path, error: &StorageError) -> PathError {
        let kind = match self.options.cancel.is_cancelled() {
            true => FailureKind::Cancelled,
            false => FailureKind::from(&**error),
        };
        PathError::new(path, kind, error.to_string())
    }

    fn report(&self, path: &Path, done: u64, total: u64, operation: Operation) {
        if let Some(sink) = &self.options.progress {
            sink.on_progress(&ProgressEvent {
                path: path.to_path_buf(),
                bytes_done: done,
                bytes_total: total,
                operation,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{ProgressSink, TransferHook};
    use async_trait::async_trait;
    use ferry_storage::StorageBackend;
    use ferry_storage::backend::{LocalBackend, MockBackend, RecordStream};
    use ferry_storage::error::ErrorKind as StorageErrorKind;
    use std::collections::HashSet;
    use std::num::NonZeroUsize;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use time::OffsetDateTime;
    use tokio::io::DuplexStream;
    use tokio_util::sync::CancellationToken;

    /// Wraps a backend to count and order the calls made against it.
    struct Instrumented {
        inner: MockBackend,
        /// Writes take this long, so that transfers overlap.
        write_delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        writes: AtomicUsize,
        deletes: AtomicUsize,
        log: Mutex<Vec<String>>,
        fail_list: bool,
        fail_reads: HashSet<PathBuf>,
        hang_reads: HashSet<PathBuf>,
        // Keeps hung readers pending rather than at EOF.
        hung: Mutex<Vec<DuplexStream>>,
    }

    impl Instrumented {
        fn new(inner: MockBackend) -> Self {
            Self {
                inner,
                write_delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                log: Mutex::new(Vec::new()),
                fail_list: false,
                fail_reads: HashSet::new(),
                hang_reads: HashSet::new(),
                hung: Mutex::new(Vec::new()),
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StorageBackend for Instrumented {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn list_stream<'a>(&'a self, prefix: Option<&'a Path>) -> RecordStream<'a> {
            if self.fail_list {
                let err = exn::Exn::from(StorageErrorKind::Unavailable("listing refused".to_string()));
                return Box::pin(futures::stream::once(async { Err(err) }));
            }
            self.inner.list_stream(prefix)
        }

        async fn exists(&self, path: &Path) -> ferry_storage::error::Result<bool> {
            self.inner.exists(path).await
        }

        async fn reader(&self, path: &Path) -> ferry_storage::error::Result<BoxRead> {
            if self.fail_reads.contains(path) {
                exn::bail!(StorageErrorKind::Unavailable("read refused".to_string()));
            }
            if self.hang_reads.contains(path) {
                let (writer, reader) = tokio::io::duplex(64);
                self.hung.lock().unwrap().push(writer);
                return Ok(Box::pin(reader));
            }
            self.inner.reader(path).await
        }

        async fn write(&self, path: &Path, reader: BoxRead, size: u64) -> ferry_storage::error::Result<u64> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.write_delay).await;
            let written = self.inner.write(path, reader, size).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("write {}", path.display()));
            written
        }

        async fn delete(&self, path: &Path) -> ferry_storage::error::Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("delete {}", path.display()));
            self.inner.delete(path).await
        }

        async fn stat(&self, path: &Path) -> ferry_storage::error::Result<FileRecord> {
            self.inner.stat(path).await
        }

        async fn close(&self) -> ferry_storage::error::Result<()> {
            self.inner.close().await
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);
    impl ProgressSink for Recorder {
        fn on_progress(&self, event: &ProgressEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn files(names: &[&str]) -> Vec<(String, Vec<u8>)> {
        names.iter().map(|n| (n.to_string(), n.as_bytes().to_vec())).collect()
    }

    fn location(backend: impl StorageBackend + 'static) -> Location {
        Location::root(Arc::new(backend))
    }

    fn sorted(mut paths: Vec<PathBuf>) -> Vec<PathBuf> {
        paths.sort();
        paths
    }

    #[tokio::test]
    async fn test_identity_match_transfers_nothing() {
        let source = MockBackend::with_files([("a.txt", vec![1u8; 100])]);
        let destination = MockBackend::with_files([("a.txt", vec![1u8; 100])]);
        // Same content, but the source looks newer: identity wins.
        destination.set_modified("a.txt", OffsetDateTime::UNIX_EPOCH).await;
        let result = sync(&location(source), &location(destination), &SyncOptions::default()).await.unwrap();
        assert_eq!(result.files_transferred(), 0);
        assert_eq!(result.skipped, 1);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_new_file_is_transferred() {
        let destination = Arc::new(MockBackend::default());
        let source = location(MockBackend::with_files([("b.txt", b"new".to_vec())]));
        let result = sync(&source, &Location::root(destination.clone()), &SyncOptions::default()).await.unwrap();
        assert_eq!(result.transferred, [PathBuf::from("b.txt")]);
        assert_eq!(result.bytes_transferred, 3);
        assert_eq!(destination.read(Path::new("b.txt")).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_extraneous_files_survive_without_flag() {
        let destination = Arc::new(MockBackend::with_files([("c.txt", b"old".to_vec())]));
        let source = location(MockBackend::with_files(files(&["b.txt"])));
        let result = sync(&source, &Location::root(destination.clone()), &SyncOptions::default()).await.unwrap();
        assert_eq!(result.files_deleted(), 0);
        assert!(destination.exists(Path::new("c.txt")).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletes_run_after_all_transfers() {
        let mut destination = Instrumented::new(MockBackend::with_files(files(&["c.txt", "d.txt"])));
        destination.write_delay = Duration::from_millis(50);
        let destination = Arc::new(destination);
        let source = location(MockBackend::with_files(files(&["a.txt", "b.txt", "e.txt"])));
        let options = SyncOptions::default().with_delete_extraneous(true);

        let result = sync(&source, &Location::root(destination.clone()), &options).await.unwrap();
        assert_eq!(sorted(result.transferred), ["a.txt", "b.txt", "e.txt"].map(PathBuf::from));
        assert_eq!(result.deleted, ["c.txt", "d.txt"].map(PathBuf::from));
        assert!(!destination.inner.exists(Path::new("c.txt")).await.unwrap());

        let log = destination.log();
        let last_write = log.iter().rposition(|l| l.starts_with("write")).unwrap();
        let first_delete = log.iter().position(|l| l.starts_with("delete")).unwrap();
        assert!(last_write < first_delete, "{log:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound() {
        let names: Vec<String> = (0..20).map(|i| format!("file-{i:02}")).collect();
        let source = location(MockBackend::with_files(names.iter().map(|n| (n.clone(), n.as_bytes().to_vec()))));
        let mut destination = Instrumented::new(MockBackend::default());
        destination.write_delay = Duration::from_millis(10);
        let destination = Arc::new(destination);
        let options = SyncOptions::default().with_concurrency(NonZeroUsize::new(3).unwrap());

        let result = sync(&source, &Location::root(destination.clone()), &options).await.unwrap();
        assert_eq!(result.files_transferred(), 20);
        assert_eq!(destination.max_in_flight.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_dry_run_is_pure() {
        let source = Arc::new(Instrumented::new(MockBackend::with_files(files(&["a", "b"]))));
        let destination = Arc::new(Instrumented::new(MockBackend::with_files(files(&["c"]))));
        let options = SyncOptions::default().with_dry_run(true).with_delete_extraneous(true);

        let result = sync(&Location::root(source.clone()), &Location::root(destination.clone()), &options).await.unwrap();
        assert!(result.dry_run);
        assert_eq!(sorted(result.transferred), ["a", "b"].map(PathBuf::from));
        assert_eq!(result.deleted, [PathBuf::from("c")]);
        assert_eq!(result.bytes_transferred, 2);
        for backend in [&source, &destination] {
            assert_eq!(backend.writes.load(Ordering::SeqCst), 0);
            assert_eq!(backend.deletes.load(Ordering::SeqCst), 0);
        }
        assert!(destination.inner.exists(Path::new("c")).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_sync_is_a_no_op() {
        let temp = tempfile::tempdir().unwrap();
        let from = LocalBackend::new("from", temp.path().join("from")).unwrap();
        from.write_bytes(Path::new("runs/001/a.h5"), b"aaaa").await.unwrap();
        from.write_bytes(Path::new("runs/002/b.h5"), b"").await.unwrap();
        from.write_bytes(Path::new("notes.txt"), b"n").await.unwrap();
        let source = location(from);
        let destination = location(LocalBackend::new("to", temp.path().join("to")).unwrap());
        let options = SyncOptions::default().with_delete_extraneous(true);

        let first = sync(&source, &destination, &options).await.unwrap();
        assert_eq!(first.files_transferred(), 3);
        assert!(first.is_clean());
        let second = sync(&source, &destination, &options).await.unwrap();
        assert_eq!(second.files_transferred(), 0);
        assert_eq!(second.files_deleted(), 0);
        assert_eq!(second.skipped, 3);
    }

    #[tokio::test]
    async fn test_prefixes() {
        let source = Location::new(
            Arc::new(MockBackend::with_files(files(&["raw/a", "raw/sub/b", "rawer/c"]))),
            Some(PathBuf::from("raw")),
        );
        let archive = Arc::new(MockBackend::with_files(files(&["archive/raw/stale"])));
        let destination = Location::new(archive.clone(), Some(PathBuf::from("archive/raw")));
        let options = SyncOptions::default().with_delete_extraneous(true);

        let result = sync(&source, &destination, &options).await.unwrap();
        assert_eq!(sorted(result.transferred), ["a", "sub/b"].map(PathBuf::from));
        assert_eq!(result.deleted, [PathBuf::from("stale")]);
        assert_eq!(archive.paths().await, ["archive/raw/a", "archive/raw/sub/b"].map(PathBuf::from));
    }

    #[tokio::test]
    async fn test_listing_failure_is_fatal() {
        let mut source = Instrumented::new(MockBackend::with_files(files(&["a"])));
        source.fail_list = true;
        let destination = Arc::new(Instrumented::new(MockBackend::with_files(files(&["b"]))));
        let options = SyncOptions::default().with_delete_extraneous(true);

        let err = sync(&location(source), &Location::root(destination.clone()), &options).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::Listing(Side::Source)));
        assert_eq!(destination.writes.load(Ordering::SeqCst), 0);
        assert_eq!(destination.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_one_failed_file_does_not_stop_the_rest() {
        let mut source = Instrumented::new(MockBackend::with_files(files(&["a", "b", "c"])));
        source.fail_reads.insert(PathBuf::from("b"));
        let result = sync(&location(source), &location(MockBackend::default()), &SyncOptions::default()).await.unwrap();
        assert_eq!(sorted(result.transferred.clone()), ["a", "c"].map(PathBuf::from));
        assert!(result.is_partial());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, Path::new("b"));
        assert_eq!(result.errors[0].kind, FailureKind::Unavailable);
    }

    #[tokio::test]
    async fn test_conflict_is_reported_per_path() {
        let temp = tempfile::tempdir().unwrap();
        let destination = LocalBackend::new("to", temp.path()).unwrap();
        destination.write_bytes(Path::new("x/inner"), b"i").await.unwrap();
        let source = location(MockBackend::with_files(files(&["x", "y"])));
        let options = SyncOptions::default();

        let result = sync(&source, &location(destination), &options).await.unwrap();
        assert_eq!(result.transferred, [PathBuf::from("y")]);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, FailureKind::Conflict);
        assert!(temp.path().join("x/inner").is_file());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_a_path_error() {
        let mut source = Instrumented::new(MockBackend::with_files(files(&["slow", "fast"])));
        source.hang_reads.insert(PathBuf::from("slow"));
        let options = SyncOptions::default().with_transfer_timeout(Duration::from_secs(30));

        let result = sync(&location(source), &location(MockBackend::default()), &options).await.unwrap();
        assert_eq!(result.transferred, [PathBuf::from("fast")]);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].kind, FailureKind::Timeout);
        assert!(result.errors[0].kind.is_retryable());
        assert!(!result.cancelled);
    }

    struct CancelAfterFirst(CancellationToken);
    #[async_trait]
    impl TransferHook for CancelAfterFirst {
        async fn after_transfer(&self, _: &FileRecord) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.0.cancel();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancellation_keeps_completed_work() {
        let cancel = CancellationToken::new();
        let destination = Arc::new(Instrumented::new(MockBackend::with_files(files(&["extra"]))));
        let options = SyncOptions::default()
            .with_concurrency(NonZeroUsize::MIN)
            .with_delete_extraneous(true)
            .with_hook(Arc::new(CancelAfterFirst(cancel.clone())))
            .with_cancellation(cancel);
        let source = location(MockBackend::with_files(files(&["a", "b", "c"])));

        let result = sync(&source, &Location::root(destination.clone()), &options).await.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.transferred, [PathBuf::from("a")]);
        assert!(destination.inner.exists(Path::new("a")).await.unwrap());
        // Nothing is deleted once cancelled.
        assert_eq!(destination.deletes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_in_flight_reads() {
        let cancel = CancellationToken::new();
        let mut source = Instrumented::new(MockBackend::with_files(files(&["stuck"])));
        source.hang_reads.insert(PathBuf::from("stuck"));
        let options = SyncOptions::default().with_cancellation(cancel.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let result = sync(&location(source), &location(MockBackend::default()), &options).await.unwrap();
        canceller.await.unwrap();
        assert!(result.cancelled);
        assert!(result.transferred.is_empty());
        assert_eq!(result.errors[0].kind, FailureKind::Cancelled);
    }

    #[tokio::test]
    async fn test_progress_is_reported_per_file() {
        let recorder = Arc::new(Recorder::default());
        let source = location(MockBackend::with_files([("big", vec![0u8; 10_000]), ("small", vec![0u8; 1])]));
        let destination = location(MockBackend::with_files(files(&["gone"])));
        let options = SyncOptions::default()
            .with_progress_interval(4096)
            .with_delete_extraneous(true)
            .with_progress(recorder.clone());

        sync(&source, &destination, &options).await.unwrap();
        let events = recorder.0.lock().unwrap();
        let big: Vec<_> = events.iter().filter(|e| e.path == Path::new("big")).collect();
        assert!(big.len() >= 2);
        assert!(big.windows(2).all(|w| w[0].bytes_done <= w[1].bytes_done));
        assert_eq!(big.last().unwrap().bytes_done, 10_000);
        assert!(events.iter().any(|e| e.path == Path::new("small") && e.bytes_done == 1));
        assert!(events.iter().any(|e| e.path == Path::new("gone") && e.operation == Operation::Delete));
    }

    #[tokio::test]
    async fn test_overlapping_locations_are_rejected() {
        let backend: Arc<MockBackend> = Arc::new(MockBackend::default());
        let source = Location::new(backend.clone(), Some(PathBuf::from("data")));
        let destination = Location::new(backend, Some(PathBuf::from("data/archive")));
        let err = sync(&source, &destination, &SyncOptions::default()).await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidOptions(_)));
    }
}
