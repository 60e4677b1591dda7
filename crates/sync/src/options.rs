use crate::error::{ErrorKind, Result};
use crate::progress::{ProgressSink, TransferHook};
use exn::ResultExt;
use ferry_storage::validate_path;
use std::collections::BTreeSet;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CONCURRENCY: NonZeroUsize = NonZeroUsize::new(4).unwrap();
/// Bytes between two progress reports for the same file.
pub const DEFAULT_PROGRESS_INTERVAL: u64 = 1024 * 1024;

/// Decides whether a relative path is left out of a sync entirely.
pub type ExcludeFilter = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Configuration for a single [`sync`](crate::sync) call.
///
/// ```
/// use ferry_sync::SyncOptions;
/// use std::num::NonZeroUsize;
/// use std::time::Duration;
///
/// let options = SyncOptions::default()
///     .with_delete_extraneous(true)
///     .with_concurrency(NonZeroUsize::new(8).unwrap())
///     .with_transfer_timeout(Duration::from_secs(300));
/// assert!(!options.dry_run);
/// ```
#[derive(Clone)]
pub struct SyncOptions {
    /// Plan only; issue no writes or deletes.
    pub dry_run: bool,
    /// Remove destination files that don't exist at the source.
    pub delete_extraneous: bool,
    /// Maximum transfers in flight at once.
    pub concurrency: NonZeroUsize,
    /// Upper bound for one file transfer.
    pub transfer_timeout: Option<Duration>,
    pub progress_interval: u64,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub hook: Option<Arc<dyn TransferHook>>,
    /// Restrict transfers and deletes to these paths (relative to the
    /// prefixes) and everything beneath them. Listings stay complete.
    pub scope: Option<BTreeSet<PathBuf>>,
    /// Paths this matches are neither transferred nor deleted, on either
    /// side.
    pub exclude: Option<ExcludeFilter>,
    pub cancel: CancellationToken,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            delete_extraneous: false,
            concurrency: DEFAULT_CONCURRENCY,
            transfer_timeout: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            progress: None,
            hook: None,
            scope: None,
            exclude: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl SyncOptions {
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_delete_extraneous(mut self, delete: bool) -> Self {
        self.delete_extraneous = delete;
        self
    }

    pub fn with_concurrency(mut self, concurrency: NonZeroUsize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = Some(timeout);
        self
    }

    pub fn with_progress_interval(mut self, bytes: u64) -> Self {
        self.progress_interval = bytes;
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_hook(mut self, hook: Arc<dyn TransferHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_scope(mut self, paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.scope = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_exclude(mut self, filter: impl Fn(&Path) -> bool + Send + Sync + 'static) -> Self {
        self.exclude = Some(Arc::new(filter));
        self
    }

    pub(crate) fn is_excluded(&self, path: &Path) -> bool {
        self.exclude.as_ref().is_some_and(|exclude| exclude(path))
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Reject options that can't describe a meaningful sync, and normalise
    /// scope paths the same way backends normalise their own.
    pub(crate) fn validated(&self) -> Result<Option<BTreeSet<PathBuf>>> {
        if self.progress_interval == 0 {
            exn::bail!(ErrorKind::InvalidOptions("progress interval must be at least one byte".to_string()));
        }
        if self.transfer_timeout.is_some_and(|t| t.is_zero()) {
            exn::bail!(ErrorKind::InvalidOptions("transfer timeout must not be zero".to_string()));
        }
        let Some(scope) = &self.scope else {
            return Ok(None);
        };
        scope
            .iter()
            .map(|path| {
                validate_path(path).or_raise(|| ErrorKind::InvalidOptions(format!("invalid scope path {}", path.display())))
            })
            .collect::<Result<BTreeSet<_>>>()
            .map(Some)
    }
}

/// Whether `path` is one of the scope entries or lies beneath one.
pub(crate) fn in_scope(scope: Option<&BTreeSet<PathBuf>>, path: &Path) -> bool {
    match scope {
        None => true,
        Some(scope) => path.ancestors().any(|ancestor| scope.contains(ancestor)),
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("dry_run", &self.dry_run)
            .field("delete_extraneous", &self.delete_extraneous)
            .field("concurrency", &self.concurrency)
            .field("transfer_timeout", &self.transfer_timeout)
            .field("progress_interval", &self.progress_interval)
            .field("progress", &self.progress.is_some())
            .field("hook", &self.hook.is_some())
            .field("scope", &self.scope)
            .field("exclude", &self.exclude.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = SyncOptions::default();
        assert_eq!(options.concurrency.get(), 4);
        assert!(!options.dry_run);
        assert!(!options.delete_extraneous);
        assert!(options.scope.is_none());
        assert!(!options.is_excluded(Path::new("anything")));
        assert_eq!(options.validated().unwrap(), None);
    }

    #[test]
    fn test_invalid_options() {
        assert!(SyncOptions::default().with_progress_interval(0).validated().is_err());
        assert!(SyncOptions::default().with_transfer_timeout(Duration::ZERO).validated().is_err());
        assert!(SyncOptions::default().with_scope(["../escape"]).validated().is_err());
    }

    #[test]
    fn test_scope_is_normalised() {
        let scope = SyncOptions::default().with_scope(["./runs//a.h5", "/b"]).validated().unwrap().unwrap();
        assert!(scope.contains(Path::new("runs/a.h5")));
        assert!(scope.contains(Path::new("b")));
    }

    #[test]
    fn test_exclude_filter() {
        let options = SyncOptions::default().with_exclude(|path: &Path| path.extension().is_some_and(|e| e == "tmp"));
        assert!(options.is_excluded(Path::new("run/a.tmp")));
        assert!(!options.is_excluded(Path::new("run/a.h5")));
    }

    #[test]
    fn test_in_scope() {
        let scope: BTreeSet<PathBuf> = [PathBuf::from("runs/001"), PathBuf::from("top.dat")].into();
        assert!(in_scope(None, Path::new("anything")));
        assert!(in_scope(Some(&scope), Path::new("runs/001")));
        assert!(in_scope(Some(&scope), Path::new("runs/001/scan.h5")));
        assert!(in_scope(Some(&scope), Path::new("top.dat")));
        assert!(!in_scope(Some(&scope), Path::new("runs/002/scan.h5")));
        assert!(!in_scope(Some(&scope), Path::new("runs")));
    }
}
