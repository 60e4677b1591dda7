//! Filesystem change notifications for one directory tree.

use crate::error::{ErrorKind, Result};
use crate::exclude::ExcludeSet;
use exn::ResultExt;
use futures::Stream;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    /// The path is the *new* name; the old name arrives as `Removed`.
    Renamed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawEvent {
    /// Relative to the watched root.
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub at: Instant,
}

/// Keeps the underlying OS watch alive; dropping it stops observation and
/// ends the paired [`EventStream`].
pub struct Watcher {
    _inner: RecommendedWatcher,
    root: PathBuf,
}

impl Watcher {
    /// Start watching `root` recursively. Subdirectories created later are
    /// picked up automatically.
    pub fn start(root: &Path, excludes: ExcludeSet) -> Result<(Watcher, EventStream)> {
        let root = std::fs::canonicalize(root).or_raise(|| ErrorKind::Watcher)?;
        if !root.is_dir() {
            exn::bail!(ErrorKind::Watcher);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let handler_root = root.clone();
        let mut inner = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    for item in map_event(&handler_root, &excludes, &event) {
                        // Receiver dropped means nobody is listening any more.
                        _ = tx.send(item);
                    }
                },
                Err(err) => {
                    tracing::error!(error = %err, "File watcher error");
                    _ = tx.send(Err(exn::Exn::from(ErrorKind::Watcher)));
                },
            },
            notify::Config::default(),
        )
        .or_raise(|| ErrorKind::Watcher)?;
        inner.watch(&root, RecursiveMode::Recursive).or_raise(|| ErrorKind::Watcher)?;
        tracing::info!(path = %root.display(), "Started recursive watch");
        Ok((Watcher { _inner: inner, root }, EventStream { rx, done: false }))
    }

    /// Canonical form of the watched root.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        tracing::debug!(path = %self.root.display(), "Stopped watch");
    }
}

/// Change events for one watched root.
///
/// Yields `Ok` events until the watch stops. A backend failure or removal of
/// the root ends the stream with exactly one `Err`.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Result<RawEvent>>,
    done: bool,
}

impl Stream for EventStream {
    type Item = Result<RawEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let item = std::task::ready!(self.rx.poll_recv(cx));
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
            self.rx.close();
        }
        Poll::Ready(item)
    }
}

/// Translate one notify event into zero or more relative change events.
fn map_event(root: &Path, excludes: &ExcludeSet, event: &notify::Event) -> Vec<Result<RawEvent>> {
    let at = Instant::now();
    let paths = &event.paths;
    let changes: Vec<(&PathBuf, ChangeKind)> = match &event.kind {
        EventKind::Create(_) => paths.iter().take(1).map(|p| (p, ChangeKind::Created)).collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            vec![(&paths[0], ChangeKind::Removed), (&paths[1], ChangeKind::Renamed)]
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            paths.iter().take(1).map(|p| (p, ChangeKind::Removed)).collect()
        },
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            paths.iter().take(1).map(|p| (p, ChangeKind::Renamed)).collect()
        },
        // Permission and timestamp changes don't change content.
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => paths.iter().take(1).map(|p| (p, ChangeKind::Modified)).collect(),
        EventKind::Remove(_) => paths.iter().take(1).map(|p| (p, ChangeKind::Removed)).collect(),
        _ => {
            tracing::trace!(kind = ?event.kind, "Ignoring event kind");
            Vec::new()
        },
    };

    let mut mapped = Vec::new();
    for (path, kind) in changes {
        if kind == ChangeKind::Removed && path == root && !root.exists() {
            mapped.push(Err(exn::Exn::from(ErrorKind::RootRemoved(root.to_path_buf()))));
            break;
        }
        let Some(relative) = path.strip_prefix(root).ok().filter(|r| !r.as_os_str().is_empty()) else {
            continue;
        };
        if excludes.is_excluded(relative) {
            tracing::trace!(path = %relative.display(), "Excluded change");
            continue;
        }
        tracing::debug!(path = %relative.display(), ?kind, "Mapped change");
        mapped.push(Ok(RawEvent {
            path: relative.to_path_buf(),
            kind,
            at,
        }));
    }
    mapped
}
