//! Coalescing bursts of change events into sync batches.
//!
//! [`Debouncer`] is a plain state machine over caller-supplied instants, so
//! it can be driven by a synthetic clock in tests. [`drive`] runs it against
//! a live event stream on tokio's clock.

use crate::error::Result;
use crate::watcher::RawEvent;
use futures::{Stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebounceState {
    /// Nothing pending, no timer armed.
    Idle,
    /// Paths pending and a deadline armed.
    Accumulating,
}

/// Result of one [`Debouncer::flush`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Flush {
    /// Paths to sync now. Never triggers a sync when empty.
    pub batch: BTreeSet<PathBuf>,
    /// Paths still too young; they stay pending for the next flush.
    pub deferred: usize,
}

#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    minimum_age: Duration,
    /// Pending paths and the instant of their latest event.
    pending: BTreeMap<PathBuf, Instant>,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration, minimum_age: Duration) -> Self {
        Self {
            delay,
            minimum_age,
            pending: BTreeMap::new(),
            deadline: None,
        }
    }

    /// Record a change. Every event pushes the deadline out to at least
    /// `at + delay`; an out-of-order event never pulls it in.
    pub fn push(&mut self, path: impl Into<PathBuf>, at: Instant) {
        let last = self.pending.entry(path.into()).or_insert(at);
        *last = (*last).max(at);
        let due = at + self.delay;
        self.deadline = Some(self.deadline.map_or(due, |deadline| deadline.max(due)));
    }

    /// When the next flush is due, if anything is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn state(&self) -> DebounceState {
        match self.deadline {
            Some(_) => DebounceState::Accumulating,
            None => DebounceState::Idle,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Split pending paths into those old enough to sync and those that are
    /// not.
    ///
    /// A path's age is the smaller of what `age_probe` reports (typically the
    /// time since the file was last modified) and the time since its last
    /// event; paths the probe knows nothing about (e.g. deleted files) are
    /// aged by their events alone. Paths younger than the minimum age stay
    /// pending and the deadline is re-armed for when the first of them
    /// comes of age.
    pub fn flush(&mut self, now: Instant, age_probe: impl Fn(&Path) -> Option<Duration>) -> Flush {
        let mut flush = Flush::default();
        let mut wait: Option<Duration> = None;
        let pending = std::mem::take(&mut self.pending);
        for (path, last) in pending {
            let since_event = now.saturating_duration_since(last);
            let age = age_probe(&path).map_or(since_event, |probed| probed.min(since_event));
            if age < self.minimum_age {
                let remaining = self.minimum_age - age;
                wait = Some(wait.map_or(remaining, |w| w.min(remaining)));
                self.pending.insert(path, last);
            } else {
                flush.batch.insert(path);
            }
        }
        flush.deferred = self.pending.len();
        self.deadline = wait.map(|w| now + w);
        flush
    }
}

/// Run `debouncer` against `events`, sending each non-empty batch to
/// `batches`.
///
/// Returns `Ok` when cancelled, when the event stream ends, or when the
/// batch receiver goes away; returns the stream's error if it fails.
/// Pending paths are dropped on return.
pub async fn drive<S, P>(
    mut events: S,
    mut debouncer: Debouncer,
    age_probe: P,
    batches: mpsc::Sender<BTreeSet<PathBuf>>,
    cancel: CancellationToken,
) -> Result<()>
where
    S: Stream<Item = Result<RawEvent>> + Unpin,
    P: Fn(&Path) -> Option<Duration>,
{
    loop {
        let deadline = debouncer.deadline();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            // Disabled branches are still constructed; `now` is never polled.
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let flush = debouncer.flush(Instant::now(), &age_probe);
                tracing::debug!(batch = flush.batch.len(), deferred = flush.deferred, "Debounce window closed");
                if !flush.batch.is_empty() {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        sent = batches.send(flush.batch) => if sent.is_err() {
                            return Ok(());
                        },
                    }
                }
            },
            event = events.next() => match event {
                Some(Ok(event)) => {
                    tracing::trace!(path = %event.path.display(), kind = ?event.kind, "Change");
                    debouncer.push(event.path, event.at);
                },
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
        }
    }
}
