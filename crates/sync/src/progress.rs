//! Progress reporting and the post-transfer hook.

use derive_more::Display;
use ferry_storage::FileRecord;
use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Operation {
    #[display("transfer")]
    Transfer,
    #[display("delete")]
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Path relative to the sync prefix.
    pub path: PathBuf,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub operation: Operation,
}

/// Receives progress while a sync runs.
///
/// Called from inside transfer futures, so implementations must return
/// quickly: buffer, don't block.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Forwards progress events into an unbounded channel.
///
/// Events are dropped silently once the receiver is gone.
#[derive(Clone, Debug)]
pub struct ChannelProgress(UnboundedSender<ProgressEvent>);

impl ChannelProgress {
    pub fn new(sender: UnboundedSender<ProgressEvent>) -> Self {
        Self(sender)
    }
}

impl ProgressSink for ChannelProgress {
    fn on_progress(&self, event: &ProgressEvent) {
        _ = self.0.send(event.clone());
    }
}

/// Called once for every file that landed at the destination.
///
/// This is where metadata extraction and the like hook in. Failures are
/// logged and otherwise ignored; the file has been transferred either way.
#[async_trait::async_trait]
pub trait TransferHook: Send + Sync {
    /// `record` describes the source file; its path is relative to the sync
    /// prefix.
    async fn after_transfer(&self, record: &FileRecord) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

pin_project! {
    /// Reader wrapper that reports bytes read and stops at the next read once
    /// the sync is cancelled.
    pub(crate) struct ProgressReader<R> {
        #[pin]
        inner: R,
        #[pin]
        cancelled: WaitForCancellationFutureOwned,
        path: PathBuf,
        total: u64,
        done: u64,
        reported: u64,
        interval: u64,
        sink: Option<Arc<dyn ProgressSink>>,
    }
}

impl<R> ProgressReader<R> {
    pub(crate) fn new(
        inner: R,
        path: PathBuf,
        total: u64,
        interval: u64,
        sink: Option<Arc<dyn ProgressSink>>,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            inner,
            cancelled: cancel.clone().cancelled_owned(),
            path,
            total,
            done: 0,
            reported: 0,
            interval: interval.max(1),
            sink,
        }
    }
}

impl<R: AsyncRead> AsyncRead for ProgressReader<R> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        // Polling the cancellation future registers the waker, so a read
        // that is stuck waiting on the network still notices cancellation.
        if this.cancelled.poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::other("transfer cancelled")));
        }
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        *this.done += (buf.filled().len() - before) as u64;
        if let Some(sink) = this.sink
            && *this.done - *this.reported >= *this.interval
        {
            *this.reported = *this.done;
            sink.on_progress(&ProgressEvent {
                path: this.path.clone(),
                bytes_done: *this.done,
                bytes_total: *this.total,
                operation: Operation::Transfer,
            });
        }
        Poll::Ready(Ok(()))
    }
}
