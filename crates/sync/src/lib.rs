//! One-way synchronisation between two storage backends.
//!
//! [`sync`] lists both sides, works out which files are missing or out of
//! date at the destination, copies them with bounded concurrency and
//! (optionally) removes whatever the source no longer has. Planning is
//! available on its own through [`plan`] for callers that only want to know
//! what *would* happen.

mod engine;
pub mod error;
mod options;
mod plan;
mod progress;
mod result;

pub use crate::engine::sync;
pub use crate::options::{DEFAULT_CONCURRENCY, DEFAULT_PROGRESS_INTERVAL, ExcludeFilter, SyncOptions};
pub use crate::plan::{Decision, Plan, decide, plan};
pub use crate::progress::{ChannelProgress, Operation, ProgressEvent, ProgressSink, TransferHook};
pub use crate::result::{FailureKind, PathError, SyncResult};
pub use ferry_storage::Location;
pub use tokio_util::sync::CancellationToken;
