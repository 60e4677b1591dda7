//! Watching directories and syncing their changes as they settle.
//!
//! Each watch runs its own pipeline: a recursive [`Watcher`] feeds raw change
//! events into a [`Debouncer`], and every batch that comes out of it is
//! synced to the watch's destination with [`ferry_sync::sync`], scoped to
//! just the paths in the batch. [`WatchManager`] owns the pipelines and the
//! persisted [`WatchDefinition`]s.

pub mod debounce;
mod definition;
pub mod error;
mod exclude;
mod manager;
mod state;
mod store;
pub mod watcher;

pub use crate::debounce::{DebounceState, Debouncer, Flush};
pub use crate::definition::{DEFAULT_DEBOUNCE_SECS, WatchDefinition};
pub use crate::exclude::ExcludeSet;
pub use crate::manager::{DEFAULT_HISTORY, ManagerSettings, WatchManager};
pub use crate::state::{Phase, SyncRecord, Trigger, WatchState};
pub use crate::store::WatchStore;
pub use crate::watcher::{ChangeKind, RawEvent, Watcher};
