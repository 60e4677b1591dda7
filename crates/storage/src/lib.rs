//! Storage backends for ferry.
//!
//! Every storage technology implements [`StorageBackend`]; the sync engine
//! only ever talks to that trait. [`BackendRegistry`] turns destination
//! locators such as `s3://bucket/prefix` or `/mnt/archive` into concrete
//! backends.

pub mod backend;
pub mod error;
pub mod file;
mod locator;
mod path;

pub use crate::backend::StorageBackend;
pub use crate::file::{FileRecord, Identity, IdentityKind};
pub use crate::locator::{BackendRegistry, Location, Locator, S3Settings};
pub use crate::path::{relative_to, validate as validate_path, validate_prefix};
use std::sync::Arc;

pub type BackendHandle = Arc<dyn StorageBackend + Send + Sync>;
