use crate::error::{ErrorKind, Result};
use crate::exclude::ExcludeSet;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DEBOUNCE_SECS: u64 = 5;

/// Persisted configuration for one watch.
///
/// ```
/// use ferry_watch::WatchDefinition;
///
/// let definition = WatchDefinition::new("beamline", "/data/beamline", "s3://archive/beamline")
///     .with_minimum_age_secs(30)
///     .with_exclude(["*.tmp", "scratch/**"]);
/// assert_eq!(definition.debounce_secs, 5);
/// assert!(definition.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchDefinition {
    pub id: String,
    /// Absolute path of the directory to watch.
    pub source: PathBuf,
    /// Destination locator: a local path, `file:///path` or `s3://bucket/prefix`.
    pub destination: String,
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default)]
    pub minimum_age_secs: u64,
    /// Remove source files once they have been transferred.
    #[serde(default)]
    pub delete_source: bool,
    #[serde(default)]
    pub sync_on_start: bool,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Remove destination files that no longer exist at the source.
    #[serde(default, skip_serializing_if = "is_false")]
    pub delete_extraneous: bool,
}

fn default_debounce_secs() -> u64 {
    DEFAULT_DEBOUNCE_SECS
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl WatchDefinition {
    pub fn new(id: impl Into<String>, source: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            destination: destination.into(),
            debounce_secs: DEFAULT_DEBOUNCE_SECS,
            minimum_age_secs: 0,
            delete_source: false,
            sync_on_start: false,
            exclude: Vec::new(),
            delete_extraneous: false,
        }
    }

    pub fn with_debounce_secs(mut self, secs: u64) -> Self {
        self.debounce_secs = secs;
        self
    }

    pub fn with_minimum_age_secs(mut self, secs: u64) -> Self {
        self.minimum_age_secs = secs;
        self
    }

    pub fn with_delete_source(mut self, delete: bool) -> Self {
        self.delete_source = delete;
        self
    }

    pub fn with_sync_on_start(mut self, sync: bool) -> Self {
        self.sync_on_start = sync;
        self
    }

    pub fn with_exclude(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.exclude = patterns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delete_extraneous(mut self, delete: bool) -> Self {
        self.delete_extraneous = delete;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn minimum_age(&self) -> Duration {
        Duration::from_secs(self.minimum_age_secs)
    }

    pub fn excludes(&self) -> Result<ExcludeSet> {
        ExcludeSet::new(&self.exclude)
    }

    /// Checks that don't need the filesystem or any other watch.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| exn::Exn::from(ErrorKind::InvalidDefinition(format!("{}: {reason}", self.id)));
        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        if !self.source.is_absolute() {
            return Err(invalid("source must be an absolute path"));
        }
        if self.destination.trim().is_empty() {
            return Err(invalid("destination must not be empty"));
        }
        if self.delete_source && self.delete_extraneous {
            return Err(invalid("delete_source and delete_extraneous are mutually exclusive"));
        }
        self.excludes()?;
        Ok(())
    }
}
