//! Turning destination strings into backends.
//!
//! A [`Locator`] is the parsed form of something like `s3://bucket/prefix`,
//! `file:///mnt/archive` or just `/mnt/archive`. The [`BackendRegistry`]
//! maps each scheme to a factory that builds the backend and decides which
//! part of the locator becomes the sync prefix.

use crate::backend::LocalBackend;
use crate::error::{ErrorKind, Result};
use crate::BackendHandle;
use exn::OptionExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Parsed backend locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    /// Lowercase scheme (`file`, `s3`, ...).
    pub scheme: String,
    /// Bucket or host; always `None` for `file`.
    pub host: Option<String>,
    /// Absolute for `file`, relative (possibly empty) for everything else.
    pub path: PathBuf,
}

impl Locator {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let Some((scheme, rest)) = input.split_once("://") else {
            // Bare paths are only accepted when absolute.
            let path = Path::new(input);
            if !path.is_absolute() {
                exn::bail!(ErrorKind::InvalidLocator(input.to_string()));
            }
            return Ok(Self::local(path));
        };
        let scheme = scheme.to_ascii_lowercase();
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
            exn::bail!(ErrorKind::InvalidLocator(input.to_string()));
        }
        if scheme == "file" {
            // `file:///abs/path`; the (empty) authority is the first `/`.
            if !rest.starts_with('/') {
                exn::bail!(ErrorKind::InvalidLocator(input.to_string()));
            }
            return Ok(Self::local(rest));
        }
        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        if host.is_empty() {
            exn::bail!(ErrorKind::InvalidLocator(input.to_string()));
        }
        Ok(Self {
            scheme,
            host: Some(host.to_string()),
            path: PathBuf::from(path),
        })
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            scheme: "file".to_string(),
            host: None,
            path: path.into(),
        }
    }
}

impl FromStr for Locator {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Some(host) if self.path.as_os_str().is_empty() => write!(f, "{}://{host}", self.scheme),
            Some(host) => write!(f, "{}://{host}/{}", self.scheme, self.path.display()),
            None => write!(f, "{}://{}", self.scheme, self.path.display()),
        }
    }
}

/// A backend together with the prefix a sync should operate beneath.
#[derive(Clone)]
pub struct Location {
    pub backend: BackendHandle,
    pub prefix: Option<PathBuf>,
}

impl Location {
    pub fn new(backend: BackendHandle, prefix: Option<PathBuf>) -> Self {
        Self { backend, prefix }
    }

    /// Whole-backend location.
    pub fn root(backend: BackendHandle) -> Self {
        Self::new(backend, None)
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Location")
            .field("backend", &self.backend.name())
            .field("prefix", &self.prefix)
            .finish()
    }
}

/// Connection settings for one S3 bucket.
#[derive(Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub region: String,
    pub endpoint: Option<String>,
    pub key_id: String,
    pub key_secret: String,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("key_id", &self.key_id)
            .field("key_secret", &"<redacted>")
            .finish()
    }
}

type Factory = Arc<dyn Fn(Locator) -> BoxFuture<'static, Result<Location>> + Send + Sync>;

/// Scheme to backend factory mapping.
///
/// ```
/// use ferry_storage::{BackendRegistry, Locator};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let dir = std::env::temp_dir().join("ferry-registry-doctest");
/// let registry = BackendRegistry::local();
/// let location = registry.resolve(&Locator::local(&dir)).await?;
/// assert!(location.prefix.is_none());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<String, Factory>,
}

impl BackendRegistry {
    /// Registry that only knows about the local filesystem.
    pub fn local() -> Self {
        Self::default().register("file", |locator: Locator| {
            Box::pin(async move {
                let backend = LocalBackend::new(locator.to_string(), &locator.path)?;
                Ok(Location::root(Arc::new(backend)))
            })
        })
    }

    /// Add S3 support; buckets without settings fail to resolve.
    #[cfg(feature = "s3")]
    pub fn with_s3(self, settings: HashMap<String, S3Settings>) -> Self {
        let settings = Arc::new(settings);
        self.register("s3", move |locator: Locator| {
            let settings = settings.clone();
            Box::pin(async move {
                let bucket = locator
                    .host
                    .clone()
                    .ok_or_raise(|| ErrorKind::InvalidLocator(locator.to_string()))?;
                let config = settings.get(&bucket).ok_or_raise(|| {
                    ErrorKind::BackendError(format!("no settings configured for bucket `{bucket}`"))
                })?;
                let backend = crate::backend::S3Backend::new(
                    format!("s3://{bucket}"),
                    &bucket,
                    None,
                    &config.region,
                    config.endpoint.clone(),
                    &config.key_id,
                    &config.key_secret,
                )
                .await?;
                let prefix = crate::validate_prefix(Some(&locator.path))?;
                Ok(Location::new(Arc::new(backend), prefix))
            })
        })
    }

    /// Register (or replace) the factory for a scheme.
    pub fn register<F>(mut self, scheme: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Locator) -> BoxFuture<'static, Result<Location>> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.into().to_ascii_lowercase(), Arc::new(factory));
        self
    }

    pub fn supports(&self, scheme: &str) -> bool {
        self.factories.contains_key(&scheme.to_ascii_lowercase())
    }

    pub async fn resolve(&self, locator: &Locator) -> Result<Location> {
        let factory = self
            .factories
            .get(&locator.scheme)
            .ok_or_raise(|| ErrorKind::UnsupportedScheme(locator.scheme.clone()))?;
        tracing::debug!(locator = %locator, "Resolving backend");
        factory(locator.clone()).await
    }
}
