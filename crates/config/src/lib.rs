//! Layered configuration for ferry.
//!
//! Values come from compiled-in defaults, then an optional config file
//! (TOML, YAML or JSON, chosen by extension), then `FERRY_` environment
//! variables, each layer overriding the one before. Nested keys are
//! separated by a double underscore: `FERRY_SYNC__CONCURRENCY=8`.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::{OptionExt, ResultExt};
use ferry_storage::{BackendRegistry, S3Settings};
use ferry_sync::{DEFAULT_CONCURRENCY, DEFAULT_PROGRESS_INTERVAL, SyncOptions};
use ferry_watch::{DEFAULT_DEBOUNCE_SECS, DEFAULT_HISTORY, ManagerSettings, WatchDefinition, WatchStore};
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PREFIX: &str = "FERRY_";
const CONFIG_FILE: &str = "config.toml";
const STORE_FILE: &str = "watches.json";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub watch: WatchConfig,
    /// Connection settings per bucket name.
    pub s3: BTreeMap<String, S3Config>,
}

/// Transfer settings for every sync, whether started by a watch or not.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub concurrency: usize,
    /// Seconds one file transfer may take.
    pub transfer_timeout: Option<u64>,
    /// Bytes between progress reports.
    pub progress_interval: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY.get(),
            transfer_timeout: None,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Default debounce, in seconds, for new watches.
    pub debounce: u64,
    /// Default minimum file age, in seconds, for new watches.
    pub minimum_age: u64,
    /// Sync records kept per watch.
    pub history: usize,
    /// Where watch definitions are persisted. Defaults to the platform data
    /// directory.
    pub store: Option<PathBuf>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE_SECS,
            minimum_age: 0,
            history: DEFAULT_HISTORY.get(),
            store: None,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    pub region: String,
    /// Custom endpoint for S3-compatible services.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub key_id: String,
    pub key_secret: String,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("key_id", &self.key_id)
            .field("key_secret", &"<redacted>")
            .finish()
    }
}

impl From<&S3Config> for S3Settings {
    fn from(config: &S3Config) -> Self {
        Self {
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            key_id: config.key_id.clone(),
            key_secret: config.key_secret.clone(),
        }
    }
}

impl Config {
    /// Load defaults, then `file` (if given), then the environment.
    ///
    /// A file that is named explicitly must exist.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let config: Self = Self::figment(file)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the platform config file if there is one.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path()?;
        match path.exists() {
            true => Self::load(Some(&path)),
            false => Self::load(None),
        }
    }

    pub fn figment(file: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = file {
            if !path.is_file() {
                tracing::error!(path = %path.display(), "Config file not found");
                exn::bail!(ErrorKind::Load);
            }
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => figment.merge(Toml::file(path)),
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => exn::bail!(ErrorKind::Invalid(format!("unsupported config file format: {}", path.display()))),
            };
            tracing::debug!(path = %path.display(), "Using config file");
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// `<config dir>/config.toml` for the current platform.
    pub fn default_path() -> Result<PathBuf> {
        Ok(project_dirs()?.config_dir().join(CONFIG_FILE))
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.sync.concurrency == 0 {
            problems.push("sync.concurrency must be greater than 0");
        }
        if self.sync.transfer_timeout == Some(0) {
            problems.push("sync.transfer_timeout must be greater than 0");
        }
        if self.sync.progress_interval == 0 {
            problems.push("sync.progress_interval must be greater than 0");
        }
        if self.watch.history == 0 {
            problems.push("watch.history must be greater than 0");
        }
        if problems.is_empty() {
            return Ok(());
        }
        exn::bail!(ErrorKind::Invalid(problems.join(", ")))
    }

    /// Options for a one-off sync.
    pub fn sync_options(&self) -> SyncOptions {
        let mut options = SyncOptions::default()
            .with_concurrency(NonZeroUsize::new(self.sync.concurrency).unwrap_or(DEFAULT_CONCURRENCY))
            .with_progress_interval(self.sync.progress_interval);
        if let Some(secs) = self.sync.transfer_timeout {
            options = options.with_transfer_timeout(Duration::from_secs(secs));
        }
        options
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            history: NonZeroUsize::new(self.watch.history).unwrap_or(DEFAULT_HISTORY),
            concurrency: NonZeroUsize::new(self.sync.concurrency).unwrap_or(DEFAULT_CONCURRENCY),
            transfer_timeout: self.sync.transfer_timeout.map(Duration::from_secs),
            progress_interval: self.sync.progress_interval,
        }
    }

    /// A new watch definition carrying the configured defaults.
    pub fn watch_definition(
        &self,
        id: impl Into<String>,
        source: impl Into<PathBuf>,
        destination: impl Into<String>,
    ) -> WatchDefinition {
        WatchDefinition::new(id, source, destination)
            .with_debounce_secs(self.watch.debounce)
            .with_minimum_age_secs(self.watch.minimum_age)
    }

    pub fn watch_store(&self) -> Result<WatchStore> {
        let path = match &self.watch.store {
            Some(path) => path.clone(),
            None => project_dirs()?.data_dir().join(STORE_FILE),
        };
        Ok(WatchStore::new(path))
    }

    pub fn s3_settings(&self) -> HashMap<String, S3Settings> {
        self.s3.iter().map(|(bucket, config)| (bucket.clone(), config.into())).collect()
    }

    /// Every backend this build supports, configured from `self`.
    pub fn registry(&self) -> BackendRegistry {
        let registry = BackendRegistry::local();
        #[cfg(feature = "s3")]
        let registry = registry.with_s3(self.s3_settings());
        registry
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("", "", "ferry").ok_or_raise(|| ErrorKind::NoHomeDirectory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    #[test]
    fn test_defaults() {
        Jail::expect_with(|_| {
            let config = Config::load(None).unwrap();
            assert_eq!(config, Config::default());
            assert_eq!(config.sync.concurrency, 4);
            assert_eq!(config.sync.progress_interval, 1024 * 1024);
            assert_eq!(config.watch.debounce, 5);
            assert_eq!(config.watch.history, 50);
            Ok(())
        });
    }

    #[test]
    fn test_file_then_environment() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "ferry.toml",
                r#"
                [sync]
                concurrency = 2
                transfer_timeout = 600

                [watch]
                debounce = 10
                store = "/var/lib/ferry/watches.json"

                [s3.archive]
                region = "eu-west-1"
                endpoint = "http://localhost:9000"
                key_id = "AKIA"
                key_secret = "secret"
                "#,
            )?;
            jail.set_env("FERRY_SYNC__CONCURRENCY", "8");
            jail.set_env("FERRY_WATCH__MINIMUM_AGE", "30");

            let config = Config::load(Some(Path::new("ferry.toml"))).unwrap();
            assert_eq!(config.sync.concurrency, 8);
            assert_eq!(config.sync.transfer_timeout, Some(600));
            assert_eq!(config.watch.debounce, 10);
            assert_eq!(config.watch.minimum_age, 30);
            assert_eq!(config.watch.history, 50);
            assert_eq!(config.watch_store().unwrap().path(), Path::new("/var/lib/ferry/watches.json"));

            let settings = config.s3_settings();
            assert_eq!(settings["archive"].endpoint.as_deref(), Some("http://localhost:9000"));
            let debug = format!("{:?}", config.s3["archive"]);
            assert!(debug.contains("<redacted>") && !debug.contains("\"secret\""));
            Ok(())
        });
    }

    #[rstest]
    #[case("ferry.yaml", "sync:\n  concurrency: 3\n")]
    #[case("ferry.yml", "sync:\n  concurrency: 3\n")]
    #[case("ferry.json", r#"{"sync": {"concurrency": 3}}"#)]
    fn test_file_formats(#[case] name: &str, #[case] contents: &str) {
        Jail::expect_with(|jail| {
            jail.create_file(name, contents)?;
            assert_eq!(Config::load(Some(Path::new(name))).unwrap().sync.concurrency, 3);
            Ok(())
        });
    }

    #[test]
    fn test_missing_and_unsupported_files() {
        Jail::expect_with(|jail| {
            let err = Config::load(Some(Path::new("missing.toml"))).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Load));
            jail.create_file("ferry.ini", "concurrency=1")?;
            let err = Config::load(Some(Path::new("ferry.ini"))).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid(_)));
            Ok(())
        });
    }

    #[rstest]
    #[case("FERRY_SYNC__CONCURRENCY", "0")]
    #[case("FERRY_SYNC__TRANSFER_TIMEOUT", "0")]
    #[case("FERRY_SYNC__PROGRESS_INTERVAL", "0")]
    #[case("FERRY_WATCH__HISTORY", "0")]
    fn test_validation(#[case] key: &str, #[case] value: &str) {
        Jail::expect_with(|jail| {
            jail.set_env(key, value);
            let err = Config::load(None).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid(_)), "{err:?}");
            Ok(())
        });
    }

    #[test]
    fn test_type_errors_fail_to_load() {
        Jail::expect_with(|jail| {
            jail.set_env("FERRY_SYNC__CONCURRENCY", "lots");
            let err = Config::load(None).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Load));
            Ok(())
        });
    }

    #[test]
    fn test_conversions() {
        let mut config = Config::default();
        config.sync.concurrency = 6;
        config.sync.transfer_timeout = Some(90);
        config.watch.history = 7;
        config.watch.debounce = 2;
        config.watch.minimum_age = 12;

        let options = config.sync_options();
        assert_eq!(options.concurrency.get(), 6);
        assert_eq!(options.transfer_timeout, Some(Duration::from_secs(90)));
        assert!(!options.delete_extraneous);

        let settings = config.manager_settings();
        assert_eq!(settings.history.get(), 7);
        assert_eq!(settings.concurrency.get(), 6);

        let definition = config.watch_definition("a", "/data", "/backup");
        assert_eq!(definition.debounce_secs, 2);
        assert_eq!(definition.minimum_age_secs, 12);
        assert!(config.registry().supports("file"));
    }
}
