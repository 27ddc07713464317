//! Engine configuration.
//!
//! Loaded from `TALLY_*` environment variables. Parsing goes through a lookup
//! function so tests never touch the process environment.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::executor::{DirectoryModuleSource, ExecutorConfig, ImageStore, ModuleLoader, SchemaFlavor};
use crate::remote::HttpRemote;
use crate::sync::{RetryPolicy, SchedulerConfig};
use crate::util::is_http_url;

/// Settings for a device-side engine.
#[derive(Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Root for durable images; `None` keeps the local store in memory
    pub data_dir: Option<PathBuf>,
    /// Storage partition name for this device's image
    pub origin: String,
    pub remote_url: Option<String>,
    pub remote_token: Option<String>,
    pub remote_timeout: Duration,
    /// Trusted root for executor modules
    pub module_root: Option<PathBuf>,
    /// Allow-listed module loaded at boot
    pub engine_module: Option<String>,
    pub executor_timeout: Duration,
    pub executor_max_pending: usize,
    pub debounce: Duration,
    /// `None` disables periodic passes
    pub sync_interval: Option<Duration>,
    /// Periodic passes become full reconciliations this long after the last
    /// one; `None` keeps them incremental
    pub full_sync_interval: Option<Duration>,
    pub retry_max_attempts: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub poll_interval: Duration,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("EngineConfig")
            .field("data_dir", &self.data_dir)
            .field("origin", &self.origin)
            .field("remote_url", &self.remote_url)
            .field("remote_token", &self.remote_token.as_ref().map(|_| "[REDACTED]"))
            .field("remote_timeout", &self.remote_timeout)
            .field("module_root", &self.module_root)
            .field("engine_module", &self.engine_module)
            .field("executor_timeout", &self.executor_timeout)
            .field("executor_max_pending", &self.executor_max_pending)
            .field("debounce", &self.debounce)
            .field("sync_interval", &self.sync_interval)
            .field("full_sync_interval", &self.full_sync_interval)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("retry_initial_delay", &self.retry_initial_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            origin: "local".to_string(),
            remote_url: None,
            remote_token: None,
            remote_timeout: Duration::from_secs(15),
            module_root: None,
            engine_module: None,
            executor_timeout: Duration::from_secs(10),
            executor_max_pending: 256,
            debounce: Duration::from_secs(2),
            sync_interval: Some(Duration::from_secs(300)),
            full_sync_interval: Some(Duration::from_secs(24 * 60 * 60)),
            retry_max_attempts: 5,
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(60),
            poll_interval: Duration::from_secs(15),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let remote_url = optional_trimmed(&lookup, "TALLY_REMOTE_URL")
            .map(|value| value.trim_end_matches('/').to_string());
        if let Some(url) = remote_url.as_deref() {
            if !is_http_url(url) {
                return Err(Error::InvalidInput(
                    "TALLY_REMOTE_URL must start with http:// or https://".to_string(),
                ));
            }
        }

        let sync_interval_secs = parse_number(&lookup, "TALLY_SYNC_INTERVAL_SECS", 300_u64)?;
        let full_sync_interval_secs =
            parse_number(&lookup, "TALLY_FULL_SYNC_INTERVAL_SECS", 86_400_u64)?;
        let retry_max_attempts = parse_number(&lookup, "TALLY_SYNC_MAX_ATTEMPTS", defaults.retry_max_attempts)?;
        if retry_max_attempts == 0 {
            return Err(Error::InvalidInput(
                "TALLY_SYNC_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        let executor_max_pending =
            parse_number(&lookup, "TALLY_EXECUTOR_MAX_PENDING", defaults.executor_max_pending)?;
        if executor_max_pending == 0 {
            return Err(Error::InvalidInput(
                "TALLY_EXECUTOR_MAX_PENDING must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            data_dir: optional_trimmed(&lookup, "TALLY_DATA_DIR").map(PathBuf::from),
            origin: optional_trimmed(&lookup, "TALLY_ORIGIN").unwrap_or(defaults.origin),
            remote_url,
            remote_token: optional_trimmed(&lookup, "TALLY_REMOTE_TOKEN"),
            remote_timeout: Duration::from_secs(parse_number(&lookup, "TALLY_REMOTE_TIMEOUT_SECS", 15)?),
            module_root: optional_trimmed(&lookup, "TALLY_MODULE_ROOT").map(PathBuf::from),
            engine_module: optional_trimmed(&lookup, "TALLY_ENGINE_MODULE"),
            executor_timeout: Duration::from_millis(parse_number(&lookup, "TALLY_EXECUTOR_TIMEOUT_MS", 10_000)?),
            executor_max_pending,
            debounce: Duration::from_millis(parse_number(&lookup, "TALLY_SYNC_DEBOUNCE_MS", 2_000)?),
            sync_interval: (sync_interval_secs > 0).then(|| Duration::from_secs(sync_interval_secs)),
            full_sync_interval: (full_sync_interval_secs > 0)
                .then(|| Duration::from_secs(full_sync_interval_secs)),
            retry_max_attempts,
            retry_initial_delay: Duration::from_millis(parse_number(&lookup, "TALLY_SYNC_RETRY_INITIAL_MS", 1_000)?),
            retry_max_delay: Duration::from_millis(parse_number(&lookup, "TALLY_SYNC_RETRY_MAX_MS", 60_000)?),
            poll_interval: Duration::from_secs(parse_number(&lookup, "TALLY_POLL_INTERVAL_SECS", 15)?),
        })
    }

    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    #[must_use]
    pub fn with_remote(mut self, url: impl Into<String>, token: Option<String>) -> Self {
        self.remote_url = Some(url.into());
        self.remote_token = token;
        self
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Location of the local durable image, if persistence is enabled.
    pub fn image_store(&self) -> Option<ImageStore> {
        self.data_dir
            .as_ref()
            .map(|dir| ImageStore::for_origin(dir, &self.origin))
    }

    /// Executor settings for the device-side store.
    pub fn executor_config(&self) -> Result<ExecutorConfig> {
        let mut config = self.image_store().map_or_else(
            || ExecutorConfig::in_memory(SchemaFlavor::Local),
            |image| ExecutorConfig::durable(SchemaFlavor::Local, image),
        );
        config = config
            .with_timeout(self.executor_timeout)
            .with_max_pending(self.executor_max_pending);

        if let Some(root) = self.module_root.as_ref() {
            config = config.with_modules(ModuleLoader::new(Arc::new(DirectoryModuleSource::new(root))));
        }
        if let Some(module) = self.engine_module.as_ref() {
            if self.module_root.is_none() {
                return Err(Error::InvalidInput(
                    "TALLY_ENGINE_MODULE requires TALLY_MODULE_ROOT".to_string(),
                ));
            }
            config = config.with_engine_module(module.clone());
        }
        Ok(config)
    }

    /// Remote transport; disabled when no URL is configured.
    pub fn remote(&self) -> Result<HttpRemote> {
        HttpRemote::from_settings(
            self.remote_url.as_deref(),
            self.remote_token.as_deref(),
            self.remote_timeout,
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_max_attempts)
            .with_initial_delay(self.retry_initial_delay)
            .with_max_delay(self.retry_max_delay)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_debounce(self.debounce)
            .with_periodic_interval(self.sync_interval)
            .with_full_interval(self.full_sync_interval)
            .with_retry(self.retry_policy())
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T> {
    optional_trimmed(lookup, name).map_or(Ok(default), |value| {
        value
            .parse::<T>()
            .map_err(|_| Error::InvalidInput(format!("{name} must be a non-negative integer")))
    })
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
