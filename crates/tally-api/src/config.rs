use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub api_token: String,
    /// Where the authoritative image lives; `None` keeps it in memory
    pub data_dir: Option<PathBuf>,
    pub origin: String,
    pub executor_timeout: Duration,
    pub executor_max_pending: usize,
    /// Statements per batch read request
    pub max_batch_statements: usize,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("api_token", &"[REDACTED]")
            .field("data_dir", &self.data_dir)
            .field("origin", &self.origin)
            .field("executor_timeout", &self.executor_timeout)
            .field("executor_max_pending", &self.executor_max_pending)
            .field("max_batch_statements", &self.max_batch_statements)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "TALLY_API_BIND_ADDR", "127.0.0.1:8080");

        let api_token = required_trimmed(&lookup, "TALLY_API_TOKEN")?;
        if api_token.len() < 16 {
            return Err(ConfigError::Invalid(
                "TALLY_API_TOKEN must be at least 16 characters".to_string(),
            ));
        }

        let data_dir = optional_trimmed(&lookup, "TALLY_API_DATA_DIR").map(PathBuf::from);
        let origin = value_or_default(&lookup, "TALLY_API_ORIGIN", "remote");

        let executor_timeout_ms = value_or_default(&lookup, "TALLY_API_EXECUTOR_TIMEOUT_MS", "10000")
            .parse::<u64>()
            .map_err(|_| {
                ConfigError::Invalid(
                    "TALLY_API_EXECUTOR_TIMEOUT_MS must be an integer in [100, 120000]".to_string(),
                )
            })?;
        if !(100..=120_000).contains(&executor_timeout_ms) {
            return Err(ConfigError::Invalid(
                "TALLY_API_EXECUTOR_TIMEOUT_MS must be in [100, 120000]".to_string(),
            ));
        }

        let executor_max_pending = value_or_default(&lookup, "TALLY_API_MAX_PENDING", "256")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::Invalid("TALLY_API_MAX_PENDING must be a positive integer".to_string())
            })?;
        if executor_max_pending == 0 {
            return Err(ConfigError::Invalid(
                "TALLY_API_MAX_PENDING must be at least 1".to_string(),
            ));
        }

        let max_batch_statements = value_or_default(&lookup, "TALLY_API_MAX_BATCH", "64")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::Invalid("TALLY_API_MAX_BATCH must be an integer in [1, 1000]".to_string())
            })?;
        if !(1..=1_000).contains(&max_batch_statements) {
            return Err(ConfigError::Invalid(
                "TALLY_API_MAX_BATCH must be in [1, 1000]".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            api_token,
            data_dir,
            origin,
            executor_timeout: Duration::from_millis(executor_timeout_ms),
            executor_max_pending,
            max_batch_statements,
        })
    }

    #[cfg(test)]
    pub fn for_tests(api_token: &str) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            api_token: api_token.to_string(),
            data_dir: None,
            origin: "remote".to_string(),
            executor_timeout: Duration::from_secs(10),
            executor_max_pending: 256,
            max_batch_statements: 4,
        }
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
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

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn config_requires_api_token() {
        let map: HashMap<&str, &str> = HashMap::new();
        let err = AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("TALLY_API_TOKEN"));
    }

    #[test]
    fn config_rejects_short_tokens_and_bad_limits() {
        let mut map = HashMap::new();
        map.insert("TALLY_API_TOKEN", "short");
        assert!(AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string())).is_err());

        map.insert("TALLY_API_TOKEN", "a-long-enough-shared-token");
        map.insert("TALLY_API_MAX_BATCH", "0");
        assert!(AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string())).is_err());
    }

    #[test]
    fn config_defaults_and_redaction() {
        let mut map = HashMap::new();
        map.insert("TALLY_API_TOKEN", "sensitive-shared-token");
        map.insert("TALLY_API_DATA_DIR", " /var/lib/tally ");

        let config =
            AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string())).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/tally")));
        assert_eq!(config.executor_timeout, Duration::from_secs(10));

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-shared-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
