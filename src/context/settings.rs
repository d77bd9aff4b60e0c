//! Process configuration reader.
//!
//! Values are read once at startup from the environment (or supplied
//! explicitly in tests) and never reloaded.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const API_REQUESTS_PER_HOUR: &str = "API_REQUESTS_PER_HOUR";
pub const API_RETRY: &str = "API_RETRY";
pub const API_TIMEOUT: &str = "API_TIMEOUT";
pub const PIPELINE_MAX_PARALLEL: &str = "PIPELINE_MAX_PARALLEL";
pub const PIPELINE_FAIL_FAST: &str = "PIPELINE_FAIL_FAST";
pub const PROGRESS_CHANNEL_CAPACITY: &str = "PROGRESS_CHANNEL_CAPACITY";
pub const DB_URL: &str = "DB_URL";
pub const REMOTE_PLUGIN_DIR: &str = "REMOTE_PLUGIN_DIR";
pub const PIPEFORGE_PLUGINS: &str = "PIPEFORGE_PLUGINS";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration value: {0}")]
    Missing(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Parse a raw configuration value.
pub fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse a raw configuration value as a boolean.
pub fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

/// Immutable key/value configuration handed to every execution context.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    values: HashMap<String, String>,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            values: std::env::vars().collect(),
        }
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Returns a copy with `key` overridden.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.get_str(key)
            .map(|v| parse_env_value(v, key))
            .transpose()
    }

    pub fn get_or<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        Ok(self.get_parsed(key)?.unwrap_or(default))
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get_str(key) {
            Some(v) => parse_env_bool(v, key),
            None => Ok(default),
        }
    }

    /// Reads a whole number of seconds.
    pub fn get_duration_secs(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        Ok(self
            .get_parsed::<u64>(key)?
            .map(Duration::from_secs)
            .unwrap_or(default))
    }

    /// Reads a comma-separated list, skipping blanks.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get_str(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}
