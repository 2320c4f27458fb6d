//! Static configuration for control loops.
//!
//! The service reads an optional TOML file:
//!
//! ```toml
//! [controllers]
//! default_workers = 2
//! sync_poll_interval = "100ms"
//! shutdown_grace = "30s"
//!
//! [controllers.workers]
//! namespace-controller = 10
//!
//! [queue]
//! max_retries = 15
//!
//! [queue.backoff]
//! type = "exponential"
//! initial_delay = "5ms"
//! max_delay = "1000s"
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::BackoffConfig;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML was invalid.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range.
    #[error("invalid config: {0}")]
    Validation(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KilnConfig {
    /// Control-loop concurrency and timing.
    #[serde(default)]
    pub controllers: ControllersConfig,

    /// Work-queue retry policy.
    #[serde(default)]
    pub queue: QueueConfig,
}

impl KilnConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails
    /// validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controllers.default_workers == 0 {
            return Err(ConfigError::Validation(
                "controllers.default_workers must be at least 1".to_string(),
            ));
        }
        if let Some((unit, _)) = self.controllers.workers.iter().find(|(_, n)| **n == 0) {
            return Err(ConfigError::Validation(format!(
                "controllers.workers.{unit} must be at least 1"
            )));
        }
        if self.controllers.sync_poll_interval.is_zero() {
            return Err(ConfigError::Validation(
                "controllers.sync_poll_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Control-loop configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllersConfig {
    /// Workers for units that declare no default of their own.
    #[serde(default = "default_workers")]
    pub default_workers: usize,

    /// Per-unit worker overrides, keyed by unit name.
    #[serde(default)]
    pub workers: BTreeMap<String, usize>,

    /// Interval of the conjunctive "all sources synced" poll.
    #[serde(default = "default_sync_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub sync_poll_interval: Duration,

    /// How long shutdown waits for loops to exit.
    #[serde(default = "default_shutdown_grace")]
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

const fn default_workers() -> usize {
    2
}

const fn default_sync_poll_interval() -> Duration {
    Duration::from_millis(100)
}

const fn default_shutdown_grace() -> Duration {
    Duration::from_secs(30)
}

impl Default for ControllersConfig {
    fn default() -> Self {
        Self {
            default_workers: default_workers(),
            workers: BTreeMap::new(),
            sync_poll_interval: default_sync_poll_interval(),
            shutdown_grace: default_shutdown_grace(),
        }
    }
}

impl ControllersConfig {
    /// Worker count for `unit`: the configured override, else the unit's
    /// own default, else `default_workers`.
    #[must_use]
    pub fn workers_for(&self, unit: &str, unit_default: Option<usize>) -> usize {
        self.workers
            .get(unit)
            .copied()
            .or(unit_default)
            .unwrap_or(self.default_workers)
            .max(1)
    }
}

/// Work-queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Backoff between retries of a failing key.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Retries before a key is dropped until its next change.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

const fn default_max_retries() -> u32 {
    15
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_retries: default_max_retries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = KilnConfig::from_toml("").unwrap();
        assert_eq!(config, KilnConfig::default());
        assert_eq!(
            config.controllers.sync_poll_interval,
            Duration::from_millis(100)
        );
        assert_eq!(config.queue.max_retries, 15);
    }

    #[test]
    fn test_worker_overrides() {
        let config = KilnConfig::from_toml(
            r#"
            [controllers]
            default_workers = 3

            [controllers.workers]
            namespace-controller = 10
            "#,
        )
        .unwrap();

        let controllers = &config.controllers;
        assert_eq!(controllers.workers_for("namespace-controller", Some(5)), 10);
        assert_eq!(controllers.workers_for("quota-controller", Some(5)), 5);
        assert_eq!(controllers.workers_for("quota-controller", None), 3);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let err = KilnConfig::from_toml(
            r#"
            [controllers.workers]
            export-controller = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("export-controller")));

        let err = KilnConfig::from_toml("[controllers]\ndefault_workers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_durations_round_trip_through_toml() {
        let mut config = KilnConfig::default();
        config.controllers.shutdown_grace = Duration::from_secs(5);
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("shutdown_grace = \"5s\""));
        assert_eq!(KilnConfig::from_toml(&rendered).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kiln.toml");
        std::fs::write(&path, "[queue]\nmax_retries = 3\n").unwrap();
        assert_eq!(KilnConfig::from_file(&path).unwrap().queue.max_retries, 3);

        let missing = KilnConfig::from_file(&dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io(_)));
    }
}
