//! Configuration types for the rowstream runtime
//!
//! [`ApplicationConfig`] is assembled with figment from serde defaults, an
//! optional YAML file and `ROWSTREAM_` prefixed environment variables
//! (`__` separates nested keys, e.g. `ROWSTREAM_STATE__DIR`).

use crate::error::{ProcessorError, Result};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Legacy environment variable that overrides the consumer group
pub const LEGACY_CONSUMER_GROUP_ENV: &str = "Quix__Consumer_Group";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Bootstrap servers, comma separated
    #[serde(default = "default_broker_address")]
    pub broker_address: String,

    /// Consumer group id, also part of the state directory layout
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    /// Where to start when the group has no committed offset
    #[serde(default)]
    pub auto_offset_reset: AutoOffsetReset,

    /// Let the consumer commit stored offsets periodically
    #[serde(default = "default_true")]
    pub auto_commit_enable: bool,

    /// Partition assignment strategy passed to the group protocol
    #[serde(default = "default_assignment_strategy")]
    pub assignment_strategy: String,

    /// Upper bound for a single consumer poll
    #[serde(default = "default_consumer_poll_timeout_ms")]
    pub consumer_poll_timeout_ms: u64,

    /// Time spent servicing delivery reports per iteration
    #[serde(default)]
    pub producer_poll_timeout_ms: u64,

    /// Flush and close budget on shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Create missing changelog topics on startup
    #[serde(default = "default_true")]
    pub auto_create_topics: bool,

    /// Log level, `None` leaves logging setup to the caller
    #[serde(default = "default_loglevel")]
    pub loglevel: Option<String>,

    /// Local state configuration
    #[serde(default)]
    pub state: StateConfig,

    /// Extra librdkafka consumer properties
    #[serde(default)]
    pub consumer_extra_config: HashMap<String, String>,

    /// Extra librdkafka producer properties
    #[serde(default)]
    pub producer_extra_config: HashMap<String, String>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            broker_address: default_broker_address(),
            consumer_group: default_consumer_group(),
            auto_offset_reset: AutoOffsetReset::default(),
            auto_commit_enable: true,
            assignment_strategy: default_assignment_strategy(),
            consumer_poll_timeout_ms: default_consumer_poll_timeout_ms(),
            producer_poll_timeout_ms: 0,
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            auto_create_topics: true,
            loglevel: default_loglevel(),
            state: StateConfig::default(),
            consumer_extra_config: HashMap::new(),
            producer_extra_config: HashMap::new(),
        }
    }
}

impl ApplicationConfig {
    /// Load configuration from defaults, an optional YAML file and the environment
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(ApplicationConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }

        figment = figment.merge(Env::prefixed("ROWSTREAM_").split("__"));

        if let Ok(group) = std::env::var(LEGACY_CONSUMER_GROUP_ENV) {
            figment = figment.merge(Serialized::default("consumer_group", group));
        }

        let config: ApplicationConfig = figment
            .extract()
            .map_err(|e| ProcessorError::configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.broker_address.trim().is_empty() {
            return Err(ProcessorError::configuration(
                "broker_address must not be empty",
            ));
        }

        if self.consumer_group.trim().is_empty() {
            return Err(ProcessorError::configuration(
                "consumer_group must not be empty",
            ));
        }

        if self.consumer_poll_timeout_ms == 0 {
            return Err(ProcessorError::configuration(
                "consumer_poll_timeout_ms must be greater than 0",
            ));
        }

        if self.assignment_strategy.trim().is_empty() {
            return Err(ProcessorError::configuration(
                "assignment_strategy must not be empty",
            ));
        }

        self.state.validate()
    }

    pub fn consumer_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_timeout_ms)
    }

    pub fn producer_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.producer_poll_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Offset reset policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AutoOffsetReset {
    Earliest,
    #[default]
    Latest,
    Error,
}

impl AutoOffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoOffsetReset::Earliest => "earliest",
            AutoOffsetReset::Latest => "latest",
            AutoOffsetReset::Error => "error",
        }
    }
}

impl fmt::Display for AutoOffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Root directory for store partitions
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,

    /// Mirror store mutations into changelog topics
    #[serde(default = "default_true")]
    pub use_changelog_topics: bool,

    /// sled page cache per store partition, in bytes
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,

    /// sled background flush interval
    #[serde(default = "default_flush_every_ms")]
    pub flush_every_ms: u64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            use_changelog_topics: true,
            cache_capacity: default_cache_capacity(),
            flush_every_ms: default_flush_every_ms(),
        }
    }
}

impl StateConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dir.as_os_str().is_empty() {
            return Err(ProcessorError::configuration("state.dir must not be empty"));
        }

        if self.cache_capacity == 0 {
            return Err(ProcessorError::configuration(
                "state.cache_capacity must be greater than 0",
            ));
        }

        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_broker_address() -> String {
    "localhost:9092".to_string()
}

fn default_consumer_group() -> String {
    "rowstream-default".to_string()
}

fn default_assignment_strategy() -> String {
    "cooperative-sticky".to_string()
}

fn default_consumer_poll_timeout_ms() -> u64 {
    1000
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_loglevel() -> Option<String> {
    Some("INFO".to_string())
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_cache_capacity() -> u64 {
    64 * 1024 * 1024
}

fn default_flush_every_ms() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApplicationConfig::default();
        assert_eq!(config.consumer_group, "rowstream-default");
        assert_eq!(config.auto_offset_reset, AutoOffsetReset::Latest);
        assert_eq!(config.assignment_strategy, "cooperative-sticky");
        assert_eq!(config.consumer_poll_timeout(), Duration::from_secs(1));
        assert_eq!(config.producer_poll_timeout(), Duration::ZERO);
        assert_eq!(config.state.dir, PathBuf::from("state"));
        assert!(config.state.use_changelog_topics);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ApplicationConfig::default();
        config.consumer_poll_timeout_ms = 0;
        assert!(config.validate().is_err());

        config.consumer_poll_timeout_ms = 100;
        config.consumer_group = "  ".to_string();
        assert!(config.validate().is_err());

        config.consumer_group = "orders".to_string();
        config.state.cache_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rowstream.yaml");
        std::fs::write(
            &path,
            "consumer_group: orders\nauto_offset_reset: earliest\nstate:\n  dir: /var/lib/rowstream\n",
        )
        .unwrap();

        let config = ApplicationConfig::load(Some(&path)).unwrap();
        assert_eq!(config.consumer_group, "orders");
        assert_eq!(config.auto_offset_reset, AutoOffsetReset::Earliest);
        assert_eq!(config.state.dir, PathBuf::from("/var/lib/rowstream"));
        assert_eq!(config.broker_address, "localhost:9092");
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rowstream.yaml");
        std::fs::write(&path, "consumer_poll_timeout_ms: 0\n").unwrap();

        assert!(ApplicationConfig::load(Some(&path)).is_err());
    }
}
