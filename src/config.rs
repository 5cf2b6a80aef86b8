//! Configuration system for the event subscriber
//!
//! Configuration is a TOML document with a mandatory `[subscriber]` section and
//! an optional `[timing]` section. Credentials are never stored in the file;
//! the file names the environment variables that hold them and they are
//! resolved at runtime.

use crate::subscriber::retry::RetryIntervalSequence;
use crate::transport::{BrokerEndpoint, Credentials};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main subscriber configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriberConfig {
    pub subscriber: SubscriberSection,
    #[serde(default)]
    pub timing: TimingSection,
}

/// Subscription target and broker candidates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriberSection {
    /// Topic to subscribe to; the last path segment of each received topic is the event name
    pub topic: String,
    /// Broker endpoints in failover priority order (`host:port` or `mqtt://host:port`)
    pub brokers: Vec<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    /// Prefix for generated MQTT client identifiers
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
}

/// Timeouts, probe cadence and reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingSection {
    /// Per-attempt connect timeout in seconds (default: 60)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Liveness probe period in seconds (default: 5)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Wait after each fully failed pass over the broker list, in seconds
    #[serde(default = "default_retry_intervals")]
    pub retry_intervals_secs: Vec<u64>,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            retry_intervals_secs: default_retry_intervals(),
        }
    }
}

fn default_client_id_prefix() -> String {
    "mb-subscriber".to_string()
}

fn default_connect_timeout() -> u64 {
    60
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_retry_intervals() -> Vec<u64> {
    vec![2, 2, 5, 5, 10, 10, 20, 20, 30, 30, 40, 40, 50, 50, 60]
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SubscriberConfig {
    /// Build a configuration programmatically with default timing
    pub fn new<S: Into<String>>(topic: S, brokers: Vec<String>) -> Self {
        Self {
            subscriber: SubscriberSection {
                topic: topic.into(),
                brokers,
                username_env: None,
                password_env: None,
                client_id_prefix: default_client_id_prefix(),
            },
            timing: TimingSection::default(),
        }
    }

    /// Load configuration from TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SubscriberConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section; endpoints and the retry list are parsed eagerly
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_topic(&self.subscriber.topic)?;
        self.endpoints()?;
        self.retry_sequence()?;

        if self.timing.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.timing.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.subscriber.password_env.is_some() && self.subscriber.username_env.is_none() {
            return Err(ConfigError::InvalidConfig(
                "password_env requires username_env".to_string(),
            ));
        }

        Ok(())
    }

    /// Parse the broker list, preserving failover order
    pub fn endpoints(&self) -> Result<Vec<BrokerEndpoint>, ConfigError> {
        if self.subscriber.brokers.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one broker endpoint is required".to_string(),
            ));
        }
        self.subscriber
            .brokers
            .iter()
            .map(|url| url.parse::<BrokerEndpoint>())
            .collect()
    }

    /// Build the reconnect backoff sequence from `retry_intervals_secs`
    pub fn retry_sequence(&self) -> Result<RetryIntervalSequence, ConfigError> {
        RetryIntervalSequence::from_secs(&self.timing.retry_intervals_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.timing.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.timing.heartbeat_interval_secs)
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Resolve broker credentials from the configured environment variables.
    ///
    /// Returns `None` when no username variable is configured or it is unset;
    /// a missing password resolves to an empty string.
    pub fn get_credentials(&self) -> Option<Credentials> {
        let username = Self::get_env_var_optional(self.subscriber.username_env.as_ref())?;
        let password =
            Self::get_env_var_optional(self.subscriber.password_env.as_ref()).unwrap_or_default();
        Some(Credentials::new(username, password))
    }
}

/// Reject topics MQTT never allows: empty, or containing NUL
fn validate_topic(topic: &str) -> Result<(), ConfigError> {
    if topic.is_empty() {
        return Err(ConfigError::InvalidConfig(
            "subscription topic must not be empty".to_string(),
        ));
    }
    if topic.contains('\0') {
        return Err(ConfigError::InvalidConfig(format!(
            "subscription topic {topic:?} must not contain NUL"
        )));
    }
    Ok(())
}
