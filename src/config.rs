//! Configuration for the connectivity layer
//!
//! [`ConnectivityConfig`] is loaded from TOML and validated before anything
//! touches the network. [`SpecificConfig`] merges the broker-specific option
//! map of a [`Connection`] with defaults derived from its URI; unknown keys and
//! unparsable values are rejected here, never at connect time.

use crate::client::publisher::backoff::MAX_WINDOW;
use crate::model::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectivityConfig {
    pub connection: Connection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub publisher: PublisherSection,
    #[serde(default)]
    pub consumer: ConsumerSection,
}

/// Supervisor timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    /// How long the supervisor waits for the worker to connect
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub test_timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            test_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ClientSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    pub fn test_timeout(&self) -> Duration {
        Duration::from_millis(self.test_timeout_ms)
    }
}

/// Publisher queue and producer backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublisherSection {
    /// Items waiting for a send slot
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Maximum concurrent in-flight sends
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl Default for PublisherSection {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            parallelism: default_parallelism(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl PublisherSection {
    /// Total items the publisher holds before dropping new ones
    pub fn capacity(&self) -> usize {
        self.max_queue_size + self.parallelism
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::InvalidConfig(
                "publisher.parallelism must be at least 1".to_string(),
            ));
        }
        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "publisher backoff must satisfy 0 < initial ({}) <= max ({})",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        if u128::from(self.backoff_max_ms) > MAX_WINDOW.as_millis() {
            return Err(ConfigError::InvalidConfig(format!(
                "publisher.backoff_max_ms must not exceed {}",
                MAX_WINDOW.as_millis()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerSection {
    /// Consecutive failed listener installations before a consumer gives up
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            max_recovery_attempts: default_max_recovery_attempts(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_disconnect_timeout_ms() -> u64 {
    5_000
}

fn default_max_queue_size() -> usize {
    10
}

fn default_parallelism() -> usize {
    1
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_max_recovery_attempts() -> u32 {
    3
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid connection ID format: {0}")]
    InvalidConnectionId(String),
    #[error("Invalid connection: {0}")]
    InvalidConnection(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Invalid URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("Invalid specific config '{key}': {reason}")]
    InvalidSpecificConfig { key: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConnectivityConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ConnectivityConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.connection.validate()?;
        SpecificConfig::resolve(&self.connection)?;
        self.publisher.validate()?;
        Ok(())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[connection]
id = "test-connection"
uri = "amqp://localhost:5672"

[[connection.sources]]
addresses = ["telemetry"]
consumer_count = 2

[[connection.targets]]
address = "events/{{ entity:id }}"
topics = ["*"]
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Reconnection pacing used by broker adapters with failover enabled
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after the pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::doubling(100, 30_000, None)
    }
}

impl ReconnectConfig {
    /// Pattern doubling from `initial_ms` until `max_ms`, then sustained at `max_ms`
    pub fn doubling(initial_ms: u64, max_ms: u64, max_attempts: Option<u32>) -> Self {
        let mut backoff_pattern = Vec::new();
        let mut delay = initial_ms.max(1);
        while delay < max_ms {
            backoff_pattern.push(delay);
            delay = delay.saturating_mul(2);
        }
        Self {
            max_attempts,
            backoff_pattern,
            sustained_delay: max_ms.max(1),
        }
    }

    /// Backoff delay for the given 1-based attempt
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }

    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

/// Broker options after merging URI defaults with the specific-config map
#[derive(Debug, Clone, PartialEq)]
pub struct SpecificConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub clean_start: bool,
    pub connect_timeout: Duration,
    /// Capacity of the adapter's request buffer
    pub receive_buffer: usize,
    /// Present only when failover is enabled
    pub reconnect: Option<ReconnectConfig>,
}

/// Keys accepted in [`Connection::specific_config`]
pub const SPECIFIC_CONFIG_KEYS: &[&str] = &[
    "username",
    "password",
    "keep-alive-secs",
    "clean-start",
    "connect-timeout-ms",
    "receive-buffer",
    "failover.initial-reconnect-delay-ms",
    "failover.max-reconnect-delay-ms",
    "failover.max-reconnect-attempts",
];

impl SpecificConfig {
    pub fn resolve(connection: &Connection) -> Result<Self, ConfigError> {
        let url = Url::parse(&connection.uri).map_err(|e| ConfigError::InvalidUri {
            uri: crate::error::sanitize_error_message(&connection.uri),
            reason: e.to_string(),
        })?;

        if let Some(key) = connection
            .specific_config
            .keys()
            .find(|k| !SPECIFIC_CONFIG_KEYS.contains(&k.as_str()))
        {
            return Err(ConfigError::InvalidSpecificConfig {
                key: key.clone(),
                reason: "unknown key".to_string(),
            });
        }

        let scheme = url.scheme();
        let tls = matches!(scheme, "amqps" | "mqtts" | "ssl");
        let default_port = match scheme {
            "mqtt" => 1883,
            "mqtts" => 8883,
            "amqps" | "ssl" => 5671,
            _ => 5672,
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidUri {
                uri: crate::error::sanitize_error_message(&connection.uri),
                reason: "missing host".to_string(),
            })?
            .to_string();

        let uri_username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let uri_password = url.password().map(str::to_string);

        let options = &connection.specific_config;
        let get = |key: &str| options.get(key).map(String::as_str);

        let reconnect = if connection.failover_enabled {
            let initial_key = "failover.initial-reconnect-delay-ms";
            let max_key = "failover.max-reconnect-delay-ms";
            let attempts_key = "failover.max-reconnect-attempts";

            let initial = parse_or(get(initial_key), initial_key, 100u64)?;
            let max = parse_or(get(max_key), max_key, 30_000u64)?;
            let attempts = parse_opt::<u32>(get(attempts_key), attempts_key)?;
            if initial == 0 || initial > max {
                return Err(ConfigError::InvalidSpecificConfig {
                    key: "failover.initial-reconnect-delay-ms".to_string(),
                    reason: format!("must be between 1 and max delay {max}"),
                });
            }
            Some(ReconnectConfig::doubling(initial, max, attempts))
        } else {
            None
        };

        Ok(Self {
            host,
            port: url.port().unwrap_or(default_port),
            tls,
            username: get("username").map(str::to_string).or(uri_username),
            password: get("password").map(str::to_string).or(uri_password),
            keep_alive: Duration::from_secs(parse_or(
                get("keep-alive-secs"),
                "keep-alive-secs",
                60u64,
            )?),
            clean_start: parse_or(get("clean-start"), "clean-start", false)?,
            connect_timeout: Duration::from_millis(parse_or(
                get("connect-timeout-ms"),
                "connect-timeout-ms",
                10_000u64,
            )?),
            receive_buffer: parse_or(get("receive-buffer"), "receive-buffer", 64usize)?,
            reconnect,
        })
    }
}

fn parse_opt<T>(value: Option<&str>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::InvalidSpecificConfig {
                    key: key.to_string(),
                    reason: format!("'{v}': {e}"),
                })
        })
        .transpose()
}

fn parse_or<T>(value: Option<&str>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    Ok(parse_opt(value, key)?.unwrap_or(default))
}
