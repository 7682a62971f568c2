//! Bus configuration.
//!
//! Aggregates connection, exchange, and consumer settings into a single
//! [`BusConfig`] that can be loaded from a YAML file or environment
//! variables. Exchange names and the per-message processing timeout honor
//! the broker-facing environment variables regardless of config file
//! contents.

use std::time::Duration;

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "protobus.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PROTOBUS_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PROTOBUS";

/// Environment variable overriding the main (requests) exchange name.
pub const BUS_EXCHANGE_ENV_VAR: &str = "BUS_EXCHANGE_NAME";
/// Environment variable overriding the callbacks exchange name.
pub const CALLBACKS_EXCHANGE_ENV_VAR: &str = "CALLBACKS_EXCHANGE_NAME";
/// Environment variable overriding the events exchange name.
pub const EVENTS_EXCHANGE_ENV_VAR: &str = "EVENTS_EXCHANGE_NAME";
/// Environment variable overriding the per-message processing timeout (ms).
pub const MESSAGE_TIMEOUT_ENV_VAR: &str = "MESSAGE_PROCESSING_TIMEOUT";

/// Default name of the main topic exchange carrying RPC requests.
pub const DEFAULT_BUS_EXCHANGE: &str = "proto.bus";
/// Default name of the direct exchange carrying RPC replies.
pub const DEFAULT_CALLBACKS_EXCHANGE: &str = "proto.bus.callback";
/// Default name of the topic exchange carrying events.
pub const DEFAULT_EVENTS_EXCHANGE: &str = "proto.bus.events";
/// Default per-message processing timeout in milliseconds.
pub const DEFAULT_MESSAGE_TIMEOUT_MS: u64 = 600_000;

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

/// Main bus configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Exchange names.
    pub exchanges: ExchangeConfig,
    /// Reconnection behavior.
    pub reconnect: ReconnectConfig,
    /// Per-message processing timeout in milliseconds.
    pub message_timeout_ms: u64,
    /// Directories scanned recursively for `.proto` schema files.
    pub schema_dirs: Vec<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            exchanges: ExchangeConfig::default(),
            reconnect: ReconnectConfig::default(),
            message_timeout_ms: DEFAULT_MESSAGE_TIMEOUT_MS,
            schema_dirs: Vec::new(),
        }
    }
}

impl BusConfig {
    /// Load configuration from file and environment.
    ///
    /// Sources, later overrides earlier:
    /// 1. `protobus.yaml` in the current directory (if present)
    /// 2. File specified by `path` (if provided)
    /// 3. File specified by `PROTOBUS_CONFIG` (if set)
    /// 4. Environment variables with the `PROTOBUS` prefix
    /// 5. The broker-facing variables (`BUS_EXCHANGE_NAME`, ...)
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let loaded = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: BusConfig = loaded.try_deserialize()?;
        Ok(config.apply_env())
    }

    /// Apply the broker-facing environment variables on top of whatever the
    /// file and prefixed environment produced.
    pub fn apply_env(mut self) -> Self {
        if let Ok(name) = std::env::var(BUS_EXCHANGE_ENV_VAR) {
            if !name.is_empty() {
                self.exchanges.requests = name;
            }
        }
        if let Ok(name) = std::env::var(CALLBACKS_EXCHANGE_ENV_VAR) {
            if !name.is_empty() {
                self.exchanges.callbacks = name;
            }
        }
        if let Ok(name) = std::env::var(EVENTS_EXCHANGE_ENV_VAR) {
            if !name.is_empty() {
                self.exchanges.events = name;
            }
        }
        if let Ok(raw) = std::env::var(MESSAGE_TIMEOUT_ENV_VAR) {
            match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => self.message_timeout_ms = ms,
                _ => tracing::warn!(
                    value = %raw,
                    "ignoring unparseable MESSAGE_PROCESSING_TIMEOUT"
                ),
            }
        }
        self
    }

    /// Per-message processing timeout as a [`Duration`].
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

/// Names of the three exchanges the bus declares.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Main topic exchange for RPC requests.
    pub requests: String,
    /// Direct exchange for RPC replies.
    pub callbacks: String,
    /// Topic exchange for events.
    pub events: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            requests: DEFAULT_BUS_EXCHANGE.to_string(),
            callbacks: DEFAULT_CALLBACKS_EXCHANGE.to_string(),
            events: DEFAULT_EVENTS_EXCHANGE.to_string(),
        }
    }
}

/// Reconnection behavior after a transport loss.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Maximum reconnect attempts. Zero means unbounded.
    pub max_retries: u32,
    /// Delay before the first reconnect attempt.
    pub initial_delay_ms: u64,
    /// Cap applied to the exponential delay.
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Redelivery policy for a consumer queue.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryOptions {
    /// Retry attempts before a message is dead-lettered. Zero disables
    /// retry entirely.
    pub max_retries: u32,
    /// Time a failed message waits in the retry queue before redelivery.
    pub retry_delay_ms: u64,
    /// Optional per-queue TTL applied to the service queue itself.
    #[serde(default)]
    pub message_ttl_ms: Option<u64>,
}

/// Per-service consumer options.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceOptions {
    /// Upper bound on concurrently processed messages. Applied as the
    /// channel prefetch when acknowledgements are deferred.
    pub max_concurrent: Option<u16>,
    /// Retry and dead-letter policy. Enabling it switches the consumer to
    /// deferred acknowledgement.
    pub retry: Option<RetryOptions>,
}

impl ServiceOptions {
    /// Effective concurrency bound.
    pub fn concurrency(&self) -> u16 {
        self.max_concurrent.unwrap_or(1).max(1)
    }

    /// Whether acknowledgements are deferred until the handler finishes.
    pub fn late_ack(&self) -> bool {
        self.retry.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = BusConfig::default();
        assert_eq!(config.url, "amqp://localhost:5672");
        assert_eq!(config.exchanges.requests, "proto.bus");
        assert_eq!(config.exchanges.callbacks, "proto.bus.callback");
        assert_eq!(config.exchanges.events, "proto.bus.events");
        assert_eq!(config.message_timeout_ms, 600_000);
        assert_eq!(config.reconnect.max_retries, 10);
        assert_eq!(config.reconnect.initial_delay_ms, 1_000);
        assert_eq!(config.reconnect.max_delay_ms, 30_000);
        assert_eq!(config.reconnect.backoff_multiplier, 2.0);
    }

    #[test]
    #[serial]
    fn test_exchange_env_overrides() {
        std::env::set_var(BUS_EXCHANGE_ENV_VAR, "custom.bus");
        std::env::set_var(MESSAGE_TIMEOUT_ENV_VAR, "1500");

        let config = BusConfig::default().apply_env();
        assert_eq!(config.exchanges.requests, "custom.bus");
        assert_eq!(config.message_timeout_ms, 1_500);
        // Untouched names keep their defaults.
        assert_eq!(config.exchanges.events, "proto.bus.events");

        std::env::remove_var(BUS_EXCHANGE_ENV_VAR);
        std::env::remove_var(MESSAGE_TIMEOUT_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_invalid_timeout_is_ignored() {
        std::env::set_var(MESSAGE_TIMEOUT_ENV_VAR, "soon");
        let config = BusConfig::default().apply_env();
        assert_eq!(config.message_timeout_ms, DEFAULT_MESSAGE_TIMEOUT_MS);
        std::env::remove_var(MESSAGE_TIMEOUT_ENV_VAR);
    }

    #[test]
    fn test_service_options() {
        let plain = ServiceOptions::default();
        assert_eq!(plain.concurrency(), 1);
        assert!(!plain.late_ack());

        let with_retry = ServiceOptions {
            max_concurrent: Some(8),
            retry: Some(RetryOptions {
                max_retries: 3,
                retry_delay_ms: 100,
                message_ttl_ms: None,
            }),
        };
        assert_eq!(with_retry.concurrency(), 8);
        assert!(with_retry.late_ack());
    }
}
