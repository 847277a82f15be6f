// Gateway configuration
// Defaults, then an optional TOML file, then MESSAGEBUS__* environment variables

//! # Gateway Settings
//!
//! All tunables of the gateway live in [`GatewayConfig`]. Values are layered
//! with the `config` crate:
//!
//! 1. compiled-in defaults (`GatewayConfig::default()`)
//! 2. an optional file, `config/messagebus.toml` unless another path is given
//! 3. environment variables such as `MESSAGEBUS__HEALTH__RESET_WINDOW_MS=30000`
//!
//! Nested keys are separated by a double underscore so that field names
//! containing single underscores stay intact.

use std::path::Path;
use std::time::Duration;

use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Default location of the settings file
pub const DEFAULT_CONFIG_PATH: &str = "config/messagebus.toml";

/// Prefix of the environment variables that override settings
pub const ENV_PREFIX: &str = "MESSAGEBUS";

/// Complete gateway configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub nats: NatsSettings,
    pub health: HealthSettings,
    pub log_pool: LogPoolSettings,
    pub callback: CallbackSettings,
    pub worker: WorkerSettings,
    pub log_level: LogLevel,
}

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSettings {
    /// When false the gateway runs with in-memory producers only
    pub enabled: bool,
    pub urls: Vec<String>,
    pub stream_name: String,
    pub subject_prefix: String,
    pub publish_timeout_ms: u64,
    pub connection_timeout_ms: u64,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            urls: vec!["nats://localhost:4222".to_string()],
            stream_name: "MESSAGEBUS".to_string(),
            subject_prefix: "messagebus".to_string(),
            publish_timeout_ms: 3000,
            connection_timeout_ms: 10_000,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    /// How long the breaker stays broken after the last failure
    pub reset_window_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            reset_window_ms: 60_000,
        }
    }
}

impl HealthSettings {
    pub fn reset_window(&self) -> Duration {
        Duration::from_millis(self.reset_window_ms)
    }
}

/// Bounded pool used for best-effort message log writes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogPoolSettings {
    pub workers: usize,
    pub queue_depth: usize,
}

impl Default for LogPoolSettings {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_depth: 10_000,
        }
    }
}

/// Outbound callback settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackSettings {
    /// Permits per callback key unless the endpoint overrides it
    pub default_permits: usize,
    pub connect_timeout_ms: u64,
    /// Used when an endpoint is configured with a zero timeout
    pub default_socket_timeout_ms: u64,
    /// Longest response body kept as diagnostic context
    pub max_response_chars: usize,
    pub user_agent: String,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            default_permits: 20,
            connect_timeout_ms: 5000,
            default_socket_timeout_ms: 5000,
            max_response_chars: 1000,
            user_agent: format!("message-bus/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl CallbackSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Compensation worker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub enabled: bool,
    pub interval_ms: u64,
    pub batch_size: usize,
    /// Delay before retry n is `retry_backoff_ms * n`
    pub retry_backoff_ms: u64,
    pub max_retries: u32,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
            batch_size: 100,
            retry_backoff_ms: 30_000,
            max_retries: 10,
        }
    }
}

impl WorkerSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Log level used when `RUST_LOG` is not set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

impl GatewayConfig {
    /// Load settings from the default file location and the environment
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load settings from `path` (optional) and the environment
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&GatewayConfig::default())?)
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("nats.urls")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
