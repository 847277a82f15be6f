// Application and endpoint configuration models
// Owned by an external configuration cache, read-only at dispatch time

//! # Configuration Models
//!
//! Every producer application is described by an `AppConfig`. It declares
//! which broker transport it uses and carries one `MessageConfig` per message
//! code. Each `MessageConfig` lists the business endpoints (`CallbackConfig`)
//! that must eventually receive the message.

use serde::{Deserialize, Serialize};

/// Broker transport declared by an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    Nats,
    RabbitMq,
    Kafka,
}

impl std::fmt::Display for TransportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportType::Nats => write!(f, "nats"),
            TransportType::RabbitMq => write!(f, "rabbitmq"),
            TransportType::Kafka => write!(f, "kafka"),
        }
    }
}

/// Per-application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub app_id: String,
    pub transport: TransportType,
    #[serde(default)]
    pub message_configs: Vec<MessageConfig>,
}

impl AppConfig {
    pub fn new(app_id: impl Into<String>, transport: TransportType) -> Self {
        Self {
            app_id: app_id.into(),
            transport,
            message_configs: Vec::new(),
        }
    }

    /// Add (or replace) the configuration for one message code
    pub fn with_message_config(mut self, config: MessageConfig) -> Self {
        self.message_configs.retain(|existing| existing.code != config.code);
        self.message_configs.push(config);
        self
    }

    /// Look up the configuration for a message code
    pub fn message_config(&self, code: &str) -> Option<&MessageConfig> {
        self.message_configs.iter().find(|config| config.code == code)
    }
}

/// Per-message-code settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageConfig {
    pub code: String,

    /// Disabled codes are rejected at publish time
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Whether accepted messages are written to the message log
    #[serde(default = "default_true")]
    pub enable_log: bool,

    /// Business endpoints, in declaration order
    #[serde(default)]
    pub callbacks: Vec<CallbackConfig>,
}

impl MessageConfig {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            enabled: true,
            enable_log: true,
            callbacks: Vec::new(),
        }
    }

    pub fn with_callback(mut self, callback: CallbackConfig) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn with_log(mut self, enable_log: bool) -> Self {
        self.enable_log = enable_log;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Callback targets that should receive deliveries
    pub fn active_callbacks(&self) -> impl Iterator<Item = &CallbackConfig> {
        self.callbacks.iter().filter(|callback| callback.enabled)
    }

    /// Find a callback target by its key
    pub fn callback(&self, callback_key: &str) -> Option<&CallbackConfig> {
        self.callbacks
            .iter()
            .find(|callback| callback.callback_key == callback_key)
    }
}

/// One business endpoint
///
/// `callback_key` selects the concurrency budget in the semaphore registry,
/// so every message routed to the same endpoint shares the same permits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub callback_key: String,
    pub url: String,

    /// Media type without charset, e.g. `application/x-www-form-urlencoded`
    #[serde(default)]
    pub content_type: Option<String>,

    /// Socket timeout for one delivery, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Permit count for this endpoint, overrides the registry default
    #[serde(default)]
    pub max_concurrency: Option<usize>,
}

impl CallbackConfig {
    pub fn new(callback_key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            callback_key: callback_key.into(),
            url: url.into(),
            content_type: None,
            timeout_ms: default_timeout_ms(),
            enabled: true,
            max_concurrency: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_concurrency(mut self, permits: usize) -> Self {
        self.max_concurrency = Some(permits);
        self
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    5000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_config() -> AppConfig {
        AppConfig::new("trading", TransportType::Nats).with_message_config(
            MessageConfig::new("order_paid")
                .with_callback(CallbackConfig::new("trading_order_paid_c1", "http://a/notify"))
                .with_callback(CallbackConfig {
                    enabled: false,
                    ..CallbackConfig::new("trading_order_paid_c2", "http://b/notify")
                }),
        )
    }

    #[test]
    fn test_message_config_lookup() {
        let app = order_config();
        assert!(app.message_config("order_paid").is_some());
        assert!(app.message_config("order_refunded").is_none());
    }

    #[test]
    fn test_with_message_config_replaces_same_code() {
        let app = order_config().with_message_config(MessageConfig::new("order_paid").disabled());
        assert_eq!(app.message_configs.len(), 1);
        assert!(!app.message_config("order_paid").unwrap().enabled);
    }

    #[test]
    fn test_active_callbacks_skip_disabled() {
        let app = order_config();
        let config = app.message_config("order_paid").unwrap();
        let keys: Vec<_> = config
            .active_callbacks()
            .map(|c| c.callback_key.as_str())
            .collect();
        assert_eq!(keys, vec!["trading_order_paid_c1"]);
        assert!(config.callback("trading_order_paid_c2").is_some());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let json = serde_json::json!({
            "app_id": "trading",
            "transport": "nats",
            "message_configs": [{
                "code": "order_paid",
                "callbacks": [{ "callback_key": "k1", "url": "http://a/notify" }]
            }]
        });
        let app: AppConfig = serde_json::from_value(json).unwrap();
        let config = app.message_config("order_paid").unwrap();
        assert!(config.enabled);
        assert!(config.enable_log);
        assert_eq!(config.callbacks[0].timeout_ms, 5000);
        assert!(config.callbacks[0].content_type.is_none());
    }
}
