// Message domain models - what producers submit to the bus

//! # Message Models
//!
//! This module defines the unit of work that flows through the gateway:
//! - `Message`: an immutable envelope submitted by a producer
//! - `MessageStatus`: where a logged message currently sits in the pipeline
//! - `ProcessStatus`: how far downstream processing of a logged message got
//!
//! ## Rust Learning Notes:
//!
//! ### Immutable Sharing
//! Once a message is accepted by the dispatcher it is wrapped in an `Arc`
//! and handed to several background tasks at once (log write, publish,
//! compensation). Nothing mutates it after submission, so plain shared
//! references are enough and no locking is needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message submitted by a producer
///
/// The identity fields decide how the message is routed:
/// - `app_id` selects an `AppConfig`
/// - `code` selects a `MessageConfig` inside that application
/// - `app_code` (`{app_id}_{code}`) names the broker route
///
/// `message_id` is the producer's own idempotency key while `uuid` is
/// generated by the bus and identifies this particular submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Application that produced the message
    pub app_id: String,

    /// Route name, always `{app_id}_{code}`
    pub app_code: String,

    /// Message code inside the application
    pub code: String,

    /// Producer supplied id, unique per application
    pub message_id: String,

    /// Bus generated business uuid
    pub uuid: String,

    /// Opaque payload, delivered verbatim to business endpoints
    pub body: String,

    /// Address of the producer, when known
    pub client_ip: Option<String>,

    /// When the gateway accepted the message
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message with a fresh business uuid
    ///
    /// ```rust
    /// # use message_bus::Message;
    /// let message = Message::new("trading", "order_paid", "order-1", r#"{"orderId":1}"#);
    /// assert_eq!(message.app_code, "trading_order_paid");
    /// ```
    pub fn new(
        app_id: impl Into<String>,
        code: impl Into<String>,
        message_id: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        let app_id = app_id.into();
        let code = code.into();
        Self {
            app_code: format!("{}_{}", app_id, code),
            app_id,
            code,
            message_id: message_id.into(),
            uuid: Uuid::new_v4().to_string(),
            body: body.into(),
            client_ip: None,
            created_at: Utc::now(),
        }
    }

    /// Record the producer's address
    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    /// Whether there is a payload to attach to outbound requests
    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }
}

/// Pipeline status of a logged message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Logged, publish not finished yet
    Init,
    /// Accepted by the broker
    PublishToMq,
    /// Broker unavailable, handed to the compensation store
    PublishToCompensate,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Init => write!(f, "init"),
            MessageStatus::PublishToMq => write!(f, "publish_to_mq"),
            MessageStatus::PublishToCompensate => write!(f, "publish_to_compensate"),
        }
    }
}

/// Downstream processing status of a logged message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Init,
    Success,
    Fail,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Init => write!(f, "init"),
            ProcessStatus::Success => write!(f, "success"),
            ProcessStatus::Fail => write!(f, "fail"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_derives_app_code_and_uuid() {
        let first = Message::new("trading", "order_paid", "order-1", "{}");
        let second = Message::new("trading", "order_paid", "order-1", "{}");

        assert_eq!(first.app_code, "trading_order_paid");
        assert_eq!(first.code, "order_paid");
        assert!(first.client_ip.is_none());
        // Same producer id, different submissions
        assert_ne!(first.uuid, second.uuid);
    }

    #[test]
    fn test_has_body() {
        assert!(Message::new("a", "b", "1", "payload").has_body());
        assert!(!Message::new("a", "b", "1", "").has_body());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&MessageStatus::PublishToCompensate).unwrap();
        assert_eq!(json, "\"publish_to_compensate\"");
        assert_eq!(ProcessStatus::Init.to_string(), "init");
    }
}
