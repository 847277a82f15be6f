// Compensation records - pending delivery obligations

//! # Compensation Models
//!
//! A `MessageCompensate` says "this message still has to reach this one
//! business endpoint". The dispatcher writes one per callback target when
//! the broker cannot take a message, and the outcome recorder writes one when
//! a direct callback fails. Records are independent: each one is delivered,
//! retried and resolved on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::app_config::CallbackConfig;
use super::message::Message;

/// Why a compensation record exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensateSource {
    /// The broker publish failed or the producer was unhealthy
    Publish,
    /// A direct callback to the business endpoint failed
    Callback,
}

impl std::fmt::Display for CompensateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompensateSource::Publish => write!(f, "publish"),
            CompensateSource::Callback => write!(f, "callback"),
        }
    }
}

/// Delivery status of a compensation record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensateStatus {
    /// Waiting for (re)delivery
    Pending,
    /// The endpoint acknowledged the message
    Succeeded,
    /// Retries exhausted
    Failed,
}

/// Durable record of one pending delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCompensate {
    /// `{uuid}:{callback_key}`, stable for a (message, endpoint) pair
    pub id: String,
    pub app_id: String,
    pub app_code: String,
    pub code: String,
    pub message_id: String,
    pub uuid: String,
    pub body: String,
    pub callback_key: String,
    pub source: CompensateSource,
    pub status: CompensateStatus,
    pub retry_count: u32,
    pub next_retry_at: DateTime<Utc>,
    /// Last response body or error text, truncated
    pub last_response: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MessageCompensate {
    /// Build the record for one (message, callback target) pair
    ///
    /// The record is due immediately.
    pub fn from_message(
        message: &Message,
        callback: &CallbackConfig,
        source: CompensateSource,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Self::record_id(&message.uuid, &callback.callback_key),
            app_id: message.app_id.clone(),
            app_code: message.app_code.clone(),
            code: message.code.clone(),
            message_id: message.message_id.clone(),
            uuid: message.uuid.clone(),
            body: message.body.clone(),
            callback_key: callback.callback_key.clone(),
            source,
            status: CompensateStatus::Pending,
            retry_count: 0,
            next_retry_at: now,
            last_response: None,
            last_duration_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Identifier shared by every attempt to write the same pair
    pub fn record_id(uuid: &str, callback_key: &str) -> String {
        format!("{}:{}", uuid, callback_key)
    }

    /// Rebuild the message this record carries
    pub fn to_message(&self) -> Message {
        Message {
            app_id: self.app_id.clone(),
            app_code: self.app_code.clone(),
            code: self.code.clone(),
            message_id: self.message_id.clone(),
            uuid: self.uuid.clone(),
            body: self.body.clone(),
            client_ip: None,
            created_at: self.created_at,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == CompensateStatus::Pending
    }

    /// Whether the record should be picked up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.next_retry_at <= now
    }
}
