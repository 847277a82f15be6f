// Delivery outcome persistence

//! # Outcome Recording
//!
//! The delivery engine classifies every attempt and reports exactly one
//! terminal outcome to an [`OutcomeRecorder`]. What "recording" means is up
//! to the implementation; [`StoreOutcomeRecorder`] writes it back to the
//! compensation store:
//!
//! - success on a compensation record marks it `Succeeded`
//! - failure on a compensation record bumps its retry count and schedules
//!   the next attempt, or marks it `Failed` once retries run out
//! - failure of a direct callback (no record yet) creates a record with
//!   source `Callback` so the worker picks it up later

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::storage::CompensationStore;
use crate::models::{CallbackConfig, CompensateSource, CompensateStatus, Message, MessageCompensate};
use crate::settings::WorkerSettings;
use crate::{MessageBusError, Result};

/// Sink for terminal delivery outcomes
#[async_trait::async_trait]
pub trait OutcomeRecorder: Send + Sync {
    async fn record_success(
        &self,
        message: &Message,
        compensate: Option<&MessageCompensate>,
        callback: &CallbackConfig,
        duration_ms: u64,
    ) -> Result<()>;

    /// `body` is the raw response body when the endpoint answered
    async fn record_failure(
        &self,
        message: &Message,
        compensate: Option<&MessageCompensate>,
        callback: &CallbackConfig,
        body: Option<&str>,
        duration_ms: u64,
        cause: Option<&MessageBusError>,
    ) -> Result<()>;
}

/// When and how often a failed delivery is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which a record is marked `Failed`
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&WorkerSettings::default())
    }
}

impl From<&WorkerSettings> for RetryPolicy {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff: Duration::from_millis(settings.retry_backoff_ms),
        }
    }
}

impl RetryPolicy {
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Linear backoff: the n-th retry waits `n * backoff`
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.backoff.saturating_mul(retry_count.max(1))
    }
}

/// Truncate diagnostic text to `max_chars` characters
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

/// Writes outcomes back to the compensation store
pub struct StoreOutcomeRecorder {
    store: Arc<dyn CompensationStore>,
    policy: RetryPolicy,
    max_response_chars: usize,
}

impl StoreOutcomeRecorder {
    pub fn new(store: Arc<dyn CompensationStore>, policy: RetryPolicy, max_response_chars: usize) -> Self {
        Self {
            store,
            policy,
            max_response_chars,
        }
    }

    fn next_retry(&self, retry_count: u32) -> chrono::DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.policy.delay_for(retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Utc::now() + delay
    }
}

#[async_trait::async_trait]
impl OutcomeRecorder for StoreOutcomeRecorder {
    async fn record_success(
        &self,
        message: &Message,
        compensate: Option<&MessageCompensate>,
        callback: &CallbackConfig,
        duration_ms: u64,
    ) -> Result<()> {
        let Some(record) = compensate else {
            debug!(
                app_code = %message.app_code,
                uuid = %message.uuid,
                callback_key = %callback.callback_key,
                duration_ms,
                "direct callback succeeded"
            );
            return Ok(());
        };

        let mut record = record.clone();
        record.status = CompensateStatus::Succeeded;
        record.last_response = Some("ok".to_string());
        record.last_duration_ms = Some(duration_ms);
        record.updated_at = Utc::now();
        self.store.update(&record).await?;

        info!(
            app_code = %message.app_code,
            uuid = %message.uuid,
            callback_key = %callback.callback_key,
            retry_count = record.retry_count,
            "compensation delivered"
        );
        Ok(())
    }

    async fn record_failure(
        &self,
        message: &Message,
        compensate: Option<&MessageCompensate>,
        callback: &CallbackConfig,
        body: Option<&str>,
        duration_ms: u64,
        cause: Option<&MessageBusError>,
    ) -> Result<()> {
        let response = body
            .map(str::to_string)
            .or_else(|| cause.map(|e| e.to_string()))
            .map(|text| truncate_chars(&text, self.max_response_chars));

        match compensate {
            Some(record) => {
                let mut record = record.clone();
                record.retry_count += 1;
                record.last_response = response;
                record.last_duration_ms = Some(duration_ms);
                record.updated_at = Utc::now();

                if self.policy.is_exhausted(record.retry_count) {
                    record.status = CompensateStatus::Failed;
                    warn!(
                        app_code = %message.app_code,
                        uuid = %message.uuid,
                        callback_key = %callback.callback_key,
                        retry_count = record.retry_count,
                        "compensation retries exhausted"
                    );
                } else {
                    record.next_retry_at = self.next_retry(record.retry_count);
                }

                self.store.update(&record).await
            }
            None => {
                let mut record =
                    MessageCompensate::from_message(message, callback, CompensateSource::Callback);
                record.last_response = response;
                record.last_duration_ms = Some(duration_ms);
                record.next_retry_at = self.next_retry(1);

                let is_new = self.store.insert(&record).await?;
                debug!(
                    app_code = %message.app_code,
                    uuid = %message.uuid,
                    callback_key = %callback.callback_key,
                    is_new,
                    "direct callback failed, compensation scheduled"
                );
                if is_new {
                    return Ok(());
                }

                // Same (message, endpoint) pair already owed: keep its retry
                // bookkeeping, refresh the diagnostics
                match self.store.get(&record.id).await? {
                    Some(mut existing) => {
                        existing.last_response = record.last_response;
                        existing.last_duration_ms = record.last_duration_ms;
                        existing.updated_at = Utc::now();
                        self.store.update(&existing).await
                    }
                    None => Ok(()),
                }
            }
        }
    }
}
