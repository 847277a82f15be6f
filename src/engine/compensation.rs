// Compensation writer - durable fallback sink for undeliverable messages

//! # Compensation
//!
//! When the broker cannot take a message, the gateway still owes it to
//! every business endpoint configured for its code. [`CompensationWriter`]
//! records that debt: one [`MessageCompensate`] per active callback target.
//!
//! ## Partial Failure
//!
//! Inserts are best effort. A failing insert for one target does not stop
//! the others; the [`CompensationReport`] lists what was recorded and what
//! was not. Record ids are `{uuid}:{callback_key}` and inserts are
//! idempotent, so compensating the same message again only fills the gaps.

use std::sync::Arc;

use tracing::{debug, error, warn};

use super::storage::{CompensationStore, MessageLog};
use crate::models::{
    CompensateSource, Message, MessageCompensate, MessageConfig, MessageStatus, ProcessStatus,
};

/// What one compensation write achieved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompensationReport {
    /// Callback keys now backed by a record (new or already present)
    pub inserted: Vec<String>,
    /// How many of `inserted` already existed
    pub duplicates: usize,
    /// Callback keys whose insert failed, with the error text
    pub failed: Vec<(String, String)>,
}

impl CompensationReport {
    /// Every target is backed by a record
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// At least one target was attempted and none was recorded
    pub fn is_total_failure(&self) -> bool {
        self.inserted.is_empty() && !self.failed.is_empty()
    }
}

/// Writes compensation records for a message
#[derive(Clone)]
pub struct CompensationWriter {
    store: Arc<dyn CompensationStore>,
    message_log: Arc<dyn MessageLog>,
}

impl CompensationWriter {
    pub fn new(store: Arc<dyn CompensationStore>, message_log: Arc<dyn MessageLog>) -> Self {
        Self { store, message_log }
    }

    /// Record one compensation entry per active callback of `config`
    ///
    /// When the message was logged before this attempt, its log entry is
    /// moved to `PublishToCompensate` so reconciliation can find it. A
    /// message that was never logged has nothing to update.
    pub async fn write(
        &self,
        message: &Message,
        config: &MessageConfig,
        source: CompensateSource,
        already_logged: bool,
    ) -> CompensationReport {
        let mut report = CompensationReport::default();

        for callback in config.active_callbacks() {
            let record = MessageCompensate::from_message(message, callback, source);
            match self.store.insert(&record).await {
                Ok(is_new) => {
                    if !is_new {
                        report.duplicates += 1;
                    }
                    report.inserted.push(callback.callback_key.clone());
                }
                Err(e) => {
                    error!(
                        app_code = %message.app_code,
                        uuid = %message.uuid,
                        callback_key = %callback.callback_key,
                        error = %e,
                        "failed to insert compensation record"
                    );
                    report
                        .failed
                        .push((callback.callback_key.clone(), e.to_string()));
                }
            }
        }

        if report.inserted.is_empty() && report.failed.is_empty() {
            warn!(
                app_code = %message.app_code,
                uuid = %message.uuid,
                "no active callback configured, nothing to compensate"
            );
        } else {
            debug!(
                app_code = %message.app_code,
                uuid = %message.uuid,
                inserted = report.inserted.len(),
                failed = report.failed.len(),
                "compensation written"
            );
        }

        if already_logged {
            if let Err(e) = self
                .message_log
                .update_status(
                    &message.app_id,
                    &message.code,
                    &message.uuid,
                    MessageStatus::PublishToCompensate,
                    ProcessStatus::Init,
                )
                .await
            {
                warn!(
                    app_code = %message.app_code,
                    uuid = %message.uuid,
                    error = %e,
                    "failed to mark message as compensated"
                );
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::storage::{InMemoryCompensationStore, InMemoryMessageLog};
    use crate::models::CallbackConfig;
    use crate::{MessageBusError, Result};
    use chrono::{DateTime, Utc};

    /// Store that rejects inserts for one callback key
    struct FailingStore {
        inner: InMemoryCompensationStore,
        failing_key: String,
    }

    #[async_trait::async_trait]
    impl CompensationStore for FailingStore {
        async fn insert(&self, record: &MessageCompensate) -> Result<bool> {
            if record.callback_key == self.failing_key {
                return Err(MessageBusError::Storage(anyhow::anyhow!("disk full")));
            }
            self.inner.insert(record).await
        }

        async fn update(&self, record: &MessageCompensate) -> Result<()> {
            self.inner.update(record).await
        }

        async fn get(&self, id: &str) -> Result<Option<MessageCompensate>> {
            self.inner.get(id).await
        }

        async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<MessageCompensate>> {
            self.inner.find_due(now, limit).await
        }
    }

    fn two_targets() -> MessageConfig {
        MessageConfig::new("order_paid")
            .with_callback(CallbackConfig::new("a", "http://a/notify"))
            .with_callback(CallbackConfig::new("b", "http://b/notify"))
    }

    #[tokio::test]
    async fn test_one_record_per_active_callback() {
        let store = Arc::new(InMemoryCompensationStore::new());
        let log = Arc::new(InMemoryMessageLog::new());
        let writer = CompensationWriter::new(store.clone(), log);

        let config = two_targets().with_callback(CallbackConfig {
            enabled: false,
            ..CallbackConfig::new("c", "http://c/notify")
        });
        let message = Message::new("trading", "order_paid", "order-1", "{}");

        let report = writer
            .write(&message, &config, CompensateSource::Publish, false)
            .await;

        assert!(report.is_complete());
        assert_eq!(report.inserted, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_rewrite_is_idempotent() {
        let store = Arc::new(InMemoryCompensationStore::new());
        let writer = CompensationWriter::new(store.clone(), Arc::new(InMemoryMessageLog::new()));
        let message = Message::new("trading", "order_paid", "order-1", "{}");

        writer.write(&message, &two_targets(), CompensateSource::Publish, false).await;
        let again = writer.write(&message, &two_targets(), CompensateSource::Publish, false).await;

        assert_eq!(again.duplicates, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_continues() {
        let store = Arc::new(FailingStore {
            inner: InMemoryCompensationStore::new(),
            failing_key: "a".to_string(),
        });
        let writer = CompensationWriter::new(store.clone(), Arc::new(InMemoryMessageLog::new()));
        let message = Message::new("trading", "order_paid", "order-1", "{}");

        let report = writer
            .write(&message, &two_targets(), CompensateSource::Publish, false)
            .await;

        assert!(!report.is_complete());
        assert!(!report.is_total_failure());
        assert_eq!(report.inserted, vec!["b".to_string()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "a");
        assert_eq!(store.inner.len(), 1);
    }

    #[tokio::test]
    async fn test_logged_message_marked_compensated() {
        let log = Arc::new(InMemoryMessageLog::new());
        let writer = CompensationWriter::new(Arc::new(InMemoryCompensationStore::new()), log.clone());
        let message = Message::new("trading", "order_paid", "order-1", "{}");
        log.insert(&message).await.unwrap();

        writer.write(&message, &two_targets(), CompensateSource::Publish, true).await;

        let logged = log.get(&message.uuid).unwrap().unwrap();
        assert_eq!(logged.status, MessageStatus::PublishToCompensate);
        assert_eq!(logged.process_status, ProcessStatus::Init);
    }

    #[tokio::test]
    async fn test_unlogged_message_left_alone() {
        let log = Arc::new(InMemoryMessageLog::new());
        let writer = CompensationWriter::new(Arc::new(InMemoryCompensationStore::new()), log.clone());
        let message = Message::new("trading", "order_paid", "order-1", "{}");

        let report = writer.write(&message, &two_targets(), CompensateSource::Publish, false).await;

        assert!(report.is_complete());
        assert!(log.is_empty());
    }
}
