// Compensation worker
// Periodically redelivers compensation records whose retry is due

//! # Compensation Worker
//!
//! The reconciliation loop behind the compensation store. Each cycle loads
//! up to `batch_size` due records, looks up the callback each one belongs
//! to and hands them to the [`CallbackDeliveryEngine`]. The cycle waits for
//! every delivery it started before it ends, so a record still in flight is
//! never picked up twice.
//!
//! Deliveries within a cycle run side by side. A record whose endpoint is
//! out of permits waits for that endpoint only; records for other endpoints
//! in the same batch go out immediately.
//!
//! Every due record leaves the due window by the end of the cycle:
//!
//! - a record whose application, code or callback has since been removed or
//!   disabled is retired as `Failed`
//! - a record whose configuration could not be read is pushed back by one
//!   backoff step without consuming a retry

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::callback::{CallbackDeliveryEngine, DeliveryOutcome, DeliveryRequest};
use super::outcome::RetryPolicy;
use super::storage::{CompensationStore, ConfigResolver};
use crate::models::{CallbackConfig, CompensateStatus, MessageCompensate};
use crate::settings::WorkerSettings;
use crate::Result;

/// Response recorded on a record retired because its callback is gone
pub const UNCONFIGURED_RESPONSE: &str = "callback no longer configured";

/// Tally of one drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Callback removed or disabled, record marked `Failed`
    pub retired: usize,
    /// Configuration lookup failed, record rescheduled
    pub deferred: usize,
    pub abandoned: usize,
}

/// What happened to one due record
#[derive(Debug)]
enum Disposition {
    Delivered(DeliveryOutcome),
    Retired,
    Deferred,
}

impl DrainReport {
    fn count(&mut self, disposition: Disposition) {
        match disposition {
            Disposition::Retired => self.retired += 1,
            Disposition::Deferred => self.deferred += 1,
            Disposition::Delivered(DeliveryOutcome::Succeeded) => self.succeeded += 1,
            Disposition::Delivered(DeliveryOutcome::Abandoned) => self.abandoned += 1,
            Disposition::Delivered(
                DeliveryOutcome::FailedResponse { .. }
                | DeliveryOutcome::FailedTransport
                | DeliveryOutcome::Cancelled,
            ) => self.failed += 1,
        }
    }
}

/// Drains due compensation records into the delivery engine
pub struct CompensationWorker {
    store: Arc<dyn CompensationStore>,
    config_resolver: Arc<dyn ConfigResolver>,
    engine: CallbackDeliveryEngine,
    policy: RetryPolicy,
    batch_size: usize,
    interval: Duration,
}

impl CompensationWorker {
    pub fn new(
        store: Arc<dyn CompensationStore>,
        config_resolver: Arc<dyn ConfigResolver>,
        engine: CallbackDeliveryEngine,
        settings: &WorkerSettings,
    ) -> Self {
        Self {
            store,
            config_resolver,
            engine,
            policy: RetryPolicy::from(settings),
            batch_size: settings.batch_size,
            interval: settings.interval(),
        }
    }

    /// Callback the record is owed to, if it is still configured and enabled
    async fn callback_for(&self, record: &MessageCompensate) -> Result<Option<CallbackConfig>> {
        let callback = self
            .config_resolver
            .get_app_config(&record.app_id)
            .await?
            .and_then(|app| {
                app.message_config(&record.code)
                    .filter(|config| config.enabled)
                    .and_then(|config| config.callback(&record.callback_key))
                    .filter(|callback| callback.enabled)
                    .cloned()
            });
        Ok(callback)
    }

    /// Run one cycle
    pub async fn drain_once(&self) -> Result<DrainReport> {
        let due = self.store.find_due(Utc::now(), self.batch_size).await?;
        let mut report = DrainReport {
            due: due.len(),
            ..DrainReport::default()
        };

        let dispositions = join_all(due.into_iter().map(|record| self.redeliver(record))).await;
        for disposition in dispositions {
            report.count(disposition);
        }

        if report.due > 0 {
            info!(
                due = report.due,
                succeeded = report.succeeded,
                failed = report.failed,
                retired = report.retired,
                deferred = report.deferred,
                abandoned = report.abandoned,
                "compensation cycle finished"
            );
        }
        Ok(report)
    }

    async fn redeliver(&self, record: MessageCompensate) -> Disposition {
        let callback = match self.callback_for(&record).await {
            Ok(Some(callback)) => callback,
            Ok(None) => {
                self.retire(record).await;
                return Disposition::Retired;
            }
            Err(e) => {
                error!(id = %record.id, error = %e, "failed to resolve callback for compensation");
                self.defer(record).await;
                return Disposition::Deferred;
            }
        };

        debug!(
            id = %record.id,
            callback_key = %callback.callback_key,
            retry_count = record.retry_count,
            "redelivering compensation"
        );
        let handle = self
            .engine
            .deliver(DeliveryRequest::compensation(record, callback))
            .await;
        Disposition::Delivered(handle.outcome().await)
    }

    async fn retire(&self, mut record: MessageCompensate) {
        warn!(
            id = %record.id,
            app_code = %record.app_code,
            callback_key = %record.callback_key,
            "callback no longer configured, compensation retired"
        );
        record.status = CompensateStatus::Failed;
        record.last_response = Some(UNCONFIGURED_RESPONSE.to_string());
        record.updated_at = Utc::now();
        if let Err(e) = self.store.update(&record).await {
            error!(id = %record.id, error = %e, "failed to retire compensation");
        }
    }

    async fn defer(&self, mut record: MessageCompensate) {
        let delay = chrono::Duration::from_std(self.policy.delay_for(record.retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let now = Utc::now();
        record.next_retry_at = now + delay;
        record.updated_at = now;
        if let Err(e) = self.store.update(&record).await {
            error!(id = %record.id, error = %e, "failed to reschedule compensation");
        }
    }

    /// Drain every `interval` until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, batch_size = self.batch_size, "compensation worker started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.drain_once().await {
                        error!(error = %e, "compensation cycle failed");
                    }
                }
            }
        }

        info!("compensation worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::outcome::tests::RecordingRecorder;
    use crate::engine::outcome::StoreOutcomeRecorder;
    use crate::engine::semaphore::SemaphoreRegistry;
    use crate::engine::storage::{InMemoryCompensationStore, InMemoryConfigResolver};
    use crate::models::{AppConfig, CompensateSource, Message, MessageConfig, TransportType};
    use crate::settings::CallbackSettings;
    use crate::MessageBusError;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        worker: CompensationWorker,
        store: Arc<InMemoryCompensationStore>,
        recorder: Arc<RecordingRecorder>,
    }

    fn fixture(app: AppConfig) -> Fixture {
        fixture_with(
            Arc::new(InMemoryConfigResolver::new().with_app(app)),
            WorkerSettings::default(),
        )
    }

    fn fixture_with(resolver: Arc<dyn ConfigResolver>, settings: WorkerSettings) -> Fixture {
        let store = Arc::new(InMemoryCompensationStore::new());
        let recorder = Arc::new(RecordingRecorder::forwarding(Arc::new(
            StoreOutcomeRecorder::new(store.clone(), RetryPolicy::from(&settings), 1000),
        )));
        let engine = CallbackDeliveryEngine::new(
            Arc::new(SemaphoreRegistry::new(4)),
            recorder.clone(),
            &CallbackSettings::default(),
        )
        .unwrap();
        let worker = CompensationWorker::new(store.clone(), resolver, engine, &settings);
        Fixture {
            worker,
            store,
            recorder,
        }
    }

    /// Resolver whose backing store is unreachable
    struct UnreachableResolver;

    #[async_trait::async_trait]
    impl ConfigResolver for UnreachableResolver {
        async fn get_app_config(&self, _app_id: &str) -> Result<Option<AppConfig>> {
            Err(MessageBusError::Storage(anyhow::anyhow!("config store unreachable")))
        }
    }

    async fn endpoint(route: &str, status: u16, body: &str) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(status).set_body_string(body))
            .mount(&server)
            .await;
        server
    }

    /// Insert a record for `callback` that became due `age` ago
    async fn insert_due(
        store: &InMemoryCompensationStore,
        message: &Message,
        callback: &CallbackConfig,
        age: chrono::Duration,
    ) -> MessageCompensate {
        let mut record = MessageCompensate::from_message(message, callback, CompensateSource::Publish);
        record.next_retry_at = Utc::now() - age;
        assert!(store.insert(&record).await.unwrap());
        record
    }

    #[tokio::test]
    async fn test_empty_store_is_a_noop() {
        let fixture = fixture(AppConfig::new("trading", TransportType::Nats));
        let report = fixture.worker.drain_once().await.unwrap();
        assert_eq!(report, DrainReport::default());
    }

    #[tokio::test]
    async fn test_two_targets_resolve_independently() {
        let ok = endpoint("/a", 200, "ok").await;
        let failing = endpoint("/b", 500, "busy").await;

        let callback_a = CallbackConfig::new("a", format!("{}/a", ok.uri()));
        let callback_b = CallbackConfig::new("b", format!("{}/b", failing.uri()));
        let config = MessageConfig::new("order_paid")
            .with_callback(callback_a.clone())
            .with_callback(callback_b.clone());
        let fixture = fixture(
            AppConfig::new("trading", TransportType::Nats).with_message_config(config),
        );

        let message = Message::new("trading", "order_paid", "order-1", "{}");
        for callback in [&callback_a, &callback_b] {
            let record = MessageCompensate::from_message(&message, callback, CompensateSource::Publish);
            fixture.store.insert(&record).await.unwrap();
        }

        let report = fixture.worker.drain_once().await.unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(fixture.recorder.successes(), 1);
        assert_eq!(fixture.recorder.failures(), 1);

        let a = fixture
            .store
            .get(&MessageCompensate::record_id(&message.uuid, "a"))
            .await
            .unwrap()
            .unwrap();
        let b = fixture
            .store
            .get(&MessageCompensate::record_id(&message.uuid, "b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a.status, CompensateStatus::Succeeded);
        assert_eq!(b.status, CompensateStatus::Pending);
        assert_eq!(b.retry_count, 1);
        assert_eq!(b.last_response.as_deref(), Some("busy"));

        // b is not due again until its backoff has passed
        let again = fixture.worker.drain_once().await.unwrap();
        assert_eq!(again.due, 0);
    }

    #[tokio::test]
    async fn test_removed_callback_is_retired() {
        let fixture = fixture(
            AppConfig::new("trading", TransportType::Nats)
                .with_message_config(MessageConfig::new("order_paid")),
        );
        let message = Message::new("trading", "order_paid", "order-1", "{}");
        let gone = CallbackConfig::new("gone", "http://localhost/gone");
        let record = MessageCompensate::from_message(&message, &gone, CompensateSource::Publish);
        fixture.store.insert(&record).await.unwrap();

        let report = fixture.worker.drain_once().await.unwrap();
        assert_eq!(report.retired, 1);
        assert!(fixture.recorder.calls().is_empty());

        let stored = fixture.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CompensateStatus::Failed);
        assert_eq!(stored.last_response.as_deref(), Some(UNCONFIGURED_RESPONSE));
        assert_eq!(stored.retry_count, 0);

        let again = fixture.worker.drain_once().await.unwrap();
        assert_eq!(again, DrainReport::default());
    }

    #[tokio::test]
    async fn test_unreadable_config_defers_without_spending_a_retry() {
        let settings = WorkerSettings {
            retry_backoff_ms: 60_000,
            ..WorkerSettings::default()
        };
        let fixture = fixture_with(Arc::new(UnreachableResolver), settings);
        let message = Message::new("trading", "order_paid", "order-1", "{}");
        let callback = CallbackConfig::new("a", "http://localhost/a");
        let record = MessageCompensate::from_message(&message, &callback, CompensateSource::Publish);
        fixture.store.insert(&record).await.unwrap();

        let report = fixture.worker.drain_once().await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.deferred, 1);
        assert!(fixture.recorder.calls().is_empty());

        let stored = fixture.store.get(&record.id).await.unwrap().unwrap();
        assert!(stored.is_pending());
        assert_eq!(stored.retry_count, 0);
        assert!(stored.next_retry_at > Utc::now() + chrono::Duration::seconds(30));

        let again = fixture.worker.drain_once().await.unwrap();
        assert_eq!(again.due, 0);
    }

    #[tokio::test]
    async fn test_stale_records_do_not_starve_newer_ones() {
        let live = endpoint("/live", 200, "ok").await;
        let callback = CallbackConfig::new("live", format!("{}/live", live.uri()));
        let app = AppConfig::new("trading", TransportType::Nats)
            .with_message_config(MessageConfig::new("order_paid").with_callback(callback.clone()));
        let settings = WorkerSettings {
            batch_size: 2,
            ..WorkerSettings::default()
        };
        let fixture = fixture_with(Arc::new(InMemoryConfigResolver::new().with_app(app)), settings);

        let message = Message::new("trading", "order_paid", "order-1", "{}");
        let mut stale = Vec::new();
        for key in ["removed-1", "removed-2"] {
            let gone = CallbackConfig::new(key, "http://localhost/gone");
            stale.push(insert_due(&fixture.store, &message, &gone, chrono::Duration::minutes(10)).await);
        }
        let fresh = insert_due(&fixture.store, &message, &callback, chrono::Duration::seconds(1)).await;

        let first = fixture.worker.drain_once().await.unwrap();
        assert_eq!(first.due, 2);
        assert_eq!(first.retired, 2);

        let second = fixture.worker.drain_once().await.unwrap();
        assert_eq!(second.due, 1);
        assert_eq!(second.succeeded, 1);

        let delivered = fixture.store.get(&fresh.id).await.unwrap().unwrap();
        assert_eq!(delivered.status, CompensateStatus::Succeeded);
        for record in stale {
            let stored = fixture.store.get(&record.id).await.unwrap().unwrap();
            assert_eq!(stored.status, CompensateStatus::Failed);
        }
        assert_eq!(fixture.recorder.successes(), 1);
    }

    #[tokio::test]
    async fn test_saturated_endpoint_does_not_delay_other_endpoints() {
        let slow = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/slow"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("ok")
                    .set_delay(Duration::from_millis(600)),
            )
            .mount(&slow)
            .await;
        let fast = endpoint("/fast", 200, "ok").await;

        let slow_callback =
            CallbackConfig::new("slow", format!("{}/slow", slow.uri())).with_max_concurrency(1);
        let fast_callback = CallbackConfig::new("fast", format!("{}/fast", fast.uri()));
        let app = AppConfig::new("trading", TransportType::Nats)
            .with_message_config(
                MessageConfig::new("order_paid")
                    .with_callback(slow_callback.clone())
                    .with_callback(fast_callback.clone()),
            );
        let fixture = fixture(app);

        // Both slow records sort ahead of the fast one
        for order in ["order-1", "order-2"] {
            let message = Message::new("trading", "order_paid", order, "{}");
            insert_due(&fixture.store, &message, &slow_callback, chrono::Duration::minutes(5)).await;
        }
        let message = Message::new("trading", "order_paid", "order-3", "{}");
        let fast_record =
            insert_due(&fixture.store, &message, &fast_callback, chrono::Duration::seconds(1)).await;

        let (report, fast_requests) = tokio::join!(fixture.worker.drain_once(), async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            fast.received_requests().await.map(|r| r.len()).unwrap_or(0)
        });

        assert_eq!(fast_requests, 1);
        let report = report.unwrap();
        assert_eq!(report.due, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(
            fixture.store.get(&fast_record.id).await.unwrap().unwrap().status,
            CompensateStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let fixture = fixture(AppConfig::new("trading", TransportType::Nats));
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), fixture.worker.run(shutdown))
            .await
            .unwrap();
    }
}
