// Publish pipeline
// Validation, asynchronous logging, broker publish and failover to compensation

//! # Dispatcher
//!
//! [`Dispatcher::publish`] is the gateway's entry point for producers.
//!
//! ## Publish Flow
//!
//! 1. Resolve the application by id. Unknown applications and applications
//!    declared for another transport are rejected with `InvalidArgument`.
//! 2. Resolve the message configuration by code. Unknown or disabled codes
//!    are rejected the same way. Nothing has happened yet at this point.
//! 3. **Fast path** (circuit breaker healthy): submit the log write (when
//!    logging is enabled) and the broker publish to their schedulers and
//!    return [`PublishReceipt::Async`] straight away.
//! 4. **Degraded path** (breaker broken): publish synchronously, skip the
//!    log, and return [`PublishReceipt::Degraded`] once the message is
//!    either on the broker or in the compensation store.
//!
//! ## Failover
//!
//! Every way a publish can fail ends in the compensation store: the route's
//! producer cannot be built, the producer reports itself unhealthy, or the
//! broker rejects the message. A failed publish on the fast path trips the
//! circuit breaker so the following calls stop paying for the log write and
//! the task hand-off until the reset window has passed.
//!
//! ## Rust Learning Notes:
//!
//! ### `Arc<Inner>` Handles
//! `Dispatcher` is a thin handle around `Arc<DispatcherInner>`. Cloning it is
//! cheap, and a background task can own a clone of the inner state for as
//! long as it runs without borrowing from the caller.

use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::compensation::{CompensationReport, CompensationWriter};
use super::executor::{BoundedExecutor, SpawnScheduler, TaskScheduler};
use super::health::CircuitBreaker;
use super::producer::{ProducerCache, ProducerFactory, RouteKey};
use super::storage::{CompensationStore, ConfigResolver, MessageLog};
use crate::models::{
    CompensateSource, Message, MessageConfig, MessageStatus, ProcessStatus, TransportType,
};
use crate::settings::LogPoolSettings;
use crate::{MessageBusError, Result};

/// Which path a publish took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReceipt {
    /// Handed to background tasks; outcome only visible in logs and stores
    Async,
    /// Published (or compensated) before returning
    Degraded,
}

struct DispatcherInner {
    config_resolver: Arc<dyn ConfigResolver>,
    message_log: Arc<dyn MessageLog>,
    producers: ProducerCache,
    compensation: CompensationWriter,
    health: Arc<CircuitBreaker>,
    log_scheduler: Arc<dyn TaskScheduler>,
    publish_scheduler: Arc<dyn TaskScheduler>,
    transport: TransportType,
}

/// Routes messages to the broker with failover to compensation
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn builder(
        config_resolver: Arc<dyn ConfigResolver>,
        message_log: Arc<dyn MessageLog>,
        compensation_store: Arc<dyn CompensationStore>,
        producer_factory: Arc<dyn ProducerFactory>,
    ) -> DispatcherBuilder {
        DispatcherBuilder::new(config_resolver, message_log, compensation_store, producer_factory)
    }

    pub fn health(&self) -> &Arc<CircuitBreaker> {
        &self.inner.health
    }

    pub fn producers(&self) -> &ProducerCache {
        &self.inner.producers
    }

    pub fn transport(&self) -> TransportType {
        self.inner.transport
    }

    /// Publish a message
    ///
    /// ## Errors
    /// - `InvalidArgument`: unknown application, transport mismatch, unknown
    ///   or disabled code
    /// - `PublishFailed`: degraded path only, the broker did not take the
    ///   message (it was still handed to compensation where possible)
    pub async fn publish(&self, message: Message) -> Result<PublishReceipt> {
        let config = self.inner.resolve(&message).await?;
        let message = Arc::new(message);

        if !self.inner.health.is_healthy() {
            debug!(app_code = %message.app_code, uuid = %message.uuid, "circuit broken, publishing synchronously");
            self.inner.publish_to_mq(&message, &config, false).await?;
            return Ok(PublishReceipt::Degraded);
        }

        let already_logged = config.enable_log && self.submit_log(&message);

        let config = Arc::new(config);
        match self.submit_publish(message.clone(), config.clone(), already_logged) {
            Ok(()) => Ok(PublishReceipt::Async),
            Err(e) => {
                error!(
                    app_code = %message.app_code,
                    uuid = %message.uuid,
                    error = %e,
                    "failed to submit async publish, publishing synchronously"
                );
                self.inner.health.set_broken();
                self.inner.publish_to_mq(&message, &config, false).await?;
                Ok(PublishReceipt::Degraded)
            }
        }
    }

    /// Submit the best-effort log write, returning whether it was accepted
    fn submit_log(&self, message: &Arc<Message>) -> bool {
        let log = self.inner.message_log.clone();
        let logged = message.clone();
        let task = async move {
            if let Err(e) = log.insert(&logged).await {
                error!(
                    app_code = %logged.app_code,
                    uuid = %logged.uuid,
                    error = %e,
                    "failed to write message log"
                );
            }
        }
        .boxed();

        match self.inner.log_scheduler.submit(task) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    app_code = %message.app_code,
                    uuid = %message.uuid,
                    error = %e,
                    "message log pool used up, log write dropped"
                );
                false
            }
        }
    }

    fn submit_publish(
        &self,
        message: Arc<Message>,
        config: Arc<MessageConfig>,
        already_logged: bool,
    ) -> Result<()> {
        let inner = self.inner.clone();
        let task = async move {
            debug!(app_code = %message.app_code, uuid = %message.uuid, "async publish begin");
            if let Err(e) = inner.publish_to_mq(&message, &config, already_logged).await {
                error!(
                    app_code = %message.app_code,
                    uuid = %message.uuid,
                    error = %e,
                    "async publish failed"
                );
                inner.health.set_broken();
            }
            debug!(app_code = %message.app_code, uuid = %message.uuid, "async publish end");
        }
        .boxed();

        self.inner.publish_scheduler.submit(task)
    }
}

impl DispatcherInner {
    async fn resolve(&self, message: &Message) -> Result<MessageConfig> {
        let app = self
            .config_resolver
            .get_app_config(&message.app_id)
            .await?
            .ok_or_else(|| {
                MessageBusError::InvalidArgument(format!("invalid appId: {}", message.app_id))
            })?;

        if app.transport != self.transport {
            return Err(MessageBusError::InvalidArgument(format!(
                "invalid appId: {}, transport {} is not served here, configure {}",
                message.app_id, app.transport, self.transport
            )));
        }

        app.message_config(&message.code)
            .filter(|config| config.enabled)
            .cloned()
            .ok_or_else(|| MessageBusError::InvalidArgument(format!("invalid code: {}", message.code)))
    }

    /// Publish to the broker, falling back to compensation
    async fn publish_to_mq(
        &self,
        message: &Message,
        config: &MessageConfig,
        already_logged: bool,
    ) -> Result<()> {
        let route = RouteKey::new(message.app_id.clone(), message.app_code.clone());

        let producer = match self.producers.producer_for(&route).await {
            Ok(producer) => producer,
            Err(e) => {
                error!(route = %route, uuid = %message.uuid, error = %e, "no producer for route, compensating");
                self.compensate(message, config, already_logged).await;
                return Err(MessageBusError::publish_failed(&message.app_code, e));
            }
        };

        if !producer.is_healthy() {
            if !producer.is_broken() {
                producer.set_broken(true);
                error!(app_code = %message.app_code, "broker is broken, switching to compensation");
            }

            let report = self.compensate(message, config, already_logged).await;
            if report.is_total_failure() {
                return Err(MessageBusError::publish_failed(
                    &message.app_code,
                    anyhow::anyhow!(
                        "broker unavailable and no compensation record written ({} failed)",
                        report.failed.len()
                    ),
                ));
            }
            return Ok(());
        }

        if let Err(e) = producer
            .publish(&message.body, &message.message_id, &message.uuid)
            .await
        {
            error!(app_code = %message.app_code, uuid = %message.uuid, error = %e, "broker publish failed, compensating");
            self.compensate(message, config, already_logged).await;
            return Err(MessageBusError::publish_failed(&message.app_code, e));
        }

        if producer.is_broken() {
            producer.set_broken(false);
            info!(app_code = %message.app_code, "broker recovered");
        }

        if already_logged {
            if let Err(e) = self
                .message_log
                .update_status(
                    &message.app_id,
                    &message.code,
                    &message.uuid,
                    MessageStatus::PublishToMq,
                    ProcessStatus::Init,
                )
                .await
            {
                warn!(app_code = %message.app_code, uuid = %message.uuid, error = %e, "failed to mark message as published");
            }
        }

        debug!(app_code = %message.app_code, uuid = %message.uuid, "published to broker");
        Ok(())
    }

    async fn compensate(
        &self,
        message: &Message,
        config: &MessageConfig,
        already_logged: bool,
    ) -> CompensationReport {
        let report = self
            .compensation
            .write(message, config, CompensateSource::Publish, already_logged)
            .await;

        if !report.is_complete() {
            warn!(
                app_code = %message.app_code,
                uuid = %message.uuid,
                failed = ?report.failed,
                "compensation incomplete, resubmitting the message fills the gaps"
            );
        }
        report
    }
}

/// Builder for [`Dispatcher`]
///
/// ## Defaults
/// - circuit breaker: 60 s reset window on the system clock
/// - log scheduler: a [`BoundedExecutor`] sized by [`LogPoolSettings`]
/// - publish scheduler: [`SpawnScheduler`]
/// - transport: NATS
pub struct DispatcherBuilder {
    config_resolver: Arc<dyn ConfigResolver>,
    message_log: Arc<dyn MessageLog>,
    compensation_store: Arc<dyn CompensationStore>,
    producer_factory: Arc<dyn ProducerFactory>,
    health: Option<Arc<CircuitBreaker>>,
    log_scheduler: Option<Arc<dyn TaskScheduler>>,
    publish_scheduler: Option<Arc<dyn TaskScheduler>>,
    log_pool: LogPoolSettings,
    transport: TransportType,
}

impl DispatcherBuilder {
    pub fn new(
        config_resolver: Arc<dyn ConfigResolver>,
        message_log: Arc<dyn MessageLog>,
        compensation_store: Arc<dyn CompensationStore>,
        producer_factory: Arc<dyn ProducerFactory>,
    ) -> Self {
        Self {
            config_resolver,
            message_log,
            compensation_store,
            producer_factory,
            health: None,
            log_scheduler: None,
            publish_scheduler: None,
            log_pool: LogPoolSettings::default(),
            transport: TransportType::Nats,
        }
    }

    pub fn with_health(mut self, health: Arc<CircuitBreaker>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_log_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.log_scheduler = Some(scheduler);
        self
    }

    pub fn with_publish_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.publish_scheduler = Some(scheduler);
        self
    }

    /// Size of the default log pool
    pub fn with_log_pool(mut self, log_pool: LogPoolSettings) -> Self {
        self.log_pool = log_pool;
        self
    }

    /// Transport every served application must declare
    pub fn expect_transport(mut self, transport: TransportType) -> Self {
        self.transport = transport;
        self
    }

    /// Build the dispatcher
    ///
    /// Without an explicit log scheduler this starts a [`BoundedExecutor`],
    /// so it must run inside a Tokio runtime.
    pub fn build(self) -> Dispatcher {
        let log_scheduler = self.log_scheduler.unwrap_or_else(|| {
            Arc::new(BoundedExecutor::new(
                "message-log",
                self.log_pool.workers,
                self.log_pool.queue_depth,
            ))
        });

        Dispatcher {
            inner: Arc::new(DispatcherInner {
                config_resolver: self.config_resolver,
                compensation: CompensationWriter::new(
                    self.compensation_store,
                    self.message_log.clone(),
                ),
                message_log: self.message_log,
                producers: ProducerCache::new(self.producer_factory),
                health: self.health.unwrap_or_default(),
                log_scheduler,
                publish_scheduler: self
                    .publish_scheduler
                    .unwrap_or_else(|| Arc::new(SpawnScheduler)),
                transport: self.transport,
            }),
        }
    }
}
