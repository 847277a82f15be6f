// Gateway wiring
// Builds the dispatcher, delivery engine and worker from one configuration

//! # Gateway
//!
//! [`GatewayBuilder`] turns a [`GatewayConfig`] plus whichever collaborators
//! the caller supplies into a running [`Gateway`]. Anything not supplied
//! falls back to a default:
//!
//! - stores: the in-memory implementations
//! - producers: NATS JetStream when `nats.enabled`, otherwise the caller
//!   must supply a factory
//! - outcome recorder: [`StoreOutcomeRecorder`] over the compensation store
//!
//! The gateway owns its background work (the log pool and the compensation
//! worker) and stops it in [`Gateway::shutdown`].

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::callback::{CallbackDeliveryEngine, DeliveryHandle, DeliveryRequest};
use crate::engine::dispatcher::{Dispatcher, PublishReceipt};
use crate::engine::executor::BoundedExecutor;
use crate::engine::health::CircuitBreaker;
use crate::engine::nats_producer::{NatsProducerConfig, NatsProducerFactory};
use crate::engine::outcome::{OutcomeRecorder, RetryPolicy, StoreOutcomeRecorder};
use crate::engine::producer::ProducerFactory;
use crate::engine::semaphore::SemaphoreRegistry;
use crate::engine::storage::{
    CompensationStore, ConfigResolver, InMemoryCompensationStore, InMemoryConfigResolver,
    InMemoryMessageLog, MessageLog,
};
use crate::engine::worker::CompensationWorker;
use crate::models::{Message, TransportType};
use crate::settings::GatewayConfig;
use crate::{MessageBusError, Result};

/// A fully wired message bus gateway
pub struct Gateway {
    config: GatewayConfig,
    config_resolver: Arc<dyn ConfigResolver>,
    compensation_store: Arc<dyn CompensationStore>,
    dispatcher: Dispatcher,
    engine: CallbackDeliveryEngine,
    worker: Arc<CompensationWorker>,
    log_executor: Arc<BoundedExecutor>,
    shutdown: CancellationToken,
    worker_task: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    pub fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn engine(&self) -> &CallbackDeliveryEngine {
        &self.engine
    }

    pub fn semaphores(&self) -> &Arc<SemaphoreRegistry> {
        self.engine.semaphores()
    }

    pub fn worker(&self) -> &Arc<CompensationWorker> {
        &self.worker
    }

    pub fn compensation_store(&self) -> &Arc<dyn CompensationStore> {
        &self.compensation_store
    }

    /// Publish a producer's message
    pub async fn publish(&self, message: Message) -> Result<PublishReceipt> {
        self.dispatcher.publish(message).await
    }

    /// Deliver a consumed message straight to every active callback
    ///
    /// Failed deliveries become compensation records with source `Callback`.
    pub async fn dispatch_callbacks(&self, message: Message) -> Result<Vec<DeliveryHandle>> {
        let app = self
            .config_resolver
            .get_app_config(&message.app_id)
            .await?
            .ok_or_else(|| MessageBusError::InvalidArgument(format!("invalid appId: {}", message.app_id)))?;
        let config = app
            .message_config(&message.code)
            .filter(|config| config.enabled)
            .ok_or_else(|| MessageBusError::InvalidArgument(format!("invalid code: {}", message.code)))?;

        let message = Arc::new(message);
        let mut handles = Vec::new();
        for callback in config.active_callbacks() {
            let request = DeliveryRequest::direct(message.clone(), callback.clone());
            handles.push(self.engine.deliver(request).await);
        }
        Ok(handles)
    }

    /// Start the compensation worker unless disabled or already running
    pub fn start_worker(&self) {
        if !self.config.worker.enabled {
            info!("compensation worker disabled");
            return;
        }

        let Ok(mut slot) = self.worker_task.lock() else {
            warn!("worker slot poisoned, compensation worker not started");
            return;
        };
        if slot.is_some() {
            return;
        }

        let worker = self.worker.clone();
        let token = self.shutdown.child_token();
        *slot = Some(tokio::spawn(async move { worker.run(token).await }));
    }

    /// Stop background work and wait for it to finish
    pub async fn shutdown(&self) {
        info!("shutting down message bus gateway");
        self.shutdown.cancel();
        self.engine.shutdown();

        let task = self.worker_task.lock().ok().and_then(|mut slot| slot.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "compensation worker ended abnormally");
            }
        }

        self.log_executor.shutdown().await;
        info!("message bus gateway stopped");
    }
}

/// Builder for [`Gateway`]
pub struct GatewayBuilder {
    config: GatewayConfig,
    config_resolver: Option<Arc<dyn ConfigResolver>>,
    message_log: Option<Arc<dyn MessageLog>>,
    compensation_store: Option<Arc<dyn CompensationStore>>,
    producer_factory: Option<Arc<dyn ProducerFactory>>,
    recorder: Option<Arc<dyn OutcomeRecorder>>,
    health: Option<Arc<CircuitBreaker>>,
    transport: TransportType,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            config_resolver: None,
            message_log: None,
            compensation_store: None,
            producer_factory: None,
            recorder: None,
            health: None,
            transport: TransportType::Nats,
        }
    }

    pub fn with_config_resolver(mut self, resolver: Arc<dyn ConfigResolver>) -> Self {
        self.config_resolver = Some(resolver);
        self
    }

    pub fn with_message_log(mut self, message_log: Arc<dyn MessageLog>) -> Self {
        self.message_log = Some(message_log);
        self
    }

    pub fn with_compensation_store(mut self, store: Arc<dyn CompensationStore>) -> Self {
        self.compensation_store = Some(store);
        self
    }

    pub fn with_producer_factory(mut self, factory: Arc<dyn ProducerFactory>) -> Self {
        self.producer_factory = Some(factory);
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn OutcomeRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_health(mut self, health: Arc<CircuitBreaker>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn expect_transport(mut self, transport: TransportType) -> Self {
        self.transport = transport;
        self
    }

    /// Wire everything up; connects to NATS when no factory was supplied
    pub async fn build(self) -> Result<Gateway> {
        let config = self.config;

        let config_resolver = self
            .config_resolver
            .unwrap_or_else(|| Arc::new(InMemoryConfigResolver::new()));
        let message_log = self
            .message_log
            .unwrap_or_else(|| Arc::new(InMemoryMessageLog::new()));
        let compensation_store = self
            .compensation_store
            .unwrap_or_else(|| Arc::new(InMemoryCompensationStore::new()));

        let producer_factory: Arc<dyn ProducerFactory> = match self.producer_factory {
            Some(factory) => factory,
            None if config.nats.enabled => {
                let nats = NatsProducerConfig::from(&config.nats);
                info!(urls = ?nats.nats_urls, stream = %nats.stream_name, "connecting to NATS");
                Arc::new(NatsProducerFactory::connect(nats).await?)
            }
            None => {
                return Err(MessageBusError::Config(::config::ConfigError::Message(
                    "nats is disabled and no producer factory was supplied".to_string(),
                )))
            }
        };

        let health = self
            .health
            .unwrap_or_else(|| Arc::new(CircuitBreaker::new(config.health.reset_window())));

        let log_executor = Arc::new(BoundedExecutor::new(
            "message-log",
            config.log_pool.workers,
            config.log_pool.queue_depth,
        ));

        let dispatcher = Dispatcher::builder(
            config_resolver.clone(),
            message_log,
            compensation_store.clone(),
            producer_factory,
        )
        .with_health(health)
        .with_log_scheduler(log_executor.clone())
        .expect_transport(self.transport)
        .build();

        let recorder = self.recorder.unwrap_or_else(|| {
            Arc::new(StoreOutcomeRecorder::new(
                compensation_store.clone(),
                RetryPolicy::from(&config.worker),
                config.callback.max_response_chars,
            ))
        });

        let semaphores = Arc::new(SemaphoreRegistry::new(config.callback.default_permits));
        let engine = CallbackDeliveryEngine::new(semaphores, recorder, &config.callback)?;

        let worker = Arc::new(CompensationWorker::new(
            compensation_store.clone(),
            config_resolver.clone(),
            engine.clone(),
            &config.worker,
        ));

        info!(
            transport = %self.transport,
            reset_window_ms = config.health.reset_window_ms,
            default_permits = config.callback.default_permits,
            "message bus gateway ready"
        );

        Ok(Gateway {
            config,
            config_resolver,
            compensation_store,
            dispatcher,
            engine,
            worker,
            log_executor,
            shutdown: CancellationToken::new(),
            worker_task: Mutex::new(None),
        })
    }
}
