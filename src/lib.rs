// Message Bus Gateway - Rust Edition
// Decouples producers from the broker and from business HTTP endpoints

//! # Message Bus Library
//!
//! This is the library crate for the message bus gateway. The gateway sits
//! between producers, a message broker and downstream business endpoints, and
//! its job is to make sure no message is silently lost when any of them is
//! unavailable.
//!
//! ## Core Components
//!
//! ### Publish Pipeline
//! - [`Dispatcher`]: validates a [`Message`] against its [`AppConfig`], logs it
//!   and publishes it to the broker, failing over to the compensation store
//! - [`CircuitBreaker`]: time-windowed failure detector choosing between the
//!   fast asynchronous path and the degraded synchronous path
//! - [`ProducerCache`]: one [`QueueProducer`] per application route
//! - [`CompensationWriter`]: writes one [`MessageCompensate`] per callback target
//!
//! ### Delivery Engine
//! - [`CallbackDeliveryEngine`]: non-blocking HTTP delivery to business
//!   endpoints with strict `200 ok` acknowledgement
//! - [`SemaphoreRegistry`]: per-endpoint adjustable concurrency limits
//! - [`OutcomeRecorder`]: persists delivery outcomes
//! - [`CompensationWorker`]: drains due compensation records
//!
//! ### Wiring
//! - [`GatewayBuilder`]: assembles everything from a [`GatewayConfig`]
//!
//! ## Guarantees
//!
//! Delivery is at-least-once. Business endpoints must tolerate redelivery,
//! there is no ordering across endpoints and no distributed transaction.

pub mod settings;
pub mod engine;
pub mod models;
pub mod server;

// Re-export core domain types for convenience
pub use models::{
    AppConfig, CallbackConfig, CompensateSource, CompensateStatus, Message, MessageCompensate,
    MessageConfig, MessageStatus, ProcessStatus, TransportType,
};

// Re-export the engine components
pub use engine::{
    callback::{CallbackDeliveryEngine, DeliveryHandle, DeliveryOutcome, DeliveryRequest},
    compensation::{CompensationReport, CompensationWriter},
    dispatcher::{Dispatcher, DispatcherBuilder, PublishReceipt},
    executor::{BoundedExecutor, SpawnScheduler, TaskScheduler},
    health::{CircuitBreaker, Clock, ManualClock, SystemClock},
    nats_producer::{NatsProducer, NatsProducerConfig, NatsProducerFactory},
    outcome::{OutcomeRecorder, RetryPolicy, StoreOutcomeRecorder},
    producer::{
        InMemoryProducer, InMemoryProducerFactory, ProducerCache, ProducerFactory, QueueProducer,
        RouteKey,
    },
    semaphore::{AdjustableSemaphore, CallbackPermit, SemaphoreRegistry, SemaphoreStats},
    storage::{
        CompensationStore, ConfigResolver, InMemoryCompensationStore, InMemoryConfigResolver,
        InMemoryMessageLog, LoggedMessage, MessageLog,
    },
    worker::{CompensationWorker, DrainReport},
};

pub use settings::GatewayConfig;
pub use server::gateway::{Gateway, GatewayBuilder};

// Core error types
// Using the `thiserror` crate to make error handling easier
use thiserror::Error;

/// Error types for message bus operations
///
/// ## Rust Learning Notes:
///
/// ### What the Caller Sees
/// Only two variants ever reach a direct caller of `Dispatcher::publish`:
/// `InvalidArgument` (bad application, code or transport) and
/// `PublishFailed` on the degraded synchronous path. Everything that goes
/// wrong on background tasks is logged where it happens.
///
/// ### `#[source]` with anyhow
/// Collaborators (stores, broker clients) report failures as
/// `anyhow::Error`. Keeping the original error as the `source` means
/// `{:#}` formatting and error reporters can still walk the full chain.
#[derive(Error, Debug)]
pub enum MessageBusError {
    /// Unknown application, unknown or disabled message code, transport mismatch
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The broker could not take the message
    #[error("Publish failed for {app_code}: {source}")]
    PublishFailed {
        app_code: String,
        #[source]
        source: anyhow::Error,
    },

    /// A collaborator (store or broker connection) failed
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    /// The HTTP client could not be built
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A bounded scheduler rejected a task because its queue is full
    #[error("Scheduler queue is full")]
    SchedulerFull,

    /// A scheduler no longer accepts tasks
    #[error("Scheduler is shut down")]
    SchedulerClosed,

    /// The operation was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl MessageBusError {
    /// Wrap a broker failure with the route it happened on
    pub fn publish_failed(app_code: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        MessageBusError::PublishFailed {
            app_code: app_code.into(),
            source: source.into(),
        }
    }

    /// Whether the error is a caller mistake rather than an outage
    pub fn is_invalid_argument(&self) -> bool {
        matches!(self, MessageBusError::InvalidArgument(_))
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, MessageBusError>;
