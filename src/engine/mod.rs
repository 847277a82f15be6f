// Message Bus Engine
// Publish pipeline, delivery engine and their collaborators

//! # Engine Module
//!
//! Everything between "a producer handed us a message" and "the business
//! endpoint said ok" lives here. The layers, leaves first:
//!
//! ## Primitives
//! - `health`: the time-windowed [`CircuitBreaker`](health::CircuitBreaker)
//! - `executor`: injectable [`TaskScheduler`](executor::TaskScheduler)s
//! - `semaphore`: per-endpoint [`SemaphoreRegistry`](semaphore::SemaphoreRegistry)
//!
//! ## Collaborators
//! - `storage`: configuration, message log and compensation store traits
//!   with in-memory implementations
//! - `producer`: broker producers cached per route
//! - `nats_producer`: the NATS JetStream producer
//!
//! ## Pipelines
//! - `dispatcher`: validate, log, publish, fail over
//! - `compensation`: write one record per callback target
//! - `callback`: deliver to business endpoints
//! - `outcome`: persist delivery outcomes
//! - `worker`: redeliver due compensation records
//!
//! ## Rust Learning Notes:
//!
//! ### Module Organization Pattern
//! Each file is one concern. Larger test suites live in sibling
//! `*_tests.rs` files that are only compiled under `cfg(test)`.

pub mod callback;
pub mod compensation;
pub mod dispatcher;
pub mod executor;
pub mod health;
pub mod nats_producer;
pub mod outcome;
pub mod producer;
pub mod semaphore;
pub mod storage;
pub mod worker;

pub use callback::{CallbackDeliveryEngine, DeliveryHandle, DeliveryOutcome, DeliveryRequest};
pub use dispatcher::{Dispatcher, DispatcherBuilder, PublishReceipt};
pub use storage::{CompensationStore, ConfigResolver, MessageLog};
