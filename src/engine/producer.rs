// Broker producers, one per application route
// Cached lazily behind an injectable factory

//! # Queue Producers
//!
//! A [`QueueProducer`] is the gateway's handle on one broker route
//! (application id + application code). Its health is tracked per route and
//! independently of the global circuit breaker, so one broken route can fail
//! over to compensation while every other route keeps publishing normally.
//!
//! Producers are expensive to build (connections, streams), so the
//! [`ProducerCache`] builds each one once, on first use, through a
//! [`ProducerFactory`] and hands out shared `Arc`s afterwards.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

/// Identifies one broker route
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub app_id: String,
    pub app_code: String,
}

impl RouteKey {
    pub fn new(app_id: impl Into<String>, app_code: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            app_code: app_code.into(),
        }
    }
}

impl std::fmt::Display for RouteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.app_id, self.app_code)
    }
}

/// Broker connection for one route
///
/// `is_healthy` reflects the transport (is the connection usable right
/// now). `is_broken` is a sticky flag the dispatcher sets when it fails over,
/// so the switch to compensation and the recovery are logged once each.
/// Both are racy-tolerant booleans, not linearizable state.
#[async_trait]
pub trait QueueProducer: Send + Sync {
    fn is_healthy(&self) -> bool;

    fn is_broken(&self) -> bool;

    fn set_broken(&self, broken: bool);

    /// Publish `body` keyed by the producer's message id and the business uuid
    async fn publish(&self, body: &str, message_id: &str, uuid: &str) -> anyhow::Result<()>;
}

/// Builds producers for routes on demand
#[async_trait]
pub trait ProducerFactory: Send + Sync {
    async fn create(&self, route: &RouteKey) -> anyhow::Result<Arc<dyn QueueProducer>>;
}

/// Sticky broken flag shared by producer implementations
#[derive(Debug, Default)]
pub struct BrokenFlag(AtomicBool);

impl BrokenFlag {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Store `broken`, returning the previous value
    pub fn set(&self, broken: bool) -> bool {
        self.0.swap(broken, Ordering::AcqRel)
    }
}

/// Keyed cache of producers, one per route
pub struct ProducerCache {
    factory: Arc<dyn ProducerFactory>,
    producers: DashMap<RouteKey, Arc<dyn QueueProducer>>,
}

impl ProducerCache {
    pub fn new(factory: Arc<dyn ProducerFactory>) -> Self {
        Self {
            factory,
            producers: DashMap::new(),
        }
    }

    /// Get the cached producer for `route`, building it on first use
    ///
    /// Two callers racing on a new route may both build a producer; the
    /// first one inserted wins and the other is dropped.
    pub async fn producer_for(&self, route: &RouteKey) -> anyhow::Result<Arc<dyn QueueProducer>> {
        if let Some(producer) = self.producers.get(route) {
            return Ok(producer.value().clone());
        }

        let created = self.factory.create(route).await?;
        let producer = self
            .producers
            .entry(route.clone())
            .or_insert(created)
            .value()
            .clone();
        debug!(route = %route, "producer created");
        Ok(producer)
    }

    /// Drop the cached producer so the next call rebuilds it
    pub fn evict(&self, route: &RouteKey) -> bool {
        self.producers.remove(route).is_some()
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

/// Message accepted by an [`InMemoryProducer`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub body: String,
    pub message_id: String,
    pub uuid: String,
}

/// Broker stand-in that keeps published messages in memory
///
/// Always healthy. Used by the demo server when no broker is configured.
#[derive(Debug, Default)]
pub struct InMemoryProducer {
    broken: BrokenFlag,
    published: std::sync::Mutex<Vec<PublishedMessage>>,
}

impl InMemoryProducer {
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .map(|published| published.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueProducer for InMemoryProducer {
    fn is_healthy(&self) -> bool {
        true
    }

    fn is_broken(&self) -> bool {
        self.broken.get()
    }

    fn set_broken(&self, broken: bool) {
        self.broken.set(broken);
    }

    async fn publish(&self, body: &str, message_id: &str, uuid: &str) -> anyhow::Result<()> {
        self.published
            .lock()
            .map_err(|_| anyhow::anyhow!("in-memory producer lock poisoned"))?
            .push(PublishedMessage {
                body: body.to_string(),
                message_id: message_id.to_string(),
                uuid: uuid.to_string(),
            });
        Ok(())
    }
}

/// Builds one [`InMemoryProducer`] per route and keeps them inspectable
#[derive(Default)]
pub struct InMemoryProducerFactory {
    producers: DashMap<RouteKey, Arc<InMemoryProducer>>,
}

impl InMemoryProducerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer(&self, route: &RouteKey) -> Option<Arc<InMemoryProducer>> {
        self.producers.get(route).map(|producer| producer.value().clone())
    }
}

#[async_trait]
impl ProducerFactory for InMemoryProducerFactory {
    async fn create(&self, route: &RouteKey) -> anyhow::Result<Arc<dyn QueueProducer>> {
        let producer = self
            .producers
            .entry(route.clone())
            .or_insert_with(|| Arc::new(InMemoryProducer::default()))
            .value()
            .clone();
        Ok(producer)
    }
}
