// Collaborator stores for the message bus gateway
// Application configuration, message log and compensation records

//! # Storage Abstraction Layer
//!
//! The dispatch core never talks to a database directly. It sees three
//! collaborator traits and nothing else:
//!
//! - [`ConfigResolver`]: application and message configuration by app id
//! - [`MessageLog`]: the audit log of submitted messages and their status
//! - [`CompensationStore`]: durable pending-delivery records
//!
//! Each trait ships with an in-memory implementation used by the tests and
//! by the demo server. Production deployments plug in their own backends.
//!
//! ## Thread Safety
//!
//! The in-memory stores keep their data behind `std::sync::RwLock`. No lock
//! is ever held across an `.await`, so a blocking lock is fine inside async
//! code.
//!
//! ## Rust Learning Notes:
//!
//! ### `Result<Option<T>>`
//! Lookups return `Ok(None)` when the key is simply absent and `Err(_)` only
//! when the store itself failed. The dispatcher turns `Ok(None)` into an
//! `InvalidArgument` error, while a store failure stays a `Storage` error.
//!
//! ### Lock Poisoning
//! A poisoned lock means another thread panicked mid-write. Rather than
//! unwrapping, the stores surface it as a `Storage` error.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{AppConfig, CompensateStatus, Message, MessageCompensate, MessageStatus, ProcessStatus};
use crate::{MessageBusError, Result};

/// Resolves application configuration by application id
#[async_trait::async_trait]
pub trait ConfigResolver: Send + Sync {
    /// `Ok(None)` when the application is unknown
    async fn get_app_config(&self, app_id: &str) -> Result<Option<AppConfig>>;
}

/// Audit log of submitted messages
#[async_trait::async_trait]
pub trait MessageLog: Send + Sync {
    async fn insert(&self, message: &Message) -> Result<()>;

    /// Move a logged message to a new pipeline and processing status
    async fn update_status(
        &self,
        app_id: &str,
        code: &str,
        uuid: &str,
        status: MessageStatus,
        process_status: ProcessStatus,
    ) -> Result<()>;
}

/// Durable compensation records
///
/// ## Idempotency
/// `insert` is keyed by the record id (`{uuid}:{callback_key}`). Inserting a
/// record whose id already exists is a no-op returning `Ok(false)`, so the
/// whole compensation of a message can be retried safely.
#[async_trait::async_trait]
pub trait CompensationStore: Send + Sync {
    /// Insert a record, returning whether it was new
    async fn insert(&self, record: &MessageCompensate) -> Result<bool>;

    /// Replace an existing record
    async fn update(&self, record: &MessageCompensate) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<MessageCompensate>>;

    /// Pending records whose retry time has come, oldest first
    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<MessageCompensate>>;
}

fn read_lock<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read()
        .map_err(|_| MessageBusError::Storage(anyhow::anyhow!("store lock poisoned")))
}

fn write_lock<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| MessageBusError::Storage(anyhow::anyhow!("store lock poisoned")))
}

/// In-memory application configuration
#[derive(Default)]
pub struct InMemoryConfigResolver {
    apps: RwLock<HashMap<String, AppConfig>>,
}

impl InMemoryConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style registration
    pub fn with_app(self, config: AppConfig) -> Self {
        self.apps
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(config.app_id.clone(), config);
        self
    }

    /// Insert or replace an application's configuration
    pub fn upsert(&self, config: AppConfig) -> Result<()> {
        let mut apps = write_lock(&self.apps)?;
        apps.insert(config.app_id.clone(), config);
        Ok(())
    }

    pub fn remove(&self, app_id: &str) -> Result<Option<AppConfig>> {
        Ok(write_lock(&self.apps)?.remove(app_id))
    }
}

#[async_trait::async_trait]
impl ConfigResolver for InMemoryConfigResolver {
    async fn get_app_config(&self, app_id: &str) -> Result<Option<AppConfig>> {
        Ok(read_lock(&self.apps)?.get(app_id).cloned())
    }
}

/// A message as held by the log, with its current status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedMessage {
    pub message: Message,
    pub status: MessageStatus,
    pub process_status: ProcessStatus,
    pub updated_at: DateTime<Utc>,
}

/// In-memory message log keyed by business uuid
#[derive(Default)]
pub struct InMemoryMessageLog {
    messages: RwLock<HashMap<String, LoggedMessage>>,
}

impl InMemoryMessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uuid: &str) -> Result<Option<LoggedMessage>> {
        Ok(read_lock(&self.messages)?.get(uuid).cloned())
    }

    pub fn len(&self) -> usize {
        read_lock(&self.messages).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl MessageLog for InMemoryMessageLog {
    async fn insert(&self, message: &Message) -> Result<()> {
        let mut messages = write_lock(&self.messages)?;
        messages.insert(
            message.uuid.clone(),
            LoggedMessage {
                message: message.clone(),
                status: MessageStatus::Init,
                process_status: ProcessStatus::Init,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn update_status(
        &self,
        app_id: &str,
        code: &str,
        uuid: &str,
        status: MessageStatus,
        process_status: ProcessStatus,
    ) -> Result<()> {
        let mut messages = write_lock(&self.messages)?;
        match messages.get_mut(uuid) {
            Some(logged) if logged.message.app_id == app_id && logged.message.code == code => {
                logged.status = status;
                logged.process_status = process_status;
                logged.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(MessageBusError::Storage(anyhow::anyhow!(
                "no logged message {} for {}/{}",
                uuid,
                app_id,
                code
            ))),
        }
    }
}

/// In-memory compensation records keyed by record id
#[derive(Default)]
pub struct InMemoryCompensationStore {
    records: RwLock<HashMap<String, MessageCompensate>>,
}

impl InMemoryCompensationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, sorted by id
    pub fn records(&self) -> Result<Vec<MessageCompensate>> {
        let mut records: Vec<_> = read_lock(&self.records)?.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    pub fn count_with_status(&self, status: CompensateStatus) -> usize {
        read_lock(&self.records)
            .map(|r| r.values().filter(|c| c.status == status).count())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        read_lock(&self.records).map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait::async_trait]
impl CompensationStore for InMemoryCompensationStore {
    async fn insert(&self, record: &MessageCompensate) -> Result<bool> {
        let mut records = write_lock(&self.records)?;
        if records.contains_key(&record.id) {
            return Ok(false);
        }
        records.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    async fn update(&self, record: &MessageCompensate) -> Result<()> {
        let mut records = write_lock(&self.records)?;
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(MessageBusError::Storage(anyhow::anyhow!(
                "compensation record {} not found",
                record.id
            ))),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<MessageCompensate>> {
        Ok(read_lock(&self.records)?.get(id).cloned())
    }

    async fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<MessageCompensate>> {
        let records = read_lock(&self.records)?;
        let mut due: Vec<_> = records.values().filter(|r| r.is_due(now)).cloned().collect();
        due.sort_by(|a, b| a.next_retry_at.cmp(&b.next_retry_at));
        due.truncate(limit);
        Ok(due)
    }
}
