// Per-endpoint concurrency limits for callback delivery

//! # Concurrency Limiter
//!
//! Every business endpoint (identified by its callback key) gets its own
//! budget of concurrent in-flight deliveries. The budget lives in an
//! [`AdjustableSemaphore`] that can be resized while permits are held, and
//! the [`SemaphoreRegistry`] creates one lazily per key.
//!
//! ## Resizing
//!
//! Raising the cap adds permits straight away. Lowering it removes as many
//! idle permits as it can; whatever is still held becomes *debt*, paid off
//! by swallowing permits as they are released. The number of deliveries in
//! flight therefore converges to the new cap without interrupting any of
//! them.
//!
//! ## Rust Learning Notes:
//!
//! ### RAII Permits
//! A [`CallbackPermit`] returns its slot in `Drop`. There is no separate
//! `release` call to forget on an error path: panics, early returns and
//! cancelled tasks all drop the permit.
//!
//! ### `OwnedSemaphorePermit`
//! `Semaphore::acquire_owned` needs an `Arc<Semaphore>` and yields a permit
//! with no lifetime tied to the semaphore, so it can move into a spawned
//! task.

use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{MessageBusError, Result};

#[derive(Debug, Default)]
struct Limits {
    max_permits: usize,
    /// Held permits to swallow on release after a shrink
    debt: usize,
}

/// Counting semaphore whose capacity can change at runtime
#[derive(Debug)]
pub struct AdjustableSemaphore {
    semaphore: Arc<Semaphore>,
    limits: Mutex<Limits>,
}

impl AdjustableSemaphore {
    pub fn new(max_permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_permits)),
            limits: Mutex::new(Limits {
                max_permits,
                debt: 0,
            }),
        }
    }

    fn limits(&self) -> MutexGuard<'_, Limits> {
        // Limits holds plain counters, a poisoned guard is still consistent
        self.limits.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for a permit, giving up when `cancel` fires
    pub async fn acquire(self: &Arc<Self>, cancel: &CancellationToken) -> Result<CallbackPermit> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(MessageBusError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit
                .map_err(|_| MessageBusError::Internal("semaphore closed".to_string()))?,
        };

        Ok(CallbackPermit {
            permit: Some(permit),
            owner: self.clone(),
        })
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(self: &Arc<Self>) -> Option<CallbackPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        Some(CallbackPermit {
            permit: Some(permit),
            owner: self.clone(),
        })
    }

    /// Change the capacity without touching held permits
    pub fn set_max_permits(&self, max_permits: usize) {
        let mut limits = self.limits();
        let current = limits.max_permits;

        if max_permits > current {
            let mut grow = max_permits - current;
            let forgiven = grow.min(limits.debt);
            limits.debt -= forgiven;
            grow -= forgiven;
            if grow > 0 {
                self.semaphore.add_permits(grow);
            }
        } else if max_permits < current {
            let mut shrink = current - max_permits;
            while shrink > 0 {
                match self.semaphore.try_acquire() {
                    Ok(idle) => {
                        idle.forget();
                        shrink -= 1;
                    }
                    Err(_) => break,
                }
            }
            limits.debt += shrink;
        }

        limits.max_permits = max_permits;
    }

    pub fn max_permits(&self) -> usize {
        self.limits().max_permits
    }

    /// Permits free for immediate acquisition
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Permits currently held
    pub fn in_flight(&self) -> usize {
        let limits = self.limits();
        (limits.max_permits + limits.debt).saturating_sub(self.semaphore.available_permits())
    }

    fn release(&self, permit: OwnedSemaphorePermit) {
        let mut limits = self.limits();
        if limits.debt > 0 {
            limits.debt -= 1;
            permit.forget();
        } else {
            drop(permit);
        }
    }
}

/// A held delivery slot, returned on drop
#[derive(Debug)]
pub struct CallbackPermit {
    permit: Option<OwnedSemaphorePermit>,
    owner: Arc<AdjustableSemaphore>,
}

impl CallbackPermit {
    /// Return the slot now; dropping does the same
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.owner.release(permit);
        }
    }
}

impl Drop for CallbackPermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Point-in-time view of one endpoint's budget
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SemaphoreStats {
    pub callback_key: String,
    pub max_permits: usize,
    pub available: usize,
    pub in_flight: usize,
}

/// Callback key to semaphore map, created lazily
pub struct SemaphoreRegistry {
    default_permits: usize,
    semaphores: DashMap<String, Arc<AdjustableSemaphore>>,
}

impl SemaphoreRegistry {
    pub fn new(default_permits: usize) -> Self {
        Self {
            default_permits,
            semaphores: DashMap::new(),
        }
    }

    pub fn default_permits(&self) -> usize {
        self.default_permits
    }

    /// Semaphore for `callback_key`, created with `seed` or the default size
    ///
    /// `seed` only sizes a new semaphore; an existing one keeps its cap.
    pub fn get(&self, callback_key: &str, seed: Option<usize>) -> Arc<AdjustableSemaphore> {
        if let Some(existing) = self.semaphores.get(callback_key) {
            return existing.value().clone();
        }

        self.semaphores
            .entry(callback_key.to_string())
            .or_insert_with(|| {
                let permits = seed.unwrap_or(self.default_permits);
                debug!(callback_key, permits, "created callback semaphore");
                Arc::new(AdjustableSemaphore::new(permits))
            })
            .value()
            .clone()
    }

    /// Wait for a delivery slot on `callback_key`
    pub async fn acquire(
        &self,
        callback_key: &str,
        seed: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<CallbackPermit> {
        self.get(callback_key, seed).acquire(cancel).await
    }

    /// Resize the budget of `callback_key`, creating it if needed
    pub fn set_max_permits(&self, callback_key: &str, max_permits: usize) {
        let semaphore = self.get(callback_key, Some(max_permits));
        let previous = semaphore.max_permits();
        semaphore.set_max_permits(max_permits);
        if previous != max_permits {
            info!(callback_key, previous, max_permits, "callback concurrency changed");
        }
    }

    /// Free permits for `callback_key`, `None` if it was never used
    pub fn available(&self, callback_key: &str) -> Option<usize> {
        self.semaphores
            .get(callback_key)
            .map(|semaphore| semaphore.available())
    }

    /// Stats for every known key, sorted by key
    pub fn snapshot(&self) -> Vec<SemaphoreStats> {
        let mut stats: Vec<_> = self
            .semaphores
            .iter()
            .map(|entry| SemaphoreStats {
                callback_key: entry.key().clone(),
                max_permits: entry.value().max_permits(),
                available: entry.value().available(),
                in_flight: entry.value().in_flight(),
            })
            .collect();
        stats.sort_by(|a, b| a.callback_key.cmp(&b.callback_key));
        stats
    }

    pub fn len(&self) -> usize {
        self.semaphores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.semaphores.is_empty()
    }
}
