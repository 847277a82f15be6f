// Task scheduling port for fire-and-forget work
// Log writes and asynchronous publishes are submitted here

//! # Task Schedulers
//!
//! The dispatcher never spawns background work directly. It submits boxed
//! futures to a [`TaskScheduler`], which makes the scheduling policy
//! injectable:
//!
//! - [`BoundedExecutor`]: fixed worker count reading from a bounded queue.
//!   Submission never waits; a full queue rejects the task immediately so
//!   the hot publish path never feels backpressure from a side channel.
//! - [`SpawnScheduler`]: one Tokio task per submission.
//!
//! ## Rust Learning Notes:
//!
//! ### BoxFuture
//! `BoxFuture<'static, ()>` is `Pin<Box<dyn Future<Output = ()> + Send>>`.
//! Boxing erases the concrete future type so tasks built from different
//! `async` blocks can share one queue.
//!
//! ### Sharing a Receiver
//! An `mpsc::Receiver` has a single owner. The workers share it through an
//! `Arc<Mutex<...>>` and take turns pulling the next task out of it.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::{MessageBusError, Result};

/// Unit of background work
pub type Task = BoxFuture<'static, ()>;

/// Non-blocking submission of background work
pub trait TaskScheduler: Send + Sync {
    /// Hand `task` over for execution; never waits for capacity
    fn submit(&self, task: Task) -> Result<()>;
}

/// Fixed-size worker pool with a bounded queue and reject-when-full policy
pub struct BoundedExecutor {
    name: String,
    sender: mpsc::Sender<Task>,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BoundedExecutor {
    /// Start `workers` workers pulling from a queue of `queue_depth` slots
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: impl Into<String>, workers: usize, queue_depth: usize) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Task>(queue_depth.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let shutdown = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|index| {
                let receiver = receiver.clone();
                let shutdown = shutdown.clone();
                let name = name.clone();
                tokio::spawn(async move {
                    run_worker(&name, index, receiver, shutdown).await;
                })
            })
            .collect();

        Self {
            name,
            sender,
            shutdown,
            workers: Mutex::new(handles),
        }
    }

    /// Free queue slots right now
    pub fn remaining_capacity(&self) -> usize {
        self.sender.capacity()
    }

    /// Stop accepting work, run what is already queued, then join the workers
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<_> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                error!(executor = %self.name, "executor worker ended abnormally: {}", e);
            }
        }
        debug!(executor = %self.name, "executor shut down");
    }
}

impl TaskScheduler for BoundedExecutor {
    fn submit(&self, task: Task) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(MessageBusError::SchedulerClosed);
        }
        self.sender.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => MessageBusError::SchedulerFull,
            TrySendError::Closed(_) => MessageBusError::SchedulerClosed,
        })
    }
}

async fn run_worker(
    name: &str,
    index: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    shutdown: CancellationToken,
) {
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                task = receiver.recv() => task,
                _ = shutdown.cancelled() => {
                    // Closing keeps already queued tasks available to recv
                    receiver.close();
                    receiver.recv().await
                }
            }
        };

        let Some(task) = next else {
            break;
        };

        // A panicking task must not take the worker down with it
        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            error!(executor = %name, worker = index, "background task panicked");
        }
    }
}

impl std::fmt::Debug for BoundedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedExecutor")
            .field("name", &self.name)
            .field("remaining_capacity", &self.remaining_capacity())
            .finish()
    }
}

/// Spawns every task on the current Tokio runtime
#[derive(Debug, Clone, Default)]
pub struct SpawnScheduler;

impl TaskScheduler for SpawnScheduler {
    fn submit(&self, task: Task) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| MessageBusError::SchedulerClosed)?;
        handle.spawn(task);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Holds submitted tasks until they are run explicitly
    ///
    /// Gives tests full control over when background work happens.
    #[derive(Default)]
    pub struct ManualScheduler {
        tasks: Mutex<Vec<Task>>,
        reject: std::sync::atomic::AtomicBool,
    }

    impl ManualScheduler {
        pub fn new() -> Self {
            Self::default()
        }

        /// A scheduler whose queue is always full
        pub fn rejecting() -> Self {
            let scheduler = Self::default();
            scheduler.set_rejecting(true);
            scheduler
        }

        pub fn set_rejecting(&self, reject: bool) {
            self.reject
                .store(reject, std::sync::atomic::Ordering::SeqCst);
        }

        /// Number of tasks waiting to run
        pub fn pending(&self) -> usize {
            self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
        }

        /// Run queued tasks in submission order, including ones they submit
        ///
        /// Returns how many tasks ran.
        pub async fn run_pending(&self) -> usize {
            let mut ran = 0;
            loop {
                let batch: Vec<Task> = match self.tasks.lock() {
                    Ok(mut tasks) => tasks.drain(..).collect(),
                    Err(_) => return ran,
                };
                if batch.is_empty() {
                    return ran;
                }
                for task in batch {
                    task.await;
                    ran += 1;
                }
            }
        }
    }

    impl TaskScheduler for ManualScheduler {
        fn submit(&self, task: Task) -> Result<()> {
            if self.reject.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(MessageBusError::SchedulerFull);
            }
            self.tasks
                .lock()
                .map_err(|_| MessageBusError::Internal("scheduler lock poisoned".to_string()))?
                .push(task);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_bounded_executor_runs_tasks() {
        let executor = BoundedExecutor::new("test", 2, 16);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            executor
                .submit(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                .boxed())
                .unwrap();
        }

        executor.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_bounded_executor_rejects_when_full() {
        let executor = BoundedExecutor::new("test", 1, 1);
        let gate = Arc::new(tokio::sync::Notify::new());

        // Occupy the only worker
        let blocker = gate.clone();
        executor
            .submit(async move { blocker.notified().await }.boxed())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Fill the only queue slot
        executor.submit(async {}.boxed()).unwrap();

        // Next submission fails fast instead of waiting
        let rejected = executor.submit(async {}.boxed());
        assert!(matches!(rejected, Err(MessageBusError::SchedulerFull)));

        gate.notify_one();
        executor.shutdown().await;
    }

    #[tokio::test]
    async fn test_bounded_executor_survives_panics() {
        let executor = BoundedExecutor::new("test", 1, 4);
        let counter = Arc::new(AtomicUsize::new(0));

        executor
            .submit(async { panic!("boom"); }.boxed())
            .unwrap();
        let after = counter.clone();
        executor
            .submit(async move {
                after.fetch_add(1, Ordering::SeqCst);
            }
            .boxed())
            .unwrap();

        executor.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let executor = BoundedExecutor::new("test", 1, 4);
        executor.shutdown().await;
        let result = executor.submit(async {}.boxed());
        assert!(matches!(result, Err(MessageBusError::SchedulerClosed)));
    }

    #[tokio::test]
    async fn test_manual_scheduler_runs_on_demand() {
        let scheduler = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let task_counter = counter.clone();
        scheduler
            .submit(async move {
                task_counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed())
            .unwrap();

        assert_eq!(scheduler.pending(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert_eq!(scheduler.run_pending().await, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[test]
    fn test_manual_scheduler_rejecting() {
        let scheduler = ManualScheduler::rejecting();
        let result = scheduler.submit(async {}.boxed());
        assert!(matches!(result, Err(MessageBusError::SchedulerFull)));
    }
}
