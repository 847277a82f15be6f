// Circuit breaker guarding the fast publish path
// Optimistic auto-reset after a fixed window, no half-open state

//! # Health Proxy
//!
//! [`CircuitBreaker`] decides whether the dispatcher may take the fast path
//! (asynchronous log write plus asynchronous publish) or has to fall back to
//! the degraded path (synchronous publish, no log write).
//!
//! The breaker is deliberately simple:
//! - any publish failure calls [`CircuitBreaker::set_broken`]
//! - once `reset_window` has passed since the last break, `is_healthy`
//!   reports healthy again on its own
//! - there is no success counting; the next attempt after the window is
//!   made optimistically and a new failure re-arms the breaker
//!
//! ## Concurrency
//!
//! State is an `AtomicBool` plus an `AtomicU64` timestamp. Concurrent
//! `set_broken` calls race and the last write wins, which only moves the end
//! of the broken window slightly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Monotonic millisecond clock
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Clock backed by `Instant`, counting from construction
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Hand-driven clock for tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Time-windowed failure detector
pub struct CircuitBreaker {
    broken: AtomicBool,
    last_break_ms: AtomicU64,
    reset_window: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Reset window used by the gateway unless configured otherwise
    pub const DEFAULT_RESET_WINDOW: Duration = Duration::from_secs(60);

    /// Create a healthy breaker using the system clock
    pub fn new(reset_window: Duration) -> Self {
        Self::with_clock(reset_window, Arc::new(SystemClock::new()))
    }

    /// Create a healthy breaker reading time from `clock`
    pub fn with_clock(reset_window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            broken: AtomicBool::new(false),
            last_break_ms: AtomicU64::new(0),
            reset_window,
            clock,
        }
    }

    /// Whether the fast path may be used
    ///
    /// A broken breaker heals itself here once the reset window has elapsed.
    pub fn is_healthy(&self) -> bool {
        if !self.broken.load(Ordering::Acquire) {
            return true;
        }

        let elapsed = self
            .clock
            .now_millis()
            .saturating_sub(self.last_break_ms.load(Ordering::Acquire));

        if elapsed >= self.reset_window.as_millis() as u64 {
            // Only the caller that flips the flag logs the reset
            if self
                .broken
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                info!(
                    broken_for_ms = elapsed,
                    "circuit breaker reset window elapsed, retrying fast path"
                );
            }
            true
        } else {
            false
        }
    }

    /// Trip the breaker; idempotent, extends the window on repeat calls
    pub fn set_broken(&self) {
        self.last_break_ms
            .store(self.clock.now_millis(), Ordering::Release);
        if !self.broken.swap(true, Ordering::AcqRel) {
            warn!(
                reset_window_ms = self.reset_window.as_millis() as u64,
                "circuit breaker tripped, switching to degraded publish path"
            );
        }
    }

    /// Raw flag, without applying the auto-reset
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub fn reset_window(&self) -> Duration {
        self.reset_window
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(Self::DEFAULT_RESET_WINDOW)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("broken", &self.is_broken())
            .field("last_break_ms", &self.last_break_ms.load(Ordering::Relaxed))
            .field("reset_window", &self.reset_window)
            .finish()
    }
}
