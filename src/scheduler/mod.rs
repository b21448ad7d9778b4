//! Timer primitives for the continuation loop.
//!
//! One-shot and recurring timers over tokio, each returning a
//! cancellable handle, plus the adaptive interval used by the periodic
//! checker. Monotonic time (`Instant`) drives scheduling; wall-clock
//! time is exposed separately for timestamps so tests can pause the
//! tokio clock without skewing persisted records.

use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Splits monotonic scheduling time from wall-clock timestamp time.
pub trait Clock: Send + Sync {
    fn monotonic(&self) -> Instant;
    fn wall(&self) -> chrono::DateTime<chrono::Utc>;
}

/// Default clock backed by the OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn monotonic(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}

/// Handle to a scheduled timer; pass back to [`Scheduler::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(u64);

/// Owns every timer it hands out; all are cancellable, individually or
/// in bulk at shutdown.
#[derive(Clone, Default)]
pub struct Scheduler {
    timers: Arc<Mutex<HashMap<TimerHandle, JoinHandle<()>>>>,
    next_id: Arc<AtomicU64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_handle(&self) -> TimerHandle {
        TimerHandle(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Run `f` once after `delay`.
    pub async fn after<F, Fut>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self.next_handle();
        let timers = self.timers.clone();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f().await;
            timers.lock().await.remove(&handle);
        });
        self.timers.lock().await.insert(handle, join);
        handle
    }

    /// Run `f` every `interval` until cancelled. The first tick fires
    /// after one full interval, not immediately.
    pub async fn every<F, Fut>(&self, interval: Duration, f: F) -> TimerHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self.next_handle();
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // interval's first tick completes immediately; consume it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                f().await;
            }
        });
        self.timers.lock().await.insert(handle, join);
        handle
    }

    /// Cancel a timer. Cancelling an already-fired or unknown handle
    /// is a no-op.
    pub async fn cancel(&self, handle: TimerHandle) {
        if let Some(join) = self.timers.lock().await.remove(&handle) {
            join.abort();
            debug!("[Scheduler] Cancelled timer {:?}", handle);
        }
    }

    /// Cancel everything; used on shutdown.
    pub async fn cancel_all(&self) {
        let mut timers = self.timers.lock().await;
        let count = timers.len();
        for (_, join) in timers.drain() {
            join.abort();
        }
        if count > 0 {
            debug!("[Scheduler] Cancelled {} timers", count);
        }
    }

    pub async fn active_count(&self) -> usize {
        self.timers.lock().await.len()
    }
}

/// Recent session activity as observed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityLevel {
    /// Output is streaming steadily; check sooner.
    HighlyActive,
    /// No output for a while; back off.
    Idle,
    /// Neither extreme; keep the current cadence.
    Normal,
}

/// Configuration for [`AdaptiveInterval`].
#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub min: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Fractional jitter applied to each computed interval (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(crate::constants::ADAPTIVE_MIN_INTERVAL_SECS),
            max: Duration::from_secs(crate::constants::ADAPTIVE_MAX_INTERVAL_SECS),
            factor: crate::constants::ADAPTIVE_FACTOR,
            jitter: 0.1,
        }
    }
}

/// Interval that tightens under activity and relaxes when idle,
/// clamped to `[min, max]` with a little jitter so a fleet of sessions
/// does not synchronize its check-ins.
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    config: AdaptiveConfig,
    current: Duration,
}

impl AdaptiveInterval {
    pub fn new(initial: Duration, config: AdaptiveConfig) -> Self {
        let current = initial.clamp(config.min, config.max);
        Self { config, current }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Compute and store the next interval given observed activity.
    pub fn next_interval(&mut self, activity: ActivityLevel) -> Duration {
        let secs = self.current.as_secs_f64();
        let scaled = match activity {
            ActivityLevel::HighlyActive => secs / self.config.factor,
            ActivityLevel::Idle => secs * self.config.factor,
            ActivityLevel::Normal => secs,
        };
        let clamped = scaled.clamp(
            self.config.min.as_secs_f64(),
            self.config.max.as_secs_f64(),
        );
        self.current = Duration::from_secs_f64(clamped);

        let jitter = if self.config.jitter > 0.0 {
            let spread = clamped * self.config.jitter;
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        let jittered = (clamped + jitter).max(self.config.min.as_secs_f64());
        Duration::from_secs_f64(jittered)
    }
}
