//! Reconciliation loop primitives.
//!
//! Every reconciliation loop in the scheduler has the same shape: watch a
//! set of named things in the coordination store, keep exactly one live
//! worker per thing, and clean up whatever outlives its worker. The
//! [`supervisor`] module implements that shape once; this module holds the
//! timing policies the loops share.
//!
//! # Invariants
//!
//! - A supervisor never returns while any task it spawned is still running.
//! - Each pass re-reads the full current state; watch events only say *when*
//!   to look again, never *what* changed.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

pub mod supervisor;

pub use supervisor::{listen, manage, wait_for_shutdown, ConnectionSlot, Listener, Spawner};

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(30) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exponent);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

// =============================================================================
// Retry Policy
// =============================================================================

/// Bounded retry with a fixed delay, applied to store writes that can fail
/// transiently (lost optimistic races, a briefly unreachable server).
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub limit: u32,

    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RETRY_LIMIT,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails with an error `retryable` rejects,
    /// or the retry limit is spent. Returns the last outcome.
    pub async fn run<T, E, F, Fut, R>(&self, mut op: F, retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.limit && retryable(&e) => {
                    attempt += 1;
                    debug!(attempt, limit = self.limit, error = %e, "Retrying");
                    tokio::time::sleep(self.delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// =============================================================================
// Exclusion Window
// =============================================================================

/// Remembers keys for a fixed window after they are recorded.
///
/// Used to keep a failed placement from being retried on the same target
/// right away.
#[derive(Debug, Clone)]
pub struct ExclusionWindow<K: Ord> {
    window: Duration,
    entries: BTreeMap<K, Instant>,
}

impl<K: Ord> ExclusionWindow<K> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: BTreeMap::new(),
        }
    }

    /// Excludes `key` for the window, restarting it if already excluded.
    pub fn record(&mut self, key: K) {
        self.entries.insert(key, Instant::now());
    }

    pub fn is_excluded(&self, key: &K) -> bool {
        self.entries
            .get(key)
            .is_some_and(|at| at.elapsed() < self.window)
    }

    pub fn clear(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Drops expired entries.
    pub fn prune(&mut self) {
        let window = self.window;
        self.entries.retain(|_, at| at.elapsed() < window);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Default retry limit for transient store failures.
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Default pause between retries, and between failed reconciliation passes.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
