//! # Exponential Backoff
//!
//! Retry delays for failed reconciliations. The delay doubles with every
//! consecutive failure of the same object and is capped, matching the
//! standard controller rate limiter: 5ms, 10ms, 20ms, ... up to 1000s by
//! default.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Exponential backoff calculator
///
/// Stateless: the caller keeps the failure count (`RetryTracker` keeps one
/// per object) and asks for the delay that goes with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Delay after the first failure
    base: Duration,
    /// Upper bound on any delay
    max: Duration,
}

impl ExponentialBackoff {
    /// Create a new backoff doubling from `base` up to `max`
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Calculate the delay for a given number of previous failures
    ///
    /// `failures` is 0-indexed: the first retry waits `base`, the second
    /// `2 * base`, and so on, capped at `max`.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Consecutive failures per object, with a cap on retries
#[derive(Debug)]
pub struct RetryTracker {
    backoff: ExponentialBackoff,
    max_retries: u32,
    failures: Mutex<HashMap<String, u32>>,
}

impl RetryTracker {
    /// Creates a tracker allowing `max_retries` retries per object
    #[must_use]
    pub fn new(backoff: ExponentialBackoff, max_retries: u32) -> Self {
        Self {
            backoff,
            max_retries,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure of `key` and returns the delay before its next
    /// attempt, or `None` once its retries are used up. Giving up clears
    /// the count, so a later change starts over.
    pub fn next_delay(&self, key: &str) -> Option<Duration> {
        let mut failures = self.lock();
        let count = failures.entry(key.to_string()).or_insert(0);
        if *count >= self.max_retries {
            failures.remove(key);
            return None;
        }
        let delay = self.backoff.delay_for(*count);
        *count += 1;
        Some(delay)
    }

    /// Retries `key` has used since it last succeeded
    #[must_use]
    pub fn retries(&self, key: &str) -> u32 {
        self.lock().get(key).copied().unwrap_or(0)
    }

    /// Forgets the failures of `key`
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
