//! Requeue backoff for failing resources.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

/// Default delay after the first failure.
pub const DEFAULT_BASE: Duration = Duration::from_secs(1);

/// Default upper bound of the delay.
pub const DEFAULT_MAX: Duration = Duration::from_secs(300);

/// Tracks consecutive failures per resource and when each may run again.
///
/// The delay doubles with every failure, starting at `base` and capped at
/// `max`. A success clears the entry.
#[derive(Debug, Clone)]
pub struct BackoffTracker {
    base: Duration,
    max: Duration,

    /// resource_key -> (consecutive failures, earliest next attempt)
    failures: BTreeMap<String, (u32, Instant)>,
}

impl Default for BackoffTracker {
    fn default() -> Self {
        Self::new(DEFAULT_BASE, DEFAULT_MAX)
    }
}

impl BackoffTracker {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: BTreeMap::new(),
        }
    }

    /// Delay to wait after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Record a failure at `now`. Returns the delay before the next attempt.
    pub fn record_failure(&mut self, resource_key: &str, now: Instant) -> Duration {
        let count = self
            .failures
            .get(resource_key)
            .map_or(1, |(count, _)| count.saturating_add(1));
        let delay = self.delay(count);
        self.failures
            .insert(resource_key.to_string(), (count, now + delay));
        delay
    }

    /// Whether the resource may be reconciled at `now`.
    pub fn is_ready(&self, resource_key: &str, now: Instant) -> bool {
        self.failures
            .get(resource_key)
            .is_none_or(|(_, next)| now >= *next)
    }

    pub fn failures(&self, resource_key: &str) -> u32 {
        self.failures.get(resource_key).map_or(0, |(count, _)| *count)
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Forget resources that no longer exist.
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.failures.retain(|key, _| keep(key));
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
