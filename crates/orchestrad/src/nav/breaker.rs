//! Per-service circuit breaker for manifest fetches
//!
//! Closed until `threshold` consecutive failures, then open until
//! `reset_after` has passed since the last failure. No half-open trial call:
//! once the window expires the entry is dropped and calls flow again.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_RESET_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct BreakerEntry {
    failures: u32,
    last_failure_at: Instant,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    entries: DashMap<String, BreakerEntry>,
    threshold: u32,
    reset_after: Duration,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            threshold: threshold.max(1),
            reset_after,
        }
    }

    /// False while the breaker for `service_id` is open
    pub fn should_attempt(&self, service_id: &str) -> bool {
        let expired = match self.entries.get(service_id) {
            None => return true,
            Some(entry) => {
                if entry.failures < self.threshold {
                    return true;
                }
                entry.last_failure_at.elapsed() > self.reset_after
            }
        };

        if expired {
            self.entries.remove(service_id);
            info!("[NAV] Circuit breaker for {} reset - retrying", service_id);
        }
        expired
    }

    pub fn record_success(&self, service_id: &str) {
        self.entries.remove(service_id);
    }

    /// Returns the consecutive failure count after this failure
    pub fn record_failure(&self, service_id: &str) -> u32 {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(service_id.to_string())
            .or_insert(BreakerEntry {
                failures: 0,
                last_failure_at: now,
            });
        entry.failures += 1;
        entry.last_failure_at = now;
        let failures = entry.failures;
        drop(entry);

        if failures == self.threshold {
            warn!(
                "[NAV] Circuit breaker opened for {} after {} failures",
                service_id, failures
            );
        }
        failures
    }

    pub fn failure_count(&self, service_id: &str) -> u32 {
        self.entries.get(service_id).map(|e| e.failures).unwrap_or(0)
    }

    pub fn is_open(&self, service_id: &str) -> bool {
        self.entries
            .get(service_id)
            .map(|e| e.failures >= self.threshold && e.last_failure_at.elapsed() <= self.reset_after)
            .unwrap_or(false)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD, DEFAULT_RESET_AFTER)
    }
}
