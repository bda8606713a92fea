//! Per-experiment retry accounting
//!
//! Counts consecutive retryable failures so the requeue delay can grow
//! exponentially and an experiment that never recovers is eventually
//! failed instead of retried forever.

use crate::controller::snapshot::ExperimentId;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

#[derive(Default)]
pub struct RetryBudget {
    failures: Mutex<HashMap<ExperimentId, u32>>,
}

impl RetryBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one more consecutive failure; returns the new count
    pub fn record_failure(&self, id: &ExperimentId) -> u32 {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(id.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Clear the count after a tick that completed without a retryable error
    pub fn reset(&self, id: &ExperimentId) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    pub fn failures(&self, id: &ExperimentId) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .copied()
            .unwrap_or(0)
    }
}

/// Exponential backoff: base * 2^(failures-1), capped at max
pub fn backoff_delay(failures: u32, base: Duration, max: Duration) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent)
        .map_or(max, |delay| delay.min(max))
}
