//! Time source for the reconciler
//!
//! Step pacing, `lastTransitionTime`, history entries and the analysis
//! interval gate read `Context::clock` instead of `Utc::now()`.

use chrono::{DateTime, Utc};

/// Source of "now" for an experiment tick
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Frozen clock; scenario tests step it past `analysisInterval` by hand
#[cfg(test)]
pub struct MockClock {
    now: std::sync::Mutex<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl MockClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    /// Fixed, readable starting point for scenario tests
    pub fn at_epoch() -> Self {
        Self::new(
            DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
                .expect("valid timestamp")
                .with_timezone(&Utc),
        )
    }

    pub fn advance(&self, duration: chrono::Duration) {
        *self.now.lock().expect("MockClock lock poisoned") += duration;
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("MockClock lock poisoned")
    }
}
