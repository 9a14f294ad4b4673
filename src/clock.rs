//! Time sources for stores.
//!
//! Stores read "now" through a [`Clock`] so that delayed jobs, lease expiry
//! and retention can be exercised in tests without waiting for wall-clock
//! time to pass.

use chrono::{DateTime, SubsecRound, Utc};
use std::fmt;
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Mock clock for controlling time in tests.
///
/// Clones share the same instant, so a test can keep one handle and hand
/// another to a store.
///
/// ```rust
/// use backlot::clock::{Clock, MockClock};
/// use chrono::Duration;
///
/// let clock = MockClock::new();
/// let start = clock.now();
/// clock.advance(Duration::minutes(30));
/// assert_eq!((clock.now() - start).num_minutes(), 30);
/// ```
#[derive(Clone, Debug)]
pub struct MockClock {
    current_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current time, truncated to
    /// microseconds to match database timestamp precision.
    pub fn new() -> Self {
        Self::at(Utc::now().trunc_subsecs(6))
    }

    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            current_time: Arc::new(Mutex::new(time)),
        }
    }

    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *time += duration;
    }

    pub fn set_time(&self, time: DateTime<Utc>) {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = time;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self
            .current_time
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
