//! Wall-clock source
//!
//! Every component that needs "now" asks a [`Clock`] instead of calling
//! `Utc::now()` directly, so tests can pin or step time deterministically.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, RwLock};

/// Provider of the current wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Shared handle to a clock
pub type SharedClock = Arc<dyn Clock>;

/// The real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to
///
/// Clones share the same underlying instant, so a test can hand one clone
/// to the hub and keep another to advance time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<RwLock<DateTime<Utc>>>,
}

impl ManualClock {
    /// Start at a fixed instant
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(RwLock::new(time)),
        }
    }

    /// Jump to an instant (may move backwards)
    pub fn set(&self, time: DateTime<Utc>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = time;
    }

    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        *current += duration;
    }

    pub fn advance_seconds(&self, seconds: i64) {
        self.advance(Duration::seconds(seconds));
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.read().unwrap_or_else(|e| e.into_inner())
    }
}
