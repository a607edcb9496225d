//! Time source abstraction.
//!
//! The lock protocol compares wall-clock timestamps persisted by different
//! cluster nodes, so the engine takes its notion of "now" from a trait
//! instead of calling the system clock directly. Tests drive the protocol
//! with a manually advanced clock.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
    /// Returns the current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A manually advanced clock for tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<u64>>,
}

impl ManualClock {
    /// Creates a manual clock starting at the given time.
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: Arc::new(Mutex::new(start_millis)),
        }
    }

    /// Advances the clock by the given number of milliseconds.
    pub fn advance(&self, millis: u64) {
        *self.now.lock() += millis;
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, millis: u64) {
        *self.now.lock() = millis;
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        *self.now.lock()
    }
}
