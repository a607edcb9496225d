//! Exponential backoff for failure pauses.

use std::time::Duration;

/// Pure computation of the pause before the next retry after consecutive
/// failures.
///
/// The n'th call to [`next`](Self::next) yields
/// `min(ceiling, start * factor^(n-1))`. The exporter drops the state and
/// constructs a fresh one whenever at least one changeset was published, so
/// transient blips do not compound into large delays once the system
/// recovers.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    current: Duration,
    factor: f64,
    ceiling: Duration,
}

impl ExponentialBackoff {
    /// Creates a backoff starting at `start`, growing by `factor`, capped at
    /// `ceiling`.
    pub fn new(start: Duration, factor: f64, ceiling: Duration) -> Self {
        Self {
            current: start,
            factor,
            ceiling,
        }
    }

    /// Returns the next pause and advances the state.
    pub fn next(&mut self) -> Duration {
        let pause = self.current.min(self.ceiling);
        let grown = self.current.as_secs_f64() * self.factor;
        self.current = Duration::from_secs_f64(grown.min(self.ceiling.as_secs_f64()));
        pause
    }

    /// Returns the pause the next call to [`next`](Self::next) would yield,
    /// without advancing.
    pub fn peek(&self) -> Duration {
        self.current.min(self.ceiling)
    }
}
