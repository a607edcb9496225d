//! Configuration for the export engine.

use std::time::Duration;

/// Configuration of one exporter instance.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Stable identifier of the source system, used as the partitioning key
    /// of every outbound record.
    pub source_id: String,
    /// Time a run may hold the export lock without refreshing it before
    /// other nodes presume the holder dead.
    pub lock_timeout: Duration,
    /// Pause after the first failure of a run.
    pub error_pause_start: Duration,
    /// Growth factor applied to the pause on each consecutive failure.
    pub error_pause_factor: f64,
    /// Ceiling for the failure pause.
    pub error_pause_max: Duration,
    /// Bounded wait for one bus acknowledgment.
    pub publish_timeout: Duration,
    /// Number of sent records retained for inspection. Zero disables the
    /// history.
    pub retained_records: usize,
}

impl ExporterConfig {
    /// Creates a configuration with default timings for the given source id.
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            lock_timeout: Duration::from_secs(50),
            error_pause_start: Duration::from_secs(60),
            error_pause_factor: 2.0,
            error_pause_max: Duration::from_secs(600),
            publish_timeout: Duration::from_secs(10),
            retained_records: 0,
        }
    }

    /// Sets the lock timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the initial failure pause.
    pub fn with_error_pause_start(mut self, pause: Duration) -> Self {
        self.error_pause_start = pause;
        self
    }

    /// Sets the failure-pause growth factor.
    pub fn with_error_pause_factor(mut self, factor: f64) -> Self {
        self.error_pause_factor = factor;
        self
    }

    /// Sets the failure-pause ceiling.
    pub fn with_error_pause_max(mut self, max: Duration) -> Self {
        self.error_pause_max = max;
        self
    }

    /// Sets the bounded wait for one publish.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Sets the number of sent records kept for inspection.
    pub fn with_retained_records(mut self, count: usize) -> Self {
        self.retained_records = count;
        self
    }

    /// Elapsed holding time after which the lock is refreshed, two thirds of
    /// the lock timeout.
    pub fn refresh_threshold(&self) -> Duration {
        self.lock_timeout * 2 / 3
    }
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self::new("")
    }
}
