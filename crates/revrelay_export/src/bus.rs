//! Message bus client abstraction.

use parking_lot::Mutex;
use revrelay_model::OutboundRecord;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Failures of a bounded-wait publish.
#[derive(Debug, Error)]
pub enum BusError {
    /// No acknowledgment arrived within the bounded wait.
    #[error("publish not acknowledged within the timeout")]
    Timeout,

    /// The bus reported a failure for the record.
    #[error("bus rejected the record: {0}")]
    Rejected(String),

    /// The client has no connection to the bus.
    #[error("not connected to the bus")]
    Disconnected,
}

/// Acknowledgment returned by the bus for one accepted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    /// Bus-assigned position of the record, if the bus reports one.
    pub offset: Option<u64>,
}

/// A client of the external message bus.
///
/// Only the publish contract is required here; partitioning, topic
/// administration, serialization formats and connection management are the
/// implementation's concern. `publish` blocks for at most `timeout` waiting
/// for the acknowledgment; the wait always completes or times out on its
/// own, it is never aborted once started.
pub trait BusClient: Send + Sync {
    /// Publishes one record and waits up to `timeout` for acknowledgment.
    fn publish(&self, record: &OutboundRecord, timeout: Duration) -> BusResult<Acknowledgment>;
}

impl<B: BusClient + ?Sized> BusClient for Arc<B> {
    fn publish(&self, record: &OutboundRecord, timeout: Duration) -> BusResult<Acknowledgment> {
        (**self).publish(record, timeout)
    }
}

/// An in-memory bus client for tests.
///
/// Accepted records are retained in publish order. Failures can be
/// scripted: each queued failure is consumed by one publish attempt.
#[derive(Debug, Default)]
pub struct MemoryBusClient {
    published: Mutex<Vec<OutboundRecord>>,
    failures: Mutex<VecDeque<BusError>>,
}

impl MemoryBusClient {
    /// Creates a bus client that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for the next publish attempt.
    pub fn fail_next(&self, error: BusError) {
        self.failures.lock().push_back(error);
    }

    /// Queues `count` timeout failures.
    pub fn fail_next_n(&self, count: usize) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.push_back(BusError::Timeout);
        }
    }

    /// Returns all accepted records in publish order.
    pub fn published(&self) -> Vec<OutboundRecord> {
        self.published.lock().clone()
    }

    /// Returns the number of accepted records.
    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }
}

impl BusClient for MemoryBusClient {
    fn publish(&self, record: &OutboundRecord, _timeout: Duration) -> BusResult<Acknowledgment> {
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }
        let mut published = self.published.lock();
        published.push(record.clone());
        Ok(Acknowledgment {
            offset: Some(published.len() as u64 - 1),
        })
    }
}
