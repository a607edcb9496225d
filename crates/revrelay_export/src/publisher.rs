//! Publisher: turns changesets into outbound records and sends them to the
//! bus with a bounded wait.

use parking_lot::Mutex;
use revrelay_model::{ChangeSet, OutboundRecord, SEQUENCE_NONE};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::bus::BusClient;
use crate::checkpoint::SEQUENCE_KEY;
use crate::clock::Clock;
use crate::coord::CoordinationStore;
use crate::error::{ExportError, ExportResult};
use crate::pipeline::ChangesetSink;

/// A record that was successfully published, kept for inspection.
#[derive(Debug, Clone)]
pub struct SentRecord {
    /// The published record.
    pub record: OutboundRecord,
    /// Time the acknowledgment arrived, in epoch milliseconds.
    pub sent_at: u64,
}

/// Bounded FIFO history of recently published records.
///
/// Purely operational: a diagnostics endpoint may read it concurrently with
/// the export thread, so it is guarded by a mutex. Capacity zero disables
/// retention entirely.
#[derive(Debug, Clone)]
pub struct SentRecordHistory {
    records: Arc<Mutex<VecDeque<SentRecord>>>,
    capacity: usize,
}

impl SentRecordHistory {
    /// Creates a history retaining up to `capacity` records.
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Whether retention is enabled.
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Appends a record, evicting the oldest once capacity is exceeded.
    pub fn offer(&self, record: OutboundRecord, sent_at: u64) {
        if self.capacity == 0 {
            return;
        }
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(SentRecord { record, sent_at });
    }

    /// Returns the retained records in send order, oldest first.
    pub fn snapshot(&self) -> Vec<SentRecord> {
        self.records.lock().iter().cloned().collect()
    }
}

///// Terminal sink of the rewrite pipeline: publishes every changeset it
/// receives as one outbound record with a dense sequence number.
pub struct Publisher<C, B> {
    coord: C,
    bus: B,
    clock: Arc<dyn Clock>,
    source_id: String,
    publish_timeout: Duration,
    history: SentRecordHistory,
}

impl<C: CoordinationStore, B: BusClient> Publisher<C, B> {
    /// Creates a publisher over the given stores.
    pub fn new(
        coord: C,
        bus: B,
        clock: Arc<dyn Clock>,
        source_id: impl Into<String>,
        publish_timeout: Duration,
        history: SentRecordHistory,
    ) -> Self {
        Self {
            coord,
            bus,
            clock,
            source_id: source_id.into(),
            publish_timeout,
            history,
        }
    }

    /// Reads the last confirmed sequence number from the coordination
    /// store. Reading through the store rather than memory keeps sequence
    /// numbers from being reused after a restart.
    pub fn last_confirmed_sequence(&self) -> ExportResult<u64> {
        let props = self.coord.get_properties(&[SEQUENCE_KEY])?;
        match props.get(SEQUENCE_KEY) {
            None => Ok(SEQUENCE_NONE),
            Some(raw) if raw.is_empty() => Ok(SEQUENCE_NONE),
            Some(raw) => raw.parse::<u64>().map_err(|_| ExportError::MalformedToken {
                key: SEQUENCE_KEY.to_string(),
                token: raw.clone(),
            }),
        }
    }
}

impl<C: CoordinationStore, B: BusClient> ChangesetSink for Publisher<C, B> {
    fn write(&mut self, changeset: ChangeSet) -> ExportResult<()> {
        if changeset.is_empty() {
            // Publishing it is harmless and guards against bugs upstream,
            // but it should not happen.
            warn!(
                revision = changeset.revision.number(),
                "publishing a seemingly empty changeset"
            );
        }
        let revision = changeset.revision;
        let sequence = self.last_confirmed_sequence()? + 1;
        let record = OutboundRecord::new(self.source_id.clone(), sequence, changeset);

        self.bus
            .publish(&record, self.publish_timeout)
            .map_err(|cause| ExportError::PublishFailed { revision, cause })?;

        // Confirmed: persist the sequence so a restart continues after it.
        self.coord
            .set_property(SEQUENCE_KEY, &sequence.to_string())?;
        self.history.offer(record, self.clock.now_millis());
        info!(
            revision = revision.number(),
            sequence, "finished sending revision"
        );
        Ok(())
    }

    fn flush(&mut self) -> ExportResult<()> {
        // Every record is awaited individually; nothing is buffered.
        Ok(())
    }

    fn close(&mut self) -> ExportResult<()> {
        Ok(())
    }
}
