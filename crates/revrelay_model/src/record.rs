//! Outbound records published to the message bus.

use crate::changeset::ChangeSet;
use serde::{Deserialize, Serialize};

/// Sequence value meaning "no record has ever been confirmed".
pub const SEQUENCE_NONE: u64 = 0;

/// One published unit: a changeset wrapped with a durable sequence number.
///
/// The sequence number is a dense counter over successfully published
/// records and is independent of the revision number: revisions may have
/// gaps, confirmed sequence numbers never do. A failed publish consumes no
/// sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundRecord {
    /// Stable partitioning key, typically the source-system identifier.
    pub key: String,
    /// Strictly increasing, gap-free sequence number of this record.
    pub sequence: u64,
    /// The changeset carried by this record.
    pub changeset: ChangeSet,
}

impl OutboundRecord {
    /// Creates a new outbound record.
    pub fn new(key: impl Into<String>, sequence: u64, changeset: ChangeSet) -> Self {
        Self {
            key: key.into(),
            sequence,
            changeset,
        }
    }
}
