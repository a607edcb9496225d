//! # RevRelay Export Engine
//!
//! Change-data-capture export from a versioned, append-only data store to a
//! durable message bus.
//!
//! This crate provides:
//! - Cluster-wide export lock via compare-and-set on shared keys
//! - Durable revision checkpointing and crash-safe resumption
//! - Strictly ordered revision replay
//! - A stackable changeset rewrite pipeline
//! - Dense, gap-free outbound sequence numbering
//! - Failure pauses with capped exponential backoff
//!
//! ## Architecture
//!
//! Many identical nodes each schedule [`Exporter::run`] periodically; the
//! coordination store decides which node exports. A run streams every
//! changeset between the durable checkpoint and the head visible at lock
//! acquisition through the rewriters into the [`Publisher`], persisting
//! progress after every acknowledged record.
//!
//! ## Key Invariants
//!
//! - At most one node exports at a time
//! - Changesets are published in strict revision order, none skipped
//! - Progress is persisted only for acknowledged records
//! - Sequence numbers are dense; a failed publish consumes none
//! - A stale lock is released, never taken over in the same run

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backoff;
mod bus;
mod checkpoint;
mod clock;
mod config;
mod coord;
mod error;
mod exporter;
mod pipeline;
mod publisher;
mod source;
mod walker;

pub use backoff::ExponentialBackoff;
pub use bus::{Acknowledgment, BusClient, BusError, BusResult, MemoryBusClient};
pub use checkpoint::{
    CheckpointToken, ExportLock, LockManager, LockOutcome, LOCK_KEY, PROGRESS_KEY, SEQUENCE_KEY,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::ExporterConfig;
pub use coord::{CoordError, CoordResult, CoordinationStore, MemoryCoordinationStore};
pub use error::{ExportError, ExportResult};
pub use exporter::{ExportStats, Exporter, RunOutcome, RunStatus};
pub use pipeline::{ChangesetSink, FnRewriter, Rewriter, StackedSink, StageError};
pub use publisher::{Publisher, SentRecord, SentRecordHistory};
pub use source::{
    ChangesetCursor, MemoryRevisionStore, RevisionStore, SourceError, SourceResult,
};
pub use walker::RevisionWalker;
