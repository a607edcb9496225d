//! # revrelay Model
//!
//! Revision and changeset data model for revrelay.
//!
//! This crate provides:
//! - `Revision`, the monotonically increasing commit identifier
//! - `ChangeSet`, the atomic unit of change belonging to one revision
//! - `OutboundRecord`, one published unit with a dense sequence number
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod changeset;
mod record;
mod revision;

pub use changeset::{BranchEvent, ChangeKind, ChangeSet, ObjectChange, ObjectId};
pub use record::{OutboundRecord, SEQUENCE_NONE};
pub use revision::Revision;
