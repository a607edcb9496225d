//! Error types for the export engine.

use revrelay_model::Revision;
use thiserror::Error;

use crate::bus::BusError;
use crate::coord::CoordError;
use crate::source::SourceError;

/// Result type for export operations.
pub type ExportResult<T> = Result<T, ExportError>;

/// Errors that can occur during an export run.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Coordination-store failure (lock or checkpoint I/O).
    ///
    /// Always fatal to the current run: a swallowed failure here risks a
    /// permanently stuck or permanently absent lock.
    #[error("coordination store error: {0}")]
    Coordination(#[from] CoordError),

    /// Revision-store failure while resolving or streaming changesets.
    #[error("revision store error: {0}")]
    Source(#[from] SourceError),

    /// A publish did not get acknowledged within the bounded wait.
    #[error("publishing revision {revision} failed: {cause}")]
    PublishFailed {
        /// Revision of the changeset that could not be published.
        revision: Revision,
        /// The underlying bus failure.
        #[source]
        cause: BusError,
    },

    /// A rewriter stage failed for a changeset.
    ///
    /// Deterministic for a given revision: retrying without operator
    /// intervention will fail again, so the failure is terminal for the run.
    #[error("rewriting revision {revision} failed: {message}")]
    TransformFailed {
        /// Revision of the changeset the stage rejected.
        revision: Revision,
        /// Description of the stage failure.
        message: String,
    },

    /// The changeset stream moved backwards or repeated a revision.
    ///
    /// Indicates store corruption or a logic bug, never normal operation.
    #[error("out-of-order revision: walker at {position}, stream delivered {delivered}")]
    OutOfOrderRevision {
        /// Walker position when the violation was detected.
        position: Revision,
        /// Revision delivered by the changeset stream.
        delivered: Revision,
    },

    /// A checkpoint token could not be decoded.
    #[error("malformed checkpoint token {token:?} under key {key:?}")]
    MalformedToken {
        /// Coordination-store key the token was read from.
        key: String,
        /// The raw token value.
        token: String,
    },
}

impl ExportError {
    /// Returns true if a later scheduled run can succeed without operator
    /// intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExportError::PublishFailed { .. }
                | ExportError::Coordination(_)
                | ExportError::Source(_)
        )
    }
}
