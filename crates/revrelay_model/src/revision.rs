//! Revision identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one committed transaction in the source store.
///
/// Revisions are totally ordered and monotonically increasing. Once
/// committed they never change; revision numbers may have gaps from the
/// exporter's point of view because empty revisions are never streamed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    /// The smallest valid revision number.
    pub const FIRST: Revision = Revision(1);

    /// Creates a revision from a raw commit number.
    pub fn new(number: u64) -> Self {
        Revision(number)
    }

    /// Returns the raw commit number.
    pub fn number(&self) -> u64 {
        self.0
    }

    /// Returns the revision directly following this one.
    pub fn next(&self) -> Revision {
        Revision(self.0 + 1)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Revision {
    fn from(number: u64) -> Self {
        Revision(number)
    }
}
