//! Forward walker over a contiguous revision range.
//!
//! One walker is built per run, covering `[start, head]`. The changeset
//! stream skips empty revisions, so the walker must jump forward past gaps
//! while rejecting any backward or repeated movement, which would indicate
//! a corrupted or non-monotonic stream.

use revrelay_model::Revision;

use crate::error::{ExportError, ExportResult};

/// An indexed cursor over the revision numbers `start..=head`.
///
/// Building is O(head - start), once per run; advancing is O(1) amortized
/// per step even when skipping gaps.
#[derive(Debug)]
pub struct RevisionWalker {
    revisions: Vec<Revision>,
    cursor: usize,
    /// Set once the first advance happened; advancing to the start position
    /// itself is legal exactly once.
    moved: bool,
}

impl RevisionWalker {
    /// Builds the chain covering `[start, head]`, positioned at `start`.
    pub fn build_chain(start: Revision, head: Revision) -> Self {
        let revisions = (start.number()..=head.number())
            .map(Revision::new)
            .collect();
        Self {
            revisions,
            cursor: 0,
            moved: false,
        }
    }

    /// The revision the walker currently points at.
    pub fn position(&self) -> Revision {
        self.revisions
            .get(self.cursor)
            .copied()
            .unwrap_or_else(|| Revision::new(0))
    }

    /// Moves the walker forward to `revision`.
    ///
    /// Fails with [`ExportError::OutOfOrderRevision`] when asked to move to
    /// a revision at or before a position it already visited, or outside
    /// the built range.
    pub fn advance_to(&mut self, revision: Revision) -> ExportResult<()> {
        let out_of_order = || ExportError::OutOfOrderRevision {
            position: self.position(),
            delivered: revision,
        };
        if self.moved && revision <= self.position() {
            return Err(out_of_order());
        }
        if revision < self.position() {
            return Err(out_of_order());
        }
        let first = match self.revisions.first() {
            Some(first) => first.number(),
            None => return Err(out_of_order()),
        };
        let target = (revision.number() - first) as usize;
        if target >= self.revisions.len() {
            return Err(out_of_order());
        }
        self.cursor = target;
        self.moved = true;
        Ok(())
    }
}
