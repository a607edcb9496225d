//! Revision store: the versioned, append-only source of changesets.

use parking_lot::Mutex;
use revrelay_model::{ChangeSet, Revision};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Result type for revision-store operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors reported by a revision store.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The given revision number does not exist in the store.
    #[error("unknown revision {0}")]
    UnknownRevision(Revision),

    /// The store could not be read.
    #[error("revision store unavailable: {0}")]
    Unavailable(String),
}

/// A closable, forward-only stream of changesets in revision order.
///
/// Empty revisions are never delivered; the stream skips them. Resources
/// held by the cursor are released when it is dropped.
pub trait ChangesetCursor {
    /// Returns the next changeset, or `None` once the range is exhausted.
    fn next_changeset(&mut self) -> SourceResult<Option<ChangeSet>>;
}

/// The versioned, append-only data store changes are exported from.
///
/// Head visibility may be eventually consistent across cluster nodes: this
/// node's head can lag a commit another node has already exported.
pub trait RevisionStore: Send + Sync {
    /// Returns the newest committed revision visible to this node.
    fn head_revision(&self) -> SourceResult<Revision>;

    /// Validates that `number` names a committed revision and returns it.
    fn resolve_revision(&self, number: u64) -> SourceResult<Revision>;

    /// Opens a forward cursor over the non-empty changesets in
    /// `(from, to]`, ordered by revision.
    fn changeset_cursor(
        &self,
        from_exclusive: Revision,
        to_inclusive: Revision,
    ) -> SourceResult<Box<dyn ChangesetCursor + '_>>;
}

impl<S: RevisionStore + ?Sized> RevisionStore for Arc<S> {
    fn head_revision(&self) -> SourceResult<Revision> {
        (**self).head_revision()
    }

    fn resolve_revision(&self, number: u64) -> SourceResult<Revision> {
        (**self).resolve_revision(number)
    }

    fn changeset_cursor(
        &self,
        from_exclusive: Revision,
        to_inclusive: Revision,
    ) -> SourceResult<Box<dyn ChangesetCursor + '_>> {
        (**self).changeset_cursor(from_exclusive, to_inclusive)
    }
}

/// An in-memory revision store for tests.
///
/// Holds committed changesets keyed by revision; the head is the highest
/// committed revision and can also be pinned lower to model a node whose
/// view of the store lags the cluster.
#[derive(Debug, Default)]
pub struct MemoryRevisionStore {
    changesets: Mutex<BTreeMap<Revision, ChangeSet>>,
    empty_high: Mutex<Option<Revision>>,
    pinned: Mutex<Option<Revision>>,
}

impl MemoryRevisionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Commits a changeset. The head advances to the changeset's revision
    /// unless pinned.
    pub fn commit(&self, changeset: ChangeSet) {
        self.changesets
            .lock()
            .insert(changeset.revision, changeset);
    }

    /// Commits an empty revision: the head advances past it but the cursor
    /// never delivers it.
    pub fn commit_empty(&self, revision: Revision) {
        let mut high = self.empty_high.lock();
        if high.map_or(true, |h| revision > h) {
            *high = Some(revision);
        }
    }

    /// Pins the visible head to the given revision, modeling a node that
    /// has not yet refetched newer commits.
    pub fn pin_head(&self, revision: Revision) {
        *self.pinned.lock() = Some(revision);
    }

    fn effective_head(&self) -> Revision {
        if let Some(pinned) = *self.pinned.lock() {
            return pinned;
        }
        let committed = self
            .changesets
            .lock()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(Revision::FIRST);
        committed.max((*self.empty_high.lock()).unwrap_or(Revision::FIRST))
    }
}

impl RevisionStore for MemoryRevisionStore {
    fn head_revision(&self) -> SourceResult<Revision> {
        Ok(self.effective_head())
    }

    fn resolve_revision(&self, number: u64) -> SourceResult<Revision> {
        let revision = Revision::new(number);
        if number == 0 || revision > self.effective_head() {
            return Err(SourceError::UnknownRevision(revision));
        }
        Ok(revision)
    }

    fn changeset_cursor(
        &self,
        from_exclusive: Revision,
        to_inclusive: Revision,
    ) -> SourceResult<Box<dyn ChangesetCursor + '_>> {
        let batch: Vec<ChangeSet> = self
            .changesets
            .lock()
            .range(from_exclusive.next()..=to_inclusive)
            .map(|(_, cs)| cs.clone())
            .collect();
        Ok(Box::new(MemoryCursor {
            changesets: batch.into_iter(),
        }))
    }
}

struct MemoryCursor {
    changesets: std::vec::IntoIter<ChangeSet>,
}

impl ChangesetCursor for MemoryCursor {
    fn next_changeset(&mut self) -> SourceResult<Option<ChangeSet>> {
        Ok(self.changesets.next())
    }
}
