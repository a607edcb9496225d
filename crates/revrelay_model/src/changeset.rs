//! Changesets: the atomic unit of change for one revision.

use crate::revision::Revision;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Kind of change applied to one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Object was created (no previous version existed).
    Creation,
    /// Object was updated (previous version existed).
    Update,
    /// Object was deleted.
    Deletion,
}

/// Identity of one object in the source store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    /// Type name of the object.
    pub type_name: String,
    /// Stable object identifier within the type.
    pub id: String,
}

impl ObjectId {
    /// Creates a new object identity.
    pub fn new(type_name: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            id: id.into(),
        }
    }
}

/// One per-object change record inside a changeset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectChange {
    /// The object this change applies to.
    pub object: ObjectId,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Attribute values carried by the change.
    ///
    /// For creations the full initial state, for updates the changed
    /// attributes, empty for deletions.
    pub values: BTreeMap<String, Value>,
}

impl ObjectChange {
    /// Creates a creation record.
    pub fn creation(object: ObjectId, values: BTreeMap<String, Value>) -> Self {
        Self {
            object,
            kind: ChangeKind::Creation,
            values,
        }
    }

    /// Creates an update record.
    pub fn update(object: ObjectId, values: BTreeMap<String, Value>) -> Self {
        Self {
            object,
            kind: ChangeKind::Update,
            values,
        }
    }

    /// Creates a deletion record.
    pub fn deletion(object: ObjectId) -> Self {
        Self {
            object,
            kind: ChangeKind::Deletion,
            values: BTreeMap::new(),
        }
    }
}

/// A branch-management event belonging to a changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchEvent {
    /// Identifier of the branch the event concerns.
    pub branch: u64,
    /// Branch the new branch was created from, if any.
    pub base_branch: Option<u64>,
    /// Revision the new branch was based on, if any.
    pub base_revision: Option<Revision>,
}

/// The full set of object-level changes belonging to one revision.
///
/// Changesets are immutable once read from the source store. They are
/// replayed in strictly increasing revision order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    /// Revision this changeset was committed as.
    pub revision: Revision,
    /// Commit timestamp in epoch milliseconds.
    pub date: u64,
    /// Author of the commit.
    pub author: String,
    /// Object creations, in commit order.
    pub creations: Vec<ObjectChange>,
    /// Object updates, in commit order.
    pub updates: Vec<ObjectChange>,
    /// Object deletions, in commit order.
    pub deletions: Vec<ObjectChange>,
    /// Branch-management events.
    pub branch_events: Vec<BranchEvent>,
}

impl ChangeSet {
    /// Creates an empty changeset for the given revision.
    pub fn new(revision: Revision, date: u64, author: impl Into<String>) -> Self {
        Self {
            revision,
            date,
            author: author.into(),
            creations: Vec::new(),
            updates: Vec::new(),
            deletions: Vec::new(),
            branch_events: Vec::new(),
        }
    }

    /// Adds a creation record.
    pub fn with_creation(mut self, change: ObjectChange) -> Self {
        self.creations.push(change);
        self
    }

    /// Adds an update record.
    pub fn with_update(mut self, change: ObjectChange) -> Self {
        self.updates.push(change);
        self
    }

    /// Adds a deletion record.
    pub fn with_deletion(mut self, change: ObjectChange) -> Self {
        self.deletions.push(change);
        self
    }

    /// Adds a branch event.
    pub fn with_branch_event(mut self, event: BranchEvent) -> Self {
        self.branch_events.push(event);
        self
    }

    /// Returns true if the changeset carries no changes at all.
    ///
    /// Empty changesets cause no harm when published, but they are
    /// unnecessary and usually point at a bug upstream.
    pub fn is_empty(&self) -> bool {
        self.creations.is_empty()
            && self.updates.is_empty()
            && self.deletions.is_empty()
            && self.branch_events.is_empty()
    }

    /// Total number of per-object change records.
    pub fn change_count(&self) -> usize {
        self.creations.len() + self.updates.len() + self.deletions.len()
    }
}
