//! Coordination store: the shared transactional key/value store used for
//! the export lock and checkpoint.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Result type for coordination-store operations.
pub type CoordResult<T> = Result<T, CoordError>;

/// Errors reported by a coordination store.
///
/// Any of these is fatal to the current export run; they are never
/// swallowed because a lost lock write could leave the lock permanently
/// held or permanently absent.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The store could not be reached.
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),

    /// A transaction failed to commit.
    #[error("coordination transaction failed: {0}")]
    TransactionFailed(String),
}

/// A small persisted key/value store with compare-and-set, shared by all
/// cluster nodes.
///
/// All three operations run within an implicit local transaction committed
/// by the implementation. `compare_and_set` is the only primitive used while
/// the lock is not held; plain `set_property` writes are reserved for the
/// confirmed lock holder.
pub trait CoordinationStore: Send + Sync {
    /// Reads the given keys in one transaction. Absent keys are omitted
    /// from the result.
    fn get_properties(&self, keys: &[&str]) -> CoordResult<HashMap<String, String>>;

    /// Atomically writes `new` under `key` if the current value equals
    /// `expected`. `None` means "absent": an expected `None` requires the
    /// key not to exist yet, a new `None` deletes the key. Returns whether
    /// the write happened.
    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> CoordResult<bool>;

    /// Unconditionally writes `value` under `key`.
    fn set_property(&self, key: &str, value: &str) -> CoordResult<()>;
}

impl<S: CoordinationStore + ?Sized> CoordinationStore for Arc<S> {
    fn get_properties(&self, keys: &[&str]) -> CoordResult<HashMap<String, String>> {
        (**self).get_properties(keys)
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> CoordResult<bool> {
        (**self).compare_and_set(key, expected, new)
    }

    fn set_property(&self, key: &str, value: &str) -> CoordResult<()> {
        (**self).set_property(key, value)
    }
}

/// An in-memory coordination store for tests and single-process use.
///
/// Tracks the number of write operations so tests can assert that no-op
/// runs stay read-only.
#[derive(Debug, Default)]
pub struct MemoryCoordinationStore {
    entries: Mutex<HashMap<String, String>>,
    write_count: Mutex<u64>,
    fail_next: Mutex<bool>,
}

impl MemoryCoordinationStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful write operations (CAS wins and plain sets).
    pub fn write_count(&self) -> u64 {
        *self.write_count.lock()
    }

    /// Makes the next operation fail with [`CoordError::Unavailable`].
    pub fn fail_next_operation(&self) {
        *self.fail_next.lock() = true;
    }

    /// Returns the current value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn check_failure(&self) -> CoordResult<()> {
        let mut fail = self.fail_next.lock();
        if *fail {
            *fail = false;
            return Err(CoordError::Unavailable("injected failure".into()));
        }
        Ok(())
    }
}

impl CoordinationStore for MemoryCoordinationStore {
    fn get_properties(&self, keys: &[&str]) -> CoordResult<HashMap<String, String>> {
        self.check_failure()?;
        let entries = self.entries.lock();
        Ok(keys
            .iter()
            .filter_map(|key| entries.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect())
    }

    fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> CoordResult<bool> {
        self.check_failure()?;
        let mut entries = self.entries.lock();
        let current = entries.get(key).map(String::as_str);
        if current != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                entries.insert(key.to_string(), value.to_string());
            }
            None => {
                entries.remove(key);
            }
        }
        *self.write_count.lock() += 1;
        Ok(true)
    }

    fn set_property(&self, key: &str, value: &str) -> CoordResult<()> {
        self.check_failure()?;
        self.entries
            .lock()
            .insert(key.to_string(), value.to_string());
        *self.write_count.lock() += 1;
        Ok(())
    }
}
