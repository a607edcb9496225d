//! Export lock and checkpoint protocol.
//!
//! At most one cluster node may export at a time. The right to export is
//! claimed without a dedicated lock service, by compare-and-set on a shared
//! coordination-store key. Two checkpoint-shaped tokens exist:
//!
//! - the **lock token** records who/when last claimed the export right and
//!   is refreshed periodically while exporting,
//! - the **progress token** records the revision through which export has
//!   durably succeeded.
//!
//! Invariant: `progress.revision <= lock.revision`. The lock is free exactly
//! when both tokens are equal; a lock token older than the lock timeout is
//! presumed abandoned and released by the next contender.

use revrelay_model::Revision;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::coord::CoordinationStore;
use crate::error::{ExportError, ExportResult};

/// Key of the progress token: revision through which export has durably
/// succeeded, encoded as `"<revision>@<epoch-millis>"`.
pub const PROGRESS_KEY: &str = "lastSentRevisionAtDate";

/// Key of the lock token, same encoding as the progress token.
pub const LOCK_KEY: &str = "lastSentRevisionAtDateLock";

/// Key of the last confirmed outbound sequence number, a decimal string.
pub const SEQUENCE_KEY: &str = "lastMessageRevision";

const TOKEN_SEPARATOR: char = '@';

/// A persisted `(revision, timestamp)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointToken {
    /// Revision component of the token.
    pub revision: Revision,
    /// Epoch-millisecond timestamp component of the token.
    pub date: u64,
}

impl CheckpointToken {
    /// Creates a token.
    pub fn new(revision: Revision, date: u64) -> Self {
        Self { revision, date }
    }

    /// Encodes the token as `"<revision>@<epoch-millis>"`.
    pub fn encode(&self) -> String {
        format!("{}{}{}", self.revision, TOKEN_SEPARATOR, self.date)
    }

    /// Decodes a token read from the coordination store under `key`.
    pub fn decode(key: &str, token: &str) -> ExportResult<Self> {
        let malformed = || ExportError::MalformedToken {
            key: key.to_string(),
            token: token.to_string(),
        };
        let (revision, date) = token.split_once(TOKEN_SEPARATOR).ok_or_else(malformed)?;
        let revision = revision.parse::<u64>().map_err(|_| malformed())?;
        let date = date.parse::<u64>().map_err(|_| malformed())?;
        Ok(Self::new(Revision::new(revision), date))
    }
}

/// Outcome of one lock-acquisition attempt.
#[derive(Debug)]
pub enum LockOutcome {
    /// This node holds the export right. Export resumes just after
    /// `last_sent`.
    Acquired(ExportLock),
    /// The progress token already matches the visible head; nothing to do.
    NoChanges,
    /// Another node holds the lock, won the acquisition race, or is ahead
    /// of this node's view of the store.
    AlreadyInProgress,
    /// A lock older than the lock timeout was found and released. The run
    /// does not export; the next scheduled invocation retries cleanly.
    StaleLockReleased {
        /// How long the stale lock had been held.
        held_for: Duration,
    },
}

/// State of a held export lock.
///
/// Owned by the single run that acquired it; released exactly once at run
/// end via [`LockManager::release`].
#[derive(Debug)]
pub struct ExportLock {
    /// Head revision visible at acquisition time; the planned end of the
    /// run and the revision recorded in the lock token.
    pub head: Revision,
    /// Revision through which export had durably succeeded at acquisition.
    pub last_sent: Revision,
    /// The lock token value this run last wrote.
    lock_token: String,
    /// The progress token as last written (or read), if any exists yet.
    progress_token: Option<String>,
    /// Time of the last lock write, for refresh scheduling.
    last_refresh: u64,
}

impl ExportLock {
    /// The first revision this run will publish, if any.
    pub fn resume_from(&self) -> Revision {
        self.last_sent.next()
    }
}

/// Owns the acquisition, refresh, progress and release protocol for the
/// cluster-wide export lock.
pub struct LockManager<C> {
    coord: C,
    lock_timeout: Duration,
}

impl<C: CoordinationStore> LockManager<C> {
    /// Creates a lock manager over the given coordination store.
    pub fn new(coord: C, lock_timeout: Duration) -> Self {
        Self {
            coord,
            lock_timeout,
        }
    }

    /// Runs the single-attempt acquisition protocol.
    ///
    /// `head` is the head revision currently visible to this node and `now`
    /// the current wall-clock time. Every outcome other than
    /// [`LockOutcome::Acquired`] ends the run without export; contention is
    /// expected under normal multi-node operation and is not an error.
    pub fn acquire(&self, head: Revision, now: u64) -> ExportResult<LockOutcome> {
        let tokens = self.coord.get_properties(&[LOCK_KEY, PROGRESS_KEY])?;
        let lock_token = tokens.get(LOCK_KEY).cloned();
        let progress_token = tokens.get(PROGRESS_KEY).cloned();

        let Some(lock_token) = lock_token else {
            // First run ever against this deployment.
            let claim = CheckpointToken::new(head, now).encode();
            if !self
                .coord
                .compare_and_set(LOCK_KEY, None, Some(&claim))?
            {
                debug!("lost the initial lock race");
                return Ok(LockOutcome::AlreadyInProgress);
            }
            return Ok(LockOutcome::Acquired(ExportLock {
                head,
                last_sent: Revision::FIRST,
                lock_token: claim,
                progress_token: None,
                last_refresh: now,
            }));
        };

        if Some(&lock_token) == progress_token.as_ref() {
            // Lock is free; the previous run finished cleanly.
            let progress = CheckpointToken::decode(PROGRESS_KEY, &lock_token)?;
            if progress.revision == head {
                return Ok(LockOutcome::NoChanges);
            }
            if head < progress.revision {
                // Another node committed and exported ahead of this node's
                // view of the store.
                debug!(
                    head = head.number(),
                    progress = progress.revision.number(),
                    "visible head lags exported progress"
                );
                return Ok(LockOutcome::AlreadyInProgress);
            }
            let claim = CheckpointToken::new(head, now).encode();
            if !self
                .coord
                .compare_and_set(LOCK_KEY, Some(&lock_token), Some(&claim))?
            {
                debug!("lost the lock race");
                return Ok(LockOutcome::AlreadyInProgress);
            }
            return Ok(LockOutcome::Acquired(ExportLock {
                head,
                last_sent: progress.revision,
                lock_token: claim,
                progress_token,
                last_refresh: now,
            }));
        }

        // The lock is not free.
        let held = CheckpointToken::decode(LOCK_KEY, &lock_token)?;
        let held_for = Duration::from_millis(now.saturating_sub(held.date));
        if held_for <= self.lock_timeout {
            debug!(held_ms = held_for.as_millis() as u64, "export lock is held");
            return Ok(LockOutcome::AlreadyInProgress);
        }
        // The holder is presumed dead; put the lock back to the progress
        // token. Losing this CAS means someone else released it first.
        warn!(
            held_ms = held_for.as_millis() as u64,
            "releasing a timed-out export lock"
        );
        self.coord
            .compare_and_set(LOCK_KEY, Some(&lock_token), progress_token.as_deref())?;
        Ok(LockOutcome::StaleLockReleased { held_for })
    }

    /// Rewrites the lock token with a fresh timestamp when more than two
    /// thirds of the lock timeout elapsed since the last write, so a long
    /// export is not mistaken for a dead holder.
    pub fn maybe_refresh(&self, lock: &mut ExportLock, now: u64) -> ExportResult<()> {
        let elapsed = now.saturating_sub(lock.last_refresh);
        if elapsed <= self.lock_timeout.as_millis() as u64 * 2 / 3 {
            return Ok(());
        }
        let token = CheckpointToken::new(lock.head, now).encode();
        self.coord.set_property(LOCK_KEY, &token)?;
        lock.lock_token = token;
        lock.last_refresh = now;
        debug!("refreshed the export lock");
        Ok(())
    }

    /// Durably records that `revision` has been published.
    ///
    /// A plain write: this run exclusively holds the lock.
    pub fn store_progress(
        &self,
        lock: &mut ExportLock,
        revision: Revision,
        now: u64,
    ) -> ExportResult<()> {
        let token = CheckpointToken::new(revision, now).encode();
        self.coord.set_property(PROGRESS_KEY, &token)?;
        lock.last_sent = revision;
        lock.progress_token = Some(token);
        debug!(revision = revision.number(), "stored export progress");
        Ok(())
    }

    /// Releases the lock by overwriting the lock token with the final
    /// progress token. Called exactly once at run end, on every terminal
    /// outcome.
    pub fn release(&self, lock: ExportLock) -> ExportResult<()> {
        match &lock.progress_token {
            Some(progress) => self.coord.set_property(LOCK_KEY, progress)?,
            None => {
                // Nothing was ever exported: restore the pristine state so
                // the next run takes the first-run path again.
                self.coord
                    .compare_and_set(LOCK_KEY, Some(&lock.lock_token), None)?;
            }
        }
        info!("released the export lock");
        Ok(())
    }
}
