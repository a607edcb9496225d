//! The export orchestrator.
//!
//! One invocation per scheduling period: try to acquire the cluster-wide
//! export lock, stream every changeset between the checkpoint and the
//! visible head through the rewrite pipeline into the publisher, persist
//! progress after each success, and pause with growing backoff on failure.

use parking_lot::{Mutex, RwLock};
use revrelay_model::Revision;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::bus::BusClient;
use crate::checkpoint::{ExportLock, LockManager, LockOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::ExporterConfig;
use crate::coord::CoordinationStore;
use crate::error::{ExportError, ExportResult};
use crate::pipeline::{ChangesetSink, Rewriter, StackedSink};
use crate::publisher::{Publisher, SentRecord, SentRecordHistory};
use crate::source::RevisionStore;

/// Terminal status of one export run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every changeset up to the visible head was published.
    Success,
    /// The checkpoint already matches the visible head.
    NoChanges,
    /// Another node holds the lock or won the acquisition race.
    AlreadyInProgress,
    /// A stale lock was found and released; no export this run.
    LockTimedOut,
    /// The run was cancelled between changesets.
    Cancelled,
    /// The invocation arrived inside the backoff window of an earlier
    /// failure and did nothing.
    Skipped,
    /// The run failed; the checkpoint reflects the last success.
    Error,
}

/// Result of one export run: exactly one terminal status plus a
/// human-readable message.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Terminal status.
    pub status: RunStatus,
    /// Operator-facing description of what happened.
    pub message: String,
}

impl RunOutcome {
    fn new(status: RunStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Counters over the lifetime of one exporter instance.
#[derive(Debug, Clone, Default)]
pub struct ExportStats {
    /// Runs that published everything up to their planned head.
    pub runs_completed: u64,
    /// Runs that ended in an error.
    pub runs_failed: u64,
    /// Changesets published and checkpointed.
    pub changesets_published: u64,
    /// Message of the most recent error, cleared by a fully successful run.
    pub last_error: Option<String>,
    /// Time of the most recent fully successful run, epoch milliseconds.
    pub last_success_at: Option<u64>,
}

/// How a drain of the changeset stream ended.
enum DrainEnd {
    Completed,
    CancelledAtStartup,
    Cancelled { last: Revision },
}

/// The change-data-capture exporter.
///
/// Safe to share across threads; the scheduler is expected to serialize
/// [`run`](Self::run) invocations on one node, while [`cancel`](Self::cancel),
/// [`stats`](Self::stats) and [`sent_records`](Self::sent_records) may be
/// called concurrently.
pub struct Exporter<R, C, B> {
    config: ExporterConfig,
    source: Arc<R>,
    coord: Arc<C>,
    bus: Arc<B>,
    clock: Arc<dyn Clock>,
    lock_manager: LockManager<Arc<C>>,
    rewriters: Mutex<Vec<Box<dyn Rewriter + Send>>>,
    history: SentRecordHistory,
    backoff: Mutex<Option<ExponentialBackoff>>,
    resume_at: Mutex<u64>,
    stats: RwLock<ExportStats>,
    cancelled: AtomicBool,
}

impl<R, C, B> Exporter<R, C, B>
where
    R: RevisionStore,
    C: CoordinationStore,
    B: BusClient,
{
    /// Creates an exporter over the given collaborators.
    pub fn new(config: ExporterConfig, source: R, coord: C, bus: B) -> Self {
        let coord = Arc::new(coord);
        let lock_manager = LockManager::new(Arc::clone(&coord), config.lock_timeout);
        let history = SentRecordHistory::new(config.retained_records);
        Self {
            config,
            source: Arc::new(source),
            coord,
            bus: Arc::new(bus),
            clock: Arc::new(SystemClock),
            lock_manager,
            rewriters: Mutex::new(Vec::new()),
            history,
            backoff: Mutex::new(None),
            resume_at: Mutex::new(0),
            stats: RwLock::new(ExportStats::default()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Replaces the wall clock, for tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the rewrite stages applied to every changeset, in order.
    pub fn with_rewriters(self, rewriters: Vec<Box<dyn Rewriter + Send>>) -> Self {
        *self.rewriters.lock() = rewriters;
        self
    }

    /// Requests cancellation of the running export. Honored between
    /// changesets, never mid-publish.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns a snapshot of the lifetime counters.
    pub fn stats(&self) -> ExportStats {
        self.stats.read().clone()
    }

    /// Returns the retained recently-sent records, oldest first.
    pub fn sent_records(&self) -> Vec<SentRecord> {
        self.history.snapshot()
    }

    /// The time before which runs short-circuit due to an earlier failure,
    /// if a backoff pause is active.
    pub fn resume_at_millis(&self) -> Option<u64> {
        let resume_at = *self.resume_at.lock();
        (resume_at > self.clock.now_millis()).then_some(resume_at)
    }

    fn should_stop(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Performs one export run.
    pub fn run(&self) -> RunOutcome {
        let now = self.clock.now_millis();
        let resume_at = *self.resume_at.lock();
        if now < resume_at {
            warn!(resume_at, "skipping export due to earlier problems");
            return RunOutcome::new(
                RunStatus::Skipped,
                format!("waiting out an earlier failure, resuming at {resume_at}"),
            );
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let head = match self.source.head_revision() {
            Ok(head) => head,
            Err(e) => return self.fail_before_lock(e.into()),
        };
        match self.lock_manager.acquire(head, now) {
            Err(e) => self.fail_before_lock(e),
            Ok(LockOutcome::NoChanges) => {
                info!("no changes in the store");
                RunOutcome::new(RunStatus::NoChanges, "no changes in the store")
            }
            Ok(LockOutcome::AlreadyInProgress) => {
                info!("export already in progress");
                RunOutcome::new(
                    RunStatus::AlreadyInProgress,
                    "export already in progress on another node",
                )
            }
            Ok(LockOutcome::StaleLockReleased { held_for }) => {
                let message = format!(
                    "export lock timed out after {} ms and was released",
                    held_for.as_millis()
                );
                error!("{message}");
                self.stats.write().last_error = Some(message.clone());
                RunOutcome::new(RunStatus::LockTimedOut, message)
            }
            Ok(LockOutcome::Acquired(lock)) => {
                debug!("lock obtained");
                self.export(lock)
            }
        }
    }

    /// Streams the acquired range through the pipeline and releases the
    /// lock exactly once, whatever the outcome.
    fn export(&self, mut lock: ExportLock) -> RunOutcome {
        let start = lock.resume_from();
        let stop = lock.head;
        debug!(
            start = start.number(),
            stop = stop.number(),
            "begin sending"
        );

        let publisher = Publisher::new(
            Arc::clone(&self.coord),
            Arc::clone(&self.bus),
            Arc::clone(&self.clock),
            self.config.source_id.clone(),
            self.config.publish_timeout,
            self.history.clone(),
        );
        let stages = std::mem::take(&mut *self.rewriters.lock());
        let mut sink = StackedSink::new(stages, publisher);

        let progress_before = lock.last_sent;
        let result = self.drain(&mut lock, &mut sink);
        let (stages, _publisher) = sink.into_parts();
        *self.rewriters.lock() = stages;

        let made_progress = lock.last_sent > progress_before;
        let released = self.lock_manager.release(lock);

        let outcome = match result {
            Ok(DrainEnd::Completed) => {
                let mut stats = self.stats.write();
                stats.runs_completed += 1;
                stats.last_error = None;
                stats.last_success_at = Some(self.clock.now_millis());
                info!(
                    start = start.number(),
                    stop = stop.number(),
                    "finished sending"
                );
                let message = if start > stop {
                    "nothing to send yet".to_string()
                } else {
                    format!("sent revisions {start} through {stop}")
                };
                RunOutcome::new(RunStatus::Success, message)
            }
            Ok(DrainEnd::CancelledAtStartup) => RunOutcome::new(
                RunStatus::Cancelled,
                "cancelled before the first changeset",
            ),
            Ok(DrainEnd::Cancelled { last }) => RunOutcome::new(
                RunStatus::Cancelled,
                format!("cancelled after revision {last}; run started at {start}"),
            ),
            Err(error) => self.fail_with_backoff(error, made_progress),
        };

        if let Err(release_error) = released {
            // Fatal: a failed release risks a permanently held lock.
            error!("failed to release the export lock: {release_error}");
            self.stats.write().last_error = Some(release_error.to_string());
            return RunOutcome::new(
                RunStatus::Error,
                format!("failed to release the export lock: {release_error}"),
            );
        }
        outcome
    }

    /// The per-changeset loop: walk, rewrite, publish, checkpoint.
    fn drain(
        &self,
        lock: &mut ExportLock,
        sink: &mut StackedSink<Publisher<Arc<C>, Arc<B>>>,
    ) -> ExportResult<DrainEnd> {
        if lock.resume_from() > lock.head {
            // A fresh deployment whose head is still the bootstrap revision.
            return Ok(DrainEnd::Completed);
        }
        let start = self.source.resolve_revision(lock.resume_from().number())?;
        let stop = self.source.resolve_revision(lock.head.number())?;
        let mut walker = crate::walker::RevisionWalker::build_chain(start, stop);
        let mut cursor = self.source.changeset_cursor(lock.last_sent, lock.head)?;

        if self.should_stop() {
            return Ok(DrainEnd::CancelledAtStartup);
        }
        loop {
            let Some(changeset) = cursor.next_changeset()? else {
                break;
            };
            debug!(
                revision = changeset.revision.number(),
                author = changeset.author.as_str(),
                creations = changeset.creations.len(),
                updates = changeset.updates.len(),
                deletions = changeset.deletions.len(),
                branch_events = changeset.branch_events.len(),
                "read next changeset"
            );
            let revision = changeset.revision;
            walker.advance_to(revision)?;
            sink.write(changeset)?;

            let sent_at = self.clock.now_millis();
            self.lock_manager.maybe_refresh(lock, sent_at)?;
            self.lock_manager.store_progress(lock, revision, sent_at)?;
            self.stats.write().changesets_published += 1;
            // Progress resets the backoff even if later changesets fail, so
            // transient blips do not compound once the system recovers.
            *self.backoff.lock() = None;

            if self.should_stop() {
                return Ok(DrainEnd::Cancelled { last: revision });
            }
        }
        sink.flush()?;
        debug!("finished sending normally");
        Ok(DrainEnd::Completed)
    }

    /// Applies the backoff pause and turns `error` into a run outcome.
    fn fail_with_backoff(&self, error: ExportError, made_progress: bool) -> RunOutcome {
        let pause = self.next_error_pause();
        let resume_at = self.clock.now_millis() + pause.as_millis() as u64;
        *self.resume_at.lock() = resume_at;

        let message = match &error {
            ExportError::PublishFailed { .. } if made_progress => {
                format!("publishing failed after partial progress: {error}")
            }
            ExportError::PublishFailed { .. } => {
                format!("publishing failed before any progress: {error}")
            }
            ExportError::TransformFailed { .. } => {
                format!("rewriting failed, operator intervention required: {error}")
            }
            ExportError::OutOfOrderRevision { .. } => {
                format!("revision stream out of order: {error}")
            }
            _ if made_progress => format!("export failed after partial progress: {error}"),
            _ => format!("export failed: {error}"),
        };
        error!(resume_at, "{message}");

        let mut stats = self.stats.write();
        stats.runs_failed += 1;
        stats.last_error = Some(message.clone());
        RunOutcome::new(RunStatus::Error, message)
    }

    /// An error before the lock was acquired: surfaced without touching the
    /// backoff window, the next scheduled run retries normally.
    fn fail_before_lock(&self, error: ExportError) -> RunOutcome {
        let message = format!("export could not start: {error}");
        error!("{message}");
        let mut stats = self.stats.write();
        stats.runs_failed += 1;
        stats.last_error = Some(message.clone());
        RunOutcome::new(RunStatus::Error, message)
    }

    fn next_error_pause(&self) -> Duration {
        let mut backoff = self.backoff.lock();
        backoff
            .get_or_insert_with(|| {
                ExponentialBackoff::new(
                    self.config.error_pause_start,
                    self.config.error_pause_factor,
                    self.config.error_pause_max,
                )
            })
            .next()
    }
}
