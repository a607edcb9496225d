//! Integration tests for the export engine: lock protocol, checkpointed
//! replay, sequencing and failure handling over in-memory collaborators.

use revrelay_export::{
    CheckpointToken, CoordinationStore, Exporter, ExporterConfig, FnRewriter, ManualClock,
    MemoryBusClient, MemoryCoordinationStore, MemoryRevisionStore, Rewriter, RunStatus,
    StageError, LOCK_KEY, PROGRESS_KEY,
};
use revrelay_model::{ChangeSet, ObjectChange, ObjectId, Revision};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

type TestExporter =
    Exporter<Arc<MemoryRevisionStore>, Arc<MemoryCoordinationStore>, Arc<MemoryBusClient>>;

/// One node's view of the shared stores, with a controllable clock.
struct Cluster {
    source: Arc<MemoryRevisionStore>,
    coord: Arc<MemoryCoordinationStore>,
    bus: Arc<MemoryBusClient>,
    clock: ManualClock,
}

impl Cluster {
    fn new() -> Self {
        Self {
            source: Arc::new(MemoryRevisionStore::new()),
            coord: Arc::new(MemoryCoordinationStore::new()),
            bus: Arc::new(MemoryBusClient::new()),
            clock: ManualClock::new(1_000),
        }
    }

    fn config() -> ExporterConfig {
        ExporterConfig::new("sys-a")
            .with_error_pause_start(Duration::from_secs(10))
            .with_error_pause_max(Duration::from_secs(60))
            .with_retained_records(8)
    }

    fn exporter(&self) -> TestExporter {
        self.exporter_with(Self::config())
    }

    fn exporter_with(&self, config: ExporterConfig) -> TestExporter {
        Exporter::new(
            config,
            Arc::clone(&self.source),
            Arc::clone(&self.coord),
            Arc::clone(&self.bus),
        )
        .with_clock(Arc::new(self.clock.clone()))
    }

    fn commit(&self, revision: u64) {
        self.source.commit(changeset(revision));
    }

    fn published_revisions(&self) -> Vec<u64> {
        self.bus
            .published()
            .iter()
            .map(|r| r.changeset.revision.number())
            .collect()
    }

    fn sequences(&self) -> Vec<u64> {
        self.bus.published().iter().map(|r| r.sequence).collect()
    }

    fn progress_revision(&self) -> Option<u64> {
        self.coord.get(PROGRESS_KEY).map(|token| {
            CheckpointToken::decode(PROGRESS_KEY, &token)
                .unwrap()
                .revision
                .number()
        })
    }

    fn lock_is_free(&self) -> bool {
        self.coord.get(LOCK_KEY) == self.coord.get(PROGRESS_KEY)
    }
}

fn changeset(revision: u64) -> ChangeSet {
    ChangeSet::new(Revision::new(revision), revision * 100, "tester").with_creation(
        ObjectChange::creation(
            ObjectId::new("Doc", format!("d{revision}")),
            Default::default(),
        ),
    )
}

#[test]
fn exports_every_changeset_in_order_and_checkpoints() {
    let cluster = Cluster::new();
    // Revisions 3, 4 and 6 exist but carry no object changes.
    cluster.commit(2);
    cluster.commit(5);
    cluster.commit(7);

    let exporter = cluster.exporter();
    let outcome = exporter.run();

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(cluster.published_revisions(), vec![2, 5, 7]);
    assert_eq!(cluster.sequences(), vec![1, 2, 3]);
    assert_eq!(cluster.progress_revision(), Some(7));
    assert!(cluster.lock_is_free());
}

#[test]
fn bootstrap_store_exports_nothing() {
    let cluster = Cluster::new();
    let exporter = cluster.exporter();

    let outcome = exporter.run();

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(cluster.bus.published_count(), 0);
    // No trace is left; the next run starts from the pristine state again.
    assert_eq!(cluster.coord.get(LOCK_KEY), None);
    assert_eq!(cluster.coord.get(PROGRESS_KEY), None);
}

#[test]
fn no_new_commits_is_a_read_only_no_op() {
    let cluster = Cluster::new();
    cluster.commit(2);
    let exporter = cluster.exporter();
    assert_eq!(exporter.run().status, RunStatus::Success);

    let writes_before = cluster.coord.write_count();
    let outcome = exporter.run();

    assert_eq!(outcome.status, RunStatus::NoChanges);
    assert_eq!(cluster.coord.write_count(), writes_before);
    assert_eq!(cluster.bus.published_count(), 1);
}

#[test]
fn resumes_from_checkpoint_across_instances() {
    let cluster = Cluster::new();
    cluster.commit(2);
    cluster.commit(3);
    assert_eq!(cluster.exporter().run().status, RunStatus::Success);

    // A different process picks up where the first left off.
    cluster.commit(4);
    let outcome = cluster.exporter().run();

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(cluster.published_revisions(), vec![2, 3, 4]);
    assert_eq!(cluster.sequences(), vec![1, 2, 3]);
}

#[test]
fn sequences_stay_dense_across_a_failed_publish() {
    let cluster = Cluster::new();
    cluster.commit(2);
    let exporter = cluster.exporter();
    assert_eq!(exporter.run().status, RunStatus::Success);

    cluster.commit(3);
    cluster.commit(4);
    cluster.bus.fail_next(revrelay_export::BusError::Timeout);
    let outcome = exporter.run();
    assert_eq!(outcome.status, RunStatus::Error);
    assert!(outcome.message.contains("before any progress"));
    // The failed attempt left no record and consumed no sequence number.
    assert_eq!(cluster.published_revisions(), vec![2]);
    assert_eq!(cluster.progress_revision(), Some(2));

    cluster.clock.advance(10_000);
    let outcome = exporter.run();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(cluster.published_revisions(), vec![2, 3, 4]);
    assert_eq!(cluster.sequences(), vec![1, 2, 3]);
}

#[test]
fn held_lock_within_timeout_defers_to_the_holder() {
    let cluster = Cluster::new();
    for rev in 5..=9 {
        cluster.commit(rev);
    }
    cluster
        .coord
        .set_property(LOCK_KEY, &CheckpointToken::new(Revision::new(9), 1_000).encode())
        .unwrap();
    cluster
        .coord
        .set_property(PROGRESS_KEY, &CheckpointToken::new(Revision::new(4), 900).encode())
        .unwrap();

    cluster.clock.set(31_000); // 30 s into the 50 s timeout
    let outcome = cluster.exporter().run();

    assert_eq!(outcome.status, RunStatus::AlreadyInProgress);
    assert_eq!(cluster.bus.published_count(), 0);
}

#[test]
fn stale_lock_is_released_and_the_next_run_exports() {
    let cluster = Cluster::new();
    for rev in 5..=9 {
        cluster.commit(rev);
    }
    cluster
        .coord
        .set_property(LOCK_KEY, &CheckpointToken::new(Revision::new(9), 1_000).encode())
        .unwrap();
    cluster
        .coord
        .set_property(PROGRESS_KEY, &CheckpointToken::new(Revision::new(4), 900).encode())
        .unwrap();

    cluster.clock.set(100_000); // well past the 50 s timeout
    let exporter = cluster.exporter();

    let outcome = exporter.run();
    assert_eq!(outcome.status, RunStatus::LockTimedOut);
    assert_eq!(cluster.bus.published_count(), 0);
    assert!(cluster.lock_is_free());

    let outcome = exporter.run();
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(cluster.published_revisions(), vec![5, 6, 7, 8, 9]);
    assert_eq!(cluster.progress_revision(), Some(9));
}

#[test]
fn lagging_head_defers_instead_of_rewinding() {
    let cluster = Cluster::new();
    for rev in 2..=9 {
        cluster.commit(rev);
    }
    let token = CheckpointToken::new(Revision::new(9), 500).encode();
    cluster.coord.set_property(LOCK_KEY, &token).unwrap();
    cluster.coord.set_property(PROGRESS_KEY, &token).unwrap();
    // This node has not yet seen revisions 8 and 9.
    cluster.source.pin_head(Revision::new(7));

    let outcome = cluster.exporter().run();

    assert_eq!(outcome.status, RunStatus::AlreadyInProgress);
    assert_eq!(cluster.bus.published_count(), 0);
    assert_eq!(cluster.progress_revision(), Some(9));
}

#[test]
fn failure_pause_gates_runs_and_resets_after_progress() {
    let cluster = Cluster::new();
    cluster.commit(2);
    let exporter = cluster.exporter();

    cluster.bus.fail_next(revrelay_export::BusError::Timeout);
    assert_eq!(exporter.run().status, RunStatus::Error);
    assert_eq!(exporter.resume_at_millis(), Some(11_000));

    // Inside the pause window nothing happens.
    assert_eq!(exporter.run().status, RunStatus::Skipped);
    assert_eq!(cluster.bus.published_count(), 0);

    cluster.clock.set(11_000);
    assert_eq!(exporter.run().status, RunStatus::Success);

    // Progress reset the backoff: the next failure pauses for the initial
    // duration again, not a doubled one.
    cluster.commit(3);
    cluster.bus.fail_next(revrelay_export::BusError::Timeout);
    assert_eq!(exporter.run().status, RunStatus::Error);
    assert_eq!(exporter.resume_at_millis(), Some(21_000));
}

#[test]
fn failure_pause_grows_while_no_progress_is_made() {
    let cluster = Cluster::new();
    cluster.commit(2);
    let exporter = cluster.exporter();

    cluster.bus.fail_next(revrelay_export::BusError::Timeout);
    assert_eq!(exporter.run().status, RunStatus::Error);
    assert_eq!(exporter.resume_at_millis(), Some(11_000));

    cluster.clock.set(11_000);
    cluster.bus.fail_next(revrelay_export::BusError::Timeout);
    assert_eq!(exporter.run().status, RunStatus::Error);
    // Second consecutive failure: 10 s doubled to 20 s.
    assert_eq!(exporter.resume_at_millis(), Some(31_000));
}

#[test]
fn rewrite_failure_is_terminal_and_keeps_earlier_progress() {
    let cluster = Cluster::new();
    cluster.commit(2);
    cluster.commit(3);

    let stage = FnRewriter::new(|cs: ChangeSet| {
        if cs.revision.number() == 3 {
            Err(StageError::new("unmappable attribute"))
        } else {
            Ok(vec![cs])
        }
    });
    let exporter = cluster
        .exporter()
        .with_rewriters(vec![Box::new(stage) as Box<dyn Rewriter + Send>]);

    let outcome = exporter.run();
    assert_eq!(outcome.status, RunStatus::Error);
    assert!(outcome.message.contains("rewriting failed"));
    assert_eq!(cluster.published_revisions(), vec![2]);
    assert_eq!(cluster.progress_revision(), Some(2));
    assert!(cluster.lock_is_free());

    // The failure is not transient; the pause window applies.
    assert_eq!(exporter.run().status, RunStatus::Skipped);
}

#[test]
fn filtering_stage_checkpoints_without_publishing() {
    let cluster = Cluster::new();
    cluster.commit(2);
    cluster.commit(3);
    cluster.commit(4);

    let stage = FnRewriter::new(|cs: ChangeSet| {
        if cs.revision.number() == 3 {
            Ok(Vec::new())
        } else {
            Ok(vec![cs])
        }
    });
    let exporter = cluster
        .exporter()
        .with_rewriters(vec![Box::new(stage) as Box<dyn Rewriter + Send>]);

    let outcome = exporter.run();

    assert_eq!(outcome.status, RunStatus::Success);
    // The filtered revision consumed no sequence number but the checkpoint
    // advanced past it.
    assert_eq!(cluster.published_revisions(), vec![2, 4]);
    assert_eq!(cluster.sequences(), vec![1, 2]);
    assert_eq!(cluster.progress_revision(), Some(4));
}

#[test]
fn rewriting_stage_can_redact_values() {
    let cluster = Cluster::new();
    let mut values = std::collections::BTreeMap::new();
    values.insert("name".to_string(), serde_json::json!("alice"));
    values.insert("ssn".to_string(), serde_json::json!("000-11-2222"));
    cluster.source.commit(
        ChangeSet::new(Revision::new(2), 200, "tester")
            .with_creation(ObjectChange::creation(ObjectId::new("Person", "p1"), values)),
    );

    let stage = FnRewriter::new(|mut cs: ChangeSet| {
        for change in &mut cs.creations {
            change
                .values
                .entry("ssn".to_string())
                .and_modify(|v| *v = serde_json::json!("<redacted>"));
        }
        Ok(vec![cs])
    });
    let exporter = cluster
        .exporter()
        .with_rewriters(vec![Box::new(stage) as Box<dyn Rewriter + Send>]);

    assert_eq!(exporter.run().status, RunStatus::Success);
    let published = cluster.bus.published();
    let values = &published[0].changeset.creations[0].values;
    assert_eq!(values["ssn"], serde_json::json!("<redacted>"));
    assert_eq!(values["name"], serde_json::json!("alice"));
}

#[test]
fn cancellation_takes_effect_between_changesets() {
    let cluster = Cluster::new();
    cluster.commit(2);
    cluster.commit(3);
    cluster.commit(4);

    let (entered_tx, entered_rx) = mpsc::channel::<u64>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let gate = FnRewriter::new(move |cs: ChangeSet| {
        entered_tx
            .send(cs.revision.number())
            .map_err(|_| StageError::new("test gate closed"))?;
        release_rx
            .recv()
            .map_err(|_| StageError::new("test gate closed"))?;
        Ok(vec![cs])
    });
    let exporter = Arc::new(
        cluster
            .exporter()
            .with_rewriters(vec![Box::new(gate) as Box<dyn Rewriter + Send>]),
    );

    let worker = {
        let exporter = Arc::clone(&exporter);
        thread::spawn(move || exporter.run())
    };

    // Wait until the run is inside the first rewrite, cancel, then let the
    // changeset finish.
    assert_eq!(entered_rx.recv().unwrap(), 2);
    exporter.cancel();
    release_tx.send(()).unwrap();

    let outcome = worker.join().unwrap();
    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert!(outcome.message.contains("after revision 2"));
    // The in-flight changeset completed; nothing after it was started.
    assert_eq!(cluster.published_revisions(), vec![2]);
    assert_eq!(cluster.progress_revision(), Some(2));
    assert!(cluster.lock_is_free());
}

#[test]
fn history_retains_the_most_recent_records() {
    let cluster = Cluster::new();
    for rev in 2..=5 {
        cluster.commit(rev);
    }
    let exporter = cluster.exporter_with(Cluster::config().with_retained_records(2));

    assert_eq!(exporter.run().status, RunStatus::Success);

    let retained: Vec<u64> = exporter
        .sent_records()
        .iter()
        .map(|r| r.record.changeset.revision.number())
        .collect();
    assert_eq!(retained, vec![4, 5]);
}

#[test]
fn stats_reflect_the_run_history() {
    let cluster = Cluster::new();
    cluster.commit(2);
    cluster.commit(3);
    let exporter = cluster.exporter();

    assert_eq!(exporter.run().status, RunStatus::Success);
    cluster.commit(4);
    cluster.bus.fail_next(revrelay_export::BusError::Timeout);
    assert_eq!(exporter.run().status, RunStatus::Error);

    let stats = exporter.stats();
    assert_eq!(stats.runs_completed, 1);
    assert_eq!(stats.runs_failed, 1);
    assert_eq!(stats.changesets_published, 2);
    assert!(stats.last_error.is_some());
    assert_eq!(stats.last_success_at, Some(1_000));
}
