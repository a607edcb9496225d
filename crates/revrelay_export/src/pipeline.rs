//! Rewriter pipeline applied to every changeset before publication.
//!
//! Zero or more independent stages are chained onto a terminal sink (the
//! publisher). Each stage turns one changeset into zero or more changesets
//! which feed the next stage in order; the chain as a whole behaves as a
//! single sink with the same write/flush/close contract as any stage.

use revrelay_model::{ChangeSet, Revision};
use thiserror::Error;

use crate::error::{ExportError, ExportResult};

/// Failure of one rewriter stage.
///
/// Deterministic for a given changeset: the pipeline aborts the run and the
/// failure recurs on retry until an operator fixes the stage or skips the
/// offending revision.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StageError {
    message: String,
}

impl StageError {
    /// Creates a stage error with the given description.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// A sink for changesets: the terminal end of a pipeline, or the pipeline
/// itself.
pub trait ChangesetSink {
    /// Processes one changeset.
    fn write(&mut self, changeset: ChangeSet) -> ExportResult<()>;

    /// Flushes any buffered state.
    fn flush(&mut self) -> ExportResult<()>;

    /// Releases resources. The sink must not be written after closing.
    fn close(&mut self) -> ExportResult<()>;
}

/// One rewrite stage.
///
/// A stage may filter (return nothing), pass through, split, or merge
/// changesets. Stages that buffer across calls emit their remainder from
/// [`flush`](Self::flush).
pub trait Rewriter {
    /// Rewrites one changeset into zero or more changesets.
    fn rewrite(&mut self, changeset: ChangeSet) -> Result<Vec<ChangeSet>, StageError>;

    /// Emits any changesets buffered across `rewrite` calls.
    fn flush(&mut self) -> Result<Vec<ChangeSet>, StageError> {
        Ok(Vec::new())
    }

    /// Releases stage resources.
    fn close(&mut self) -> Result<(), StageError> {
        Ok(())
    }
}

/// A rewriter backed by a closure, for simple stateless stages.
pub struct FnRewriter<F> {
    rewrite: F,
}

impl<F> FnRewriter<F>
where
    F: FnMut(ChangeSet) -> Result<Vec<ChangeSet>, StageError>,
{
    /// Creates a rewriter from the given closure.
    pub fn new(rewrite: F) -> Self {
        Self { rewrite }
    }
}

impl<F> Rewriter for FnRewriter<F>
where
    F: FnMut(ChangeSet) -> Result<Vec<ChangeSet>, StageError>,
{
    fn rewrite(&mut self, changeset: ChangeSet) -> Result<Vec<ChangeSet>, StageError> {
        (self.rewrite)(changeset)
    }
}

/// An ordered chain of rewriters terminating in a sink.
pub struct StackedSink<S> {
    stages: Vec<Box<dyn Rewriter + Send>>,
    terminal: S,
}

impl<S: ChangesetSink> StackedSink<S> {
    /// Chains `stages` (applied in order) onto `terminal`.
    pub fn new(stages: Vec<Box<dyn Rewriter + Send>>, terminal: S) -> Self {
        Self { stages, terminal }
    }

    /// Consumes the pipeline, returning the terminal sink.
    pub fn into_terminal(self) -> S {
        self.terminal
    }

    /// Consumes the pipeline, returning the stages and the terminal sink.
    pub fn into_parts(self) -> (Vec<Box<dyn Rewriter + Send>>, S) {
        (self.stages, self.terminal)
    }

    /// Borrows the terminal sink.
    pub fn terminal(&self) -> &S {
        &self.terminal
    }
}

fn stage_failed(revision: Revision, error: StageError) -> ExportError {
    ExportError::TransformFailed {
        revision,
        message: error.to_string(),
    }
}

/// Feeds one changeset through `stages` and hands the results to the
/// terminal sink.
fn write_through<S: ChangesetSink>(
    stages: &mut [Box<dyn Rewriter + Send>],
    terminal: &mut S,
    changeset: ChangeSet,
) -> ExportResult<()> {
    let revision = changeset.revision;
    let mut batch = vec![changeset];
    for stage in stages.iter_mut() {
        let mut next = Vec::new();
        for changeset in batch {
            next.extend(
                stage
                    .rewrite(changeset)
                    .map_err(|e| stage_failed(revision, e))?,
            );
        }
        if next.is_empty() {
            return Ok(());
        }
        batch = next;
    }
    for changeset in batch {
        terminal.write(changeset)?;
    }
    Ok(())
}

impl<S: ChangesetSink> ChangesetSink for StackedSink<S> {
    fn write(&mut self, changeset: ChangeSet) -> ExportResult<()> {
        write_through(&mut self.stages, &mut self.terminal, changeset)
    }

    fn flush(&mut self) -> ExportResult<()> {
        for index in 0..self.stages.len() {
            let flushed = self.stages[index]
                .flush()
                .map_err(|e| stage_failed(Revision::new(0), e))?;
            let rest = &mut self.stages[index + 1..];
            for changeset in flushed {
                write_through(rest, &mut self.terminal, changeset)?;
            }
        }
        self.terminal.flush()
    }

    fn close(&mut self) -> ExportResult<()> {
        for stage in &mut self.stages {
            stage
                .close()
                .map_err(|e| stage_failed(Revision::new(0), e))?;
        }
        self.terminal.close()
    }
}
