//! Guaranteed final flush of the results table.
//!
//! `FlushGuard` owns the results buffer for the duration of a run. The
//! normal path ends with [`FlushGuard::finish`], which saves exactly once and
//! folds the save result into the run result. If the guard is dropped
//! without `finish` (panic unwinding, early return), `Drop` still saves.

use super::CheckpointStore;
use crate::models::{Result, ResultsTable, RunOutcome};
use tracing::{error, info, warn};

/// Owns the in-progress results and flushes them on every exit path.
pub struct FlushGuard<'a, S: CheckpointStore + ?Sized> {
    store: &'a S,
    results: ResultsTable,
    finished: bool,
}

impl<'a, S: CheckpointStore + ?Sized> FlushGuard<'a, S> {
    pub fn new(store: &'a S, results: ResultsTable) -> Self {
        Self {
            store,
            results,
            finished: false,
        }
    }

    pub fn results(&self) -> &ResultsTable {
        &self.results
    }

    pub fn results_mut(&mut self) -> &mut ResultsTable {
        &mut self.results
    }

    /// Flush once and combine the flush with the run result.
    ///
    /// - run ok, flush ok: the outcome
    /// - run ok, flush failed: the flush error
    /// - run failed: the run error; a flush failure is only logged
    pub fn finish(mut self, run: Result<RunOutcome>) -> Result<(RunOutcome, ResultsTable)> {
        self.finished = true;
        let flush = self.store.save(&self.results);
        let results = std::mem::take(&mut self.results);

        match (run, flush) {
            (Ok(outcome), Ok(())) => {
                info!(rows = results.len(), outcome = ?outcome, "Final snapshot saved");
                Ok((outcome, results))
            }
            (Ok(outcome), Err(e)) => {
                error!(error = %e, outcome = ?outcome, "Final snapshot could not be saved");
                Err(e)
            }
            (Err(e), Ok(())) => {
                warn!(rows = results.len(), "Run failed, partial snapshot saved");
                Err(e)
            }
            (Err(e), Err(flush_err)) => {
                error!(error = %flush_err, "Run failed and the snapshot could not be saved");
                Err(e)
            }
        }
    }
}

impl<S: CheckpointStore + ?Sized> Drop for FlushGuard<'_, S> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        warn!(
            rows = self.results.len(),
            "Run ended without a final flush, saving snapshot"
        );
        if let Err(e) = self.store.save(&self.results) {
            error!(error = %e, "Emergency snapshot save failed");
        }
    }
}
