//! Resumable annotation pipeline.
//!
//! Pipeline flow:
//! Source table → merge snapshot → for each row in order:
//! skip | complete → extract → record → (autosave) → pace
//!
//! Rows are processed strictly one at a time. Cancellation is observed only
//! between rows, and the snapshot is flushed once more on every exit path.

use crate::checkpoint::{CheckpointStore, FileCheckpointStore, FlushGuard, merge_snapshot};
use crate::client::{InferenceClient, OllamaClient, PromptTemplates};
use crate::extract::ResponseExtractor;
use crate::models::{
    AnnotationConfig, ColumnConfig, Config, Result, ResultRow, ResultsTable, RunOutcome,
    RunReport, RunStats, SourceRow, SurveyorError,
};
use crate::table::Table;
use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Loop parameters for [`AnnotationDriver`].
#[derive(Debug, Clone)]
pub struct AnnotationSettings {
    pub autosave_interval: usize,
    pub rationale_interval: usize,
    pub pacing_delay: Duration,
    pub retry_empty_answers: bool,
    pub show_progress: bool,
}

impl AnnotationSettings {
    pub fn from_config(config: &AnnotationConfig) -> Self {
        Self {
            autosave_interval: config.autosave_interval.max(1),
            rationale_interval: config.rationale_interval.max(1),
            pacing_delay: config.pacing_delay(),
            retry_empty_answers: config.retry_empty_answers,
            show_progress: config.show_progress,
        }
    }

    /// Rationale sampling policy.
    pub fn wants_rationale(&self, index: usize) -> bool {
        index % self.rationale_interval == 0
    }

    /// Periodic checkpoint policy.
    pub fn is_autosave_row(&self, index: usize) -> bool {
        index > 0 && index % self.autosave_interval == 0
    }
}

impl Default for AnnotationSettings {
    fn default() -> Self {
        Self::from_config(&AnnotationConfig::default())
    }
}

/// Drives the row-by-row annotation loop.
pub struct AnnotationDriver<C, S> {
    client: C,
    store: S,
    extractor: ResponseExtractor,
    settings: AnnotationSettings,
    cancel: CancellationToken,
}

impl<C: InferenceClient, S: CheckpointStore> AnnotationDriver<C, S> {
    pub fn new(
        client: C,
        store: S,
        extractor: ResponseExtractor,
        settings: AnnotationSettings,
    ) -> Self {
        Self {
            client,
            store,
            extractor,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    /// Use an externally owned cancellation token (e.g. wired to Ctrl-C).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Annotate `rows` in place, resuming from the store's snapshot.
    ///
    /// Returns an error only on the failed path (after the final flush was
    /// attempted) or when the final flush of a completed/interrupted run
    /// could not be saved.
    pub async fn run(&self, rows: &mut [SourceRow]) -> Result<RunReport> {
        let started_at = Utc::now();
        let mut stats = RunStats {
            total_rows: rows.len(),
            ..Default::default()
        };

        let merge = merge_snapshot(rows, self.store.load(), self.settings.retry_empty_answers);
        stats.resumed = merge.matched_rows;
        if merge.unmatched > 0 {
            warn!(
                count = merge.unmatched,
                "Snapshot rows without a matching prompt will be dropped"
            );
        }
        info!(
            total_rows = rows.len(),
            resumed = merge.matched_rows,
            requeued = merge.requeued,
            autosave_interval = self.settings.autosave_interval,
            rationale_interval = self.settings.rationale_interval,
            "Starting annotation run"
        );

        let mut guard = FlushGuard::new(&self.store, merge.results);
        let run = self.process_rows(rows, guard.results_mut(), &mut stats).await;
        if let Err(e) = &run {
            error!(error = %e, "Annotation run failed, attempting to save progress");
        }
        let (outcome, results) = guard.finish(run)?;

        Ok(RunReport {
            outcome,
            stats,
            snapshot_rows: results.len(),
            started_at,
            finished_at: Utc::now(),
        })
    }

    async fn process_rows(
        &self,
        rows: &mut [SourceRow],
        results: &mut ResultsTable,
        stats: &mut RunStats,
    ) -> Result<RunOutcome> {
        let pb = self.progress_bar(rows.len() as u64);
        let mut sent: HashSet<String> = HashSet::new();

        for row in rows.iter_mut() {
            if self.cancel.is_cancelled() {
                warn!(row = row.index, "Interrupted, stopping before row");
                pb.abandon_with_message("interrupted");
                return Ok(RunOutcome::Interrupted);
            }
            pb.inc(1);

            // PENDING → SKIPPED(already-answered)
            if row.is_answered() {
                stats.skipped_answered += 1;
                info!(row = row.index, "Already answered, skipping");
                continue;
            }

            // PENDING → SKIPPED(empty-prompt)
            if row.has_blank_prompt() {
                stats.skipped_blank += 1;
                info!(row = row.index, "Blank prompt, skipping");
                continue;
            }

            // Sent earlier in this run (never re-sent, even if it failed),
            // or settled in the snapshot
            let prior = match results.get(&row.prompt) {
                Some(r) if sent.contains(&row.prompt) => Some(r),
                Some(r) => self.is_settled(r).then_some(r),
                None => None,
            };
            if let Some(prior) = prior {
                row.apply(prior);
                stats.skipped_answered += 1;
                info!(row = row.index, "Prompt already answered, copying");
                continue;
            }

            // PENDING → PROCESSING → RECORDED
            let want_rationale = self.settings.wants_rationale(row.index);
            info!(row = row.index, want_rationale, "Sending prompt");
            let result = self.process_row(row, want_rationale, stats).await;
            row.apply(&result);
            sent.insert(row.prompt.clone());
            results.record(result);

            if self.settings.is_autosave_row(row.index) {
                if let Err(e) = self.store.save(results) {
                    error!(row = row.index, error = %e, "Autosave failed");
                    return Err(e);
                }
                stats.autosaves += 1;
                info!(row = row.index, rows = results.len(), "Autosaved snapshot");
            }

            pb.set_message(format!(
                "sent: {}, failed: {}",
                stats.processed, stats.failed_calls
            ));
            self.pace().await;
        }

        pb.finish_with_message(format!(
            "done: {} sent, {} failed",
            stats.processed, stats.failed_calls
        ));
        Ok(RunOutcome::Completed)
    }

    /// One inference round trip; failures become an empty result.
    async fn process_row(
        &self,
        row: &SourceRow,
        want_rationale: bool,
        stats: &mut RunStats,
    ) -> ResultRow {
        stats.processed += 1;
        if want_rationale {
            stats.rationales_requested += 1;
        }

        match self.client.complete(&row.prompt, want_rationale).await {
            Ok(text) => {
                let extraction = self.extractor.extract(&text, want_rationale);
                if extraction.answer.is_empty() {
                    stats.empty_answers += 1;
                    warn!(row = row.index, "No answer found in completion");
                } else {
                    debug!(row = row.index, answer = %extraction.answer, "Answer extracted");
                }
                if want_rationale && extraction.rationale.is_empty() {
                    warn!(row = row.index, "No rationale found in completion");
                }
                ResultRow::new(row.prompt.clone(), extraction.answer, extraction.rationale)
            }
            Err(e) => {
                stats.failed_calls += 1;
                stats.empty_answers += 1;
                warn!(
                    row = row.index,
                    error = %e,
                    transient = e.is_transient(),
                    "Inference call failed, recording empty answer"
                );
                ResultRow::empty(row.prompt.clone())
            }
        }
    }

    /// A recorded result that should not be sent again.
    fn is_settled(&self, result: &ResultRow) -> bool {
        !self.settings.retry_empty_answers || result.has_answer()
    }

    /// Fixed delay between requests; cut short by cancellation.
    async fn pace(&self) {
        if self.settings.pacing_delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.settings.pacing_delay) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    fn progress_bar(&self, len: u64) -> ProgressBar {
        if !self.settings.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(len);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
        {
            pb.set_style(style.progress_chars("##-"));
        }
        pb
    }
}

/// Source table with the prompt / answer / rationale columns located.
pub struct SourceTable {
    table: Table,
    prompt_col: usize,
    answer_col: usize,
    rationale_col: usize,
}

impl SourceTable {
    /// Read the source table; missing answer columns are created empty.
    pub fn load(path: &Path, columns: &ColumnConfig) -> Result<Self> {
        let mut table = Table::read(path)?;
        let prompt_col = table.column_index(&columns.prompt).ok_or_else(|| {
            SurveyorError::InvalidInput(format!(
                "{} has no '{}' column",
                path.display(),
                columns.prompt
            ))
        })?;
        let answer_col = table.ensure_column(&columns.answer);
        let rationale_col = table.ensure_column(&columns.rationale);

        info!(path = %path.display(), rows = table.len(), "Loaded source table");
        Ok(Self {
            table,
            prompt_col,
            answer_col,
            rationale_col,
        })
    }

    /// Working copies of every row, in table order.
    pub fn rows(&self) -> Vec<SourceRow> {
        (0..self.table.len())
            .map(|i| {
                SourceRow::from_cells(
                    i,
                    self.table.cell(i, self.prompt_col),
                    self.table.cell(i, self.answer_col),
                    self.table.cell(i, self.rationale_col),
                )
            })
            .collect()
    }

    /// Write known answers back into the table cells.
    pub fn apply(&mut self, rows: &[SourceRow]) {
        for row in rows {
            if let Some(answer) = &row.answer {
                self.table.set_cell(row.index, self.answer_col, answer.clone());
            }
            if let Some(rationale) = &row.rationale {
                self.table
                    .set_cell(row.index, self.rationale_col, rationale.clone());
            }
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        self.table.write(path)
    }
}

/// Annotation run wired from configuration: Ollama client + file snapshot.
pub struct AnnotationPipeline {
    config: Config,
}

impl AnnotationPipeline {
    /// Create a pipeline; the configuration is validated here.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run to completion, interruption or failure.
    ///
    /// When `merged_output` is configured, the full source table with answers
    /// filled in is written there on every path (best effort).
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunReport> {
        let annotation = &self.config.annotation;
        let mut source = SourceTable::load(&annotation.input, &self.config.columns)?;
        let mut rows = source.rows();

        let client = OllamaClient::new(
            &self.config.endpoint,
            PromptTemplates::new(&self.config.templates),
        )?;
        info!(
            model = %client.model(),
            endpoint = %client.base_url(),
            snapshot = %annotation.snapshot.display(),
            "Inference endpoint configured"
        );

        let store = FileCheckpointStore::new(&annotation.snapshot, self.config.columns.clone());
        let extractor = ResponseExtractor::new(&self.config.extraction)?;
        let driver = AnnotationDriver::new(
            client,
            store,
            extractor,
            AnnotationSettings::from_config(annotation),
        )
        .with_cancellation(cancel);

        let report = driver.run(&mut rows).await;

        if let Some(path) = &annotation.merged_output {
            source.apply(&rows);
            match source.write(path) {
                Ok(()) => info!(path = %path.display(), "Merged table written"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to write merged table"),
            }
        }

        report
    }
}
