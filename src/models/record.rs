//! Row and result types for surveyor.
//!
//! These types carry the data flow of an annotation run: source rows in,
//! result rows out, keyed by the exact prompt text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One row of the source table.
///
/// `answer` / `rationale` are `Some` once the value is known for this run:
/// a non-blank source cell, a value copied forward from the snapshot, or a
/// freshly recorded result. Copied-forward values may be empty strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRow {
    /// Position in the source table (0-based)
    pub index: usize,

    /// Prompt text, the natural key
    pub prompt: String,

    pub answer: Option<String>,

    pub rationale: Option<String>,
}

impl SourceRow {
    /// Build a row from raw cell values; blank cells count as absent.
    pub fn from_cells(index: usize, prompt: &str, answer: &str, rationale: &str) -> Self {
        let present = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());
        Self {
            index,
            prompt: prompt.to_string(),
            answer: present(answer),
            rationale: present(rationale),
        }
    }

    /// Both fields are known, so the row needs no inference call.
    pub fn is_answered(&self) -> bool {
        self.answer.is_some() && self.rationale.is_some()
    }

    /// Prompt is empty after trimming.
    pub fn has_blank_prompt(&self) -> bool {
        self.prompt.trim().is_empty()
    }

    /// Copy a result's fields into this working copy.
    pub fn apply(&mut self, result: &ResultRow) {
        self.answer = Some(result.answer.clone());
        self.rationale = Some(result.rationale.clone());
    }
}

/// One processed prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultRow {
    pub prompt: String,

    /// Numeric answer as text, empty when nothing was extracted
    pub answer: String,

    /// Free-text rationale, empty when not requested or not found
    pub rationale: String,
}

impl ResultRow {
    pub fn new(
        prompt: impl Into<String>,
        answer: impl Into<String>,
        rationale: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            answer: answer.into(),
            rationale: rationale.into(),
        }
    }

    /// Result of a failed inference call.
    pub fn empty(prompt: impl Into<String>) -> Self {
        Self::new(prompt, "", "")
    }

    pub fn has_answer(&self) -> bool {
        !self.answer.trim().is_empty()
    }
}

/// Ordered results keyed by prompt.
///
/// Holds at most one row per distinct prompt: recording an existing prompt
/// replaces its row in place, so insertion order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultsTable {
    rows: Vec<ResultRow>,
    index: HashMap<String, usize>,
}

impl ResultsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the row for `row.prompt`.
    pub fn record(&mut self, row: ResultRow) {
        match self.index.get(&row.prompt) {
            Some(&pos) => self.rows[pos] = row,
            None => {
                self.index.insert(row.prompt.clone(), self.rows.len());
                self.rows.push(row);
            }
        }
    }

    pub fn get(&self, prompt: &str) -> Option<&ResultRow> {
        self.index.get(prompt).map(|&pos| &self.rows[pos])
    }

    pub fn contains(&self, prompt: &str) -> bool {
        self.index.contains_key(prompt)
    }

    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Consume into a prompt-keyed map for merging.
    pub fn into_map(self) -> HashMap<String, ResultRow> {
        self.rows
            .into_iter()
            .map(|row| (row.prompt.clone(), row))
            .collect()
    }
}

impl FromIterator<ResultRow> for ResultsTable {
    fn from_iter<I: IntoIterator<Item = ResultRow>>(iter: I) -> Self {
        let mut table = Self::new();
        for row in iter {
            table.record(row);
        }
        table
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    /// Every row was visited
    Completed,
    /// Stopped at a row boundary after an interruption signal
    Interrupted,
}

/// Counters for one annotation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Rows in the source table
    pub total_rows: usize,

    /// Rows whose answer was copied from the snapshot
    pub resumed: usize,

    /// Rows skipped because they were already answered
    pub skipped_answered: usize,

    /// Rows skipped because the prompt was blank
    pub skipped_blank: usize,

    /// Rows sent to the inference endpoint
    pub processed: usize,

    /// Inference calls that failed
    pub failed_calls: usize,

    /// Recorded rows with an empty answer (failed or unparseable)
    pub empty_answers: usize,

    /// Rows that requested a rationale
    pub rationales_requested: usize,

    /// Periodic snapshot saves (final flush not included)
    pub autosaves: usize,
}

/// Summary of a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub stats: RunStats,
    /// Rows in the snapshot after the final flush
    pub snapshot_rows: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn runtime_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Processed rows per hour.
    pub fn throughput_per_hour(&self) -> f64 {
        let secs = self.runtime_secs();
        if secs > 0.0 {
            self.stats.processed as f64 / secs * 3600.0
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_replaces_same_prompt() {
        let mut table = ResultsTable::new();
        table.record(ResultRow::new("q1", "", ""));
        table.record(ResultRow::new("q2", "3", ""));
        table.record(ResultRow::new("q1", "4", "because"));

        assert_eq!(table.len(), 2);
        assert_eq!(table.rows()[0], ResultRow::new("q1", "4", "because"));
        assert_eq!(table.get("q2").map(|r| r.answer.as_str()), Some("3"));
    }

    #[test]
    fn test_from_cells_blank_is_absent() {
        let row = SourceRow::from_cells(0, "How much?", "  ", "ok");
        assert_eq!(row.answer, None);
        assert_eq!(row.rationale.as_deref(), Some("ok"));
        assert!(!row.is_answered());
    }

    #[test]
    fn test_apply_marks_answered_even_when_empty() {
        let mut row = SourceRow::from_cells(3, "q", "", "");
        row.apply(&ResultRow::new("q", "2", ""));
        assert!(row.is_answered());
        assert_eq!(row.rationale.as_deref(), Some(""));
    }
}
