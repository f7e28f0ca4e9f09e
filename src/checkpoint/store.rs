//! Snapshot persistence for resumable annotation runs.
//!
//! - The snapshot is a flat table (prompt, answer, rationale), fully
//!   rewritten on every save via write-then-rename
//! - The previous snapshot is kept as a backup next to it
//! - A missing or unreadable snapshot means "no prior progress", never an error

use crate::models::{ColumnConfig, Result, ResultRow, ResultsTable, SourceRow, SurveyorError};
use crate::table::{Table, TableFormat};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Durable storage for the results table.
///
/// Safe for a single writer only.
#[cfg_attr(test, mockall::automock)]
pub trait CheckpointStore: Send + Sync {
    /// Load the last snapshot; empty when there is none or it is unreadable.
    fn load(&self) -> ResultsTable;

    /// Replace the snapshot with `results`.
    fn save(&self, results: &ResultsTable) -> Result<()>;
}

/// Snapshot stored as a CSV or JSON Lines file.
pub struct FileCheckpointStore {
    path: PathBuf,
    temp_path: PathBuf,
    backup_path: PathBuf,
    format: TableFormat,
    columns: ColumnConfig,
}

impl FileCheckpointStore {
    /// Create a store for `path`; the format follows its extension.
    pub fn new(path: &Path, columns: ColumnConfig) -> Self {
        Self {
            path: path.to_path_buf(),
            temp_path: sibling(path, "tmp"),
            backup_path: sibling(path, "backup"),
            format: TableFormat::from_path(path),
            columns,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    fn to_table(&self, results: &ResultsTable) -> Table {
        let mut table = Table::new(vec![
            self.columns.prompt.clone(),
            self.columns.answer.clone(),
            self.columns.rationale.clone(),
        ]);
        for row in results.rows() {
            table.push_row(vec![
                row.prompt.clone(),
                row.answer.clone(),
                row.rationale.clone(),
            ]);
        }
        table
    }

    fn from_table(&self, table: &Table) -> Result<ResultsTable> {
        // An empty JSON Lines file has no header to carry column names
        if table.columns().is_empty() && table.is_empty() {
            return Ok(ResultsTable::new());
        }
        let prompt_col = table.column_index(&self.columns.prompt).ok_or_else(|| {
            SurveyorError::InvalidInput(format!(
                "snapshot has no '{}' column",
                self.columns.prompt
            ))
        })?;
        let answer_col = table.column_index(&self.columns.answer);
        let rationale_col = table.column_index(&self.columns.rationale);
        let cell = |row: usize, col: Option<usize>| {
            col.map(|c| table.cell(row, c).to_string()).unwrap_or_default()
        };

        Ok((0..table.len())
            .filter(|&i| !table.cell(i, prompt_col).trim().is_empty())
            .map(|i| {
                ResultRow::new(
                    table.cell(i, prompt_col),
                    cell(i, answer_col),
                    cell(i, rationale_col),
                )
            })
            .collect())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> ResultsTable {
        if !self.path.exists() {
            info!(path = %self.path.display(), "No snapshot found, starting fresh");
            return ResultsTable::new();
        }

        let loaded = Table::read_as(&self.path, self.format).and_then(|t| self.from_table(&t));
        match loaded {
            Ok(results) => {
                info!(
                    path = %self.path.display(),
                    rows = results.len(),
                    "Loaded snapshot"
                );
                results
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Snapshot unreadable, treating as no prior progress"
                );
                ResultsTable::new()
            }
        }
    }

    fn save(&self, results: &ResultsTable) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| SurveyorError::io("creating snapshot dir", e))?;
        }

        // Backup existing snapshot
        if self.path.exists() {
            fs::copy(&self.path, &self.backup_path)
                .map_err(|e| SurveyorError::io("backing up snapshot", e))?;
        }

        self.to_table(results).write_as(&self.temp_path, self.format)?;

        // Atomic rename
        fs::rename(&self.temp_path, &self.path)
            .map_err(|e| SurveyorError::io("renaming snapshot", e))?;

        debug!(rows = results.len(), "Snapshot saved");
        Ok(())
    }
}

/// `dir/name.ext` → `dir/name.{tag}.ext`
fn sibling(path: &Path, tag: &str) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot".to_string());
    let name = match path.extension() {
        Some(ext) => format!("{stem}.{tag}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{tag}"),
    };
    path.with_file_name(name)
}

/// Outcome of merging a snapshot into the source rows.
#[derive(Debug, Default)]
pub struct MergeSummary {
    /// Results to continue from, in source order, one per prompt
    pub results: ResultsTable,
    /// Source rows whose answer was copied forward
    pub matched_rows: usize,
    /// Snapshot prompts absent from the source (dropped)
    pub unmatched: usize,
    /// Checkpointed empty answers queued for another attempt
    pub requeued: usize,
}

/// Copy snapshot answers into source rows matched on exact prompt text.
///
/// With `retry_empty`, rows whose snapshot answer is blank are left pending;
/// their snapshot row is kept until a new result replaces it.
pub fn merge_snapshot(rows: &mut [SourceRow], snapshot: ResultsTable, retry_empty: bool) -> MergeSummary {
    let snapshot_len = snapshot.len();
    let by_prompt = snapshot.into_map();
    let mut summary = MergeSummary::default();
    let mut used: HashSet<&str> = HashSet::new();

    for row in rows.iter_mut() {
        let Some(result) = by_prompt.get(&row.prompt) else {
            continue;
        };
        let first_use = used.insert(result.prompt.as_str());

        if retry_empty && !result.has_answer() {
            if first_use {
                summary.requeued += 1;
            }
        } else {
            row.apply(result);
            summary.matched_rows += 1;
        }

        if first_use {
            summary.results.record(result.clone());
        }
    }

    summary.unmatched = snapshot_len - used.len();
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rows(prompts: &[&str]) -> Vec<SourceRow> {
        prompts
            .iter()
            .enumerate()
            .map(|(i, p)| SourceRow::from_cells(i, p, "", ""))
            .collect()
    }

    #[test]
    fn test_missing_snapshot_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(&dir.path().join("out.csv"), ColumnConfig::default());
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_save_then_load_keeps_order_and_empty_answers() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(&dir.path().join("out.csv"), ColumnConfig::default());

        let results: ResultsTable = vec![
            ResultRow::new("q2", "4", "they meet weekly"),
            ResultRow::empty("q1"),
        ]
        .into_iter()
        .collect();
        store.save(&results).unwrap();

        assert_eq!(store.load(), results);
        assert!(!store.backup_path().exists());

        store.save(&ResultsTable::new()).unwrap();
        assert!(store.backup_path().exists());
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_jsonl_snapshot_uses_configured_columns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("out.jsonl");
        let store = FileCheckpointStore::new(&path, ColumnConfig::default());

        let results: ResultsTable = std::iter::once(ResultRow::new("q", "2", "")).collect();
        store.save(&results).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text.trim(),
            r#"{"Prompt":"q","Risposta numerica":"2","Motivazione":""}"#
        );
        assert_eq!(store.load(), results);
    }

    #[test]
    fn test_empty_jsonl_snapshot_is_valid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.jsonl");
        let store = FileCheckpointStore::new(&path, ColumnConfig::default());

        store.save(&ResultsTable::new()).unwrap();

        let table = Table::read_as(&path, TableFormat::JsonLines).unwrap();
        assert!(table.columns().is_empty());
        assert!(store.from_table(&table).unwrap().is_empty());
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_corrupt_snapshot_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "Question,Answer\nq1,3\n").unwrap();

        let store = FileCheckpointStore::new(&path, ColumnConfig::default());
        assert!(store.load().is_empty());
    }

    #[test]
    fn test_merge_copies_matches_and_drops_unmatched() {
        let mut source = rows(&["q1", "q2", "q1", "q3"]);
        let snapshot: ResultsTable = vec![
            ResultRow::new("gone", "1", ""),
            ResultRow::new("q1", "5", "reason"),
            ResultRow::empty("q3"),
        ]
        .into_iter()
        .collect();

        let summary = merge_snapshot(&mut source, snapshot, false);

        assert_eq!(summary.matched_rows, 3);
        assert_eq!(summary.unmatched, 1);
        assert_eq!(summary.requeued, 0);
        let prompts: Vec<_> = summary.results.rows().iter().map(|r| r.prompt.as_str()).collect();
        assert_eq!(prompts, ["q1", "q3"]);

        assert_eq!(source[0].answer.as_deref(), Some("5"));
        assert!(source[2].is_answered());
        assert!(!source[1].is_answered());
        // Checkpointed failure counts as answered
        assert!(source[3].is_answered());
    }

    #[test]
    fn test_merge_requeues_empty_answers_when_asked() {
        let mut source = rows(&["q1", "q2"]);
        let snapshot: ResultsTable = vec![ResultRow::empty("q1"), ResultRow::new("q2", "3", "")]
            .into_iter()
            .collect();

        let summary = merge_snapshot(&mut source, snapshot, true);

        assert_eq!(summary.requeued, 1);
        assert_eq!(summary.matched_rows, 1);
        assert!(!source[0].is_answered());
        assert!(source[1].is_answered());
        assert_eq!(summary.results.len(), 2);
    }

    #[test]
    fn test_sibling_paths() {
        assert_eq!(sibling(Path::new("data/out.csv"), "tmp"), PathBuf::from("data/out.tmp.csv"));
        assert_eq!(sibling(Path::new("out"), "backup"), PathBuf::from("out.backup"));
    }
}
