//! Flat tables with named columns, stored as CSV or JSON Lines.
//!
//! The format follows the file extension: `.jsonl` / `.ndjson` are JSON
//! Lines (one object per row), anything else is CSV. All cells are text.

use crate::models::{Result, SurveyorError};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tracing::debug;

/// On-disk encoding of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    JsonLines,
}

impl TableFormat {
    /// Pick the format from the path's extension.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("jsonl") | Some("ndjson") => Self::JsonLines,
            _ => Self::Csv,
        }
    }
}

/// An in-memory table: ordered columns, rows of text cells.
///
/// Every row has exactly `columns.len()` cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Index of `name`, appending an empty column when it is missing.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.columns.push(name.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.columns.len() - 1
    }

    /// Append a row, padding or truncating it to the column count.
    pub fn push_row(&mut self, mut cells: Vec<String>) {
        cells.resize(self.columns.len(), String::new());
        self.rows.push(cells);
    }

    pub fn cell(&self, row: usize, col: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn set_cell(&mut self, row: usize, col: usize, value: impl Into<String>) {
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.get_mut(col)) {
            *cell = value.into();
        }
    }

    /// Read a table, choosing the format from the extension.
    pub fn read(path: &Path) -> Result<Self> {
        Self::read_as(path, TableFormat::from_path(path))
    }

    pub fn read_as(path: &Path, format: TableFormat) -> Result<Self> {
        let table = match format {
            TableFormat::Csv => Self::read_csv(path)?,
            TableFormat::JsonLines => Self::read_jsonl(path)?,
        };
        debug!(
            path = %path.display(),
            rows = table.len(),
            columns = table.columns.len(),
            "Table loaded"
        );
        Ok(table)
    }

    /// Write a table, choosing the format from the extension.
    pub fn write(&self, path: &Path) -> Result<()> {
        self.write_as(path, TableFormat::from_path(path))
    }

    pub fn write_as(&self, path: &Path, format: TableFormat) -> Result<()> {
        match format {
            TableFormat::Csv => self.write_csv(path),
            TableFormat::JsonLines => self.write_jsonl(path),
        }
    }

    fn read_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| SurveyorError::table(format!("opening {}", path.display()), e))?;

        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| SurveyorError::table("reading header", e))?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                // Spreadsheet exports often start with a byte-order mark
                if i == 0 {
                    h.trim_start_matches('\u{feff}').to_string()
                } else {
                    h.to_string()
                }
            })
            .collect();

        let mut table = Self::new(columns);
        for (line, record) in reader.records().enumerate() {
            let record = record
                .map_err(|e| SurveyorError::table(format!("reading record {}", line + 1), e))?;
            table.push_row(record.iter().map(str::to_string).collect());
        }
        Ok(table)
    }

    fn write_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .map_err(|e| SurveyorError::table(format!("creating {}", path.display()), e))?;
        writer
            .write_record(&self.columns)
            .map_err(|e| SurveyorError::table("writing header", e))?;
        for row in &self.rows {
            writer
                .write_record(row)
                .map_err(|e| SurveyorError::table("writing record", e))?;
        }
        writer
            .flush()
            .map_err(|e| SurveyorError::io("flushing table", e))
    }

    fn read_jsonl(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| SurveyorError::io(format!("opening {}", path.display()), e))?;
        let reader = BufReader::new(file);

        let mut objects = Vec::new();
        let mut columns: Vec<String> = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| SurveyorError::io("reading table", e))?;
            if line.trim().is_empty() {
                continue;
            }
            let object: Map<String, Value> = serde_json::from_str(&line).map_err(|e| {
                SurveyorError::ParseError(format!("Line {}: {}", line_num + 1, e))
            })?;
            for key in object.keys() {
                if !columns.contains(key) {
                    columns.push(key.clone());
                }
            }
            objects.push(object);
        }

        let mut table = Self::new(columns);
        for object in objects {
            let cells = table
                .columns
                .iter()
                .map(|c| object.get(c).map(value_to_cell).unwrap_or_default())
                .collect();
            table.push_row(cells);
        }
        Ok(table)
    }

    fn write_jsonl(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| SurveyorError::io(format!("creating {}", path.display()), e))?;
        let mut writer = BufWriter::new(file);

        for row in &self.rows {
            let object: Map<String, Value> = self
                .columns
                .iter()
                .cloned()
                .zip(row.iter().map(|c| Value::String(c.clone())))
                .collect();
            let json = serde_json::to_string(&object)
                .map_err(|e| SurveyorError::Internal(format!("Serializing row: {e}")))?;
            writeln!(writer, "{json}").map_err(|e| SurveyorError::io("writing table", e))?;
        }

        writer
            .flush()
            .map_err(|e| SurveyorError::io("flushing table", e))
    }
}

fn value_to_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_format_from_extension() {
        assert_eq!(TableFormat::from_path(Path::new("a.jsonl")), TableFormat::JsonLines);
        assert_eq!(TableFormat::from_path(Path::new("a.NDJSON")), TableFormat::JsonLines);
        assert_eq!(TableFormat::from_path(Path::new("a.csv")), TableFormat::Csv);
        assert_eq!(TableFormat::from_path(Path::new("a")), TableFormat::Csv);
    }

    #[test]
    fn test_read_csv_strips_bom_and_pads_short_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.csv");
        fs::write(&path, "\u{feff}Prompt,Risposta numerica\n\"Rate A, 1-5\",3\nRate B\n").unwrap();

        let table = Table::read(&path).unwrap();
        assert_eq!(table.columns(), ["Prompt", "Risposta numerica"]);
        assert_eq!(table.cell(0, 0), "Rate A, 1-5");
        assert_eq!(table.cell(1, 1), "");
    }

    #[test]
    fn test_read_jsonl_collects_columns_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.jsonl");
        fs::write(
            &path,
            "{\"Prompt\":\"q1\",\"Score\":4}\n\n{\"Prompt\":\"q2\",\"Note\":null,\"Extra\":\"x\"}\n",
        )
        .unwrap();

        let table = Table::read(&path).unwrap();
        assert_eq!(table.columns(), ["Prompt", "Score", "Note", "Extra"]);
        assert_eq!(table.cell(0, 1), "4");
        assert_eq!(table.cell(0, 3), "");
        assert_eq!(table.cell(1, 2), "");
        assert_eq!(table.cell(1, 3), "x");
    }

    #[test]
    fn test_ensure_column_extends_rows() {
        let mut table = Table::new(vec!["Prompt".to_string()]);
        table.push_row(vec!["q1".to_string()]);
        let idx = table.ensure_column("Motivazione");
        assert_eq!(idx, 1);
        assert_eq!(table.ensure_column("Prompt"), 0);
        table.set_cell(0, idx, "because");
        assert_eq!(table.cell(0, 1), "because");
    }

    #[test]
    fn test_csv_write_quotes_multiline_cells() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        let mut table = Table::new(vec!["Prompt".to_string(), "Motivazione".to_string()]);
        table.push_row(vec!["q, with comma".to_string(), "line one\nline two".to_string()]);
        table.write(&path).unwrap();

        let back = Table::read(&path).unwrap();
        assert_eq!(back, table);
    }

    #[test]
    fn test_invalid_jsonl_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, "{not json}\n").unwrap();
        assert!(matches!(Table::read(&path), Err(SurveyorError::ParseError(_))));
    }
}
