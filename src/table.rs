//! table.rs
//!
//! In-memory row sources: a CSV header plus its records, and the load
//! directives that pair a row source with a destination table.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use csv::ReaderBuilder;
use serde::{Deserialize, Serialize};

use crate::errors::IngestError;

/// How a bulk import treats rows that already exist in the destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Insert only; a row whose key already exists is an error.
    Append,
    /// Drop every existing row, then insert.
    Replace,
    /// Insert new rows and overwrite rows whose key already exists.
    #[default]
    Update,
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImportMode::Append => "append",
            ImportMode::Replace => "replace",
            ImportMode::Update => "update",
        };
        f.write_str(s)
    }
}

/// A header row and the records beneath it, all kept as strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TableData {
    /// Parse comma-delimited CSV with a header row. `label` names the source in errors.
    pub fn from_reader<R: Read>(label: &str, reader: R) -> Result<Self, IngestError> {
        let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);

        let columns: Vec<String> = rdr
            .headers()
            .map_err(|e| IngestError::Csv(label.to_string(), e))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record.map_err(|e| IngestError::Csv(label.to_string(), e))?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(TableData { columns, rows })
    }

    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        let file = File::open(path).map_err(|e| IngestError::io(path, e))?;
        Self::from_reader(&path.display().to_string(), file)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Positions of `names` within the header, or the first name that is missing.
    pub fn column_positions<'a>(&self, names: &'a [String]) -> Result<Vec<usize>, &'a str> {
        names
            .iter()
            .map(|name| {
                self.columns
                    .iter()
                    .position(|c| c == name)
                    .ok_or(name.as_str())
            })
            .collect()
    }
}

/// Every header column whose name contains `_id`, in header order.
///
/// The match is a plain case-sensitive substring test, so a column such as
/// `paid_idle` is treated as a key too.
pub fn infer_primary_key(columns: &[String]) -> Vec<String> {
    columns
        .iter()
        .filter(|col| col.contains("_id"))
        .cloned()
        .collect()
}

/// One unit of work for a versioned store: which table, which rows, keyed how.
#[derive(Debug, Clone)]
pub struct LoadDirective {
    pub table: String,
    pub data: TableData,
    pub primary_key: Vec<String>,
    pub mode: ImportMode,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn key_columns_keep_header_order() {
        let header = cols(&["player_id", "season_id", "points"]);
        assert_eq!(infer_primary_key(&header), cols(&["player_id", "season_id"]));
    }

    #[test]
    fn no_id_columns_yields_empty_key() {
        assert!(infer_primary_key(&cols(&["points", "rebounds"])).is_empty());
    }

    #[test]
    fn substring_match_is_unanchored_and_case_sensitive() {
        let header = cols(&["team_id_alt", "PLAYER_ID", "paid_idle", "id"]);
        assert_eq!(infer_primary_key(&header), cols(&["team_id_alt", "paid_idle"]));
    }

    #[test]
    fn parses_header_and_records() {
        let csv = "player_id,season_id,pts\n1,2019-20,10\n1,2020-21,\n";
        let data = TableData::from_reader("inline", csv.as_bytes()).unwrap();
        assert_eq!(data.columns, cols(&["player_id", "season_id", "pts"]));
        assert_eq!(data.len(), 2);
        assert_eq!(data.rows[1], cols(&["1", "2020-21", ""]));
    }

    #[test]
    fn ragged_rows_are_an_error() {
        let csv = "a,b\n1,2\n3\n";
        let err = TableData::from_reader("ragged", csv.as_bytes()).unwrap_err();
        assert!(matches!(err, IngestError::Csv(label, _) if label == "ragged"));
    }

    #[test]
    fn column_positions_reports_missing_name() {
        let data = TableData {
            columns: cols(&["a", "b"]),
            rows: vec![],
        };
        assert_eq!(data.column_positions(&cols(&["b", "a"])), Ok(vec![1, 0]));
        assert_eq!(data.column_positions(&cols(&["c"])), Err("c"));
    }

    #[test]
    fn import_mode_deserializes_lowercase() {
        let mode: ImportMode = serde_json::from_str("\"replace\"").unwrap();
        assert_eq!(mode, ImportMode::Replace);
        assert_eq!(ImportMode::default().to_string(), "update");
    }
}
