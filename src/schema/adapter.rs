//! Adapter for loading a per-user event table
//!
//! The ingestion stage hands over one table per user, either as CSV (the usual
//! export) or as JSON. Both forms are reduced to the same `EventTable`: the
//! column names that were present plus the typed events the engine uses.

use crate::error::ComputeError;
use crate::schema::record::RawRecord;
use crate::types::Event;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Parsed event table for one user
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventTable {
    /// Column names present in the source, in source order
    pub columns: Vec<String>,
    /// Recognized events (cbg, bolus, basal, upload)
    pub events: Vec<Event>,
    /// Rows whose type the engine ignores
    pub ignored_rows: usize,
}

impl EventTable {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}

/// Adapter for converting raw table rows into typed events
pub struct EventTableAdapter;

impl EventTableAdapter {
    /// Read a table from disk, choosing the parser by file extension
    pub fn read_path(path: &Path) -> Result<EventTable, ComputeError> {
        if !path.exists() {
            return Err(ComputeError::MissingInput(path.to_path_buf()));
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "json" => Self::parse_array(&std::fs::read_to_string(path)?),
            "ndjson" | "jsonl" => Self::parse_ndjson(&std::fs::read_to_string(path)?),
            _ => Self::parse_csv(File::open(path)?),
        }
    }

    /// Parse a CSV table with a header row
    pub fn parse_csv<R: Read>(reader: R) -> Result<EventTable, ComputeError> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers()?.clone();
        let columns: Vec<String> = headers.iter().map(|h| h.to_string()).collect();

        let mut records = Vec::new();
        for result in rdr.records() {
            let row = result?;
            let record: RawRecord = row.deserialize(Some(&headers))?;
            records.push(record);
        }

        Self::build(columns, records)
    }

    /// Parse a CSV table held in memory
    pub fn parse_csv_str(csv: &str) -> Result<EventTable, ComputeError> {
        Self::parse_csv(csv.as_bytes())
    }

    /// Parse a JSON string containing an array of row objects
    pub fn parse_array(json: &str) -> Result<EventTable, ComputeError> {
        let rows: Vec<serde_json::Map<String, Value>> = serde_json::from_str(json)?;
        Self::from_objects(rows)
    }

    /// Parse NDJSON (newline-delimited JSON) with one row object per line
    pub fn parse_ndjson(ndjson: &str) -> Result<EventTable, ComputeError> {
        let mut rows = Vec::new();
        for (line_num, line) in ndjson.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<serde_json::Map<String, Value>>(trimmed) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    return Err(ComputeError::Parse(format!(
                        "Failed to parse line {}: {}",
                        line_num + 1,
                        e
                    )));
                }
            }
        }
        Self::from_objects(rows)
    }

    fn from_objects(rows: Vec<serde_json::Map<String, Value>>) -> Result<EventTable, ComputeError> {
        // Column set is the union of keys, in first-seen order across rows
        let mut seen = BTreeSet::new();
        let mut columns = Vec::new();
        for row in &rows {
            for key in row.keys() {
                if seen.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
        }

        let records = rows
            .into_iter()
            .map(|row| serde_json::from_value::<RawRecord>(Value::Object(row)))
            .collect::<Result<Vec<_>, _>>()?;

        Self::build(columns, records)
    }

    fn build(columns: Vec<String>, records: Vec<RawRecord>) -> Result<EventTable, ComputeError> {
        let mut events = Vec::with_capacity(records.len());
        let mut ignored_rows = 0;
        for (row, record) in records.into_iter().enumerate() {
            match record.into_event(row)? {
                Some(event) => events.push(event),
                None => ignored_rows += 1,
            }
        }

        Ok(EventTable {
            columns,
            events,
            ignored_rows,
        })
    }
}
