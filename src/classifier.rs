//! Record classification
//!
//! Tags a user's event table as CGM-only, pump-only or mixed from the columns
//! it carries, checks the column contract for that class and splits the events
//! into the per-type streams the rest of the pipeline consumes.

use crate::error::ComputeError;
use crate::schema::{columns, EventTable};
use crate::types::{DataClass, Event, EventType};
use serde::Serialize;
use tracing::debug;

const CGM_COLUMNS: [&str; 4] = [columns::TYPE, columns::TIME, columns::UPLOAD_ID, columns::VALUE];

const PUMP_COLUMNS: [&str; 6] = [
    columns::TYPE,
    columns::TIME,
    columns::UPLOAD_ID,
    columns::NORMAL,
    columns::RATE,
    columns::DURATION,
];

/// Optional columns kept in the projection when present
const OPTIONAL_COLUMNS: [&str; 3] = [columns::ID, columns::DEVICE_TIME, columns::EXTENDED];

/// Per-type event streams for one classified user
#[derive(Debug, Clone, Default)]
pub struct ClassifiedEvents {
    pub cgm: Vec<Event>,
    pub bolus: Vec<Event>,
    pub basal: Vec<Event>,
    pub uploads: Vec<Event>,
}

impl ClassifiedEvents {
    /// Number of cgm, bolus and basal events
    pub fn device_event_count(&self) -> usize {
        self.cgm.len() + self.bolus.len() + self.basal.len()
    }
}

/// Result of classifying a table without running the pipeline
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub class: DataClass,
    /// Minimal column projection for the class
    pub projection: Vec<String>,
}

/// Classifier for per-user event tables
pub struct RecordClassifier;

impl RecordClassifier {
    /// Detect the data class from the column set.
    ///
    /// A `value` column means CGM data; a `normal` column means pump data.
    pub fn classify(columns: &[String]) -> DataClass {
        let has = |name: &str| columns.iter().any(|c| c == name);
        match (has(columns::VALUE), has(columns::NORMAL)) {
            (true, true) => DataClass::Mixed,
            (true, false) => DataClass::Cgm,
            (false, true) => DataClass::Pump,
            (false, false) => DataClass::Na,
        }
    }

    /// Columns the class requires
    pub fn required_columns(class: DataClass) -> Vec<&'static str> {
        let mut required: Vec<&'static str> = Vec::new();
        if class.has_cgm() {
            required.extend(CGM_COLUMNS);
        }
        if class.has_pump() {
            for column in PUMP_COLUMNS {
                if !required.contains(&column) {
                    required.push(column);
                }
            }
        }
        required
    }

    /// Minimal column projection: required columns plus optional ones present
    pub fn projection(class: DataClass, columns: &[String]) -> Vec<String> {
        let mut projection: Vec<String> = Self::required_columns(class)
            .into_iter()
            .map(str::to_string)
            .collect();
        for optional in OPTIONAL_COLUMNS {
            if optional == columns::EXTENDED && !class.has_pump() {
                continue;
            }
            if columns.iter().any(|c| c == optional) {
                projection.push(optional.to_string());
            }
        }
        projection
    }

    /// Classify a table and verify its column contract
    pub fn inspect(table: &EventTable) -> Result<Classification, ComputeError> {
        let class = Self::classify(&table.columns);
        if class == DataClass::Na {
            return Err(ComputeError::Classification(
                "no cgm `value` or bolus `normal` column".to_string(),
            ));
        }

        let missing: Vec<String> = Self::required_columns(class)
            .into_iter()
            .filter(|column| !table.has_column(column))
            .map(str::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(ComputeError::ContractViolation {
                class: class.to_string(),
                missing,
            });
        }

        Ok(Classification {
            class,
            projection: Self::projection(class, &table.columns),
        })
    }

    /// Split a table's events into per-type streams allowed by its class
    pub fn split(table: EventTable) -> Result<(DataClass, ClassifiedEvents), ComputeError> {
        let Classification { class, .. } = Self::inspect(&table)?;

        let mut out = ClassifiedEvents::default();
        for event in table.events {
            match event.event_type {
                EventType::Cbg if class.has_cgm() => out.cgm.push(event),
                EventType::Bolus if class.has_pump() => out.bolus.push(event),
                EventType::Basal if class.has_pump() => out.basal.push(event),
                EventType::Upload => out.uploads.push(event),
                _ => {}
            }
        }

        debug!(
            class = %class,
            cgm = out.cgm.len(),
            bolus = out.bolus.len(),
            basal = out.basal.len(),
            uploads = out.uploads.len(),
            "classified event table"
        );

        Ok((class, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_classify_by_columns() {
        assert_eq!(RecordClassifier::classify(&cols(&["type", "value"])), DataClass::Cgm);
        assert_eq!(RecordClassifier::classify(&cols(&["type", "normal"])), DataClass::Pump);
        assert_eq!(
            RecordClassifier::classify(&cols(&["value", "normal"])),
            DataClass::Mixed
        );
        assert_eq!(RecordClassifier::classify(&cols(&["type", "time"])), DataClass::Na);
    }

    #[test]
    fn test_projection_for_cgm() {
        let columns = cols(&["type", "time", "uploadId", "value", "id", "deviceTime", "extended", "note"]);
        let projection = RecordClassifier::projection(DataClass::Cgm, &columns);
        assert_eq!(
            projection,
            cols(&["type", "time", "uploadId", "value", "id", "deviceTime"])
        );
    }

    #[test]
    fn test_na_is_classification_error() {
        let table = EventTable {
            columns: cols(&["type", "time"]),
            ..Default::default()
        };
        let err = RecordClassifier::inspect(&table).unwrap_err();
        assert!(err.is_skip());
        assert_eq!(err.code(), "NA");
    }

    #[test]
    fn test_pump_missing_duration_is_contract_violation() {
        let table = EventTable {
            columns: cols(&["type", "time", "uploadId", "normal", "rate"]),
            ..Default::default()
        };
        match RecordClassifier::inspect(&table).unwrap_err() {
            ComputeError::ContractViolation { class, missing } => {
                assert_eq!(class, "PUMP");
                assert_eq!(missing, vec!["duration".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_split_drops_types_outside_class() {
        let t = Utc.with_ymd_and_hms(2019, 3, 1, 12, 0, 0).unwrap();
        let table = EventTable {
            columns: cols(&["type", "time", "uploadId", "value"]),
            events: vec![
                Event::cbg("c1", t, 5.5),
                Event::bolus("b1", t, 1.0),
                Event::upload("u1", "up-1", t),
            ],
            ignored_rows: 0,
        };
        let (class, split) = RecordClassifier::split(table).unwrap();
        assert_eq!(class, DataClass::Cgm);
        assert_eq!(split.cgm.len(), 1);
        assert!(split.bolus.is_empty());
        assert_eq!(split.uploads.len(), 1);
        assert_eq!(split.device_event_count(), 1);
    }
}
