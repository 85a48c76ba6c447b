//! Per-row input record
//!
//! Mirrors one row of the anonymized per-user event table delivered by the
//! ingestion stage. Column names follow the export (`deviceTime`, `uploadId`).

use crate::error::ComputeError;
use crate::types::{Event, EventType};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Column names the engine understands
pub mod columns {
    pub const TYPE: &str = "type";
    pub const TIME: &str = "time";
    pub const DEVICE_TIME: &str = "deviceTime";
    pub const UPLOAD_ID: &str = "uploadId";
    pub const ID: &str = "id";
    pub const VALUE: &str = "value";
    pub const NORMAL: &str = "normal";
    pub const EXTENDED: &str = "extended";
    pub const RATE: &str = "rate";
    pub const DURATION: &str = "duration";
}

/// Raw event-table row; every column is optional at this layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(rename = "type", default)]
    pub record_type: Option<String>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(rename = "deviceTime", default)]
    pub device_time: Option<String>,
    #[serde(rename = "uploadId", default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub value: Option<f64>,
    #[serde(default)]
    pub normal: Option<f64>,
    #[serde(default)]
    pub extended: Option<f64>,
    #[serde(default)]
    pub rate: Option<f64>,
    /// Basal duration in milliseconds
    #[serde(default)]
    pub duration: Option<f64>,
}

impl RawRecord {
    /// Convert into a typed event.
    ///
    /// Returns `Ok(None)` for record types the engine ignores (smbg, food, ...).
    /// Rows without an `id` get a synthetic one derived from the row index so the
    /// duplicate tie-break stays total.
    pub fn into_event(self, row: usize) -> Result<Option<Event>, ComputeError> {
        let Some(event_type) = self.record_type.as_deref().and_then(EventType::parse) else {
            return Ok(None);
        };

        let raw_time = self
            .time
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                ComputeError::Parse(format!("row {}: {} record has no time", row + 1, event_type.as_str()))
            })?;
        let utc_time = parse_utc(raw_time)
            .ok_or_else(|| ComputeError::Parse(format!("row {}: invalid time '{raw_time}'", row + 1)))?;

        let id = self
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("row-{row:010}"));

        let mut event = Event::new(id, event_type, utc_time);
        event.upload_id = self.upload_id.filter(|u| !u.is_empty());
        event.device_time = self.device_time.filter(|d| !d.is_empty());

        match event_type {
            EventType::Cbg => event.value = self.value,
            EventType::Bolus => {
                event.normal = self.normal;
                event.extended = self.extended;
            }
            EventType::Basal => {
                event.rate = self.rate;
                event.duration_ms = self.duration;
            }
            EventType::Upload => {}
        }

        Ok(Some(event))
    }
}

/// Parse an ISO-8601 timestamp; offset-less values are taken as UTC
pub fn parse_utc(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}
