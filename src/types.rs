//! Core types for the Synheart Glyco pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: device events, ranked and aligned events, the 5-minute grid and the
//! episode and window descriptors derived from it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Grid cadence in minutes
pub const SLOT_MINUTES: i64 = 5;

/// Number of 5-minute slots in one day
pub const SLOTS_PER_DAY: usize = 288;

/// Slots per day falling in sleep hours (00:00 to 06:00)
pub const SLEEP_SLOTS_PER_DAY: usize = 72;

/// mmol/L to mg/dL conversion factor
pub const MGDL_PER_MMOLL: f64 = 18.01559;

/// Grid cadence as a chrono duration
pub fn slot_duration() -> Duration {
    Duration::minutes(SLOT_MINUTES)
}

/// Device event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    /// Continuous glucose reading
    Cbg,
    /// Discrete insulin dose
    Bolus,
    /// Background insulin rate segment
    Basal,
    /// Upload session record, used only for recency ranking
    Upload,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Cbg => "cbg",
            EventType::Bolus => "bolus",
            EventType::Basal => "basal",
            EventType::Upload => "upload",
        }
    }

    /// Parse the `type` column, ignoring record types the engine does not use
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "cbg" => Some(EventType::Cbg),
            "bolus" => Some(EventType::Bolus),
            "basal" => Some(EventType::Basal),
            "upload" => Some(EventType::Upload),
            _ => None,
        }
    }
}

/// One immutable device event
///
/// Type-specific fields are only populated for their type: `value` for cbg,
/// `normal`/`extended` for bolus, `rate`/`duration_ms` for basal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Record id, also the deterministic tie-break key
    pub id: String,
    pub event_type: EventType,
    pub upload_id: Option<String>,
    /// Device-local timestamp as reported (not parsed)
    pub device_time: Option<String>,
    pub utc_time: DateTime<Utc>,
    /// Glucose in mmol/L
    pub value: Option<f64>,
    /// Normal bolus units
    pub normal: Option<f64>,
    /// Extended bolus units
    pub extended: Option<f64>,
    /// Basal rate (U/hr)
    pub rate: Option<f64>,
    /// Basal segment duration (ms)
    pub duration_ms: Option<f64>,
}

impl Event {
    /// Bare event of the given type; callers fill in the type-specific fields
    pub fn new(id: impl Into<String>, event_type: EventType, utc_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            event_type,
            upload_id: None,
            device_time: None,
            utc_time,
            value: None,
            normal: None,
            extended: None,
            rate: None,
            duration_ms: None,
        }
    }

    pub fn cbg(id: impl Into<String>, utc_time: DateTime<Utc>, mmol_l: f64) -> Self {
        Self {
            value: Some(mmol_l),
            ..Self::new(id, EventType::Cbg, utc_time)
        }
    }

    pub fn bolus(id: impl Into<String>, utc_time: DateTime<Utc>, normal: f64) -> Self {
        Self {
            normal: Some(normal),
            ..Self::new(id, EventType::Bolus, utc_time)
        }
    }

    pub fn basal(
        id: impl Into<String>,
        utc_time: DateTime<Utc>,
        rate: f64,
        duration_ms: Option<f64>,
    ) -> Self {
        Self {
            rate: Some(rate),
            duration_ms,
            ..Self::new(id, EventType::Basal, utc_time)
        }
    }

    pub fn upload(id: impl Into<String>, upload_id: impl Into<String>, utc_time: DateTime<Utc>) -> Self {
        Self {
            upload_id: Some(upload_id.into()),
            ..Self::new(id, EventType::Upload, utc_time)
        }
    }

    pub fn with_upload(mut self, upload_id: impl Into<String>) -> Self {
        self.upload_id = Some(upload_id.into());
        self
    }

    pub fn with_device_time(mut self, device_time: impl Into<String>) -> Self {
        self.device_time = Some(device_time.into());
        self
    }
}

/// Classification of a user's event table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataClass {
    /// CGM readings only
    Cgm,
    /// Insulin pump records only
    Pump,
    /// Both CGM and pump records
    Mixed,
    /// Nothing recognizable
    Na,
}

impl DataClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataClass::Cgm => "CGM",
            DataClass::Pump => "PUMP",
            DataClass::Mixed => "MIXED",
            DataClass::Na => "NA",
        }
    }

    pub fn has_cgm(&self) -> bool {
        matches!(self, DataClass::Cgm | DataClass::Mixed)
    }

    pub fn has_pump(&self) -> bool {
        matches!(self, DataClass::Pump | DataClass::Mixed)
    }
}

impl std::fmt::Display for DataClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event with its upload recency rank attached (1 = oldest upload, 0 = unknown upload)
#[derive(Debug, Clone, PartialEq)]
pub struct RankedEvent {
    pub event: Event,
    pub upload_rank: u32,
}

/// Ranked event snapped onto the 5-minute lattice
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedEvent {
    pub ranked: RankedEvent,
    pub slot_time: DateTime<Utc>,
}

impl AlignedEvent {
    /// Ordering key for "most recently uploaded wins" within a slot
    pub fn recency_key(&self) -> (u32, DateTime<Utc>, &str) {
        (
            self.ranked.upload_rank,
            self.ranked.event.utc_time,
            self.ranked.event.id.as_str(),
        )
    }
}

/// One 5-minute grid slot with at most one value per type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSlot {
    /// Slot time, a multiple of 5 minutes (UTC)
    pub slot_time: DateTime<Utc>,
    /// Glucose (mg/dL)
    pub cgm_mg_dl: Option<i32>,
    pub bolus_normal: Option<f64>,
    pub bolus_extended: Option<f64>,
    /// Basal rate, explicit at segment starts and filled by the basal filler
    pub basal_rate: Option<f64>,
    /// Basal duration, set only where a segment begins
    pub basal_duration_ms: Option<f64>,
}

impl GridSlot {
    pub fn empty(slot_time: DateTime<Utc>) -> Self {
        Self {
            slot_time,
            cgm_mg_dl: None,
            bolus_normal: None,
            bolus_extended: None,
            basal_rate: None,
            basal_duration_ms: None,
        }
    }

    /// Normal plus extended bolus units, `None` when the slot has no dose
    pub fn bolus_total(&self) -> Option<f64> {
        match (self.bolus_normal, self.bolus_extended) {
            (Some(n), Some(e)) => Some(n + e),
            (n, e) => n.or(e),
        }
    }
}

/// Rolling window descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    /// Column prefix, e.g. "24hr" or "7day"
    pub label: String,
    /// Window width in 5-minute slots
    pub point_count: usize,
    /// Fraction of `point_count` that must be non-null
    pub min_valid_fraction: f64,
}

impl WindowSpec {
    pub fn new(label: impl Into<String>, point_count: usize, min_valid_fraction: f64) -> Self {
        Self {
            label: label.into(),
            point_count,
            min_valid_fraction,
        }
    }

    /// Minimum non-null points for defined statistics
    pub fn min_periods(&self) -> usize {
        (self.min_valid_fraction * self.point_count as f64).floor() as usize
    }
}

/// A sustained excursion past a clinical threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub threshold_name: String,
    pub start_slot_time: DateTime<Utc>,
    pub duration_minutes: u32,
}
