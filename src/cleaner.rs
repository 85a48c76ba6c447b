//! Invalid record removal
//!
//! Drops CGM readings outside the sensor's reportable range and basal segments
//! with a negative duration before duplicates are resolved.

use crate::types::Event;
use tracing::debug;

/// Lowest reportable sensor value, 38 mg/dL in mmol/L
pub const MIN_CGM_MMOL_L: f64 = 2.109284236597303;

/// Highest reportable sensor value, 402 mg/dL in mmol/L
pub const MAX_CGM_MMOL_L: f64 = 22.314006924003046;

/// Cleaner for out-of-range device records
pub struct EventCleaner;

impl EventCleaner {
    /// Keep CGM readings with a value inside the reportable range (inclusive)
    pub fn clean_cgm(events: Vec<Event>) -> (Vec<Event>, usize) {
        let before = events.len();
        let kept: Vec<Event> = events
            .into_iter()
            .filter(|e| {
                e.value
                    .is_some_and(|v| (MIN_CGM_MMOL_L..=MAX_CGM_MMOL_L).contains(&v))
            })
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            debug!(removed, "removed out-of-range cgm values");
        }
        (kept, removed)
    }

    /// Drop basal segments whose duration is negative; missing durations stay
    pub fn clean_basal(events: Vec<Event>) -> (Vec<Event>, usize) {
        let before = events.len();
        let kept: Vec<Event> = events
            .into_iter()
            .filter(|e| !e.duration_ms.is_some_and(|d| d < 0.0))
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            debug!(removed, "removed basal segments with negative duration");
        }
        (kept, removed)
    }
}
