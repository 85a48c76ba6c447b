//! Same-slot record merging
//!
//! After alignment several records of one type can share a grid slot. CGM and
//! basal keep the most recently uploaded record; bolus doses in one slot are
//! distinct deliveries and are summed.

use crate::grid::Grid;
use crate::types::{AlignedEvent, MGDL_PER_MMOLL};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Records merged away because they shared a slot, per type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollapseReport {
    pub cgm: usize,
    pub bolus: usize,
    pub basal: usize,
}

/// Collapser writing aligned events into grid slots
pub struct SlotCollapser;

impl SlotCollapser {
    /// Keep the most recent reading per slot, stored as truncated mg/dL
    pub fn collapse_cgm(grid: &mut Grid, events: &[AlignedEvent]) -> usize {
        let (winners, placed) =
            Self::most_recent_per_slot(grid, events.iter().filter(|e| e.ranked.event.value.is_some()));
        let merged = placed - winners.len();

        for (index, event) in winners {
            if let Some(mmol_l) = event.ranked.event.value {
                grid.slots[index].cgm_mg_dl = Some((mmol_l * MGDL_PER_MMOLL) as i32);
            }
        }

        if merged > 0 {
            debug!(merged, "collapsed cgm readings sharing a slot");
        }
        merged
    }

    /// Sum normal and extended amounts of every bolus in a slot
    pub fn collapse_bolus(grid: &mut Grid, events: &[AlignedEvent]) -> usize {
        let mut sums: BTreeMap<usize, (Option<f64>, Option<f64>)> = BTreeMap::new();
        let mut placed = 0;

        for event in events {
            let Some(index) = Self::slot_index(grid, event) else {
                continue;
            };
            placed += 1;
            let entry = sums.entry(index).or_insert((None, None));
            entry.0 = add(entry.0, event.ranked.event.normal);
            entry.1 = add(entry.1, event.ranked.event.extended);
        }

        let merged = placed - sums.len();
        for (index, (normal, extended)) in sums {
            grid.slots[index].bolus_normal = normal;
            grid.slots[index].bolus_extended = extended;
        }

        if merged > 0 {
            debug!(merged, "summed bolus doses sharing a slot");
        }
        merged
    }

    /// Keep the most recent basal rate (and its duration) per slot
    pub fn collapse_basal(grid: &mut Grid, events: &[AlignedEvent]) -> usize {
        let (winners, placed) =
            Self::most_recent_per_slot(grid, events.iter().filter(|e| e.ranked.event.rate.is_some()));
        let merged = placed - winners.len();

        for (index, event) in winners {
            grid.slots[index].basal_rate = event.ranked.event.rate;
            grid.slots[index].basal_duration_ms = event.ranked.event.duration_ms;
        }

        if merged > 0 {
            debug!(merged, "collapsed basal rates sharing a slot");
        }
        merged
    }

    /// Winning event per slot index, plus how many events were placed
    fn most_recent_per_slot<'a, I>(grid: &Grid, events: I) -> (BTreeMap<usize, &'a AlignedEvent>, usize)
    where
        I: Iterator<Item = &'a AlignedEvent>,
    {
        let mut winners: BTreeMap<usize, &AlignedEvent> = BTreeMap::new();
        let mut placed = 0;
        for event in events {
            let Some(index) = Self::slot_index(grid, event) else {
                continue;
            };
            placed += 1;
            winners
                .entry(index)
                .and_modify(|current| {
                    if event.recency_key() > current.recency_key() {
                        *current = event;
                    }
                })
                .or_insert(event);
        }
        (winners, placed)
    }

    fn slot_index(grid: &Grid, event: &AlignedEvent) -> Option<usize> {
        let index = grid.index_of(event.slot_time);
        if index.is_none() {
            warn!(id = %event.ranked.event.id, slot = %event.slot_time, "aligned event falls outside the grid");
        }
        index
    }
}

fn add(total: Option<f64>, amount: Option<f64>) -> Option<f64> {
    match (total, amount) {
        (Some(t), Some(a)) => Some(t + a),
        (None, a) => a,
        (t, None) => t,
    }
}
