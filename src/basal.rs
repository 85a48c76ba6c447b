//! Basal rate gap filling
//!
//! Basal records only mark where a rate segment begins. The filler extends
//! each explicit rate across the following empty slots using the configured
//! strategy.

use crate::config::BasalFillStrategy;
use crate::grid::Grid;
use crate::types::SLOT_MINUTES;
use tracing::debug;

const SLOT_MILLIS: f64 = (SLOT_MINUTES * 60 * 1000) as f64;

/// Filler for sparse basal rates
#[derive(Debug, Clone, Copy)]
pub struct BasalFiller {
    strategy: BasalFillStrategy,
}

impl BasalFiller {
    pub fn new(strategy: BasalFillStrategy) -> Self {
        Self { strategy }
    }

    /// Fill the grid's basal column in place, returning the number of slots filled
    pub fn fill(&self, grid: &mut Grid) -> usize {
        let explicit: Vec<bool> = grid.slots.iter().map(|s| s.basal_rate.is_some()).collect();
        let starts: Vec<usize> = explicit
            .iter()
            .enumerate()
            .filter_map(|(i, is_explicit)| is_explicit.then_some(i))
            .collect();

        let mut filled = 0;
        for (n, &start) in starts.iter().enumerate() {
            let next_start = starts.get(n + 1).copied().unwrap_or(grid.len());
            let slot = &grid.slots[start];
            let rate = slot.basal_rate;

            let end = match (self.strategy, slot.basal_duration_ms) {
                (BasalFillStrategy::DurationExact, Some(duration_ms)) => {
                    let covered = (duration_ms / SLOT_MILLIS).floor().max(0.0) as usize;
                    next_start.min(start.saturating_add(covered.max(1)))
                }
                // Without a duration the segment runs until the next explicit rate
                _ => next_start,
            };

            for target in grid.slots[start + 1..end].iter_mut() {
                target.basal_rate = rate;
                filled += 1;
            }
        }

        debug!(segments = starts.len(), filled, strategy = ?self.strategy, "filled basal gaps");
        filled
    }
}
