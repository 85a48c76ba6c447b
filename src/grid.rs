//! Time grid alignment
//!
//! Snaps event timestamps onto the 5-minute lattice and builds the contiguous
//! grid skeleton shared by every event type of one user.
//!
//! Two rounding modes are available:
//! - `Fast`: each timestamp is rounded independently (1 µs epsilon, nearest
//!   30 s, 1 µs epsilon, nearest 5 min).
//! - `Chunked`: events are split into chunks at gaps of more than one step.
//!   Only a chunk's first event is rounded; later events are placed at the
//!   anchor plus the cumulative whole-step distance, so long uninterrupted runs
//!   cannot drift onto a neighbouring slot.

use crate::config::RoundingMode;
use crate::error::ComputeError;
use crate::types::{AlignedEvent, GridSlot, RankedEvent, SLOT_MINUTES};
use chrono::{DateTime, Duration, Timelike, Utc};
use tracing::debug;

/// Sleep hours run from midnight to this hour (slot time)
const SLEEP_END_HOUR: u32 = 6;

const MICROS_PER_SECOND: i64 = 1_000_000;
const HALF_MINUTE_MICROS: i64 = 30 * MICROS_PER_SECOND;
const SLOT_MICROS: i64 = SLOT_MINUTES * 60 * MICROS_PER_SECOND;

/// First and last observed event time across all types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridBounds {
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
}

impl GridBounds {
    /// Bounds over every event of every type
    pub fn from_events<'a, I>(events: I) -> Result<Self, ComputeError>
    where
        I: IntoIterator<Item = &'a RankedEvent>,
    {
        let mut bounds: Option<GridBounds> = None;
        for ranked in events {
            let t = ranked.event.utc_time;
            bounds = Some(match bounds {
                None => GridBounds { first: t, last: t },
                Some(b) => GridBounds {
                    first: b.first.min(t),
                    last: b.last.max(t),
                },
            });
        }
        bounds.ok_or_else(|| ComputeError::EmptyGrid("no cgm, bolus or basal events".to_string()))
    }
}

/// Contiguous 5-minute grid
#[derive(Debug, Clone, PartialEq)]
pub struct Grid {
    pub start: DateTime<Utc>,
    pub slots: Vec<GridSlot>,
}

impl Grid {
    /// Empty-slot grid covering `[start, end]` inclusive
    pub fn spanning(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        let steps = steps_between(start, end).max(0) as usize;
        let slots = (0..=steps)
            .map(|i| GridSlot::empty(start + Duration::minutes(SLOT_MINUTES * i as i64)))
            .collect();
        Self { start, slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.slots.last().map(|s| s.slot_time).unwrap_or(self.start)
    }

    /// Index of a lattice-aligned slot time, if it falls on this grid
    pub fn index_of(&self, slot_time: DateTime<Utc>) -> Option<usize> {
        let micros = (slot_time - self.start).num_microseconds()?;
        if micros < 0 || micros % SLOT_MICROS != 0 {
            return None;
        }
        let index = (micros / SLOT_MICROS) as usize;
        (index < self.slots.len()).then_some(index)
    }

    /// Grid column as `f64` values (`NaN` for empty slots)
    pub fn column<F>(&self, field: F) -> Vec<f64>
    where
        F: Fn(&GridSlot) -> Option<f64>,
    {
        self.slots.iter().map(|s| field(s).unwrap_or(f64::NAN)).collect()
    }

    /// Copy of a column with every slot at or after 06:00 set to `NaN`
    pub fn sleep_column(&self, values: &[f64]) -> Vec<f64> {
        self.slots
            .iter()
            .zip(values)
            .map(|(slot, &v)| if slot.slot_time.hour() < SLEEP_END_HOUR { v } else { f64::NAN })
            .collect()
    }
}

/// Aligner for snapping events onto the 5-minute lattice
#[derive(Debug, Clone, Copy)]
pub struct TimeGridAligner {
    mode: RoundingMode,
}

impl TimeGridAligner {
    pub fn new(mode: RoundingMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> RoundingMode {
        self.mode
    }

    /// Round one timestamp: +1 µs, nearest 30 s, +1 µs, nearest 5 min
    pub fn round_fast(t: DateTime<Utc>) -> DateTime<Utc> {
        let micros = t.timestamp_micros();
        let half_minute = round_to(micros + 1, HALF_MINUTE_MICROS);
        let rounded = round_to(half_minute + 1, SLOT_MICROS);
        t + Duration::microseconds(rounded - micros)
    }

    /// Attach a slot time to each event; output is sorted by (utc time, id)
    pub fn align(&self, mut events: Vec<RankedEvent>) -> Vec<AlignedEvent> {
        events.sort_by(|a, b| {
            a.event
                .utc_time
                .cmp(&b.event.utc_time)
                .then_with(|| a.event.id.cmp(&b.event.id))
        });

        match self.mode {
            RoundingMode::Fast => events
                .into_iter()
                .map(|ranked| AlignedEvent {
                    slot_time: Self::round_fast(ranked.event.utc_time),
                    ranked,
                })
                .collect(),
            RoundingMode::Chunked => Self::align_chunked(events),
        }
    }

    fn align_chunked(events: Vec<RankedEvent>) -> Vec<AlignedEvent> {
        let mut aligned = Vec::with_capacity(events.len());
        let mut prev: Option<DateTime<Utc>> = None;
        // (anchor slot, cumulative steps since anchor)
        let mut chunk: Option<(DateTime<Utc>, i64)> = None;
        let mut chunks = 0usize;

        for ranked in events {
            let t = ranked.event.utc_time;
            let steps = prev.map(|p| steps_between(p, t));

            let (anchor, cumulative) = match (chunk, steps) {
                (Some((anchor, cumulative)), Some(steps)) if steps <= 1 => (anchor, cumulative + steps),
                _ => {
                    chunks += 1;
                    (Self::round_fast(t), 0)
                }
            };
            chunk = Some((anchor, cumulative));
            prev = Some(t);

            aligned.push(AlignedEvent {
                slot_time: anchor + Duration::minutes(SLOT_MINUTES * cumulative),
                ranked,
            });
        }

        debug!(events = aligned.len(), chunks, "aligned events in gap-separated chunks");
        aligned
    }

    /// Build the grid skeleton from the global bounds.
    ///
    /// The grid runs from round(first) to round(last), widened to cover any
    /// aligned slot that falls outside those bounds.
    pub fn build_grid(&self, bounds: &GridBounds, aligned: &[&[AlignedEvent]]) -> Grid {
        let mut start = Self::round_fast(bounds.first);
        let mut end = Self::round_fast(bounds.last);
        for event in aligned.iter().flat_map(|stream| stream.iter()) {
            start = start.min(event.slot_time);
            end = end.max(event.slot_time);
        }

        let grid = Grid::spanning(start, end);
        debug!(slots = grid.len(), start = %grid.start, end = %grid.end(), "built 5-minute grid");
        grid
    }
}

/// Round to the nearest multiple of `step`, halves toward the later value
fn round_to(micros: i64, step: i64) -> i64 {
    (micros + step / 2).div_euclid(step) * step
}

/// Whole 5-minute steps between two instants, rounded to nearest
fn steps_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    match (to - from).num_microseconds() {
        Some(micros) => round_to(micros, SLOT_MICROS) / SLOT_MICROS,
        None => i64::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{slot_duration, Event};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 3, 1, 12, 0, 0).unwrap()
    }

    fn ranked(id: &str, t: DateTime<Utc>) -> RankedEvent {
        RankedEvent {
            event: Event::cbg(id, t, 6.0),
            upload_rank: 1,
        }
    }

    #[test]
    fn test_sleep_column_masks_daytime() {
        let start = Utc.with_ymd_and_hms(2019, 3, 1, 5, 50, 0).unwrap();
        let grid = Grid::spanning(start, start + Duration::minutes(15));
        let masked = grid.sleep_column(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(masked[..2].to_vec(), vec![1.0, 2.0]);
        assert!(masked[2].is_nan() && masked[3].is_nan());
    }

    #[test]
    fn test_round_fast() {
        let cases = [
            (Duration::seconds(0), 0),
            (Duration::seconds(149), 5),
            // Exact midpoint goes to the later slot
            (Duration::seconds(150), 5),
            (Duration::seconds(151), 5),
            (Duration::seconds(135), 5), // 2:15 rounds to 2:30 first
            (Duration::seconds(134), 0),
            (Duration::seconds(-1), 0),
        ];
        for (offset, minutes) in cases {
            assert_eq!(
                TimeGridAligner::round_fast(t0() + offset),
                t0() + Duration::minutes(minutes),
                "offset {offset}"
            );
        }
    }

    #[test]
    fn test_chunked_avoids_drift() {
        // A reading every 5 min + 1 s: independent rounding eventually skips
        // a slot, chunked rounding never does
        let events: Vec<RankedEvent> = (0..200)
            .map(|i| ranked(&format!("e{i:03}"), t0() + Duration::seconds(301 * i)))
            .collect();

        let chunked = TimeGridAligner::new(RoundingMode::Chunked).align(events.clone());
        for (i, event) in chunked.iter().enumerate() {
            assert_eq!(event.slot_time, t0() + Duration::minutes(5 * i as i64));
        }

        let fast = TimeGridAligner::new(RoundingMode::Fast).align(events);
        let collisions = fast
            .windows(2)
            .filter(|w| w[0].slot_time + slot_duration() != w[1].slot_time)
            .count();
        assert!(collisions > 0);
    }

    #[test]
    fn test_chunk_restarts_after_gap() {
        let events = vec![
            ranked("a", t0() + Duration::seconds(100)),
            ranked("b", t0() + Duration::seconds(400)),
            // 30-minute gap
            ranked("c", t0() + Duration::seconds(2200)),
        ];
        let aligned = TimeGridAligner::new(RoundingMode::Chunked).align(events);
        let slots: Vec<DateTime<Utc>> = aligned.iter().map(|a| a.slot_time).collect();
        assert_eq!(
            slots,
            vec![
                t0(),
                t0() + Duration::minutes(5),
                TimeGridAligner::round_fast(t0() + Duration::seconds(2200)),
            ]
        );
    }

    #[test]
    fn test_grid_bounds_and_index() {
        let a = ranked("a", t0() + Duration::seconds(40));
        let b = ranked("b", t0() + Duration::minutes(62));
        let bounds = GridBounds::from_events([&a, &b]).unwrap();
        let aligner = TimeGridAligner::new(RoundingMode::Fast);
        let aligned = aligner.align(vec![a, b]);
        let grid = aligner.build_grid(&bounds, &[aligned.as_slice()]);

        assert_eq!(grid.start, t0());
        assert_eq!(grid.len(), 13);
        assert_eq!(grid.index_of(t0() + Duration::minutes(60)), Some(12));
        assert_eq!(grid.index_of(t0() + Duration::minutes(61)), None);
        assert_eq!(grid.index_of(t0() + Duration::minutes(65)), None);
        assert!(grid.slots.iter().all(|s| s.cgm_mg_dl.is_none()));
    }

    #[test]
    fn test_empty_bounds() {
        let err = GridBounds::from_events(std::iter::empty()).unwrap_err();
        assert!(matches!(err, ComputeError::EmptyGrid(_)));
    }

    proptest! {
        #[test]
        fn prop_grid_is_contiguous(offsets in prop::collection::vec(0i64..200_000, 1..80), chunked in any::<bool>()) {
            let mode = if chunked { RoundingMode::Chunked } else { RoundingMode::Fast };
            let aligner = TimeGridAligner::new(mode);
            let events: Vec<RankedEvent> = offsets
                .iter()
                .enumerate()
                .map(|(i, s)| ranked(&format!("e{i:03}"), t0() + Duration::seconds(*s)))
                .collect();
            let bounds = GridBounds::from_events(events.iter()).unwrap();
            let aligned = aligner.align(events);
            let grid = aligner.build_grid(&bounds, &[aligned.as_slice()]);

            for pair in grid.slots.windows(2) {
                prop_assert_eq!(pair[1].slot_time - pair[0].slot_time, slot_duration());
            }
            let span = (grid.end() - grid.start).num_minutes();
            prop_assert_eq!(grid.len() as i64, span / SLOT_MINUTES + 1);
            for event in &aligned {
                prop_assert!(grid.index_of(event.slot_time).is_some());
            }
            if !chunked {
                let expected = (TimeGridAligner::round_fast(bounds.last)
                    - TimeGridAligner::round_fast(bounds.first))
                    .num_minutes()
                    / SLOT_MINUTES
                    + 1;
                prop_assert_eq!(grid.len() as i64, expected);
            }
        }

        #[test]
        fn prop_chunking_is_drift_free(
            early in prop::collection::vec(0i64..3_000, 0..20),
            gaps in prop::collection::vec(240i64..360, 1..40),
            jitter in 0i64..300,
        ) {
            let aligner = TimeGridAligner::new(RoundingMode::Chunked);
            // Later burst starts at least two hours after the earlier one ends
            let burst_start = t0() + Duration::hours(3) + Duration::seconds(jitter);
            let mut offset = 0;
            let burst: Vec<RankedEvent> = gaps
                .iter()
                .enumerate()
                .map(|(i, gap)| {
                    let event = ranked(&format!("late{i:03}"), burst_start + Duration::seconds(offset));
                    offset += gap;
                    event
                })
                .collect();
            let earlier: Vec<RankedEvent> = early
                .iter()
                .enumerate()
                .map(|(i, s)| ranked(&format!("early{i:03}"), t0() + Duration::seconds(*s)))
                .collect();

            let alone = aligner.align(burst.clone());
            let mut combined_input = earlier;
            combined_input.extend(burst);
            let combined: Vec<AlignedEvent> = aligner
                .align(combined_input)
                .into_iter()
                .filter(|a| a.ranked.event.id.starts_with("late"))
                .collect();

            prop_assert_eq!(alone, combined);
        }
    }
}
