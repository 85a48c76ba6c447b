//! Diabetes-day snapshots
//!
//! Projects the grid to one row per day: the slot at the day-start boundary,
//! holding the rolling statistics of the window that ends there. The row is
//! labelled with the day the preceding window covers.

use crate::grid::Grid;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Timelike, Utc};
use serde::Serialize;

/// One boundary slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySnapshot {
    /// Diabetes day the row summarizes
    pub day: NaiveDate,
    pub slot_index: usize,
    pub slot_time: DateTime<Utc>,
}

/// Extractor for boundary-slot rows
#[derive(Debug, Clone, Copy)]
pub struct DailySnapshotExtractor {
    boundary: NaiveTime,
}

impl DailySnapshotExtractor {
    pub fn new(boundary: NaiveTime) -> Self {
        Self { boundary }
    }

    /// Shift applied to the label: the boundary rounded up to whole hours
    pub fn label_shift(&self) -> Duration {
        let seconds = i64::from(self.boundary.num_seconds_from_midnight());
        let hours = (seconds + 3599) / 3600;
        Duration::hours(hours)
    }

    /// Boundary slots in grid order, one per day
    pub fn extract(&self, grid: &Grid) -> Vec<DailySnapshot> {
        let shift = self.label_shift();
        grid.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.slot_time.time() == self.boundary)
            .map(|(slot_index, slot)| DailySnapshot {
                day: (slot.slot_time - shift).date_naive(),
                slot_index,
                slot_time: slot.slot_time,
            })
            .collect()
    }

    /// Most recent boundary slot, used for summary rows
    pub fn latest(&self, grid: &Grid) -> Option<DailySnapshot> {
        self.extract(grid).pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn three_day_grid() -> Grid {
        let start = Utc.with_ymd_and_hms(2019, 3, 1, 0, 0, 0).unwrap();
        Grid::spanning(start, start + Duration::days(3) - Duration::minutes(5))
    }

    #[test]
    fn test_default_boundary_labels_previous_day() {
        let extractor = DailySnapshotExtractor::new(NaiveTime::from_hms_opt(5, 55, 0).unwrap());
        assert_eq!(extractor.label_shift(), Duration::hours(6));

        let grid = three_day_grid();
        let days = extractor.extract(&grid);
        assert_eq!(days.len(), 3);
        assert_eq!(days[0].day, NaiveDate::from_ymd_opt(2019, 2, 28).unwrap());
        assert_eq!(days[0].slot_index, 71);
        assert_eq!(
            days[2].slot_time,
            Utc.with_ymd_and_hms(2019, 3, 3, 5, 55, 0).unwrap()
        );
        assert_eq!(days[2].day, NaiveDate::from_ymd_opt(2019, 3, 2).unwrap());
    }

    #[test]
    fn test_midnight_boundary_keeps_day() {
        let extractor = DailySnapshotExtractor::new(NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        assert_eq!(extractor.label_shift(), Duration::zero());
        let days = extractor.extract(&three_day_grid());
        assert_eq!(days[0].day, NaiveDate::from_ymd_opt(2019, 3, 1).unwrap());
        assert_eq!(extractor.latest(&three_day_grid()).unwrap().slot_index, 576);
    }

    #[test]
    fn test_no_boundary_in_short_grid() {
        let extractor = DailySnapshotExtractor::new(NaiveTime::from_hms_opt(5, 55, 0).unwrap());
        let start = Utc.with_ymd_and_hms(2019, 3, 1, 8, 0, 0).unwrap();
        let grid = Grid::spanning(start, start + Duration::hours(2));
        assert!(extractor.extract(&grid).is_empty());
        assert!(extractor.latest(&grid).is_none());
    }
}
