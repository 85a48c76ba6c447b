//! Sustained glycemic episode detection
//!
//! Each threshold turns the CGM column into a boolean series. Runs of at least
//! three consecutive matching slots (15 minutes) are episodes, anchored at the
//! run's first slot with the run's total duration.

use crate::grid::Grid;
use crate::types::{Episode, SLOT_MINUTES};
use serde::Serialize;

/// Minimum run length (in slots) that counts as an episode
pub const MIN_EPISODE_SLOTS: usize = 3;

/// Clinical thresholds tracked for episodes (mg/dL)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EpisodeThreshold {
    Below54,
    Below70,
    Above140,
    Above180,
    Above250,
}

impl EpisodeThreshold {
    pub const ALL: [EpisodeThreshold; 5] = [
        EpisodeThreshold::Below54,
        EpisodeThreshold::Below70,
        EpisodeThreshold::Above140,
        EpisodeThreshold::Above180,
        EpisodeThreshold::Above250,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            EpisodeThreshold::Below54 => "below54",
            EpisodeThreshold::Below70 => "below70",
            EpisodeThreshold::Above140 => "above140",
            EpisodeThreshold::Above180 => "above180",
            EpisodeThreshold::Above250 => "above250",
        }
    }

    /// Strict comparison against the threshold
    pub fn matches(&self, mg_dl: f64) -> bool {
        match self {
            EpisodeThreshold::Below54 => mg_dl < 54.0,
            EpisodeThreshold::Below70 => mg_dl < 70.0,
            EpisodeThreshold::Above140 => mg_dl > 140.0,
            EpisodeThreshold::Above180 => mg_dl > 180.0,
            EpisodeThreshold::Above250 => mg_dl > 250.0,
        }
    }
}

/// Point-anchored episode column for one threshold
#[derive(Debug, Clone, PartialEq)]
pub struct EpisodeSeries {
    pub threshold: EpisodeThreshold,
    /// Episode duration at each run start, 0 elsewhere
    pub duration_minutes: Vec<u32>,
}

impl EpisodeSeries {
    pub fn is_start(&self, index: usize) -> bool {
        self.duration_minutes.get(index).is_some_and(|d| *d > 0)
    }

    pub fn count(&self) -> usize {
        self.duration_minutes.iter().filter(|d| **d > 0).count()
    }

    /// Materialize the episodes against grid slot times
    pub fn episodes(&self, grid: &Grid) -> Vec<Episode> {
        self.duration_minutes
            .iter()
            .zip(&grid.slots)
            .filter(|(d, _)| **d > 0)
            .map(|(d, slot)| Episode {
                threshold_name: self.threshold.label().to_string(),
                start_slot_time: slot.slot_time,
                duration_minutes: *d,
            })
            .collect()
    }
}

/// Run-length encode a boolean series into (start, length) runs of `true`
pub fn run_lengths(flags: &[bool]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start: Option<usize> = None;
    for (i, &flag) in flags.iter().enumerate() {
        match (flag, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push((s, i - s));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, flags.len() - s));
    }
    runs
}

/// Detector for threshold-crossing episodes
pub struct EpisodeDetector;

impl EpisodeDetector {
    /// Detect episodes for one threshold over a mg/dL column (`NaN` = missing).
    ///
    /// A missing value ends a run.
    pub fn detect(values: &[f64], threshold: EpisodeThreshold) -> EpisodeSeries {
        let flags: Vec<bool> = values
            .iter()
            .map(|v| !v.is_nan() && threshold.matches(*v))
            .collect();

        let mut duration_minutes = vec![0u32; values.len()];
        for (start, length) in run_lengths(&flags) {
            if length >= MIN_EPISODE_SLOTS {
                duration_minutes[start] = (length as i64 * SLOT_MINUTES) as u32;
            }
        }

        EpisodeSeries {
            threshold,
            duration_minutes,
        }
    }

    /// Detect episodes for every tracked threshold
    pub fn detect_all(values: &[f64]) -> Vec<EpisodeSeries> {
        EpisodeThreshold::ALL
            .iter()
            .map(|threshold| Self::detect(values, *threshold))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_lengths() {
        let flags = [true, true, false, true, false, false, true, true, true];
        assert_eq!(run_lengths(&flags), vec![(0, 2), (3, 1), (6, 3)]);
        assert!(run_lengths(&[]).is_empty());
    }

    #[test]
    fn test_run_of_two_is_not_an_episode() {
        let series = EpisodeDetector::detect(&[50.0, 50.0, 60.0, 60.0], EpisodeThreshold::Below54);
        assert_eq!(series.count(), 0);
    }

    #[test]
    fn test_run_of_three_is_one_episode() {
        let series = EpisodeDetector::detect(&[50.0, 50.0, 50.0, 60.0, 60.0], EpisodeThreshold::Below54);
        assert_eq!(series.count(), 1);
        assert!(series.is_start(0));
        assert_eq!(series.duration_minutes, vec![15, 0, 0, 0, 0]);
    }

    #[test]
    fn test_missing_value_breaks_run() {
        let values = [190.0, 200.0, f64::NAN, 210.0, 220.0, 230.0, 240.0];
        let series = EpisodeDetector::detect(&values, EpisodeThreshold::Above180);
        assert_eq!(series.duration_minutes, vec![0, 0, 0, 20, 0, 0, 0]);
    }

    #[test]
    fn test_episodes_carry_slot_times() {
        let start = Utc.with_ymd_and_hms(2019, 3, 1, 8, 0, 0).unwrap();
        let grid = Grid::spanning(start, start + Duration::minutes(30));
        let values = [100.0, 260.0, 270.0, 280.0, 290.0, 120.0, 100.0];
        let episodes = EpisodeDetector::detect(&values, EpisodeThreshold::Above250).episodes(&grid);
        assert_eq!(
            episodes,
            vec![Episode {
                threshold_name: "above250".to_string(),
                start_slot_time: start + Duration::minutes(5),
                duration_minutes: 20,
            }]
        );
    }

    #[test]
    fn test_thresholds_are_strict() {
        assert!(!EpisodeThreshold::Below70.matches(70.0));
        assert!(EpisodeThreshold::Below70.matches(69.0));
        assert!(!EpisodeThreshold::Above250.matches(250.0));
        assert_eq!(EpisodeDetector::detect_all(&[100.0]).len(), 5);
    }
}
