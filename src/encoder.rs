//! Output encoding
//!
//! This module writes a processed user as CSV: the full rolling grid, one row
//! per diabetes day, or a single summary row for the shared multi-user file.
//! Undefined statistics (`NaN`, `None`) are written as empty cells.

use crate::config::PipelineConfig;
use crate::episodes::EpisodeThreshold;
use crate::error::ComputeError;
use crate::pipeline::UserReport;
use crate::rolling::{
    EpisodeRollup, GlucoseStats, InsulinStats, SleepStats, WindowSeries, AUC_BANDS, GLYCEMIC_BANDS, PERCENTILE_LEVELS,
};
use crate::types::WindowSpec;
use crate::{GLYCO_VERSION, PRODUCER_NAME};
use csv::StringRecord;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Shared multi-user summary file name
pub const SUMMARY_FILE_NAME: &str = "summary_rolling_stats.csv";

pub fn rolling_file_name(user_id: &str) -> String {
    format!("rolling_stats_{user_id}.csv")
}

pub fn daily_file_name(user_id: &str) -> String {
    format!("daily_rolling_stats_{user_id}.csv")
}

/// Which statistic groups a file carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatGroups {
    pub glucose: bool,
    pub insulin: bool,
}

impl StatGroups {
    pub const ALL: StatGroups = StatGroups {
        glucose: true,
        insulin: true,
    };

    /// Groups present in one user's report
    pub fn of(report: &UserReport) -> Self {
        Self {
            glucose: report.class.has_cgm(),
            insulin: report.class.has_pump(),
        }
    }
}

/// CSV encoder for user reports
pub struct RowEncoder {
    run_id: String,
    windows: Vec<WindowSpec>,
    percentiles: bool,
}

impl RowEncoder {
    /// Create an encoder with a fresh run ID
    pub fn new(config: &PipelineConfig) -> Result<Self, ComputeError> {
        Self::with_run_id(config, Uuid::new_v4().to_string())
    }

    /// Create an encoder with a specific run ID
    pub fn with_run_id(config: &PipelineConfig, run_id: String) -> Result<Self, ComputeError> {
        Ok(Self {
            run_id,
            windows: config.window_specs()?,
            percentiles: config.percentiles,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Write the full grid with every derived column
    pub fn write_rolling<W: Write>(&self, report: &UserReport, writer: W) -> Result<(), ComputeError> {
        let groups = StatGroups::of(report);
        let mut wtr = csv::Writer::from_writer(writer);

        let mut header = vec!["slot_time".to_string()];
        if groups.glucose {
            header.push("cgm_mg_dl".to_string());
        }
        if groups.insulin {
            header.extend(
                [
                    "bolus_normal",
                    "bolus_extended",
                    "basal_rate",
                    "basal_duration_ms",
                    "insulin_on_board",
                ]
                .map(str::to_string),
            );
        }
        if groups.glucose {
            for threshold in EpisodeThreshold::ALL {
                header.push(format!("{}_episode_minutes", threshold.label()));
            }
        }
        header.extend(self.window_header(groups));
        wtr.write_record(&header)?;

        for (index, slot) in report.grid.slots.iter().enumerate() {
            let mut record = vec![slot.slot_time.to_rfc3339()];
            if groups.glucose {
                record.push(opt_cell(slot.cgm_mg_dl));
            }
            if groups.insulin {
                record.push(opt_cell(slot.bolus_normal));
                record.push(opt_cell(slot.bolus_extended));
                record.push(opt_cell(slot.basal_rate));
                record.push(opt_cell(slot.basal_duration_ms));
                record.push(num_cell(
                    report.insulin_on_board.get(index).copied().unwrap_or(f64::NAN),
                ));
            }
            if groups.glucose {
                for series in &report.episodes {
                    let minutes = series.duration_minutes.get(index).copied().unwrap_or(0);
                    record.push(minutes.to_string());
                }
            }
            record.extend(self.window_values(report, groups, index));
            wtr.write_record(&record)?;
        }

        wtr.flush()?;
        Ok(())
    }

    /// Write one row per diabetes day
    pub fn write_daily<W: Write>(&self, report: &UserReport, writer: W) -> Result<(), ComputeError> {
        let groups = StatGroups::of(report);
        let mut wtr = csv::Writer::from_writer(writer);

        let mut header = vec!["day".to_string(), "slot_time".to_string()];
        header.extend(self.window_header(groups));
        wtr.write_record(&header)?;

        for snapshot in &report.daily {
            let mut record = vec![snapshot.day.to_string(), snapshot.slot_time.to_rfc3339()];
            record.extend(self.window_values(report, groups, snapshot.slot_index));
            wtr.write_record(&record)?;
        }

        wtr.flush()?;
        Ok(())
    }

    /// Header of the shared summary file
    pub fn summary_header(&self) -> StringRecord {
        let mut header: Vec<String> = [
            "run_id",
            "producer",
            "producer_version",
            "user_id",
            "class",
            "day",
            "slot_time",
        ]
        .map(str::to_string)
        .to_vec();
        header.extend(self.window_header(StatGroups::ALL));
        StringRecord::from(header)
    }

    /// Summary row from the most recent daily snapshot, if any
    pub fn summary_record(&self, report: &UserReport) -> Option<StringRecord> {
        let snapshot = report.latest_snapshot()?;
        let mut record = vec![
            self.run_id.clone(),
            PRODUCER_NAME.to_string(),
            GLYCO_VERSION.to_string(),
            report.user_id.clone(),
            report.class.to_string(),
            snapshot.day.to_string(),
            snapshot.slot_time.to_rfc3339(),
        ];
        record.extend(self.window_values(report, StatGroups::ALL, snapshot.slot_index));
        Some(StringRecord::from(record))
    }

    /// Append summary rows, writing the header only when the file is new.
    ///
    /// An existing file with a different header is rejected.
    pub fn append_summary(&self, path: &Path, records: &[StringRecord]) -> Result<(), ComputeError> {
        let header = self.summary_header();
        let exists = path.exists() && fs::metadata(path)?.len() > 0;

        if exists {
            let mut rdr = csv::Reader::from_path(path)?;
            if rdr.headers()? != &header {
                return Err(ComputeError::InvalidConfig(format!(
                    "{} has different columns; use a new output directory or matching windows",
                    path.display()
                )));
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if !exists {
            wtr.write_record(&header)?;
        }
        for record in records {
            wtr.write_record(record)?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Write the per-user files selected by `rolling`/`daily` into `dir`
    pub fn write_user_files(
        &self,
        report: &UserReport,
        dir: &Path,
        rolling: bool,
        daily: bool,
    ) -> Result<Vec<PathBuf>, ComputeError> {
        fs::create_dir_all(dir)?;
        let mut written = Vec::new();
        if rolling {
            let path = dir.join(rolling_file_name(&report.user_id));
            self.write_rolling(report, fs::File::create(&path)?)?;
            written.push(path);
        }
        if daily {
            let path = dir.join(daily_file_name(&report.user_id));
            self.write_daily(report, fs::File::create(&path)?)?;
            written.push(path);
        }
        Ok(written)
    }

    fn window_header(&self, groups: StatGroups) -> Vec<String> {
        let mut header = Vec::new();
        for spec in &self.windows {
            let w = &spec.label;
            if groups.glucose {
                for metric in self.glucose_metrics() {
                    header.push(format!("{w}_{metric}"));
                }
                for metric in sleep_metrics() {
                    header.push(format!("{w}_sleep_{metric}"));
                }
            }
            if groups.insulin {
                for column in ["bolus", "basal"] {
                    for metric in self.insulin_metrics() {
                        header.push(format!("{w}_{column}_{metric}"));
                    }
                }
            }
        }
        header
    }

    fn window_values(&self, report: &UserReport, groups: StatGroups, index: usize) -> Vec<String> {
        let mut values = Vec::new();
        for (w, _) in self.windows.iter().enumerate() {
            if groups.glucose {
                match stats_at(&report.cgm_stats, w, index) {
                    Some(stats) => values.extend(self.glucose_values(stats)),
                    None => values.extend(blank(self.glucose_metrics().len())),
                }
                match stats_at(&report.sleep_stats, w, index) {
                    Some(stats) => values.extend(sleep_values(stats)),
                    None => values.extend(blank(sleep_metrics().len())),
                }
            }
            if groups.insulin {
                for series in [&report.bolus_stats, &report.basal_stats] {
                    match stats_at(series, w, index) {
                        Some(stats) => values.extend(self.insulin_values(stats)),
                        None => values.extend(blank(self.insulin_metrics().len())),
                    }
                }
            }
        }
        values
    }

    fn glucose_metrics(&self) -> Vec<String> {
        let mut metrics: Vec<String> = ["cgm_count", "fraction_data_available", "mean", "gmi", "sd", "cv", "min"]
            .map(str::to_string)
            .to_vec();
        if self.percentiles {
            metrics.push("max".to_string());
            metrics.extend(PERCENTILE_LEVELS.map(|p| format!("{p}percentile")));
            metrics.push("iqr".to_string());
        }
        metrics.push("lbgi".to_string());
        metrics.push("hbgi".to_string());
        metrics.extend(GLYCEMIC_BANDS.iter().map(|band| format!("percent_{}", band.label())));
        metrics.extend(episode_metrics());
        metrics.extend(AUC_BANDS.iter().map(|band| format!("auc_per_day_{}", band.label())));
        metrics
    }

    fn glucose_values(&self, stats: &GlucoseStats) -> Vec<String> {
        let mut values = vec![
            opt_cell(stats.count),
            num_cell(stats.fraction_data_available),
            num_cell(stats.mean),
            num_cell(stats.gmi),
            num_cell(stats.std),
            num_cell(stats.cv),
            num_cell(stats.min),
        ];
        if self.percentiles {
            values.push(num_cell(stats.max));
            values.extend(stats.percentiles.map(num_cell));
            values.push(num_cell(stats.iqr));
        }
        values.push(num_cell(stats.lbgi));
        values.push(num_cell(stats.hbgi));
        values.extend(stats.bands.map(num_cell));
        values.extend(episode_values(&stats.episodes));
        values.extend(stats.auc_per_day.map(num_cell));
        values
    }

    fn insulin_metrics(&self) -> Vec<String> {
        let mut metrics: Vec<String> = ["count", "total", "mean", "sd", "cv", "min"].map(str::to_string).to_vec();
        if self.percentiles {
            metrics.push("max".to_string());
            metrics.extend(PERCENTILE_LEVELS.map(|p| format!("{p}percentile")));
        }
        metrics
    }

    fn insulin_values(&self, stats: &InsulinStats) -> Vec<String> {
        let mut values = vec![
            opt_cell(stats.count),
            num_cell(stats.total),
            num_cell(stats.mean),
            num_cell(stats.std),
            num_cell(stats.cv),
            num_cell(stats.min),
        ];
        if self.percentiles {
            values.push(num_cell(stats.max));
            values.extend(stats.percentiles.map(num_cell));
        }
        values
    }
}

fn sleep_metrics() -> Vec<String> {
    let mut metrics: Vec<String> = ["cgm_count", "fraction_data_available", "mean", "sd", "cv", "lbgi", "hbgi"]
        .map(str::to_string)
        .to_vec();
    metrics.extend(GLYCEMIC_BANDS.iter().map(|band| format!("percent_{}", band.label())));
    metrics.extend(episode_metrics());
    metrics
}

fn sleep_values(stats: &SleepStats) -> Vec<String> {
    let mut values = vec![
        opt_cell(stats.count),
        num_cell(stats.fraction_data_available),
        num_cell(stats.mean),
        num_cell(stats.std),
        num_cell(stats.cv),
        num_cell(stats.lbgi),
        num_cell(stats.hbgi),
    ];
    values.extend(stats.bands.map(num_cell));
    values.extend(episode_values(&stats.episodes));
    values
}

fn episode_metrics() -> Vec<String> {
    EpisodeThreshold::ALL
        .iter()
        .flat_map(|t| {
            [
                format!("{}_episode_count", t.label()),
                format!("{}_episode_avg_minutes", t.label()),
            ]
        })
        .collect()
}

fn episode_values(rollups: &[EpisodeRollup]) -> Vec<String> {
    rollups
        .iter()
        .flat_map(|r| [num_cell(r.count), num_cell(r.avg_duration_minutes)])
        .collect()
}

fn stats_at<T>(series: &[WindowSeries<T>], window: usize, index: usize) -> Option<&T> {
    series.get(window).and_then(|s| s.at(index))
}

fn blank(n: usize) -> impl Iterator<Item = String> {
    std::iter::repeat_with(String::new).take(n)
}

fn num_cell(value: f64) -> String {
    if value.is_finite() {
        value.to_string()
    } else {
        String::new()
    }
}

fn opt_cell<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputModes;
    use crate::pipeline::process_user;
    use crate::schema::EventTable;
    use crate::types::Event;
    use chrono::{Duration, TimeZone, Utc};

    fn config() -> PipelineConfig {
        PipelineConfig {
            windows: vec!["1hr".to_string(), "24hr".to_string()],
            min_valid_fraction: 0.5,
            ..Default::default()
        }
    }

    fn report() -> UserReport {
        let t0 = Utc.with_ymd_and_hms(2019, 3, 1, 0, 0, 0).unwrap();
        let events = (0..(2 * 288))
            .map(|i| Event::cbg(format!("c{i:04}"), t0 + Duration::minutes(5 * i), 6.0 + (i % 7) as f64))
            .collect();
        let table = EventTable {
            columns: ["type", "time", "uploadId", "value"].map(str::to_string).to_vec(),
            events,
            ignored_rows: 0,
        };
        let modes = OutputModes {
            rolling: true,
            daily: true,
            summary: true,
        };
        process_user("user-7", table, &config(), modes).unwrap()
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("glyco-encoder-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_rolling_csv_shape() {
        let encoder = RowEncoder::with_run_id(&config(), "run-1".to_string()).unwrap();
        let report = report();
        let mut buf = Vec::new();
        encoder.write_rolling(&report, &mut buf).unwrap();

        let mut rdr = csv::Reader::from_reader(buf.as_slice());
        let header = rdr.headers().unwrap().clone();
        assert_eq!(&header[0], "slot_time");
        assert_eq!(&header[1], "cgm_mg_dl");
        assert!(header.iter().any(|h| h == "24hr_percent_70_180"));
        assert!(header.iter().any(|h| h == "1hr_below54_episode_count"));
        assert!(header.iter().any(|h| h == "24hr_auc_per_day_70_180"));
        assert!(header.iter().any(|h| h == "24hr_sleep_percent_below_70"));
        assert!(header.iter().any(|h| h == "1hr_sleep_above250_episode_avg_minutes"));
        assert!(!header.iter().any(|h| h.contains("bolus")));
        assert!(!header.iter().any(|h| h.contains("percentile")));

        let rows: Vec<StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), report.grid.len());

        // The 24hr window needs 144 points; early rows are blank
        let count_col = header.iter().position(|h| h == "24hr_cgm_count").unwrap();
        assert_eq!(&rows[10][count_col], "");
        assert_eq!(&rows[300][count_col], "288");
        let fraction_col = header
            .iter()
            .position(|h| h == "24hr_fraction_data_available")
            .unwrap();
        assert_eq!(&rows[300][fraction_col], "1");
        assert_eq!(rows[10].len(), header.len());

        // Row 300 is 01:00 on the second day: 72 sleep slots in the last 24 h
        let sleep_col = header.iter().position(|h| h == "24hr_sleep_cgm_count").unwrap();
        assert_eq!(&rows[300][sleep_col], "72");
    }

    #[test]
    fn test_daily_csv_rows() {
        let encoder = RowEncoder::with_run_id(&config(), "run-1".to_string()).unwrap();
        let report = report();
        let mut buf = Vec::new();
        encoder.write_daily(&report, &mut buf).unwrap();

        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1 + report.daily.len());
        assert!(lines[1].starts_with("2019-02-28,2019-03-01T05:55:00+00:00"));
    }

    #[test]
    fn test_summary_append_writes_header_once() {
        let dir = temp_dir();
        let path = dir.join(SUMMARY_FILE_NAME);
        let encoder = RowEncoder::with_run_id(&config(), "run-42".to_string()).unwrap();
        let record = encoder.summary_record(&report()).unwrap();

        encoder.append_summary(&path, &[record.clone()]).unwrap();
        encoder.append_summary(&path, &[record]).unwrap();

        let mut rdr = csv::Reader::from_path(&path).unwrap();
        assert_eq!(rdr.headers().unwrap(), &encoder.summary_header());
        let rows: Vec<StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], "run-42");
        assert_eq!(&rows[0][3], "user-7");
        assert_eq!(&rows[0][4], "CGM");
        assert_eq!(&rows[0][5], "2019-03-01");
        // Insulin columns exist but are empty for a CGM-only user
        let bolus_col = encoder
            .summary_header()
            .iter()
            .position(|h| h == "24hr_bolus_count")
            .unwrap();
        assert_eq!(&rows[0][bolus_col], "");
        assert!(encoder.summary_header().iter().any(|h| h == "24hr_bolus_cv"));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_summary_rejects_mismatched_header() {
        let dir = temp_dir();
        let path = dir.join(SUMMARY_FILE_NAME);
        fs::write(&path, "a,b,c\n1,2,3\n").unwrap();
        let encoder = RowEncoder::with_run_id(&config(), "run-1".to_string()).unwrap();
        let err = encoder.append_summary(&path, &[]).unwrap_err();
        assert!(matches!(err, ComputeError::InvalidConfig(_)));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_cells() {
        assert_eq!(num_cell(f64::NAN), "");
        assert_eq!(num_cell(1.5), "1.5");
        assert_eq!(opt_cell::<usize>(None), "");
        assert_eq!(opt_cell(Some(3)), "3");
    }
}
