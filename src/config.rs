//! Run configuration
//!
//! Every invocation owns one immutable `PipelineConfig` that is threaded through
//! each stage. It can be loaded from JSON and overridden from the command line.

use crate::error::ComputeError;
use crate::types::{WindowSpec, SLOTS_PER_DAY, SLOT_MINUTES};
use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Default minimum fraction of non-null points per window
pub const DEFAULT_MIN_VALID_FRACTION: f64 = 0.7;

/// Default window labels
pub const DEFAULT_WINDOWS: [&str; 6] = ["24hr", "7day", "14day", "30day", "90day", "1year"];

/// Window preset expanding to 1day..30day
pub const CONTINUOUS_PRESET: &str = "continuous";

/// How timestamps are snapped to the 5-minute grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Independent per-point epsilon rounding (30 s, then 5 min)
    Fast,
    /// Gap-chunked rounding anchored on each chunk's first event
    Chunked,
}

/// How sparse basal rates are extended across the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasalFillStrategy {
    /// Carry each rate until the next explicit rate
    ForwardFill,
    /// Carry each rate for floor(duration / 5 min) slots
    DurationExact,
}

/// Output artifact kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    Rolling,
    Daily,
    Summary,
}

/// Selected output artifacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputModes {
    pub rolling: bool,
    pub daily: bool,
    pub summary: bool,
}

impl OutputModes {
    pub fn from_modes(modes: &[OutputMode]) -> Self {
        let mut out = Self::default();
        for mode in modes {
            match mode {
                OutputMode::Rolling => out.rolling = true,
                OutputMode::Daily => out.daily = true,
                OutputMode::Summary => out.summary = true,
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        !(self.rolling || self.daily || self.summary)
    }

    /// Whether only boundary rows are needed from the statistics engine
    pub fn boundary_rows_only(&self) -> bool {
        !self.rolling
    }
}

/// Pipeline configuration for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub rounding: RoundingMode,
    pub basal_fill: BasalFillStrategy,
    /// Ordered window labels (any subset/order)
    pub windows: Vec<String>,
    pub min_valid_fraction: f64,
    /// Diabetes-day boundary time of day
    #[serde(with = "day_start_format")]
    pub day_start: NaiveTime,
    /// Compute 10/25/50/75/90th percentiles, max and IQR
    pub percentiles: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            rounding: RoundingMode::Chunked,
            basal_fill: BasalFillStrategy::DurationExact,
            windows: DEFAULT_WINDOWS.iter().map(|w| w.to_string()).collect(),
            min_valid_fraction: DEFAULT_MIN_VALID_FRACTION,
            day_start: default_day_start(),
            percentiles: false,
        }
    }
}

impl PipelineConfig {
    /// Parse configuration from JSON; absent fields take defaults
    pub fn from_json(json: &str) -> Result<Self, ComputeError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ComputeError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Serialize configuration to JSON
    pub fn to_json(&self) -> Result<String, ComputeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check window labels and thresholds
    pub fn validate(&self) -> Result<(), ComputeError> {
        if !(0.0..=1.0).contains(&self.min_valid_fraction) {
            return Err(ComputeError::InvalidConfig(format!(
                "min_valid_fraction must be within [0, 1], got {}",
                self.min_valid_fraction
            )));
        }
        if self.day_start.second() != 0 || i64::from(self.day_start.minute()) % SLOT_MINUTES != 0 {
            return Err(ComputeError::InvalidConfig(format!(
                "day_start {} is not on the {SLOT_MINUTES}-minute grid",
                self.day_start.format("%H:%M:%S")
            )));
        }
        let specs = self.window_specs()?;
        if specs.is_empty() {
            return Err(ComputeError::InvalidConfig(
                "at least one rolling window is required".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve window labels into specs, in configured order
    pub fn window_specs(&self) -> Result<Vec<WindowSpec>, ComputeError> {
        WindowSpec::parse_list(&self.windows, self.min_valid_fraction)
    }
}

impl WindowSpec {
    /// Parse a label such as `30min`, `24hr`, `7day` or `1year`
    pub fn from_label(label: &str, min_valid_fraction: f64) -> Result<Self, ComputeError> {
        let trimmed = label.trim();
        let split = trimmed
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| invalid_label(trimmed))?;
        let (digits, unit) = trimmed.split_at(split);
        let amount: usize = digits.parse().map_err(|_| invalid_label(trimmed))?;
        if amount == 0 {
            return Err(invalid_label(trimmed));
        }

        let point_count = match unit {
            "min" => {
                if amount % SLOT_MINUTES as usize != 0 {
                    return Err(ComputeError::InvalidConfig(format!(
                        "window {trimmed} is not a whole number of {SLOT_MINUTES}-minute slots"
                    )));
                }
                amount / SLOT_MINUTES as usize
            }
            "hr" => amount * 60 / SLOT_MINUTES as usize,
            "day" => amount * SLOTS_PER_DAY,
            "year" => amount * 365 * SLOTS_PER_DAY,
            _ => return Err(invalid_label(trimmed)),
        };

        Ok(WindowSpec::new(trimmed, point_count, min_valid_fraction))
    }

    /// Parse an ordered label list, expanding the `continuous` preset
    pub fn parse_list(labels: &[String], min_valid_fraction: f64) -> Result<Vec<Self>, ComputeError> {
        let mut specs = Vec::new();
        for label in labels {
            if label == CONTINUOUS_PRESET {
                for day in 1..=30 {
                    specs.push(WindowSpec::from_label(&format!("{day}day"), min_valid_fraction)?);
                }
            } else {
                specs.push(WindowSpec::from_label(label, min_valid_fraction)?);
            }
        }
        Ok(specs)
    }
}

fn invalid_label(label: &str) -> ComputeError {
    ComputeError::InvalidConfig(format!(
        "unrecognized window label '{label}' (expected e.g. 30min, 24hr, 7day, 1year)"
    ))
}

fn default_day_start() -> NaiveTime {
    NaiveTime::from_hms_opt(5, 55, 0).unwrap_or_default()
}

/// Parse a day-start boundary given as `HH:MM` or `HH:MM:SS`
pub fn parse_day_start(raw: &str) -> Result<NaiveTime, ComputeError> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map_err(|e| ComputeError::InvalidConfig(format!("invalid day start '{raw}': {e}")))
}

mod day_start_format {
    use chrono::NaiveTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_day_start(&raw).map_err(serde::de::Error::custom)
    }
}
