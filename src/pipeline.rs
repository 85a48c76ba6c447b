//! Pipeline orchestration
//!
//! This module provides the per-user entry point. It runs one user's event
//! table through every stage and returns the annotated grid with its rolling
//! statistics, episodes and daily boundary rows.

use crate::basal::BasalFiller;
use crate::classifier::RecordClassifier;
use crate::cleaner::EventCleaner;
use crate::collapse::{CollapseReport, SlotCollapser};
use crate::config::{OutputModes, PipelineConfig};
use crate::daily::{DailySnapshot, DailySnapshotExtractor};
use crate::dedup::DuplicateResolver;
use crate::episodes::{EpisodeDetector, EpisodeSeries};
use crate::error::ComputeError;
use crate::grid::{Grid, GridBounds, TimeGridAligner};
use crate::iob::ExponentialInsulinModel;
use crate::rolling::{GlucoseStats, InsulinStats, RollingStatisticsEngine, SleepStats, WindowSeries};
use crate::schema::{EventTable, EventTableAdapter};
use crate::types::{DataClass, GridSlot};
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, warn};

/// Per-type record counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeCounts {
    pub cgm: usize,
    pub bolus: usize,
    pub basal: usize,
}

/// What each stage removed or merged for one user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingAudit {
    /// Records per type after classification
    pub records: TypeCounts,
    pub uploads: usize,
    /// Rows with a type the engine does not use
    pub ignored_rows: usize,
    pub invalid_cgm_removed: usize,
    pub negative_basal_removed: usize,
    pub duplicates_removed: TypeCounts,
    /// Records merged into an already occupied slot
    pub rounded_duplicates: CollapseReport,
    pub grid_slots: usize,
    pub basal_slots_filled: usize,
}

/// Everything computed for one user
#[derive(Debug, Clone)]
pub struct UserReport {
    pub user_id: String,
    pub class: DataClass,
    pub grid: Grid,
    pub cgm_stats: Vec<WindowSeries<GlucoseStats>>,
    /// Glucose statistics over sleep-hour slots only
    pub sleep_stats: Vec<WindowSeries<SleepStats>>,
    /// Windowed over normal plus extended units per slot
    pub bolus_stats: Vec<WindowSeries<InsulinStats>>,
    pub basal_stats: Vec<WindowSeries<InsulinStats>>,
    pub episodes: Vec<EpisodeSeries>,
    /// Active bolus units per grid slot (`NaN` when none); empty without pump data
    pub insulin_on_board: Vec<f64>,
    pub daily: Vec<DailySnapshot>,
    pub audit: ProcessingAudit,
}

impl UserReport {
    /// Most recent daily row, if the grid reaches a day boundary
    pub fn latest_snapshot(&self) -> Option<&DailySnapshot> {
        self.daily.last()
    }
}

/// Reusable per-user processor bound to one configuration.
///
/// Window specs are resolved once so the same processor can be shared by
/// every worker of a batch.
#[derive(Debug, Clone)]
pub struct UserPipeline {
    config: PipelineConfig,
    modes: OutputModes,
    engine: RollingStatisticsEngine,
}

impl UserPipeline {
    pub fn new(config: PipelineConfig, modes: OutputModes) -> Result<Self, ComputeError> {
        config.validate()?;
        let engine = RollingStatisticsEngine::from_config(&config)?;
        Ok(Self {
            config,
            modes,
            engine,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn modes(&self) -> OutputModes {
        self.modes
    }

    pub fn engine(&self) -> &RollingStatisticsEngine {
        &self.engine
    }

    /// Load one user's file and process it; the user id is the file stem
    pub fn process_file(&self, path: &Path) -> Result<UserReport, ComputeError> {
        let user_id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("unknown")
            .to_string();
        let table = EventTableAdapter::read_path(path)?;
        self.process(&user_id, table)
    }

    /// Run one user's event table through every stage.
    ///
    /// Pipeline stages:
    /// 1. RecordClassifier - Detect class and check the column contract
    /// 2. EventCleaner - Drop out-of-range records
    /// 3. DuplicateResolver - Remove copies from overlapping uploads
    /// 4. TimeGridAligner - Snap to the 5-minute grid and build the skeleton
    /// 5. SlotCollapser - Merge records sharing a slot
    /// 6. BasalFiller - Extend basal segments
    /// 7. EpisodeDetector - Find sustained excursions, all day and during sleep
    /// 8. RollingStatisticsEngine - Window statistics at the requested rows,
    ///    plus insulin on board for pump users
    /// 9. DailySnapshotExtractor - Day-boundary rows
    pub fn process(&self, user_id: &str, table: EventTable) -> Result<UserReport, ComputeError> {
        let mut audit = ProcessingAudit {
            ignored_rows: table.ignored_rows,
            ..Default::default()
        };

        // Stage 1: Classify and split by type
        let (class, split) = RecordClassifier::split(table)?;
        audit.records = TypeCounts {
            cgm: split.cgm.len(),
            bolus: split.bolus.len(),
            basal: split.basal.len(),
        };
        audit.uploads = split.uploads.len();
        info!(user = %user_id, class = %class, records = split.device_event_count(), "processing user");

        // Stage 2: Remove invalid records
        let (cgm, invalid_cgm) = EventCleaner::clean_cgm(split.cgm);
        let (basal, negative_basal) = EventCleaner::clean_basal(split.basal);
        audit.invalid_cgm_removed = invalid_cgm;
        audit.negative_basal_removed = negative_basal;

        // Stage 3: Resolve duplicates per type
        let resolver = DuplicateResolver::new(&split.uploads);
        let cgm = resolver.resolve(cgm);
        let bolus = resolver.resolve(split.bolus);
        let basal = resolver.resolve(basal);
        audit.duplicates_removed = TypeCounts {
            cgm: cgm.duplicates_removed,
            bolus: bolus.duplicates_removed,
            basal: basal.duplicates_removed,
        };

        // Stage 4: Align onto the shared grid
        let bounds = GridBounds::from_events(
            cgm.events
                .iter()
                .chain(bolus.events.iter())
                .chain(basal.events.iter()),
        )?;
        let aligner = TimeGridAligner::new(self.config.rounding);
        let cgm = aligner.align(cgm.events);
        let bolus = aligner.align(bolus.events);
        let basal = aligner.align(basal.events);
        let mut grid = aligner.build_grid(&bounds, &[cgm.as_slice(), bolus.as_slice(), basal.as_slice()]);
        audit.grid_slots = grid.len();

        // Stage 5: Collapse same-slot records
        audit.rounded_duplicates = CollapseReport {
            cgm: SlotCollapser::collapse_cgm(&mut grid, &cgm),
            bolus: SlotCollapser::collapse_bolus(&mut grid, &bolus),
            basal: SlotCollapser::collapse_basal(&mut grid, &basal),
        };

        // Stage 6: Fill basal gaps
        if class.has_pump() {
            audit.basal_slots_filled = BasalFiller::new(self.config.basal_fill).fill(&mut grid);
        }

        // Stage 9 runs early: its rows decide which statistics rows are needed
        let extractor = DailySnapshotExtractor::new(self.config.day_start);
        let daily = extractor.extract(&grid);
        let rows = self.requested_rows(&grid, &daily);
        if rows.is_empty() {
            warn!(user = %user_id, slots = grid.len(), "grid reaches no day boundary; no rows to report");
        }

        // Stages 7-8: Episodes and rolling statistics
        let mut episodes = Vec::new();
        let mut cgm_stats = Vec::new();
        let mut sleep_stats = Vec::new();
        if class.has_cgm() {
            let values = grid.column(|s| s.cgm_mg_dl.map(f64::from));
            episodes = EpisodeDetector::detect_all(&values);
            cgm_stats = self.engine.compute_glucose(&values, &episodes, &rows);

            let sleep = grid.sleep_column(&values);
            let sleep_episodes = EpisodeDetector::detect_all(&sleep);
            sleep_stats = self.engine.compute_sleep(&sleep, &sleep_episodes, &rows);
        }

        let mut bolus_stats = Vec::new();
        let mut basal_stats = Vec::new();
        let mut insulin_on_board = Vec::new();
        if class.has_pump() {
            let bolus = grid.column(GridSlot::bolus_total);
            insulin_on_board = ExponentialInsulinModel::default().on_board(&bolus);
            bolus_stats = self.engine.compute_insulin(&bolus, &rows);
            basal_stats = self
                .engine
                .compute_insulin(&grid.column(|s| s.basal_rate), &rows);
        }

        debug!(user = %user_id, audit = ?audit, "pipeline audit");
        info!(
            user = %user_id,
            slots = grid.len(),
            days = daily.len(),
            windows = self.engine.windows().len(),
            "user processed"
        );

        Ok(UserReport {
            user_id: user_id.to_string(),
            class,
            grid,
            cgm_stats,
            sleep_stats,
            bolus_stats,
            basal_stats,
            episodes,
            insulin_on_board,
            daily,
            audit,
        })
    }

    /// Grid indices the statistics engine must emit for the selected outputs
    fn requested_rows(&self, grid: &Grid, daily: &[DailySnapshot]) -> Vec<usize> {
        if !self.modes.boundary_rows_only() {
            return (0..grid.len()).collect();
        }
        if self.modes.daily {
            return daily.iter().map(|d| d.slot_index).collect();
        }
        daily.last().map(|d| vec![d.slot_index]).unwrap_or_default()
    }
}

/// Process one user's event table with a one-off configuration
pub fn process_user(
    user_id: &str,
    table: EventTable,
    config: &PipelineConfig,
    modes: OutputModes,
) -> Result<UserReport, ComputeError> {
    UserPipeline::new(config.clone(), modes)?.process(user_id, table)
}
