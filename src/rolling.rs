//! Rolling window statistics
//!
//! For every configured window the engine slides over one grid column and
//! reports statistics for the window ending at each requested slot. Windows
//! holding fewer non-null points than their minimum report undefined values
//! (`NaN`, or `None` for counts) instead of failing.
//!
//! The window state is maintained incrementally: shifted running sums for the
//! moments, monotonic deques for min/max and an ordered multiset for
//! percentiles, so each window costs one pass over the column.
//!
//! Besides the full-day battery, each window reports area under the curve per
//! day for a set of glucose bands and a reduced battery over sleep-hour slots.

use crate::config::PipelineConfig;
use crate::episodes::{EpisodeSeries, EpisodeThreshold};
use crate::error::ComputeError;
use crate::types::{WindowSpec, SLEEP_SLOTS_PER_DAY, SLOTS_PER_DAY, SLOT_MINUTES};
use ordered_float::OrderedFloat;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

/// Percentile levels reported when percentiles are enabled
pub const PERCENTILE_LEVELS: [u8; 5] = [10, 25, 50, 75, 90];

/// Glucose threshold band (mg/dL)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GlycemicBand {
    /// Strictly below the threshold
    Below(u16),
    /// Strictly above the threshold
    Above(u16),
    /// Between two thresholds, both inclusive
    Between(u16, u16),
}

/// Bands reported per window, in column order
pub const GLYCEMIC_BANDS: [GlycemicBand; 15] = [
    GlycemicBand::Below(54),
    GlycemicBand::Below(70),
    GlycemicBand::Below(140),
    GlycemicBand::Below(180),
    GlycemicBand::Below(250),
    GlycemicBand::Above(54),
    GlycemicBand::Above(70),
    GlycemicBand::Above(140),
    GlycemicBand::Above(180),
    GlycemicBand::Above(250),
    GlycemicBand::Between(54, 70),
    GlycemicBand::Between(70, 140),
    GlycemicBand::Between(70, 180),
    GlycemicBand::Between(140, 180),
    GlycemicBand::Between(180, 250),
];

impl GlycemicBand {
    /// Column suffix, e.g. `below_54` or `70_180`
    pub fn label(&self) -> String {
        match self {
            GlycemicBand::Below(t) => format!("below_{t}"),
            GlycemicBand::Above(t) => format!("above_{t}"),
            GlycemicBand::Between(lo, hi) => format!("{lo}_{hi}"),
        }
    }

    pub fn contains(&self, mg_dl: f64) -> bool {
        match *self {
            GlycemicBand::Below(t) => mg_dl < f64::from(t),
            GlycemicBand::Above(t) => mg_dl > f64::from(t),
            GlycemicBand::Between(lo, hi) => (f64::from(lo)..=f64::from(hi)).contains(&mg_dl),
        }
    }

    /// Curve height integrated for this band's area.
    ///
    /// Below a threshold the reading itself counts; above a threshold or
    /// inside a range, only the excess over the lower bound. Readings outside
    /// the band and missing readings count as zero.
    pub fn area_height(&self, mg_dl: f64) -> f64 {
        if mg_dl.is_nan() || !self.contains(mg_dl) {
            return 0.0;
        }
        match *self {
            GlycemicBand::Below(_) => mg_dl,
            GlycemicBand::Above(t) => mg_dl - f64::from(t),
            GlycemicBand::Between(lo, _) => mg_dl - f64::from(lo),
        }
    }
}

/// Bands with an area-under-the-curve column, in column order
pub const AUC_BANDS: [GlycemicBand; 6] = [
    GlycemicBand::Below(54),
    GlycemicBand::Below(70),
    GlycemicBand::Between(70, 140),
    GlycemicBand::Between(70, 180),
    GlycemicBand::Above(180),
    GlycemicBand::Above(250),
];

/// Episode rollup for one threshold within one window
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpisodeRollup {
    pub count: f64,
    /// Total episode minutes divided by episode count (`NaN` without episodes)
    pub avg_duration_minutes: f64,
}

impl EpisodeRollup {
    const UNDEFINED: EpisodeRollup = EpisodeRollup {
        count: f64::NAN,
        avg_duration_minutes: f64::NAN,
    };
}

/// Glucose statistics for one window ending at one slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlucoseStats {
    /// Non-null points, `None` when the window is below its minimum
    pub count: Option<usize>,
    /// Non-null points as a fraction (0-1) of the window width, on the same
    /// scale as `WindowSpec::min_valid_fraction`; always defined
    pub fraction_data_available: f64,
    pub mean: f64,
    /// Glucose management indicator (estimated A1c)
    pub gmi: f64,
    pub std: f64,
    pub cv: f64,
    pub min: f64,
    /// Only computed with percentiles enabled
    pub max: f64,
    /// Values at `PERCENTILE_LEVELS`, only computed with percentiles enabled
    pub percentiles: [f64; 5],
    pub iqr: f64,
    pub lbgi: f64,
    pub hbgi: f64,
    /// Percentages (0-100) for each of `GLYCEMIC_BANDS`
    pub bands: [f64; 15],
    /// Rollups in `EpisodeThreshold::ALL` order
    pub episodes: [EpisodeRollup; 5],
    /// Trapezoidal area (mg/dL x minutes) for each of `AUC_BANDS`, divided by
    /// the window width in days
    pub auc_per_day: [f64; 6],
}

impl GlucoseStats {
    fn undefined(fraction_data_available: f64) -> Self {
        Self {
            count: None,
            fraction_data_available,
            mean: f64::NAN,
            gmi: f64::NAN,
            std: f64::NAN,
            cv: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            percentiles: [f64::NAN; 5],
            iqr: f64::NAN,
            lbgi: f64::NAN,
            hbgi: f64::NAN,
            bands: [f64::NAN; 15],
            episodes: [EpisodeRollup::UNDEFINED; 5],
            auc_per_day: [f64::NAN; 6],
        }
    }

    pub fn band(&self, band: GlycemicBand) -> f64 {
        band_value(&self.bands, band)
    }

    pub fn episode(&self, threshold: EpisodeThreshold) -> EpisodeRollup {
        episode_value(&self.episodes, threshold)
    }

    /// Area per day for one of `AUC_BANDS`
    pub fn auc(&self, band: GlycemicBand) -> f64 {
        AUC_BANDS
            .iter()
            .position(|b| *b == band)
            .map(|i| self.auc_per_day[i])
            .unwrap_or(f64::NAN)
    }
}

/// Glucose statistics restricted to sleep-hour slots (before 06:00)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SleepStats {
    /// Non-null sleep points, `None` when too few sleep hours are covered
    pub count: Option<usize>,
    /// Non-null sleep points over the nominal sleep slots of the window
    /// (a quarter of its width). Windows shorter than a day can exceed 1.
    pub fraction_data_available: f64,
    pub mean: f64,
    pub std: f64,
    pub cv: f64,
    pub lbgi: f64,
    pub hbgi: f64,
    /// Percentages (0-100) for each of `GLYCEMIC_BANDS`
    pub bands: [f64; 15],
    /// Rollups of episodes detected on the sleep-only series
    pub episodes: [EpisodeRollup; 5],
}

impl SleepStats {
    fn undefined(fraction_data_available: f64) -> Self {
        Self {
            count: None,
            fraction_data_available,
            mean: f64::NAN,
            std: f64::NAN,
            cv: f64::NAN,
            lbgi: f64::NAN,
            hbgi: f64::NAN,
            bands: [f64::NAN; 15],
            episodes: [EpisodeRollup::UNDEFINED; 5],
        }
    }

    pub fn band(&self, band: GlycemicBand) -> f64 {
        band_value(&self.bands, band)
    }

    pub fn episode(&self, threshold: EpisodeThreshold) -> EpisodeRollup {
        episode_value(&self.episodes, threshold)
    }
}

fn band_value(bands: &[f64; 15], band: GlycemicBand) -> f64 {
    GLYCEMIC_BANDS
        .iter()
        .position(|b| *b == band)
        .map(|i| bands[i])
        .unwrap_or(f64::NAN)
}

fn episode_value(episodes: &[EpisodeRollup; 5], threshold: EpisodeThreshold) -> EpisodeRollup {
    EpisodeThreshold::ALL
        .iter()
        .position(|t| *t == threshold)
        .map(|i| episodes[i])
        .unwrap_or(EpisodeRollup::UNDEFINED)
}

/// Insulin statistics for one window ending at one slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InsulinStats {
    pub count: Option<usize>,
    pub total: f64,
    pub mean: f64,
    pub std: f64,
    /// `std / mean`, `NaN` for a single dose or a zero mean
    pub cv: f64,
    pub min: f64,
    pub max: f64,
    pub percentiles: [f64; 5],
}

impl InsulinStats {
    fn undefined() -> Self {
        Self {
            count: None,
            total: f64::NAN,
            mean: f64::NAN,
            std: f64::NAN,
            cv: f64::NAN,
            min: f64::NAN,
            max: f64::NAN,
            percentiles: [f64::NAN; 5],
        }
    }
}

/// Statistics for one slot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowRow<T> {
    /// Grid index of the slot the window ends at
    pub index: usize,
    pub stats: T,
}

/// All emitted rows for one window
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSeries<T> {
    pub spec: WindowSpec,
    pub rows: Vec<WindowRow<T>>,
}

impl<T> WindowSeries<T> {
    /// Row ending at a grid index, if it was emitted
    pub fn at(&self, index: usize) -> Option<&T> {
        self.rows
            .binary_search_by_key(&index, |row| row.index)
            .ok()
            .map(|i| &self.rows[i].stats)
    }
}

/// Engine computing the statistic battery for each window
#[derive(Debug, Clone)]
pub struct RollingStatisticsEngine {
    windows: Vec<WindowSpec>,
    percentiles: bool,
}

impl RollingStatisticsEngine {
    pub fn new(windows: Vec<WindowSpec>, percentiles: bool) -> Self {
        Self { windows, percentiles }
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, ComputeError> {
        Ok(Self::new(config.window_specs()?, config.percentiles))
    }

    pub fn windows(&self) -> &[WindowSpec] {
        &self.windows
    }

    pub fn percentiles(&self) -> bool {
        self.percentiles
    }

    /// Glucose statistics over a mg/dL column (`NaN` = missing).
    ///
    /// `rows` lists the grid indices to emit, ascending. `episodes` holds one
    /// series per threshold in `EpisodeThreshold::ALL` order.
    pub fn compute_glucose(
        &self,
        values: &[f64],
        episodes: &[EpisodeSeries],
        rows: &[usize],
    ) -> Vec<WindowSeries<GlucoseStats>> {
        let prefixes = episode_prefixes(episodes, values.len());
        let areas = AreaPrefix::new(values);

        self.windows
            .iter()
            .map(|spec| {
                let min_periods = spec.min_periods();
                let days = spec.point_count as f64 / SLOTS_PER_DAY as f64;
                let mut acc = GlucoseAccumulator::new(self.percentiles);
                let rows = slide(values, spec.point_count, rows, &mut acc, |acc, lo, hi| {
                    let n = acc.moments.count;
                    let available = n as f64 / spec.point_count as f64;
                    if n < min_periods {
                        return GlucoseStats::undefined(available);
                    }
                    let mut stats = acc.stats(available, self.percentiles, &prefixes, lo, hi);
                    stats.auc_per_day = areas.trapezoid(lo, hi).map(|area| area / days);
                    stats
                });
                WindowSeries {
                    spec: spec.clone(),
                    rows,
                }
            })
            .collect()
    }

    /// Sleep-hour statistics over a mg/dL column masked to sleep slots.
    ///
    /// `values` holds `NaN` outside sleep hours (see `Grid::sleep_column`) and
    /// `episodes` are detected on that masked column. A window is defined when
    /// its sleep points reach `min_valid_fraction` of the nominal sleep slots.
    pub fn compute_sleep(
        &self,
        values: &[f64],
        episodes: &[EpisodeSeries],
        rows: &[usize],
    ) -> Vec<WindowSeries<SleepStats>> {
        let prefixes = episode_prefixes(episodes, values.len());

        self.windows
            .iter()
            .map(|spec| {
                let nominal = (spec.point_count * SLEEP_SLOTS_PER_DAY) as f64 / SLOTS_PER_DAY as f64;
                let mut acc = GlucoseAccumulator::new(false);
                let rows = slide(values, spec.point_count, rows, &mut acc, |acc, lo, hi| {
                    let n = acc.moments.count;
                    let available = n as f64 / nominal;
                    if n == 0 || available < spec.min_valid_fraction {
                        return SleepStats::undefined(available);
                    }
                    let full = acc.stats(available, false, &prefixes, lo, hi);
                    SleepStats {
                        count: full.count,
                        fraction_data_available: available,
                        mean: full.mean,
                        std: full.std,
                        cv: full.cv,
                        lbgi: full.lbgi,
                        hbgi: full.hbgi,
                        bands: full.bands,
                        episodes: full.episodes,
                    }
                });
                WindowSeries {
                    spec: spec.clone(),
                    rows,
                }
            })
            .collect()
    }

    /// Insulin statistics over a sparse column; one non-null point suffices
    pub fn compute_insulin(&self, values: &[f64], rows: &[usize]) -> Vec<WindowSeries<InsulinStats>> {
        self.windows
            .iter()
            .map(|spec| {
                let mut acc = SlidingMoments::new(self.percentiles);
                let rows = slide(values, spec.point_count, rows, &mut acc, |acc, _, _| {
                    if acc.count == 0 {
                        return InsulinStats::undefined();
                    }
                    let (max, percentiles) = if self.percentiles {
                        (acc.max(), acc.percentiles())
                    } else {
                        (f64::NAN, [f64::NAN; 5])
                    };
                    let (mean, std) = (acc.mean(), acc.std());
                    InsulinStats {
                        count: Some(acc.count),
                        total: acc.total(),
                        mean,
                        std,
                        cv: if mean == 0.0 { f64::NAN } else { std / mean },
                        min: acc.min(),
                        max,
                        percentiles,
                    }
                });
                WindowSeries {
                    spec: spec.clone(),
                    rows,
                }
            })
            .collect()
    }
}

/// Incremental window state fed by `slide`
trait WindowAccumulator {
    fn push(&mut self, index: usize, value: f64);
    fn pop(&mut self, value: f64);
    /// Drop state for indices before `lo`
    fn expire(&mut self, lo: usize);
}

/// Slide a window of `point_count` slots over `values`, emitting at `rows`
fn slide<A, T, F>(values: &[f64], point_count: usize, rows: &[usize], acc: &mut A, mut emit: F) -> Vec<WindowRow<T>>
where
    A: WindowAccumulator,
    F: FnMut(&A, usize, usize) -> T,
{
    let mut out = Vec::with_capacity(rows.len());
    let mut pending = rows.iter().copied().peekable();

    for (i, &value) in values.iter().enumerate() {
        if pending.peek().is_none() {
            break;
        }
        if !value.is_nan() {
            acc.push(i, value);
        }
        if i >= point_count {
            let leaving = values[i - point_count];
            if !leaving.is_nan() {
                acc.pop(leaving);
            }
        }
        let lo = (i + 1).saturating_sub(point_count);
        acc.expire(lo);

        while let Some(row) = pending.next_if(|&row| row <= i) {
            if row == i {
                out.push(WindowRow {
                    index: i,
                    stats: emit(&*acc, lo, i),
                });
            }
        }
    }

    out
}

/// Running moments, extrema and (optionally) the value distribution
#[derive(Debug, Clone)]
struct SlidingMoments {
    count: usize,
    /// First value seen, subtracted before summing to limit cancellation
    shift: Option<f64>,
    sum: f64,
    sum_sq: f64,
    minima: VecDeque<(usize, f64)>,
    maxima: VecDeque<(usize, f64)>,
    distribution: Option<BTreeMap<OrderedFloat<f64>, usize>>,
}

impl SlidingMoments {
    fn new(track_distribution: bool) -> Self {
        Self {
            count: 0,
            shift: None,
            sum: 0.0,
            sum_sq: 0.0,
            minima: VecDeque::new(),
            maxima: VecDeque::new(),
            distribution: track_distribution.then(BTreeMap::new),
        }
    }

    fn mean(&self) -> f64 {
        match (self.count, self.shift) {
            (0, _) | (_, None) => f64::NAN,
            (n, Some(k)) => k + self.sum / n as f64,
        }
    }

    fn total(&self) -> f64 {
        match self.shift {
            Some(k) => k * self.count as f64 + self.sum,
            None => f64::NAN,
        }
    }

    /// Sample standard deviation (ddof = 1)
    fn std(&self) -> f64 {
        if self.count < 2 {
            return f64::NAN;
        }
        let n = self.count as f64;
        ((self.sum_sq - self.sum * self.sum / n) / (n - 1.0)).max(0.0).sqrt()
    }

    fn min(&self) -> f64 {
        self.minima.front().map(|&(_, v)| v).unwrap_or(f64::NAN)
    }

    fn max(&self) -> f64 {
        self.maxima.front().map(|&(_, v)| v).unwrap_or(f64::NAN)
    }

    /// k-th smallest value (0-based)
    fn nth(&self, k: usize) -> f64 {
        let Some(distribution) = &self.distribution else {
            return f64::NAN;
        };
        let mut seen = 0;
        for (value, count) in distribution {
            seen += count;
            if seen > k {
                return value.into_inner();
            }
        }
        f64::NAN
    }

    /// Quantile with linear interpolation between closest ranks
    fn quantile(&self, q: f64) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        let position = q * (self.count - 1) as f64;
        let lower = position.floor() as usize;
        let upper = position.ceil() as usize;
        let a = self.nth(lower);
        if lower == upper {
            return a;
        }
        a + (self.nth(upper) - a) * (position - lower as f64)
    }

    fn percentiles(&self) -> [f64; 5] {
        PERCENTILE_LEVELS.map(|level| self.quantile(f64::from(level) / 100.0))
    }
}

impl WindowAccumulator for SlidingMoments {
    fn push(&mut self, index: usize, value: f64) {
        let k = *self.shift.get_or_insert(value);
        let d = value - k;
        self.count += 1;
        self.sum += d;
        self.sum_sq += d * d;

        while self.minima.back().is_some_and(|&(_, m)| m >= value) {
            self.minima.pop_back();
        }
        self.minima.push_back((index, value));
        while self.maxima.back().is_some_and(|&(_, m)| m <= value) {
            self.maxima.pop_back();
        }
        self.maxima.push_back((index, value));

        if let Some(distribution) = &mut self.distribution {
            *distribution.entry(OrderedFloat(value)).or_insert(0) += 1;
        }
    }

    fn pop(&mut self, value: f64) {
        let k = self.shift.unwrap_or(value);
        let d = value - k;
        self.count = self.count.saturating_sub(1);
        self.sum -= d;
        self.sum_sq -= d * d;
        if self.count == 0 {
            // Empty window: restart from a clean shift
            self.shift = None;
            self.sum = 0.0;
            self.sum_sq = 0.0;
        }

        if let Some(distribution) = &mut self.distribution {
            let key = OrderedFloat(value);
            if let Some(count) = distribution.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    distribution.remove(&key);
                }
            }
        }
    }

    fn expire(&mut self, lo: usize) {
        while self.minima.front().is_some_and(|&(i, _)| i < lo) {
            self.minima.pop_front();
        }
        while self.maxima.front().is_some_and(|&(i, _)| i < lo) {
            self.maxima.pop_front();
        }
    }
}

/// Glucose window state: moments plus band counts and risk sums
#[derive(Debug, Clone)]
struct GlucoseAccumulator {
    moments: SlidingMoments,
    band_counts: [usize; 15],
    low_risk: f64,
    high_risk: f64,
}

impl GlucoseAccumulator {
    fn new(track_distribution: bool) -> Self {
        Self {
            moments: SlidingMoments::new(track_distribution),
            band_counts: [0; 15],
            low_risk: 0.0,
            high_risk: 0.0,
        }
    }

    fn stats(
        &self,
        fraction_data_available: f64,
        percentiles: bool,
        prefixes: &[EpisodePrefix],
        lo: usize,
        hi: usize,
    ) -> GlucoseStats {
        let n = self.moments.count;
        let nf = n as f64;
        let mean = self.moments.mean();
        let std = self.moments.std();
        let cv = if mean == 0.0 { f64::NAN } else { std / mean };

        let (max, pct) = if percentiles {
            (self.moments.max(), self.moments.percentiles())
        } else {
            (f64::NAN, [f64::NAN; 5])
        };

        let mut episodes = [EpisodeRollup::UNDEFINED; 5];
        for (slot, prefix) in episodes.iter_mut().zip(prefixes) {
            *slot = prefix.rollup(lo, hi);
        }

        GlucoseStats {
            count: Some(n),
            fraction_data_available,
            mean,
            gmi: 3.31 + 0.02392 * mean,
            std,
            cv,
            min: self.moments.min(),
            max,
            percentiles: pct,
            iqr: pct[3] - pct[1],
            lbgi: self.low_risk / nf,
            hbgi: self.high_risk / nf,
            bands: self.band_counts.map(|c| 100.0 * c as f64 / nf),
            episodes,
            auc_per_day: [f64::NAN; 6],
        }
    }
}

impl WindowAccumulator for GlucoseAccumulator {
    fn push(&mut self, index: usize, value: f64) {
        self.moments.push(index, value);
        for (count, band) in self.band_counts.iter_mut().zip(GLYCEMIC_BANDS) {
            if band.contains(value) {
                *count += 1;
            }
        }
        let (low, high) = blood_glucose_risk(value);
        self.low_risk += low;
        self.high_risk += high;
    }

    fn pop(&mut self, value: f64) {
        self.moments.pop(value);
        for (count, band) in self.band_counts.iter_mut().zip(GLYCEMIC_BANDS) {
            if band.contains(value) {
                *count = count.saturating_sub(1);
            }
        }
        if self.moments.count == 0 {
            self.low_risk = 0.0;
            self.high_risk = 0.0;
        } else {
            let (low, high) = blood_glucose_risk(value);
            self.low_risk -= low;
            self.high_risk -= high;
        }
    }

    fn expire(&mut self, lo: usize) {
        self.moments.expire(lo);
    }
}

/// Low and high blood glucose risk for one mg/dL reading
pub fn blood_glucose_risk(mg_dl: f64) -> (f64, f64) {
    let f = 1.509 * (mg_dl.ln().powf(1.084) - 5.381);
    let risk = 10.0 * f * f;
    if f < 0.0 {
        (risk, 0.0)
    } else {
        (0.0, risk)
    }
}

/// Prefix sums of the `AUC_BANDS` curve heights over the whole column
#[derive(Debug, Clone)]
struct AreaPrefix {
    heights: Vec<[f64; 6]>,
    sums: Vec<[f64; 6]>,
}

impl AreaPrefix {
    fn new(values: &[f64]) -> Self {
        let heights: Vec<[f64; 6]> = values
            .iter()
            .map(|&v| AUC_BANDS.map(|band| band.area_height(v)))
            .collect();
        let mut sums = Vec::with_capacity(values.len() + 1);
        let mut running = [0.0; 6];
        sums.push(running);
        for h in &heights {
            for (total, height) in running.iter_mut().zip(h) {
                *total += height;
            }
            sums.push(running);
        }
        Self { heights, sums }
    }

    /// Trapezoidal area over slots `lo..=hi` at 5-minute spacing
    fn trapezoid(&self, lo: usize, hi: usize) -> [f64; 6] {
        let (Some(first), Some(last), Some(s_lo), Some(s_hi)) = (
            self.heights.get(lo),
            self.heights.get(hi),
            self.sums.get(lo),
            self.sums.get(hi + 1),
        ) else {
            return [f64::NAN; 6];
        };
        let mut area = [0.0; 6];
        for (b, slot) in area.iter_mut().enumerate() {
            let inner = s_hi[b] - s_lo[b] - (first[b] + last[b]) / 2.0;
            *slot = SLOT_MINUTES as f64 * inner;
        }
        area
    }
}

/// One prefix per threshold in `EpisodeThreshold::ALL` order
fn episode_prefixes(episodes: &[EpisodeSeries], len: usize) -> Vec<EpisodePrefix> {
    EpisodeThreshold::ALL
        .iter()
        .map(|threshold| {
            episodes
                .iter()
                .find(|s| s.threshold == *threshold)
                .map(EpisodePrefix::new)
                .unwrap_or_else(|| EpisodePrefix::empty(len))
        })
        .collect()
}

/// Prefix sums over one episode series
#[derive(Debug, Clone)]
struct EpisodePrefix {
    starts: Vec<u32>,
    minutes: Vec<u64>,
}

impl EpisodePrefix {
    fn new(series: &EpisodeSeries) -> Self {
        let mut starts = Vec::with_capacity(series.duration_minutes.len() + 1);
        let mut minutes = Vec::with_capacity(series.duration_minutes.len() + 1);
        starts.push(0);
        minutes.push(0);
        let (mut s, mut m) = (0u32, 0u64);
        for &duration in &series.duration_minutes {
            if duration > 0 {
                s += 1;
                m += u64::from(duration);
            }
            starts.push(s);
            minutes.push(m);
        }
        Self { starts, minutes }
    }

    fn empty(len: usize) -> Self {
        Self {
            starts: vec![0; len + 1],
            minutes: vec![0; len + 1],
        }
    }

    fn rollup(&self, lo: usize, hi: usize) -> EpisodeRollup {
        let (Some(s_hi), Some(s_lo), Some(m_hi), Some(m_lo)) = (
            self.starts.get(hi + 1),
            self.starts.get(lo),
            self.minutes.get(hi + 1),
            self.minutes.get(lo),
        ) else {
            return EpisodeRollup::UNDEFINED;
        };
        let count = f64::from(s_hi - s_lo);
        let avg_duration_minutes = if count == 0.0 {
            f64::NAN
        } else {
            (m_hi - m_lo) as f64 / count
        };
        EpisodeRollup {
            count,
            avg_duration_minutes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episodes::EpisodeDetector;
    use proptest::prelude::*;

    fn all_rows(len: usize) -> Vec<usize> {
        (0..len).collect()
    }

    fn glucose(values: &[f64], spec: WindowSpec, percentiles: bool) -> WindowSeries<GlucoseStats> {
        let engine = RollingStatisticsEngine::new(vec![spec], percentiles);
        let episodes = EpisodeDetector::detect_all(values);
        engine
            .compute_glucose(values, &episodes, &all_rows(values.len()))
            .remove(0)
    }

    #[test]
    fn test_scenario_below_54() {
        let values = [50.0, 50.0, 50.0, 60.0, 60.0];
        let series = glucose(&values, WindowSpec::new("25min", 5, 0.0), false);
        let last = series.at(4).unwrap();

        assert!((last.band(GlycemicBand::Below(54)) - 60.0).abs() < 1e-9);
        assert_eq!(last.count, Some(5));
        let rollup = last.episode(EpisodeThreshold::Below54);
        assert_eq!(rollup.count, 1.0);
        assert_eq!(rollup.avg_duration_minutes, 15.0);
        assert!(last.episode(EpisodeThreshold::Above180).avg_duration_minutes.is_nan());
    }

    #[test]
    fn test_min_periods_boundary() {
        // 10 points at 0.5 => 5 required
        let spec = WindowSpec::new("50min", 10, 0.5);
        let mut values = vec![f64::NAN; 10];
        for v in values.iter_mut().take(4) {
            *v = 120.0;
        }
        let series = glucose(&values, spec.clone(), false);
        let row = series.at(9).unwrap();
        assert_eq!(row.count, None);
        assert!(row.mean.is_nan());
        assert!((row.fraction_data_available - 0.4).abs() < 1e-9);

        values[4] = 120.0;
        let series = glucose(&values, spec, false);
        let row = series.at(9).unwrap();
        assert_eq!(row.count, Some(5));
        assert!((row.mean - 120.0).abs() < 1e-9);
    }

    #[test]
    fn test_moments_and_gmi() {
        let values = [100.0, 120.0, 140.0];
        let row = glucose(&values, WindowSpec::new("15min", 3, 0.0), false)
            .at(2)
            .cloned()
            .unwrap();
        assert!((row.mean - 120.0).abs() < 1e-9);
        assert!((row.std - 20.0).abs() < 1e-9);
        assert!((row.cv - 20.0 / 120.0).abs() < 1e-9);
        assert!((row.gmi - 6.1804).abs() < 1e-9);
        assert_eq!(row.min, 100.0);
        assert!(row.max.is_nan());
    }

    #[test]
    fn test_percentiles_interpolate() {
        let values = [40.0, 10.0, 30.0, 20.0];
        let row = glucose(&values, WindowSpec::new("20min", 4, 0.0), true)
            .at(3)
            .cloned()
            .unwrap();
        let expected = [13.0, 17.5, 25.0, 32.5, 37.0];
        for (got, want) in row.percentiles.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{got} != {want}");
        }
        assert!((row.iqr - 15.0).abs() < 1e-9);
        assert_eq!(row.max, 40.0);
    }

    #[test]
    fn test_partition_sums_to_100() {
        let values: Vec<f64> = (0..288).map(|i| 40.0 + ((i * 37) % 300) as f64).collect();
        let series = glucose(&values, WindowSpec::new("24hr", 288, 0.7), false);
        let row = series.at(287).unwrap();
        let total = row.band(GlycemicBand::Below(70))
            + row.band(GlycemicBand::Between(70, 180))
            + row.band(GlycemicBand::Above(180));
        assert!((total - 100.0).abs() < 1e-9);
        // Earlier rows have too few points
        assert_eq!(series.at(100).unwrap().count, None);
    }

    #[test]
    fn test_risk_indices() {
        let (low, high) = blood_glucose_risk(50.0);
        assert!(low > 0.0 && high == 0.0);
        let (low, high) = blood_glucose_risk(300.0);
        assert!(low == 0.0 && high > 0.0);
    }

    #[test]
    fn test_only_requested_rows_are_emitted() {
        let engine = RollingStatisticsEngine::new(vec![WindowSpec::new("10min", 2, 0.0)], false);
        let values = [100.0, 110.0, 120.0, 130.0];
        let series = engine.compute_glucose(&values, &[], &[1, 3]).remove(0);
        let indices: Vec<usize> = series.rows.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1, 3]);
        assert!((series.at(3).unwrap().mean - 125.0).abs() < 1e-9);
        assert!(series.at(2).is_none());
    }

    #[test]
    fn test_insulin_needs_one_point() {
        let engine = RollingStatisticsEngine::new(vec![WindowSpec::new("15min", 3, 0.7)], false);
        let values = [f64::NAN, 2.0, f64::NAN, f64::NAN, f64::NAN, 1.5, 0.5];
        let series = engine.compute_insulin(&values, &all_rows(values.len())).remove(0);

        let first = series.at(1).unwrap();
        assert_eq!(first.count, Some(1));
        assert_eq!(first.total, 2.0);
        assert!(first.std.is_nan());

        assert_eq!(series.at(4).unwrap().count, None);

        let last = series.at(6).unwrap();
        assert_eq!(last.count, Some(2));
        assert!((last.total - 2.0).abs() < 1e-9);
        assert_eq!(last.min, 0.5);
    }

    #[test]
    fn test_auc_per_day_trapezoid() {
        let values = [50.0, 50.0, 50.0, 60.0, 60.0];
        let row = glucose(&values, WindowSpec::new("25min", 5, 0.0), false)
            .at(4)
            .cloned()
            .unwrap();
        // Heights 50,50,50,0,0 => 625 mg/dL*min over 5/288 of a day
        assert!((row.auc(GlycemicBand::Below(54)) - 625.0 * 288.0 / 5.0).abs() < 1e-6);
        // Heights 50,50,50,60,60 => 5 * (270 - 55)
        assert!((row.auc(GlycemicBand::Below(70)) - 1075.0 * 288.0 / 5.0).abs() < 1e-6);
        assert_eq!(row.auc(GlycemicBand::Above(180)), 0.0);
    }

    #[test]
    fn test_auc_treats_gaps_as_zero_and_follows_gate() {
        let values = [200.0, f64::NAN, 200.0, 200.0];
        let series = glucose(&values, WindowSpec::new("20min", 4, 0.75), false);
        assert!(series.at(2).unwrap().auc(GlycemicBand::Above(180)).is_nan());
        let row = series.at(3).unwrap();
        // Heights 20,0,20,20 => 5 * (60 - 20)
        assert!((row.auc(GlycemicBand::Above(180)) - 200.0 * 288.0 / 4.0).abs() < 1e-6);
        assert_eq!(row.auc(GlycemicBand::Between(70, 140)), 0.0);
    }

    #[test]
    fn test_area_height() {
        assert_eq!(GlycemicBand::Below(70).area_height(60.0), 60.0);
        assert_eq!(GlycemicBand::Below(70).area_height(70.0), 0.0);
        assert_eq!(GlycemicBand::Between(70, 180).area_height(100.0), 30.0);
        assert_eq!(GlycemicBand::Above(250).area_height(300.0), 50.0);
        assert_eq!(GlycemicBand::Above(250).area_height(f64::NAN), 0.0);
    }

    fn sleep(values: &[f64], spec: WindowSpec) -> WindowSeries<SleepStats> {
        let engine = RollingStatisticsEngine::new(vec![spec], false);
        let episodes = EpisodeDetector::detect_all(values);
        engine
            .compute_sleep(values, &episodes, &[values.len() - 1])
            .remove(0)
    }

    #[test]
    fn test_sleep_window_gate() {
        // One day: 72 nominal sleep slots, 0.7 => 50.4 points needed
        let spec = WindowSpec::new("24hr", 288, 0.7);
        let mut values = vec![f64::NAN; 288];
        for v in values.iter_mut().take(50) {
            *v = 100.0;
        }
        let row = sleep(&values, spec.clone()).at(287).cloned().unwrap();
        assert_eq!(row.count, None);
        assert!(row.mean.is_nan());
        assert!((row.fraction_data_available - 50.0 / 72.0).abs() < 1e-9);

        values[50] = 60.0;
        let row = sleep(&values, spec).at(287).cloned().unwrap();
        assert_eq!(row.count, Some(51));
        assert!((row.fraction_data_available - 51.0 / 72.0).abs() < 1e-9);
        assert!((row.band(GlycemicBand::Below(70)) - 100.0 / 51.0).abs() < 1e-9);
        assert!(row.lbgi > 0.0);
    }

    #[test]
    fn test_sleep_episodes_roll_up() {
        let spec = WindowSpec::new("1hr", 12, 0.0);
        let mut values = vec![f64::NAN; 12];
        for v in values.iter_mut().take(3) {
            *v = 50.0;
        }
        values[3] = 120.0;
        let row = sleep(&values, spec).at(11).cloned().unwrap();
        assert_eq!(row.count, Some(4));
        let rollup = row.episode(EpisodeThreshold::Below54);
        assert_eq!(rollup.count, 1.0);
        assert_eq!(rollup.avg_duration_minutes, 15.0);
        assert_eq!(row.episode(EpisodeThreshold::Above180).count, 0.0);
    }

    #[test]
    fn test_empty_sleep_window_is_undefined() {
        let row = sleep(&[f64::NAN; 6], WindowSpec::new("30min", 6, 0.0))
            .at(5)
            .cloned()
            .unwrap();
        assert_eq!(row.count, None);
        assert_eq!(row.fraction_data_available, 0.0);
    }

    #[test]
    fn test_insulin_cv() {
        let engine = RollingStatisticsEngine::new(vec![WindowSpec::new("15min", 3, 0.0)], false);
        let values = [1.0, f64::NAN, 3.0];
        let row = engine.compute_insulin(&values, &[2]).remove(0).rows.remove(0).stats;
        assert!((row.mean - 2.0).abs() < 1e-9);
        assert!((row.cv - 2.0_f64.sqrt() / 2.0).abs() < 1e-9);
        let single = engine.compute_insulin(&[2.0], &[0]).remove(0).rows.remove(0).stats;
        assert!(single.cv.is_nan());
    }

    proptest! {
        #[test]
        fn prop_sliding_matches_direct(
            raw in prop::collection::vec(prop::option::of(40u16..400), 1..120),
            width in 1usize..30,
        ) {
            let values: Vec<f64> = raw.iter().map(|v| v.map(f64::from).unwrap_or(f64::NAN)).collect();
            let series = glucose(&values, WindowSpec::new("w", width, 0.0), true);

            for row in &series.rows {
                let lo = (row.index + 1).saturating_sub(width);
                let mut window: Vec<f64> = values[lo..=row.index].iter().copied().filter(|v| !v.is_nan()).collect();
                window.sort_by(|a, b| a.total_cmp(b));
                prop_assert_eq!(row.stats.count, Some(window.len()));
                if window.is_empty() {
                    prop_assert!(row.stats.mean.is_nan());
                    continue;
                }
                let mean = window.iter().sum::<f64>() / window.len() as f64;
                prop_assert!((row.stats.mean - mean).abs() < 1e-6);
                prop_assert_eq!(row.stats.min, window[0]);
                prop_assert_eq!(row.stats.max, window[window.len() - 1]);
                let below_70 = window.iter().filter(|v| **v < 70.0).count() as f64;
                prop_assert!((row.stats.band(GlycemicBand::Below(70)) - 100.0 * below_70 / window.len() as f64).abs() < 1e-9);
            }
        }
    }
}
