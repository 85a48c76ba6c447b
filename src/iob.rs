//! Insulin on board
//!
//! Active bolus insulin per grid slot. Each dose decays along the exponential
//! insulin activity curve, sampled at the grid cadence, and the remaining
//! amounts of overlapping doses add up.

use crate::types::SLOT_MINUTES;

/// Default total duration of insulin action in minutes
pub const DEFAULT_ACTION_DURATION_MINUTES: f64 = 360.0;

/// Default time of peak insulin activity in minutes
pub const DEFAULT_PEAK_ACTIVITY_MINUTES: f64 = 75.0;

/// Exponential insulin activity model.
///
/// The peak must come before half the action duration for the curve to be
/// defined; both defaults satisfy this.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialInsulinModel {
    action_duration: f64,
    peak_activity: f64,
}

impl Default for ExponentialInsulinModel {
    fn default() -> Self {
        Self {
            action_duration: DEFAULT_ACTION_DURATION_MINUTES,
            peak_activity: DEFAULT_PEAK_ACTIVITY_MINUTES,
        }
    }
}

impl ExponentialInsulinModel {
    /// Fraction of a dose still active `minutes` after delivery
    pub fn remaining(&self, minutes: f64) -> f64 {
        let (td, tp) = (self.action_duration, self.peak_activity);
        if minutes <= 0.0 {
            return 1.0;
        }
        if minutes >= td {
            return 0.0;
        }

        let tau = tp * (1.0 - tp / td) / (1.0 - 2.0 * tp / td);
        let a = 2.0 * tau / td;
        let s = 1.0 / (1.0 - a + (1.0 + a) * (-td / tau).exp());
        let t = minutes;
        let inner = (t * t / (tau * td * (1.0 - a)) - t / tau - 1.0) * (-t / tau).exp() + 1.0;
        (1.0 - s * (1.0 - a) * inner).clamp(0.0, 1.0)
    }

    /// Remaining fractions at each slot offset within the action duration
    pub fn curve(&self) -> Vec<f64> {
        let slots = (self.action_duration / SLOT_MINUTES as f64).ceil() as usize;
        (0..slots)
            .map(|k| self.remaining((k as i64 * SLOT_MINUTES) as f64))
            .collect()
    }

    /// Insulin on board per slot from a bolus column (`NaN` = no dose).
    ///
    /// Slots with no active insulin are `NaN`.
    pub fn on_board(&self, doses: &[f64]) -> Vec<f64> {
        let curve = self.curve();
        let mut active = vec![0.0; doses.len()];
        for (i, &dose) in doses.iter().enumerate() {
            if dose.is_nan() || dose <= 0.0 {
                continue;
            }
            for (slot, fraction) in active[i..].iter_mut().zip(&curve) {
                *slot += dose * fraction;
            }
        }
        active
            .into_iter()
            .map(|units| if units > 0.0 { units } else { f64::NAN })
            .collect()
    }
}
