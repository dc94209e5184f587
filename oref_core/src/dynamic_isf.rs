//! Dynamic insulin sensitivity from total daily dose and current glucose.
//!
//! Three independent strategies, picked by `Profile::dynamic_isf`. Each turns
//! (BG, TDD) into a sensitivity ratio that replaces the autosens ratio for ISF.

use crate::rounding::round_to;
use crate::{DynamicIsfMode, Error, Profile, Result};

/// Inputs observed at the clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DynamicIsfInput {
    pub bg: f64,
    pub target_bg: f64,
    /// Scheduled ISF at the clock
    pub profile_isf: f64,
    /// Insulin delivered over the last 24 hours
    pub tdd_24h: f64,
    /// Peak of the active insulin curve, minutes
    pub insulin_peak_minutes: f64,
}

/// Ratio and resulting ISF.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DynamicIsfOutcome {
    pub ratio: f64,
    pub isf: f64,
    pub weighted_tdd: f64,
}

/// Strategy selected once per call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DynamicIsf {
    mode: DynamicIsfMode,
    adjustment_factor: f64,
    adjustment_factor_sigmoid: f64,
    tdd_weight: f64,
    tdd_baseline: Option<f64>,
    min_ratio: f64,
    max_ratio: f64,
}

impl DynamicIsf {
    /// `None` when dynamic ISF is off.
    pub fn from_profile(profile: &Profile) -> Option<Self> {
        if profile.dynamic_isf == DynamicIsfMode::Off {
            return None;
        }
        Some(Self {
            mode: profile.dynamic_isf,
            adjustment_factor: profile.adjustment_factor,
            adjustment_factor_sigmoid: profile.adjustment_factor_sigmoid,
            tdd_weight: profile.tdd_weight.clamp(0.0, 1.0),
            tdd_baseline: profile.tdd_baseline,
            min_ratio: profile.autosens_min,
            max_ratio: profile.autosens_max,
        })
    }

    pub fn mode(&self) -> DynamicIsfMode {
        self.mode
    }

    /// `Ok(None)` when there is no insulin history to base it on.
    pub fn apply(&self, input: &DynamicIsfInput) -> Result<Option<DynamicIsfOutcome>> {
        if input.tdd_24h <= 0.0 || input.bg <= 0.0 {
            tracing::warn!(
                "dynamic ISF skipped: TDD {} BG {}",
                input.tdd_24h,
                input.bg
            );
            return Ok(None);
        }

        let baseline = self
            .tdd_baseline
            .filter(|b| *b > 0.0)
            .unwrap_or(input.tdd_24h);
        let tdd = self.tdd_weight * input.tdd_24h + (1.0 - self.tdd_weight) * baseline;

        let raw_ratio = match self.mode {
            DynamicIsfMode::Off => return Ok(None),
            DynamicIsfMode::Original => {
                let isf = 277_700.0 / (self.adjustment_factor * tdd * input.bg);
                input.profile_isf / isf
            }
            DynamicIsfMode::Logarithmic => {
                let divisor = 120.0 - input.insulin_peak_minutes;
                if divisor <= 0.0 {
                    return Err(Error::Computation(format!(
                        "insulin peak {} min leaves no logarithmic divisor",
                        input.insulin_peak_minutes
                    )));
                }
                let isf =
                    1800.0 / (self.adjustment_factor * tdd * (input.bg / divisor + 1.0).ln());
                input.profile_isf / isf
            }
            DynamicIsfMode::Sigmoid => self.sigmoid_ratio(input, tdd / baseline),
        };

        if !raw_ratio.is_finite() || raw_ratio <= 0.0 {
            return Err(Error::Computation(format!(
                "dynamic ISF ratio {} from TDD {} and BG {}",
                raw_ratio, tdd, input.bg
            )));
        }

        let ratio = round_to(raw_ratio.clamp(self.min_ratio, self.max_ratio), 2)
            .clamp(self.min_ratio, self.max_ratio);
        tracing::debug!(
            "dynamic ISF ({:?}): raw ratio {:.3}, using {}",
            self.mode,
            raw_ratio,
            ratio
        );

        Ok(Some(DynamicIsfOutcome {
            ratio,
            isf: round_to(input.profile_isf / ratio, 1),
            weighted_tdd: round_to(tdd, 2),
        }))
    }

    /// Logistic curve through ratio 1 at target, bounded by the autosens band.
    fn sigmoid_ratio(&self, input: &DynamicIsfInput, tdd_factor: f64) -> f64 {
        // avoid a zero-width interval above 1
        let max = if self.max_ratio <= 1.0 {
            self.max_ratio + 0.01
        } else {
            self.max_ratio
        };
        let min = self.min_ratio.min(0.99);

        let interval = max - min;
        let bg_dev = (input.bg - input.target_bg) * 0.0555;
        let fix_offset = ((1.0 - min) / (max - 1.0)).ln();
        let exponent = bg_dev * self.adjustment_factor_sigmoid * tdd_factor + fix_offset;
        interval / (1.0 + (-exponent).exp()) + min
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(mode: DynamicIsfMode) -> DynamicIsf {
        let mut profile = Profile::new(5.0, 1.0, 50.0, 10.0);
        profile.dynamic_isf = mode;
        DynamicIsf::from_profile(&profile).unwrap()
    }

    fn input(bg: f64) -> DynamicIsfInput {
        DynamicIsfInput {
            bg,
            target_bg: 100.0,
            profile_isf: 50.0,
            tdd_24h: 40.0,
            insulin_peak_minutes: 75.0,
        }
    }

    #[test]
    fn test_off_has_no_strategy() {
        assert!(DynamicIsf::from_profile(&Profile::new(5.0, 1.0, 50.0, 10.0)).is_none());
    }

    #[test]
    fn test_original_formula() {
        let outcome = strategy(DynamicIsfMode::Original)
            .apply(&input(150.0))
            .unwrap()
            .unwrap();
        // 277700 / (0.8 * 40 * 150) = 57.85 -> 50 / 57.85
        assert_eq!(outcome.ratio, 0.86);
        assert_eq!(outcome.weighted_tdd, 40.0);
    }

    #[test]
    fn test_logarithmic_formula_and_clamp() {
        let log = strategy(DynamicIsfMode::Logarithmic);
        assert_eq!(log.apply(&input(100.0)).unwrap().unwrap().ratio, 1.04);
        assert_eq!(log.apply(&input(150.0)).unwrap().unwrap().ratio, 1.2);
    }

    #[test]
    fn test_sigmoid_neutral_at_target() {
        let sigmoid = strategy(DynamicIsfMode::Sigmoid);
        let outcome = sigmoid.apply(&input(100.0)).unwrap().unwrap();
        assert_eq!(outcome.ratio, 1.0);
        assert_eq!(outcome.isf, 50.0);

        let high = sigmoid.apply(&input(200.0)).unwrap().unwrap();
        let low = sigmoid.apply(&input(70.0)).unwrap().unwrap();
        assert!(high.ratio > 1.0 && high.ratio <= 1.2);
        assert!(low.ratio < 1.0 && low.ratio >= 0.7);
    }

    #[test]
    fn test_missing_tdd_falls_back() {
        let mut no_history = input(120.0);
        no_history.tdd_24h = 0.0;
        assert!(strategy(DynamicIsfMode::Logarithmic)
            .apply(&no_history)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_baseline_blends_tdd() {
        let mut profile = Profile::new(5.0, 1.0, 50.0, 10.0);
        profile.dynamic_isf = DynamicIsfMode::Original;
        profile.tdd_baseline = Some(30.0);
        let outcome = DynamicIsf::from_profile(&profile)
            .unwrap()
            .apply(&input(150.0))
            .unwrap()
            .unwrap();
        assert_eq!(outcome.weighted_tdd, 36.5);
    }
}
