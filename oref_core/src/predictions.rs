//! Projected glucose curves.
//!
//! Starting from the current BG, each curve steps forward 5 minutes per IOB
//! tick:
//! - IOB: insulin activity plus the current deviation fading over an hour
//! - zero temp: insulin activity if basal were suspended now
//! - COB: IOB plus the remaining carbs absorbing
//! - UAM: IOB plus the current deviation fading at its observed slope
//! - blended: the highest of the active curves at each step
//!
//! Values are clamped to 39..=401 mg/dL and repeated tail values trimmed.

use crate::rounding::round_to;
use crate::{IobTick, MealData, Predictions};

/// Fastest carb absorption assumed, g/hr.
const MAX_CARB_ABSORPTION_RATE: f64 = 30.0;
/// Absorption rate used to stretch the remaining-carb window, g/hr.
const ASSUMED_CARB_ABSORPTION_RATE: f64 = 20.0;
/// Baseline hours for remaining carbs to absorb.
const REMAINING_CARB_HOURS: f64 = 3.0;
/// Minimum predictions only count once dosed insulin has peaked.
const INSULIN_PEAK_STEPS: usize = 18;
const UAM_MIN_STEPS: usize = 12;
/// Sentinel for "no minimum found yet".
pub const NO_PREDICTION: f64 = 999.0;
const BG_FLOOR: f64 = 39.0;
const BG_CEILING: f64 = 401.0;

/// Everything the curves depend on.
#[derive(Clone, Debug)]
pub struct PredictionInput<'a> {
    pub bg: f64,
    pub clock: i64,
    pub ticks: &'a [IobTick],
    pub meal: &'a MealData,
    /// Effective ISF
    pub sens: f64,
    pub carb_ratio: f64,
    pub sensitivity_ratio: f64,
    pub min_delta: f64,
    pub bgi: f64,
    pub target_bg: f64,
    pub threshold: f64,
    pub enable_uam: bool,
    pub remaining_carbs_cap: f64,
    pub remaining_carbs_fraction: f64,
}

/// Curves plus the summary values the dosing decision uses.
#[derive(Clone, Debug, PartialEq)]
pub struct Forecast {
    pub predictions: Predictions,
    pub eventual_bg: f64,
    /// Current carb impact, mg/dL per 5 min
    pub ci: f64,
    pub csf: f64,
    pub remaining_ci_peak: f64,
    pub remaining_ca_time: f64,
    pub cob_active: bool,
    pub min_iob_pred_bg: f64,
    pub min_cob_pred_bg: f64,
    pub min_uam_pred_bg: f64,
    pub min_zt_guard_bg: f64,
    pub min_guard_bg: f64,
    pub min_pred_bg: f64,
    pub avg_pred_bg: f64,
    pub last_iob_pred_bg: f64,
    pub last_cob_pred_bg: Option<f64>,
    pub last_uam_pred_bg: Option<f64>,
    pub last_zt_pred_bg: f64,
}

impl Forecast {
    /// Minutes until the deciding curve first drops below `level`, at most 240.
    pub fn minutes_above(&self, level: f64) -> f64 {
        let curve = match (&self.predictions.cob, self.cob_active) {
            (Some(cob), true) => cob,
            _ => &self.predictions.iob,
        };
        curve
            .iter()
            .position(|bg| *bg < level)
            .map(|i| (i * 5) as f64)
            .unwrap_or(240.0)
    }
}

struct Curve {
    values: Vec<f64>,
    max_len: usize,
}

impl Curve {
    fn new(bg: f64, max_len: usize) -> Self {
        Self {
            values: vec![bg],
            max_len,
        }
    }

    fn last(&self) -> f64 {
        self.values.last().copied().unwrap_or(0.0)
    }

    fn len(&self) -> f64 {
        self.values.len() as f64
    }

    fn push(&mut self, value: f64) {
        if self.values.len() < self.max_len {
            self.values.push(value);
        }
    }

    fn clamped(&self) -> Vec<f64> {
        self.values
            .iter()
            .map(|bg| round_to(bg.clamp(BG_FLOOR, BG_CEILING), 0))
            .collect()
    }
}

/// Drop repeated trailing values, keeping at least the first hour.
fn trim_tail(mut values: Vec<f64>) -> Vec<f64> {
    while values.len() > 13 {
        let n = values.len();
        if values[n - 1] == values[n - 2] {
            values.pop();
        } else {
            break;
        }
    }
    values
}

pub fn forecast(input: &PredictionInput<'_>) -> Forecast {
    let bg = input.bg;
    let meal = input.meal;
    let sens = input.sens;

    let uci = round_to(input.min_delta - input.bgi, 1);
    let csf = sens / input.carb_ratio;
    let max_ci = round_to(MAX_CARB_ABSORPTION_RATE * csf * 5.0 / 60.0, 1);
    let ci = uci.min(max_ci);

    let mut remaining_ca_time = REMAINING_CARB_HOURS / input.sensitivity_ratio;
    if meal.carbs > 0.0 {
        let base = remaining_ca_time.max(meal.meal_cob / ASSUMED_CARB_ABSORPTION_RATE);
        let last_carb_age = meal
            .last_carb_time
            .map(|t| round_to((input.clock - t) as f64 / 60_000.0, 0))
            .unwrap_or(0.0);
        remaining_ca_time = round_to(base + 1.5 * last_carb_age / 60.0, 1);
    }

    let total_ci = (ci / 5.0 * 60.0 * remaining_ca_time / 2.0).max(0.0);
    let total_ca = total_ci / csf;
    let carbs_cap = input.remaining_carbs_cap.min(90.0);
    let carbs_ignored = 1.0 - input.remaining_carbs_fraction.min(1.0);
    let remaining_carbs = (meal.meal_cob - total_ca - meal.carbs * carbs_ignored)
        .max(0.0)
        .min(carbs_cap);
    let remaining_ci_peak = if remaining_ca_time > 0.0 {
        remaining_carbs * csf * 5.0 / 60.0 / (remaining_ca_time / 2.0)
    } else {
        0.0
    };

    let slope_from_max = round_to(meal.slope_from_max_deviation, 2);
    let slope_from_min = round_to(meal.slope_from_min_deviation, 2);
    let slope_from_deviations = slope_from_max.min(-slope_from_min / 3.0);

    // carb impact duration, in 5 minute steps
    let cid = if ci == 0.0 {
        0.0
    } else {
        (remaining_ca_time * 60.0 / 5.0 / 2.0).min((meal.meal_cob * csf / ci).max(0.0))
    };
    let carbs_predicted = cid != 0.0 || remaining_ci_peak > 0.0;

    let max_len = input.ticks.len().max(1);
    let mut iob_curve = Curve::new(bg, max_len);
    let mut zt_curve = Curve::new(bg, max_len);
    let mut cob_curve = Curve::new(bg, max_len);
    let mut uam_curve = Curve::new(bg, max_len);

    let mut min_iob_pred = NO_PREDICTION;
    let mut min_cob_pred = NO_PREDICTION;
    let mut min_uam_pred = NO_PREDICTION;
    let mut min_iob_guard = NO_PREDICTION;
    let mut min_cob_guard = NO_PREDICTION;
    let mut min_uam_guard = NO_PREDICTION;
    let mut min_zt_guard = NO_PREDICTION;
    let mut max_iob_pred = bg;
    let mut max_cob_pred = bg;
    let (mut iob_pred, mut cob_pred, mut uam_pred) = (bg, bg, bg);

    for tick in input.ticks {
        let pred_bgi = round_to(-tick.actual.activity * sens * 5.0, 2);
        let pred_zt_bgi = round_to(-tick.zero_temp.activity * sens * 5.0, 2);
        let pred_dev = ci * (1.0 - (iob_curve.len() / 12.0).min(1.0));

        iob_pred = iob_curve.last() + pred_bgi + pred_dev;
        let zt_pred = zt_curve.last() + pred_zt_bgi;

        let pred_ci = (ci.max(0.0) * (1.0 - cob_curve.len() / (cid * 2.0).max(1.0))).max(0.0);
        // carbs left after the linear decay absorb along a /\ curve
        let intervals = cob_curve.len().min(remaining_ca_time * 12.0 - cob_curve.len());
        let remaining_ci = if remaining_ca_time > 0.0 {
            (intervals / (remaining_ca_time / 2.0 * 12.0) * remaining_ci_peak).max(0.0)
        } else {
            0.0
        };
        cob_pred = cob_curve.last() + pred_bgi + pred_dev.min(0.0) + pred_ci + remaining_ci;

        let pred_uci_slope = (uci + uam_curve.len() * slope_from_deviations).max(0.0);
        let pred_uci_max = (uci * (1.0 - uam_curve.len() / 36.0)).max(0.0);
        let pred_uci = pred_uci_slope.min(pred_uci_max);
        uam_pred = uam_curve.last() + pred_bgi + pred_dev.min(0.0) + pred_uci;

        iob_curve.push(iob_pred);
        zt_curve.push(zt_pred);
        cob_curve.push(cob_pred);
        uam_curve.push(uam_pred);

        min_cob_guard = min_cob_guard.min(round_to(cob_pred, 0));
        min_uam_guard = min_uam_guard.min(round_to(uam_pred, 0));
        min_iob_guard = min_iob_guard.min(round_to(iob_pred, 0));
        min_zt_guard = min_zt_guard.min(round_to(zt_pred, 0));

        if iob_curve.values.len() > INSULIN_PEAK_STEPS && iob_pred < min_iob_pred {
            min_iob_pred = round_to(iob_pred, 0);
        }
        max_iob_pred = max_iob_pred.max(iob_pred);
        if carbs_predicted && cob_curve.values.len() > INSULIN_PEAK_STEPS && cob_pred < min_cob_pred {
            min_cob_pred = round_to(cob_pred, 0);
        }
        if carbs_predicted && cob_pred > max_iob_pred {
            max_cob_pred = cob_pred;
        }
        if input.enable_uam && uam_curve.values.len() > UAM_MIN_STEPS && uam_pred < min_uam_pred {
            min_uam_pred = round_to(uam_pred, 0);
        }
    }

    let carb_impact = ci > 0.0 || remaining_ci_peak > 0.0;
    let cob_active = meal.meal_cob > 0.0 && carb_impact;
    let uam_active = carb_impact && input.enable_uam;

    let iob_values = iob_curve.clamped();
    let zt_values = zt_curve.clamped();
    let cob_values = cob_curve.clamped();
    let uam_values = uam_curve.clamped();

    let blended: Vec<f64> = iob_values
        .iter()
        .enumerate()
        .map(|(i, &value)| {
            let mut highest = value;
            if cob_active {
                highest = highest.max(cob_values[i]);
            }
            if uam_active {
                highest = highest.max(uam_values[i]);
            }
            highest
        })
        .collect();

    let predictions = Predictions {
        iob: trim_tail(iob_values),
        zero_temp: trim_tail(zt_values),
        cob: cob_active.then(|| trim_tail(cob_values)),
        uam: uam_active.then(|| trim_tail(uam_values)),
        blended: trim_tail(blended),
    };
    let eventual_bg = predictions.blended.last().copied().unwrap_or(bg);

    let min_iob_pred = min_iob_pred.max(BG_FLOOR);
    let min_cob_pred = min_cob_pred.max(BG_FLOOR);
    let min_uam_pred = min_uam_pred.max(BG_FLOOR);

    let fraction_carbs_left = if meal.carbs > 0.0 {
        meal.meal_cob / meal.carbs
    } else {
        0.0
    };

    let mut avg_pred_bg = if min_uam_pred < NO_PREDICTION && min_cob_pred < NO_PREDICTION {
        round_to((1.0 - fraction_carbs_left) * uam_pred + fraction_carbs_left * cob_pred, 0)
    } else if min_cob_pred < NO_PREDICTION {
        round_to((iob_pred + cob_pred) / 2.0, 0)
    } else if min_uam_pred < NO_PREDICTION {
        round_to((iob_pred + uam_pred) / 2.0, 0)
    } else {
        round_to(iob_pred, 0)
    };
    if min_zt_guard > avg_pred_bg {
        avg_pred_bg = min_zt_guard;
    }

    let min_guard_bg = round_to(
        if carbs_predicted {
            if input.enable_uam {
                fraction_carbs_left * min_cob_guard + (1.0 - fraction_carbs_left) * min_uam_guard
            } else {
                min_cob_guard
            }
        } else if input.enable_uam {
            min_uam_guard
        } else {
            min_iob_guard
        },
        0,
    );

    let threshold = input.threshold;
    let target_bg = input.target_bg;
    let min_zt_uam_pred = round_to(
        if min_zt_guard < threshold {
            (min_uam_pred + min_zt_guard) / 2.0
        } else if min_zt_guard < target_bg {
            let blend = (min_zt_guard - threshold) / (target_bg - threshold);
            let blended_guard = min_uam_pred * blend + min_zt_guard * (1.0 - blend);
            (min_uam_pred + blended_guard) / 2.0
        } else if min_zt_guard > min_uam_pred {
            (min_uam_pred + min_zt_guard) / 2.0
        } else {
            min_uam_pred
        },
        0,
    );

    let mut min_pred_bg = round_to(min_iob_pred, 0);
    if meal.carbs > 0.0 {
        if !input.enable_uam && min_cob_pred < NO_PREDICTION {
            min_pred_bg = round_to(min_iob_pred.max(min_cob_pred), 0);
        } else if min_cob_pred < NO_PREDICTION {
            let blended_min = fraction_carbs_left * min_cob_pred
                + (1.0 - fraction_carbs_left) * min_zt_uam_pred;
            min_pred_bg = round_to(min_iob_pred.max(min_cob_pred).max(blended_min), 0);
        } else if input.enable_uam {
            min_pred_bg = min_zt_uam_pred;
        } else {
            min_pred_bg = min_guard_bg;
        }
    } else if input.enable_uam {
        min_pred_bg = round_to(min_iob_pred.max(min_zt_uam_pred), 0);
    }
    min_pred_bg = min_pred_bg.min(avg_pred_bg);
    if max_cob_pred > bg {
        min_pred_bg = min_pred_bg.min(max_cob_pred);
    }

    let last = |values: &Vec<f64>| values.last().copied().unwrap_or(bg);
    Forecast {
        eventual_bg,
        ci,
        csf,
        remaining_ci_peak,
        remaining_ca_time,
        cob_active,
        min_iob_pred_bg: min_iob_pred,
        min_cob_pred_bg: min_cob_pred,
        min_uam_pred_bg: min_uam_pred,
        min_zt_guard_bg: min_zt_guard,
        min_guard_bg,
        min_pred_bg,
        avg_pred_bg,
        last_iob_pred_bg: last(&predictions.iob),
        last_cob_pred_bg: predictions.cob.as_ref().map(last),
        last_uam_pred_bg: predictions.uam.as_ref().map(last),
        last_zt_pred_bg: last(&predictions.zero_temp),
        predictions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IobData;

    const T0: i64 = 1_704_067_200_000;

    fn ticks(count: usize, activity: f64) -> Vec<IobTick> {
        (0..count)
            .map(|i| {
                let data = IobData {
                    time: T0 + i as i64 * 300_000,
                    activity,
                    ..IobData::default()
                };
                IobTick {
                    actual: data.clone(),
                    zero_temp: data,
                }
            })
            .collect()
    }

    fn input<'a>(ticks: &'a [IobTick], meal: &'a MealData) -> PredictionInput<'a> {
        PredictionInput {
            bg: 120.0,
            clock: T0,
            ticks,
            meal,
            sens: 50.0,
            carb_ratio: 10.0,
            sensitivity_ratio: 1.0,
            min_delta: 0.0,
            bgi: 0.0,
            target_bg: 100.0,
            threshold: 70.0,
            enable_uam: false,
            remaining_carbs_cap: 90.0,
            remaining_carbs_fraction: 1.0,
        }
    }

    #[test]
    fn test_no_insulin_no_change_is_flat() {
        let ticks = ticks(48, 0.0);
        let meal = MealData::default();
        let forecast = forecast(&input(&ticks, &meal));
        assert_eq!(forecast.eventual_bg, 120.0);
        assert_eq!(forecast.predictions.iob.len(), 13);
        assert!(forecast.predictions.cob.is_none());
        assert!(forecast.predictions.uam.is_none());
        assert_eq!(forecast.min_guard_bg, 120.0);
    }

    #[test]
    fn test_insulin_activity_lowers_curve() {
        let ticks = ticks(48, 0.01);
        let meal = MealData::default();
        let forecast = forecast(&input(&ticks, &meal));
        // 0.01 U/min * 50 * 5 = 2.5 mg/dL per step
        assert_eq!(forecast.predictions.iob[1], 118.0);
        assert!(forecast.eventual_bg < 120.0);
        assert!(forecast.predictions.iob.iter().all(|bg| *bg >= 39.0));
    }

    #[test]
    fn test_curves_clamped_to_floor() {
        let ticks = ticks(48, 0.1);
        let meal = MealData::default();
        let forecast = forecast(&input(&ticks, &meal));
        assert_eq!(forecast.eventual_bg, 39.0);
        assert!(forecast.min_guard_bg < 39.0);
    }

    #[test]
    fn test_carbs_on_board_raise_blended_curve() {
        let ticks = ticks(48, 0.0);
        let meal = MealData {
            carbs: 40.0,
            meal_cob: 40.0,
            last_carb_time: Some(T0 - 10 * 60_000),
            ..MealData::default()
        };
        let mut with_carbs = input(&ticks, &meal);
        with_carbs.min_delta = 5.0;
        let forecast = forecast(&with_carbs);
        let cob = forecast.predictions.cob.as_ref().unwrap();
        assert!(cob.last().unwrap() > &120.0);
        assert_eq!(forecast.eventual_bg, *forecast.predictions.blended.last().unwrap());
        assert!(forecast.eventual_bg >= *forecast.predictions.iob.last().unwrap());
    }

    #[test]
    fn test_uam_curve_when_enabled() {
        let ticks = ticks(48, 0.0);
        let meal = MealData::default();
        let mut rising = input(&ticks, &meal);
        rising.enable_uam = true;
        rising.min_delta = 4.0;
        let forecast = forecast(&rising);
        assert!(forecast.predictions.uam.is_some());
        assert!(forecast.min_uam_pred_bg < NO_PREDICTION);
    }

    #[test]
    fn test_minutes_above_level() {
        let ticks = ticks(48, 0.02);
        let meal = MealData::default();
        let forecast = forecast(&input(&ticks, &meal));
        // 5 mg/dL per step from 120 drops below 100 after five steps
        assert_eq!(forecast.minutes_above(100.0), 25.0);
        assert_eq!(forecast.minutes_above(20.0), 240.0);
    }

    #[test]
    fn test_trim_tail_keeps_first_hour() {
        let trimmed = trim_tail(vec![100.0; 30]);
        assert_eq!(trimmed.len(), 13);
        let moving: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert_eq!(trim_tail(moving.clone()), moving);
    }
}
