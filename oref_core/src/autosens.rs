//! Sensitivity detection.
//!
//! Deviations outside meal absorption and unannounced meals are collected over
//! a lookback window. Their median, converted to an equivalent basal offset,
//! gives the sensitivity ratio. The result is always inside the profile's
//! autosens band, and falls back to 1.0 when too few deviations survive.

use crate::config::AutosensSettings;
use crate::deviations::{self, DeviationPoint};
use crate::glucose;
use crate::insulin::CurveModel;
use crate::iob::DoseLedger;
use crate::profile;
use crate::rounding::round_to;
use crate::{AutosensResult, Error, LoopRequest, Result, Treatment, MINUTE_MS};

/// Positive deviations below this BG are not counted as resistance.
const LOW_BG_FOR_RESISTANCE: f64 = 80.0;
/// Deviation that on its own marks an unannounced meal, mg/dL per 5 min.
const UAM_DEVIATION: f64 = 6.0;

/// What the glucose at one bucket is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Interval {
    CarbAbsorption,
    UnannouncedMeal,
    NonMeal,
}

/// Run every configured window and keep the lowest ratio.
pub fn detect_lowest(request: &LoopRequest, settings: &AutosensSettings) -> Result<AutosensResult> {
    let mut lowest: Option<AutosensResult> = None;
    for &hours in &settings.windows_hours {
        let result = detect(request, hours, settings.min_samples)?;
        tracing::debug!("autosens {}h window: ratio {}", hours, result.ratio);
        if lowest.as_ref().map_or(true, |l| result.ratio < l.ratio) {
            lowest = Some(result);
        }
    }

    match lowest {
        Some(result) => Ok(result),
        None => {
            let isf = profile::isf_at(&request.profile, request.clock)?;
            Ok(AutosensResult::neutral(isf, 0.0, "no autosens window configured"))
        }
    }
}

/// Sensitivity ratio over the `window_hours` before the request clock.
pub fn detect(request: &LoopRequest, window_hours: f64, min_samples: usize) -> Result<AutosensResult> {
    let profile = &request.profile;
    let clock = request.clock;
    profile::validate(profile)?;

    let isf = profile::isf_at(profile, clock)?;
    let max_daily_basal = profile::max_daily_basal(profile);
    if max_daily_basal <= 0.0 {
        return Err(Error::InvalidProfile("max daily basal must be positive".into()));
    }

    let model = CurveModel::from_profile(profile)?;
    let ledger = DoseLedger::from_history(profile, &request.treatments, clock)?;
    let window_start = clock - (window_hours * 60.0 * MINUTE_MS as f64) as i64;
    let buckets = glucose::bucketize(&request.glucose, window_start - 20 * MINUTE_MS, clock);
    let mut points = deviations::series(profile, &ledger, &model, &buckets)?;
    points.retain(|p| p.timestamp > window_start);
    points.reverse();

    let meal_lookback = (profile.max_meal_absorption_time * 60.0 * MINUTE_MS as f64) as i64;
    let carbs = carbs_between(&request.treatments, window_start - meal_lookback, clock);

    let collected = collect_deviations(request, &points, &carbs)?;

    let max_kept = (window_hours * 12.0).round().max(1.0) as usize;
    let mut kept = collected.deviations;
    if kept.len() > max_kept {
        kept.drain(..kept.len() - max_kept);
    }

    if collected.samples < min_samples {
        let reason = format!(
            "{}h: only {} of {} required non-meal deviations, using neutral ratio",
            window_hours, collected.samples, min_samples
        );
        tracing::info!("{}", reason);
        let mut neutral = AutosensResult::neutral(isf, window_hours, reason);
        neutral.deviations_used = collected.samples;
        neutral.deviations_excluded = collected.excluded;
        return Ok(neutral);
    }

    kept.sort_by(|a, b| a.total_cmp(b));
    let median = percentile(&kept, 0.5);

    let basal_off = median * (60.0 / 5.0) / isf;
    let verdict = if median < 0.0 {
        "excess insulin sensitivity detected"
    } else if median > 0.0 {
        "excess insulin resistance detected"
    } else {
        "sensitivity normal"
    };

    let raw_ratio = 1.0 + basal_off / max_daily_basal;
    let bounded = raw_ratio.clamp(profile.autosens_min, profile.autosens_max);
    // rounding can step just outside a bound with more than 2 decimals
    let ratio = round_to(bounded, 2).clamp(profile.autosens_min, profile.autosens_max);
    if !ratio.is_finite() {
        return Err(Error::Computation(format!(
            "autosens ratio is not finite (median {})",
            median
        )));
    }

    let reason = format!(
        "{}h: {} deviations, median {:.2}: {}, ratio {}",
        window_hours,
        kept.len(),
        median,
        verdict,
        ratio
    );
    if ratio != round_to(raw_ratio, 2) {
        tracing::info!("{} (raw {:.2} clamped)", reason, raw_ratio);
    } else {
        tracing::info!("{}", reason);
    }

    Ok(AutosensResult {
        ratio,
        new_isf: round_to(isf / ratio, 0),
        deviations_used: collected.samples,
        deviations_excluded: collected.excluded,
        median_deviation: round_to(median, 2),
        window_hours,
        reason,
    })
}

struct Collected {
    deviations: Vec<f64>,
    samples: usize,
    excluded: usize,
}

/// Walk the points oldest first, tracking meal absorption, and keep the
/// deviations that belong to neither carbs nor unannounced meals.
fn collect_deviations(
    request: &LoopRequest,
    points: &[DeviationPoint],
    carbs: &[(i64, f64)],
) -> Result<Collected> {
    let profile = &request.profile;
    let mut pending = carbs.iter().peekable();
    let mut meal_cob = 0.0;
    let mut meal_carbs = 0.0;
    let mut absorbing = false;
    let mut uam = false;

    let mut collected = Collected {
        deviations: Vec::new(),
        samples: 0,
        excluded: 0,
    };

    for point in points {
        while let Some(&&(timestamp, grams)) = pending.peek() {
            if timestamp > point.timestamp {
                break;
            }
            meal_cob += grams;
            meal_carbs += grams;
            pending.next();
        }

        let mut deviation = point.deviation;
        if point.glucose < LOW_BG_FOR_RESISTANCE && deviation > 0.0 {
            deviation = 0.0;
        }

        if meal_cob > 0.0 {
            let carb_ratio = profile::carb_ratio_at(profile, point.timestamp)?;
            // Floored here, unlike meal COB: carbs decay even on flat glucose.
            let impact = deviation.max(profile.min_5m_carbimpact);
            meal_cob = (meal_cob - impact * carb_ratio / point.isf).max(0.0);
        }

        let interval = if meal_cob > 0.0 || absorbing || meal_carbs > 0.0 {
            absorbing = deviation > 0.0;
            if !absorbing && meal_cob <= 0.0 {
                meal_carbs = 0.0;
            }
            Interval::CarbAbsorption
        } else if point.iob > 2.0 * point.basal || deviation > UAM_DEVIATION || uam {
            uam = deviation > 0.0;
            Interval::UnannouncedMeal
        } else {
            Interval::NonMeal
        };

        match interval {
            Interval::NonMeal => {
                collected.deviations.push(deviation);
                collected.samples += 1;
            }
            Interval::CarbAbsorption | Interval::UnannouncedMeal => collected.excluded += 1,
        }

        let minute = profile::local_minute_of_day(profile, point.timestamp)?;
        if (minute / 60) % 2 == 0 && minute % 60 < 5 {
            collected.deviations.push(0.0);
            if let Some(extra) = exercise_deviation(request, point.timestamp) {
                collected.deviations.push(extra);
            }
        }
    }

    Ok(collected)
}

/// Extra negative deviation while a high temp target signals exercise.
fn exercise_deviation(request: &LoopRequest, at: i64) -> Option<f64> {
    let profile = &request.profile;
    if !(profile.exercise_mode || profile.high_temp_target_raises_sensitivity) {
        return None;
    }
    let targets = profile::targets_at(profile, &request.temp_targets, at).ok()?;
    if targets.temp_target_set && targets.target_bg > 100.0 {
        Some(-(targets.target_bg - 100.0) / 20.0)
    } else {
        None
    }
}

fn carbs_between(treatments: &[Treatment], after: i64, until: i64) -> Vec<(i64, f64)> {
    let mut carbs: Vec<(i64, f64)> = treatments
        .iter()
        .filter_map(|t| match *t {
            Treatment::Carbs { timestamp, grams }
                if timestamp > after && timestamp <= until && grams >= 1.0 =>
            {
                Some((timestamp, grams))
            }
            _ => None,
        })
        .collect();
    carbs.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
    carbs
}

/// Linear percentile over sorted values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let Some(&first) = sorted.first() else {
        return 0.0;
    };
    if p <= 0.0 {
        return first;
    }
    if p >= 1.0 {
        return sorted[sorted.len() - 1];
    }
    let index = sorted.len() as f64 * p;
    let lower = index.floor() as usize;
    let weight = index - index.floor();
    match sorted.get(lower + 1) {
        Some(&upper) => sorted[lower] * (1.0 - weight) + upper * weight,
        None => sorted[lower],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insulin::InsulinCurve;
    use crate::{CurrentTemp, GlucoseReading, Profile};

    const T0: i64 = 1_704_067_200_000;

    fn request(glucose: Vec<GlucoseReading>) -> LoopRequest {
        LoopRequest {
            profile: Profile::new(3.0, 1.0, 50.0, 10.0).with_curve(InsulinCurve::Bilinear),
            treatments: Vec::new(),
            glucose,
            current_temp: CurrentTemp::default(),
            clock: T0,
            temp_targets: Vec::new(),
            microbolus_allowed: false,
            autosens: None,
        }
    }

    fn trend(count: i64, start: f64, per_bucket: f64) -> Vec<GlucoseReading> {
        (0..count)
            .map(|i| GlucoseReading {
                timestamp: T0 - i * 5 * MINUTE_MS,
                glucose: start - per_bucket * i as f64,
                noise: 0,
                device: None,
            })
            .collect()
    }

    #[test]
    fn test_empty_history_is_neutral() {
        let result = detect(&request(Vec::new()), 24.0, 24).unwrap();
        assert_eq!(result.ratio, 1.0);
        assert_eq!(result.deviations_used, 0);
    }

    #[test]
    fn test_flat_glucose_is_normal() {
        let result = detect(&request(trend(300, 110.0, 0.0)), 24.0, 24).unwrap();
        assert_eq!(result.ratio, 1.0);
        assert!(result.reason.contains("sensitivity normal"));
    }

    #[test]
    fn test_falling_glucose_clamps_to_min() {
        // deviation -2 per bucket -> ratio 0.52 before the 0.7 floor
        let result = detect(&request(trend(300, 124.0, -2.0)), 24.0, 24).unwrap();
        assert_eq!(result.ratio, 0.7);
        assert!(result.median_deviation < 0.0);
    }

    #[test]
    fn test_rising_glucose_clamps_to_max() {
        let result = detect(&request(trend(300, 100.0 + 2.0 * 299.0, 2.0)), 24.0, 24).unwrap();
        assert_eq!(result.ratio, 1.2);
        assert_eq!(result.new_isf, 42.0);
    }

    #[test]
    fn test_too_few_samples_is_neutral() {
        let result = detect(&request(trend(10, 300.0, 2.0)), 24.0, 24).unwrap();
        assert_eq!(result.ratio, 1.0);
        assert!(result.reason.contains("neutral"));
    }

    #[test]
    fn test_carb_absorption_is_excluded() {
        let mut req = request(trend(300, 100.0 + 2.0 * 299.0, 2.0));
        req.treatments.push(Treatment::Carbs {
            timestamp: T0 - 23 * 60 * MINUTE_MS,
            grams: 5000.0,
        });
        let result = detect(&req, 24.0, 24).unwrap();
        assert_eq!(result.ratio, 1.0);
        assert!(result.deviations_excluded > 200);
    }

    #[test]
    fn test_lowest_window_wins() {
        // falling for the last 8h, rising slowly before that
        let readings: Vec<_> = (0..300)
            .map(|i| GlucoseReading {
                timestamp: T0 - i * 5 * MINUTE_MS,
                glucose: if i < 96 {
                    100.0 + i as f64
                } else {
                    196.0 - 0.5 * (i - 96) as f64
                },
                noise: 0,
                device: None,
            })
            .collect();
        let settings = AutosensSettings {
            enabled: true,
            windows_hours: vec![8.0, 24.0],
            min_samples: 24,
        };
        let result = detect_lowest(&request(readings), &settings).unwrap();
        assert!(result.ratio < 1.0);
        assert_eq!(result.window_hours, 8.0);
    }

    #[test]
    fn test_percentile_matches_linear_rule() {
        assert_eq!(percentile(&[], 0.5), 0.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 0.5), 3.0);
        assert_eq!(percentile(&[1.0, 2.0, 3.0], 0.5), 2.5);
    }
}
