//! Carbs on board from deviation analysis.
//!
//! Glucose rising faster than insulin explains, after a carb entry, is read
//! as carbs being absorbed. Each 5-minute deviation at or above the
//! profile's `min_5m_carbimpact` absorbs `deviation * carb_ratio / isf` grams.
//! Smaller or negative deviations absorb nothing and never add carbs back.

use crate::deviations::{self, DeviationPoint};
use crate::glucose;
use crate::insulin::CurveModel;
use crate::iob::DoseLedger;
use crate::profile;
use crate::rounding::round_to;
use crate::{Error, GlucoseReading, MealData, Profile, Result, Treatment, MINUTE_MS};

/// Minimum deviation reported when no recent data set it.
pub const NO_MIN_DEVIATION: f64 = 999.0;
/// Deviations newer than this feed the slope statistics, minutes.
const STATS_WINDOW_MINUTES: i64 = 30;
/// Carb entries below this are ignored, grams.
const MIN_CARB_ENTRY: f64 = 1.0;

#[derive(Clone, Copy, Debug)]
struct CarbEntry {
    timestamp: i64,
    grams: f64,
}

/// Absorption attributed to one deviation, mg/dL per 5 minutes.
pub fn carb_impact(deviation: f64, min_5m_carbimpact: f64) -> f64 {
    if deviation >= min_5m_carbimpact && deviation > 0.0 {
        deviation
    } else {
        0.0
    }
}

/// Carb state at `clock`.
pub fn calculate(
    profile: &Profile,
    treatments: &[Treatment],
    readings: &[GlucoseReading],
    clock: i64,
) -> Result<MealData> {
    profile::validate(profile)?;
    let model = CurveModel::from_profile(profile)?;
    let window_ms = (profile.max_meal_absorption_time * 60.0 * MINUTE_MS as f64) as i64;

    let entries = carb_entries(treatments, clock - window_ms, clock)?;
    let ledger = DoseLedger::from_history(profile, treatments, clock)?;
    let buckets = glucose::bucketize(readings, clock - window_ms - 20 * MINUTE_MS, clock);
    let points = deviations::series(profile, &ledger, &model, &buckets)?;

    let mut carbs = 0.0;
    let mut carbs_to_remove = 0.0;
    let mut meal_cob: f64 = 0.0;
    for entry in &entries {
        carbs += entry.grams;
        let absorbed = absorbed_since(profile, &points, entry.timestamp, clock)?;
        let entry_cob = (carbs - absorbed).max(0.0);
        meal_cob = meal_cob.max(entry_cob);
        if entry_cob < meal_cob {
            carbs_to_remove += entry.grams;
        } else {
            carbs_to_remove = 0.0;
        }
    }

    let stats = DeviationStats::from_points(&points, clock);

    if stats.current_deviation.is_none() && meal_cob > 0.0 {
        tracing::warn!("no glucose in the last {} min, COB forced to 0", STATS_WINDOW_MINUTES);
        meal_cob = 0.0;
    }
    if meal_cob > profile.max_cob {
        tracing::info!("COB {} capped at max_cob {}", meal_cob, profile.max_cob);
        meal_cob = profile.max_cob;
    }

    let meal = MealData {
        carbs: round_to(carbs - carbs_to_remove, 3),
        meal_cob: round_to(meal_cob, 0).min(carbs).min(profile.max_cob),
        current_deviation: round_to(stats.current_deviation.unwrap_or(0.0), 2),
        max_deviation: round_to(stats.max_deviation, 2),
        min_deviation: round_to(stats.min_deviation, 2),
        slope_from_max_deviation: round_to(stats.slope_from_max, 3),
        slope_from_min_deviation: round_to(stats.slope_from_min, 3),
        all_deviations: stats.all_deviations,
        last_carb_time: entries.first().map(|entry| entry.timestamp),
    };
    tracing::debug!(
        "meal: {}g entered, COB {}g, current deviation {}",
        meal.carbs,
        meal.meal_cob,
        meal.current_deviation
    );
    Ok(meal)
}

/// Carb entries in `(after, until]`, newest first.
fn carb_entries(treatments: &[Treatment], after: i64, until: i64) -> Result<Vec<CarbEntry>> {
    let mut entries = Vec::new();
    for treatment in treatments {
        if let Treatment::Carbs { timestamp, grams } = *treatment {
            if !(grams.is_finite() && grams >= 0.0) {
                return Err(Error::InvalidTreatment(format!(
                    "carb entry at {} has {} g",
                    timestamp, grams
                )));
            }
            if timestamp > after && timestamp <= until && grams >= MIN_CARB_ENTRY {
                entries.push(CarbEntry { timestamp, grams });
            }
        }
    }
    entries.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then(b.grams.total_cmp(&a.grams))
    });
    Ok(entries)
}

/// Grams absorbed by deviations after `meal_time`.
fn absorbed_since(
    profile: &Profile,
    points: &[DeviationPoint],
    meal_time: i64,
    clock: i64,
) -> Result<f64> {
    let mut absorbed = 0.0;
    for point in points
        .iter()
        .filter(|p| p.timestamp > meal_time && p.timestamp <= clock)
    {
        let impact = carb_impact(point.deviation, profile.min_5m_carbimpact);
        if impact > 0.0 {
            let carb_ratio = profile::carb_ratio_at(profile, point.timestamp)?;
            absorbed += impact * carb_ratio / point.isf;
        }
    }
    Ok(absorbed)
}

struct DeviationStats {
    current_deviation: Option<f64>,
    max_deviation: f64,
    min_deviation: f64,
    slope_from_max: f64,
    slope_from_min: f64,
    all_deviations: Vec<f64>,
}

impl DeviationStats {
    /// Statistics over the newest points, relative to the newest one.
    fn from_points(points: &[DeviationPoint], clock: i64) -> Self {
        let recent = points
            .iter()
            .filter(|p| p.timestamp >= clock - STATS_WINDOW_MINUTES * MINUTE_MS);

        let mut stats = DeviationStats {
            current_deviation: None,
            max_deviation: 0.0,
            min_deviation: NO_MIN_DEVIATION,
            slope_from_max: 0.0,
            slope_from_min: NO_MIN_DEVIATION,
            all_deviations: Vec::new(),
        };

        for point in recent {
            let Some(current) = stats.current_deviation else {
                stats.current_deviation = Some(point.avg_deviation);
                stats.all_deviations.push(round_to(point.avg_deviation, 0));
                continue;
            };

            let minutes_before = (clock - point.timestamp) as f64 / MINUTE_MS as f64;
            let slope = if minutes_before > 0.0 {
                (current - point.avg_deviation) / minutes_before * 5.0
            } else {
                0.0
            };
            if point.avg_deviation > stats.max_deviation {
                stats.slope_from_max = slope.min(0.0);
                stats.max_deviation = point.avg_deviation;
            }
            if point.avg_deviation < stats.min_deviation {
                stats.slope_from_min = slope.max(0.0);
                stats.min_deviation = point.avg_deviation;
            }
            stats.all_deviations.push(round_to(point.avg_deviation, 0));
        }

        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insulin::InsulinCurve;

    const T0: i64 = 1_704_067_200_000;

    fn profile() -> Profile {
        Profile::new(3.0, 1.0, 50.0, 10.0).with_curve(InsulinCurve::Bilinear)
    }

    fn readings(values: impl Fn(i64) -> f64, count: i64) -> Vec<GlucoseReading> {
        (0..count)
            .map(|i| GlucoseReading {
                timestamp: T0 - i * 5 * MINUTE_MS,
                glucose: values(i),
                noise: 0,
                device: None,
            })
            .collect()
    }

    fn carbs(minutes_ago: i64, grams: f64) -> Treatment {
        Treatment::Carbs {
            timestamp: T0 - minutes_ago * MINUTE_MS,
            grams,
        }
    }

    #[test]
    fn test_no_carbs_no_cob() {
        let meal = calculate(&profile(), &[], &readings(|_| 100.0, 24), T0).unwrap();
        assert_eq!(meal.meal_cob, 0.0);
        assert_eq!(meal.carbs, 0.0);
        assert_eq!(meal.last_carb_time, None);
    }

    #[test]
    fn test_flat_glucose_absorbs_nothing() {
        let history = vec![carbs(30, 30.0)];
        let meal = calculate(&profile(), &history, &readings(|_| 100.0, 24), T0).unwrap();
        assert_eq!(meal.meal_cob, 30.0);
        assert_eq!(meal.current_deviation, 0.0);
        assert_eq!(meal.last_carb_time, Some(T0 - 30 * MINUTE_MS));
    }

    #[test]
    fn test_rising_glucose_absorbs_carbs() {
        // +10 mg/dL per 5 min, 10 g/U over 50 mg/dL/U absorbs 2 g per bucket
        let history = vec![carbs(60, 30.0)];
        let rising = readings(|i| 250.0 - 10.0 * i as f64, 20);
        let meal = calculate(&profile(), &history, &rising, T0).unwrap();
        assert_eq!(meal.meal_cob, 6.0);
        assert_eq!(meal.current_deviation, 10.0);
    }

    #[test]
    fn test_small_and_negative_deviations_do_not_absorb() {
        let history = vec![carbs(60, 30.0)];
        let falling = readings(|i| 100.0 + 3.0 * i as f64, 20);
        let meal = calculate(&profile(), &history, &falling, T0).unwrap();
        assert_eq!(meal.meal_cob, 30.0);

        let slow_rise = readings(|i| 200.0 - 5.0 * i as f64, 20);
        let meal = calculate(&profile(), &history, &slow_rise, T0).unwrap();
        assert_eq!(meal.meal_cob, 30.0);
    }

    #[test]
    fn test_cob_capped_at_max_cob() {
        let history = vec![carbs(10, 200.0)];
        let meal = calculate(&profile(), &history, &readings(|_| 100.0, 24), T0).unwrap();
        assert_eq!(meal.meal_cob, 120.0);
    }

    #[test]
    fn test_old_carbs_leave_the_window() {
        let history = vec![carbs(7 * 60, 50.0)];
        let meal = calculate(&profile(), &history, &readings(|_| 100.0, 24), T0).unwrap();
        assert_eq!(meal.meal_cob, 0.0);
        assert_eq!(meal.carbs, 0.0);
    }

    #[test]
    fn test_missing_recent_glucose_zeroes_cob() {
        let history = vec![carbs(60, 40.0)];
        let stale: Vec<_> = readings(|_| 100.0, 40).into_iter().skip(18).collect();
        let meal = calculate(&profile(), &history, &stale, T0).unwrap();
        assert_eq!(meal.meal_cob, 0.0);
    }

    #[test]
    fn test_idempotent() {
        let history = vec![carbs(45, 25.0), carbs(90, 10.0)];
        let data = readings(|i| 180.0 - 4.0 * i as f64, 30);
        let first = calculate(&profile(), &history, &data, T0).unwrap();
        let second = calculate(&profile(), &history, &data, T0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rounded_cob_never_exceeds_entered_carbs() {
        let history = vec![carbs(0, 12.73)];
        let meal = calculate(&profile(), &history, &readings(|_| 100.0, 24), T0).unwrap();
        assert!(meal.meal_cob <= 12.73, "{}", meal.meal_cob);
        assert!(meal.meal_cob > 12.0);
    }

    #[test]
    fn test_carb_impact_floor() {
        assert_eq!(carb_impact(12.0, 8.0), 12.0);
        assert_eq!(carb_impact(7.9, 8.0), 0.0);
        assert_eq!(carb_impact(-20.0, 8.0), 0.0);
    }
}
