//! Whole loop evaluation from a single request.
//!
//! Resolves the profile, derives glucose status, IOB, meal and sensitivity
//! from the request history, then runs determine-basal. Settings are passed
//! in; nothing here reads configuration or the wall clock.

use crate::autosens;
use crate::config::{AutosensSettings, EngineSettings};
use crate::determine_basal::{determine_basal, DetermineBasalInputs};
use crate::glucose;
use crate::insulin::CurveModel;
use crate::iob;
use crate::meal;
use crate::profile;
use crate::rounding::round_to;
use crate::{
    AutosensOverride, AutosensResult, DetermineBasalResult, DynamicIsfMode, Error, LoopRequest,
    MealData, Profile, Result, MINUTE_MS,
};

/// Recommendation for `request`. Any failure becomes an error result.
pub fn recommend(
    request: &LoopRequest,
    engine: &EngineSettings,
    autosens_settings: &AutosensSettings,
) -> DetermineBasalResult {
    match evaluate(request, engine, autosens_settings) {
        Ok(result) => result,
        Err(err) => {
            tracing::warn!("loop evaluation failed: {}", err);
            DetermineBasalResult::failure(&err)
        }
    }
}

fn evaluate(
    request: &LoopRequest,
    engine: &EngineSettings,
    autosens_settings: &AutosensSettings,
) -> Result<DetermineBasalResult> {
    let profile = &request.profile;
    let clock = request.clock;
    profile::validate(profile)?;

    let status = glucose::status(&request.glucose)?;
    let snapshot = profile::resolve(profile, &request.temp_targets, clock)?;
    let meal = meal::calculate(profile, &request.treatments, &request.glucose, clock)?;

    let horizon = prediction_horizon(profile, &meal, clock, engine)?;
    let projection = iob::project(
        profile,
        &request.treatments,
        clock,
        horizon,
        engine.zero_temp_minutes,
    )?;

    let sensitivity = match &request.autosens {
        Some(supplied) => Some(from_override(profile, snapshot.isf, supplied)?),
        None if autosens_settings.enabled => {
            Some(autosens::detect_lowest(request, autosens_settings)?)
        }
        None => None,
    };

    let tdd_24h = if profile.dynamic_isf == DynamicIsfMode::Off {
        None
    } else {
        Some(iob::total_daily_dose(profile, &request.treatments, clock)?)
    };

    tracing::debug!(
        "evaluating at {} with {} min horizon, autosens {:?}",
        clock,
        horizon,
        sensitivity.as_ref().map(|s| s.ratio)
    );

    Ok(determine_basal(&DetermineBasalInputs {
        clock,
        profile,
        snapshot: &snapshot,
        glucose: &status,
        current_temp: &request.current_temp,
        iob: &projection,
        meal: &meal,
        autosens: sensitivity.as_ref(),
        tdd_24h,
        microbolus_allowed: request.microbolus_allowed,
        settings: engine,
    }))
}

/// Longer of DIA and the remaining carb absorption window, capped.
pub fn prediction_horizon(
    profile: &Profile,
    meal: &MealData,
    clock: i64,
    engine: &EngineSettings,
) -> Result<i64> {
    let dia_minutes = CurveModel::from_profile(profile)?.dia_minutes();
    let absorption_minutes = meal
        .last_carb_time
        .map(|t| {
            let window_end = t + (profile.max_meal_absorption_time * 60.0) as i64 * MINUTE_MS;
            (window_end - clock) as f64 / MINUTE_MS as f64
        })
        .unwrap_or(0.0);
    let horizon = dia_minutes.max(absorption_minutes).ceil() as i64;
    Ok(horizon.min(engine.max_prediction_minutes).max(iob::TICK_MINUTES))
}

/// Host-supplied ratio, kept inside the autosens band.
fn from_override(profile: &Profile, isf: f64, supplied: &AutosensOverride) -> Result<AutosensResult> {
    if !(supplied.ratio.is_finite() && supplied.ratio > 0.0) {
        return Err(Error::InvalidInput(format!(
            "autosens ratio must be positive, got {}",
            supplied.ratio
        )));
    }
    let ratio = supplied
        .ratio
        .clamp(profile.autosens_min, profile.autosens_max);
    let mut result = AutosensResult::neutral(isf, 0.0, "supplied by host");
    result.ratio = ratio;
    result.new_isf = round_to(isf / ratio, 0);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CurrentTemp, GlucoseReading, Treatment};

    const T0: i64 = 1_704_067_200_000;

    fn request(glucose: impl Fn(i64) -> f64) -> LoopRequest {
        let mut profile = Profile::new(5.0, 1.0, 50.0, 10.0);
        profile.min_bg = 100.0;
        profile.max_bg = 110.0;
        profile.max_basal = 3.0;
        profile.max_iob = 2.0;
        LoopRequest {
            profile,
            treatments: Vec::new(),
            glucose: (0..48)
                .map(|i| GlucoseReading {
                    timestamp: T0 - i * 5 * MINUTE_MS,
                    glucose: glucose(i),
                    noise: 0,
                    device: None,
                })
                .collect(),
            current_temp: CurrentTemp::default(),
            clock: T0,
            temp_targets: Vec::new(),
            microbolus_allowed: false,
            autosens: None,
        }
    }

    fn run(request: &LoopRequest) -> DetermineBasalResult {
        recommend(request, &EngineSettings::default(), &AutosensSettings::default())
    }

    #[test]
    fn test_rising_high_bg_gets_high_temp() {
        crate::logging::init_test();
        let result = run(&request(|i| 220.0 - 2.0 * i as f64));
        assert!(!result.has_error(), "{}", result.reason);
        assert!(result.rate.unwrap() > 1.0);
        assert!(result.rate.unwrap() <= 3.0);
        assert_eq!(result.deliver_at, Some(T0));
        assert!(result.predictions.is_some());
    }

    #[test]
    fn test_no_glucose_is_error() {
        let mut req = request(|_| 100.0);
        req.glucose.clear();
        let result = run(&req);
        assert_eq!(result.error_kind.as_deref(), Some("stale_or_missing_glucose"));
        assert_eq!(result.rate, None);
        assert_eq!(result.units, None);
    }

    #[test]
    fn test_override_is_clamped() {
        let mut req = request(|i| 150.0 - i as f64);
        req.autosens = Some(AutosensOverride { ratio: 2.0 });
        let result = run(&req);
        assert_eq!(result.sensitivity_ratio, Some(1.2));

        req.autosens = Some(AutosensOverride { ratio: -1.0 });
        assert_eq!(run(&req).error_kind.as_deref(), Some("invalid_input"));
    }

    #[test]
    fn test_dynamic_isf_reports_variable_sens() {
        let mut req = request(|i| 180.0 - i as f64);
        req.profile.dynamic_isf = DynamicIsfMode::Logarithmic;
        req.treatments = (0..24)
            .map(|h| Treatment::Bolus {
                timestamp: T0 - (h * 60 + 30) * MINUTE_MS,
                units: 1.0,
            })
            .collect();
        let result = run(&req);
        assert!(!result.has_error(), "{}", result.reason);
        assert!(result.variable_sens.is_some());
        assert!(result.reason.contains("Dynamic ISF"));
    }

    #[test]
    fn test_logarithmic_dynamic_isf_with_bilinear_curve() {
        let mut req = request(|i| 180.0 - i as f64);
        req.profile.curve = crate::InsulinCurve::Bilinear;
        req.profile.dynamic_isf = DynamicIsfMode::Logarithmic;
        req.treatments = (0..24)
            .map(|h| Treatment::Bolus {
                timestamp: T0 - (h * 60 + 30) * MINUTE_MS,
                units: 1.0,
            })
            .collect();
        let result = run(&req);
        assert!(!result.has_error(), "{}", result.reason);
        assert!(result.variable_sens.is_some());
    }

    #[test]
    fn test_horizon_covers_carb_window() {
        let profile = Profile::new(5.0, 1.0, 50.0, 10.0);
        let engine = EngineSettings::default();
        let no_carbs = MealData::default();
        assert_eq!(prediction_horizon(&profile, &no_carbs, T0, &engine).unwrap(), 300);

        let fresh_carbs = MealData {
            carbs: 30.0,
            meal_cob: 30.0,
            last_carb_time: Some(T0),
            ..MealData::default()
        };
        assert_eq!(prediction_horizon(&profile, &fresh_carbs, T0, &engine).unwrap(), 360);
    }

    #[test]
    fn test_idempotent() {
        let mut req = request(|i| 160.0 - 1.5 * i as f64);
        req.treatments.push(Treatment::Bolus {
            timestamp: T0 - 45 * MINUTE_MS,
            units: 1.0,
        });
        assert_eq!(run(&req), run(&req));
    }
}
