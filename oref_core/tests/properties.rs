//! Property tests over the public engine entry points.

use oref_core::config::{AutosensSettings, EngineSettings};
use oref_core::insulin::CurveModel;
use oref_core::{autosens, iob, meal, recommend};
use oref_core::{CurrentTemp, GlucoseReading, InsulinCurve, LoopRequest, Profile, Treatment, MINUTE_MS};
use proptest::prelude::*;

const T0: i64 = 1_704_067_200_000;

fn profile(curve: InsulinCurve) -> Profile {
    let mut profile = Profile::new(5.0, 1.0, 50.0, 10.0).with_curve(curve);
    profile.min_bg = 100.0;
    profile.max_bg = 110.0;
    profile.max_basal = 3.0;
    profile.max_iob = 2.0;
    profile
}

/// Four hours of CGM data moving by `slope` per 5 minutes, never flat.
fn readings(start: f64, slope: f64) -> Vec<GlucoseReading> {
    (0..48)
        .map(|i| GlucoseReading {
            timestamp: T0 - i * 5 * MINUTE_MS,
            glucose: (start - slope * i as f64).clamp(40.0, 400.0),
            noise: 0,
            device: None,
        })
        .collect()
}

fn request(profile: Profile, glucose: Vec<GlucoseReading>, treatments: Vec<Treatment>) -> LoopRequest {
    LoopRequest {
        profile,
        treatments,
        glucose,
        current_temp: CurrentTemp::default(),
        clock: T0,
        temp_targets: Vec::new(),
        microbolus_allowed: false,
        autosens: None,
    }
}

fn curve() -> impl Strategy<Value = InsulinCurve> {
    prop_oneof![
        Just(InsulinCurve::Bilinear),
        Just(InsulinCurve::RapidActing),
        Just(InsulinCurve::UltraRapid),
    ]
}

fn slope() -> impl Strategy<Value = f64> {
    prop_oneof![-4.0..-0.5f64, 0.5..4.0f64]
}

proptest! {
    #[test]
    fn bolus_iob_stays_within_dose_and_decays(
        curve in curve(),
        units in 0.1..10.0f64,
        minutes in 0i64..360,
    ) {
        let profile = profile(curve);
        let history = [Treatment::Bolus { timestamp: T0, units }];
        let at = T0 + minutes * MINUTE_MS;

        let now = iob::calculate(&profile, &history, at).unwrap();
        let later = iob::calculate(&profile, &history, at + 5 * MINUTE_MS).unwrap();
        prop_assert!(now.iob >= 0.0);
        prop_assert!(now.iob <= units + 1e-9);
        prop_assert!(later.iob <= now.iob + 1e-9);
    }

    #[test]
    fn bolus_iob_starts_full_and_ends_at_dia(curve in curve(), units in 0.1..10.0f64) {
        let profile = profile(curve);
        let history = [Treatment::Bolus { timestamp: T0, units }];
        let dia_minutes = CurveModel::from_profile(&profile).unwrap().dia_minutes();

        let start = iob::calculate(&profile, &history, T0).unwrap();
        let end = iob::calculate(&profile, &history, T0 + dia_minutes as i64 * MINUTE_MS).unwrap();
        prop_assert!((start.iob - units).abs() <= 1e-2);
        prop_assert!(end.iob.abs() <= 1e-3);
    }

    #[test]
    fn autosens_ratio_inside_band(start in 80.0..250.0f64, slope in slope(), bolus in 0.0..3.0f64) {
        let treatments = vec![Treatment::Bolus { timestamp: T0 - 120 * MINUTE_MS, units: bolus }];
        let req = request(profile(InsulinCurve::RapidActing), readings(start, slope), treatments);
        let result = autosens::detect_lowest(&req, &AutosensSettings::default()).unwrap();
        prop_assert!(result.ratio >= req.profile.autosens_min - 1e-9);
        prop_assert!(result.ratio <= req.profile.autosens_max + 1e-9);
    }

    #[test]
    fn cob_never_negative_or_above_entered(
        grams in 5.0..100.0f64,
        minutes_ago in 0i64..300,
        slope in slope(),
    ) {
        let profile = profile(InsulinCurve::RapidActing);
        let treatments = vec![Treatment::Carbs { timestamp: T0 - minutes_ago * MINUTE_MS, grams }];
        let data = meal::calculate(&profile, &treatments, &readings(150.0, slope), T0).unwrap();
        prop_assert!(data.meal_cob >= 0.0);
        prop_assert!(data.meal_cob <= grams + 1e-9);
    }

    #[test]
    fn recommendation_respects_limits(
        start in 60.0..300.0f64,
        slope in slope(),
        bolus in 0.0..3.0f64,
        smb in any::<bool>(),
    ) {
        let mut profile = profile(InsulinCurve::RapidActing);
        profile.enable_smb_always = smb;
        profile.enable_uam = smb;
        let treatments = vec![Treatment::Bolus { timestamp: T0 - 30 * MINUTE_MS, units: bolus }];
        let mut req = request(profile, readings(start, slope), treatments);
        req.microbolus_allowed = smb;

        let engine = EngineSettings::default();
        let settings = AutosensSettings::default();
        let result = recommend(&req, &engine, &settings);
        prop_assert!(result.error.is_none(), "{}", result.reason);

        if let Some(rate) = result.rate {
            prop_assert!(rate >= 0.0);
            prop_assert!(rate <= req.profile.max_basal + 1e-9);
        }
        if let Some(units) = result.units {
            prop_assert!(smb);
            prop_assert!(units > 0.0);
            prop_assert!(result.iob.unwrap_or(0.0) + units <= req.profile.max_iob + 0.01);
        }

        prop_assert_eq!(result, recommend(&req, &engine, &settings));
    }
}
