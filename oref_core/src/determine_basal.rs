//! Temp basal and microbolus recommendation.
//!
//! Stages run in order and any of them may end the run early:
//! 1. input checks (glucose freshness and quality, pump history agreement)
//! 2. effective sensitivity (temp target, autosens, dynamic ISF)
//! 3. BG prediction
//! 4. temp basal decision
//! 5. microbolus decision
//! 6. final safety clamp
//!
//! A failed stage produces an error result with no rate and no units.

use crate::config::EngineSettings;
use crate::dynamic_isf::{DynamicIsf, DynamicIsfInput};
use crate::insulin;
use crate::predictions::{self, PredictionInput};
use crate::profile;
use crate::rounding::{round_basal, round_to};
use crate::safety::{self, append, SafetyLimits, TempBasalSetter};
use crate::smb::{self, MicroBolusInput, SmbContext};
use crate::{
    AutosensResult, CurrentTemp, DetermineBasalResult, Error, GlucoseStatus, IobProjection,
    MealData, Profile, ProfileSnapshot, Result, MINUTE_MS,
};

/// Temp targets above this raise sensitivity, below lower it.
const NORMAL_TARGET: f64 = 100.0;
/// Lowest BG target sensitivity adjustments may produce.
const MIN_ADJUSTED_TARGET: f64 = 80.0;
/// Highest target the noisy-CGM multiplier may produce.
const MAX_NOISY_TARGET: f64 = 200.0;
/// CGM noise level at which targets are raised.
const NOISY_CGM: u8 = 2;
/// CGM noise level at which data is rejected.
const UNUSABLE_CGM: u8 = 3;

/// Everything one run looks at. Built by [`crate::engine::recommend`] or by
/// a host that computes the pieces itself.
#[derive(Clone, Copy, Debug)]
pub struct DetermineBasalInputs<'a> {
    pub clock: i64,
    pub profile: &'a Profile,
    /// Profile resolved at the clock, temp targets applied
    pub snapshot: &'a ProfileSnapshot,
    pub glucose: &'a GlucoseStatus,
    pub current_temp: &'a CurrentTemp,
    pub iob: &'a IobProjection,
    pub meal: &'a MealData,
    pub autosens: Option<&'a AutosensResult>,
    /// Insulin delivered over the last 24 hours, for dynamic ISF
    pub tdd_24h: Option<f64>,
    pub microbolus_allowed: bool,
    pub settings: &'a EngineSettings,
}

/// Run every stage. Errors become a failure result.
pub fn determine_basal(inputs: &DetermineBasalInputs<'_>) -> DetermineBasalResult {
    let outcome = decide(inputs).and_then(|(mut result, limits)| {
        safety::enforce(&mut result, &limits)?;
        Ok(result)
    });

    match outcome {
        Ok(result) => {
            tracing::info!(
                "recommendation: rate {:?} for {:?} min, units {:?}",
                result.rate,
                result.duration,
                result.units
            );
            result
        }
        Err(err) => {
            tracing::warn!("no recommendation: {}", err);
            DetermineBasalResult::failure(&err)
        }
    }
}

// ============================================================================
// Stage 1: input checks
// ============================================================================

fn check_glucose(glucose: &GlucoseStatus, clock: i64, settings: &EngineSettings) -> Result<()> {
    let bg = glucose.glucose;
    if bg <= 10.0 || bg == crate::glucose::SENSOR_ERROR_CEILING || glucose.noise >= UNUSABLE_CGM {
        return Err(Error::StaleOrMissingGlucose(format!(
            "CGM is calibrating, in ??? state, or noise is high (BG {}, noise {})",
            bg, glucose.noise
        )));
    }

    let minutes_ago = round_to((clock - glucose.timestamp) as f64 / MINUTE_MS as f64, 1);
    if minutes_ago > settings.max_glucose_age_minutes
        || minutes_ago < -settings.max_glucose_future_minutes
    {
        return Err(Error::StaleOrMissingGlucose(format!(
            "BG data is too old or in the future ({} minutes ago)",
            minutes_ago
        )));
    }

    if glucose.short_avgdelta == 0.0 && glucose.long_avgdelta == 0.0 {
        return Err(Error::StaleOrMissingGlucose(
            "CGM data is unchanged for the past ~45m".into(),
        ));
    }
    Ok(())
}

/// Reason to cancel when the pump's running temp disagrees with history.
fn pump_history_mismatch(inputs: &DetermineBasalInputs<'_>) -> Option<String> {
    let last = inputs.iob.last_temp.as_ref()?;
    let current = inputs.current_temp;
    if current.duration <= 0.0 {
        return None;
    }

    let last_temp_age = round_to((inputs.clock - last.started_at) as f64 / MINUTE_MS as f64, 0);
    if current.rate != last.rate && last_temp_age > 10.0 {
        return Some(format!(
            "Warning: current temp {} != last temp {} from pump history; canceling temp",
            current.rate, last.rate
        ));
    }

    let ended_ago = last_temp_age - last.duration_minutes;
    if ended_ago > 5.0 && last_temp_age > 10.0 {
        return Some(format!(
            "Warning: pump reports a running temp but the last recorded temp ended {}m ago; canceling temp",
            ended_ago
        ));
    }
    None
}

// ============================================================================
// Stage 2: effective sensitivity
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
struct Sensitivity {
    ratio: f64,
    /// Basal after the ratio, pump-rounded
    basal: f64,
    sens: f64,
    variable_sens: Option<f64>,
    min_bg: f64,
    max_bg: f64,
    target_bg: f64,
    notes: Vec<String>,
}

fn effective_sensitivity(inputs: &DetermineBasalInputs<'_>) -> Result<Sensitivity> {
    let profile = inputs.profile;
    let snapshot = inputs.snapshot;
    let temp_target_set = snapshot.temp_target_set;
    let mut notes = Vec::new();
    let mut min_bg = snapshot.min_bg;
    let mut max_bg = snapshot.max_bg;
    let mut target_bg = snapshot.target_bg;

    let raises_sensitivity = profile.high_temp_target_raises_sensitivity || profile.exercise_mode;
    let mut ratio = 1.0;
    if (raises_sensitivity && temp_target_set && target_bg > NORMAL_TARGET)
        || (profile.low_temp_target_lowers_sensitivity
            && temp_target_set
            && target_bg < NORMAL_TARGET)
    {
        // a temp target at half_basal_exercise_target gives a ratio of 0.5
        let c = profile.half_basal_exercise_target - NORMAL_TARGET;
        let denominator = c + target_bg - NORMAL_TARGET;
        ratio = if c * denominator <= 0.0 {
            profile.autosens_max
        } else {
            (c / denominator).min(profile.autosens_max)
        };
        ratio = round_to(ratio, 2);
        notes.push(format!(
            "from target of {} set sensitivity ratio to {}",
            target_bg, ratio
        ));
    } else if let Some(autosens) = inputs.autosens {
        ratio = autosens.ratio;
        notes.push(format!("Autosens ratio: {}", ratio));
    }
    if !(ratio.is_finite() && ratio > 0.0) {
        return Err(Error::Computation(format!(
            "sensitivity ratio {} is not positive",
            ratio
        )));
    }

    let basal = round_basal(snapshot.basal * ratio, profile.pump_model.as_deref());
    if basal != snapshot.basal {
        notes.push(format!(
            "Adjusting basal from {} to {}",
            snapshot.basal, basal
        ));
    }

    if !temp_target_set
        && ((profile.sensitivity_raises_target && ratio < 1.0)
            || (profile.resistance_lowers_target && ratio > 1.0))
    {
        min_bg = round_to((min_bg - 60.0) / ratio, 0) + 60.0;
        max_bg = round_to((max_bg - 60.0) / ratio, 0) + 60.0;
        let new_target = (round_to((target_bg - 60.0) / ratio, 0) + 60.0).max(MIN_ADJUSTED_TARGET);
        if new_target != target_bg {
            notes.push(format!("target_bg from {} to {}", target_bg, new_target));
            target_bg = new_target;
        }
    }

    if inputs.glucose.noise >= NOISY_CGM {
        let multiplier = profile.noisy_cgm_target_multiplier.max(1.1);
        min_bg = round_to((min_bg * multiplier).min(MAX_NOISY_TARGET), 0);
        target_bg = round_to((target_bg * multiplier).min(MAX_NOISY_TARGET), 0);
        max_bg = round_to((max_bg * multiplier).min(MAX_NOISY_TARGET), 0);
        notes.push(format!("Raising target_bg to {} for noisy CGM", target_bg));
    }

    let mut sens = round_to(snapshot.isf / ratio, 1);
    if sens != snapshot.isf {
        notes.push(format!("ISF from {} to {}", snapshot.isf, sens));
    }

    let mut variable_sens = None;
    if let Some(dynamic) = DynamicIsf::from_profile(profile) {
        match inputs.tdd_24h {
            Some(tdd_24h) => {
                let peak = insulin::sensitivity_peak(profile)?;
                let input = DynamicIsfInput {
                    bg: inputs.glucose.glucose,
                    target_bg,
                    profile_isf: snapshot.isf,
                    tdd_24h,
                    insulin_peak_minutes: peak,
                };
                if let Some(outcome) = dynamic.apply(&input)? {
                    sens = outcome.isf;
                    variable_sens = Some(outcome.isf);
                    notes.push(format!(
                        "Dynamic ISF ({:?}): ratio {}, ISF {}, TDD {}",
                        dynamic.mode(),
                        outcome.ratio,
                        outcome.isf,
                        outcome.weighted_tdd
                    ));
                }
            }
            None => notes.push("Dynamic ISF skipped: no TDD".to_string()),
        }
    }

    tracing::debug!(
        "sensitivity ratio {}, basal {}, ISF {}, target {}",
        ratio,
        basal,
        sens,
        target_bg
    );

    Ok(Sensitivity {
        ratio,
        basal,
        sens,
        variable_sens,
        min_bg,
        max_bg,
        target_bg,
        notes,
    })
}

// ============================================================================
// Stages 3-5
// ============================================================================

/// Keep a running temp that already matches basal, otherwise set basal.
fn keep_or_set_basal(temps: &TempBasalSetter<'_>, basal: f64, result: &mut DetermineBasalResult) {
    if temps.current_temp.duration > 15.0 && temps.matches_current(basal) {
        append(
            result,
            format!(
                "temp {} ~ basal {}, no temp required",
                temps.current_temp.rate, basal
            ),
        );
    } else {
        append(result, format!("setting current basal of {} as temp", basal));
        temps.set(basal, 30.0, result);
    }
}

fn format_tick(delta: f64) -> String {
    let rounded = round_to(delta, 0);
    if delta > -0.5 {
        format!("+{}", rounded)
    } else {
        format!("{}", rounded)
    }
}

fn decide(inputs: &DetermineBasalInputs<'_>) -> Result<(DetermineBasalResult, SafetyLimits)> {
    let profile = inputs.profile;
    let snapshot = inputs.snapshot;
    let glucose = inputs.glucose;
    let meal = inputs.meal;
    let current_temp = inputs.current_temp;
    let clock = inputs.clock;
    let pump_model = profile.pump_model.as_deref();

    profile::validate(profile)?;
    check_glucose(glucose, clock, inputs.settings)?;
    let now = inputs
        .iob
        .now()
        .ok_or_else(|| Error::Computation("IOB projection has no ticks".into()))?;
    let iob = &now.actual;
    let bg = glucose.glucose;
    let scheduled_basal = snapshot.basal;
    if !(scheduled_basal.is_finite() && scheduled_basal > 0.0) {
        return Err(Error::InvalidProfile(format!(
            "no positive basal scheduled at {}",
            clock
        )));
    }

    let limits = SafetyLimits::new(profile, snapshot, iob.iob);
    let temps = TempBasalSetter {
        profile,
        scheduled_basal,
        max_safe_basal: limits.max_safe_basal,
        current_temp,
    };
    let mut result = DetermineBasalResult {
        bg: Some(bg),
        iob: Some(iob.iob),
        cob: Some(meal.meal_cob),
        deliver_at: Some(clock),
        ..DetermineBasalResult::default()
    };

    if let Some(mismatch) = pump_history_mismatch(inputs) {
        tracing::warn!("{}", mismatch);
        append(&mut result, mismatch);
        temps.cancel(&mut result);
        return Ok((result, limits));
    }

    let sensitivity = effective_sensitivity(inputs)?;
    for note in &sensitivity.notes {
        append(&mut result, note);
    }
    let Sensitivity {
        ratio,
        basal,
        sens,
        min_bg,
        max_bg,
        target_bg,
        ..
    } = sensitivity;

    // Stage 3: predictions
    let min_delta = glucose.delta.min(glucose.short_avgdelta);
    let min_avg_delta = glucose.short_avgdelta.min(glucose.long_avgdelta);
    let max_delta = glucose
        .delta
        .max(glucose.short_avgdelta)
        .max(glucose.long_avgdelta);

    let bgi = round_to(-iob.activity * sens * 5.0, 2);
    let mut deviation = round_to(6.0 * (min_delta - bgi), 0);
    if deviation < 0.0 {
        deviation = round_to(6.0 * (min_avg_delta - bgi), 0);
        if deviation < 0.0 {
            deviation = round_to(6.0 * (glucose.long_avgdelta - bgi), 0);
        }
    }
    let naive_eventual_bg = if iob.iob > 0.0 {
        round_to(bg - iob.iob * sens, 0)
    } else {
        round_to(bg - iob.iob * sens.min(snapshot.isf), 0)
    };
    let threshold = min_bg - 0.5 * (min_bg - 40.0);

    let forecast = predictions::forecast(&PredictionInput {
        bg,
        clock,
        ticks: &inputs.iob.ticks,
        meal,
        sens,
        carb_ratio: snapshot.carb_ratio,
        sensitivity_ratio: ratio,
        min_delta,
        bgi,
        target_bg,
        threshold,
        enable_uam: profile.enable_uam,
        remaining_carbs_cap: profile.remaining_carbs_cap,
        remaining_carbs_fraction: profile.remaining_carbs_fraction,
    });
    let eventual_bg = forecast.eventual_bg;
    let min_guard_bg = forecast.min_guard_bg;
    let min_pred_bg = forecast.min_pred_bg;
    let expected_delta = round_to(bgi + (target_bg - eventual_bg) / 24.0, 1);

    result.tick = Some(format_tick(glucose.delta));
    result.eventual_bg = Some(eventual_bg);
    result.target_bg = Some(target_bg);
    result.threshold = Some(round_to(threshold, 0));
    result.sensitivity_ratio = Some(ratio);
    result.variable_sens = sensitivity.variable_sens;
    result.predictions = Some(forecast.predictions.clone());

    let mut summary = format!(
        "COB: {}, Dev: {}, BGI: {}, ISF: {}, CR: {}, Target: {}, minPredBG {}, minGuardBG {}, IOBpredBG {}",
        meal.meal_cob,
        deviation,
        bgi,
        sens,
        snapshot.carb_ratio,
        target_bg,
        min_pred_bg,
        min_guard_bg,
        forecast.last_iob_pred_bg
    );
    if let Some(cob_pred) = forecast.last_cob_pred_bg {
        summary.push_str(&format!(", COBpredBG {}", cob_pred));
    }
    if let Some(uam_pred) = forecast.last_uam_pred_bg {
        summary.push_str(&format!(", UAMpredBG {}", uam_pred));
    }
    append(&mut result, summary);

    // Stage 5 gates are needed before the temp decision
    let decision = smb::evaluate(&SmbContext {
        profile,
        meal,
        bg,
        target_bg,
        temp_target_set: snapshot.temp_target_set,
        microbolus_allowed: inputs.microbolus_allowed,
    });
    tracing::debug!("SMB gates: {:?}", decision.trail);
    append(&mut result, decision.summary());
    let mut enable_smb = decision.enabled;
    if enable_smb && min_guard_bg < threshold {
        append(
            &mut result,
            format!(
                "minGuardBG {} projected below {} - disabling SMB",
                min_guard_bg,
                round_to(threshold, 0)
            ),
        );
        enable_smb = false;
    }
    if enable_smb && max_delta > 0.2 * bg {
        append(
            &mut result,
            format!("maxDelta {} > 20% of BG {} - disabling SMB", max_delta, bg),
        );
        enable_smb = false;
    }
    let smb_active = inputs.microbolus_allowed && enable_smb;

    // carbs needed to stay above threshold
    let mut carbs_req_bg = naive_eventual_bg;
    if carbs_req_bg < 40.0 {
        carbs_req_bg = carbs_req_bg.min(min_guard_bg);
    }
    let minutes_above_threshold = forecast.minutes_above(threshold);
    let zero_temp_effect = scheduled_basal * sens * minutes_above_threshold / 60.0;
    let cob_for_carbs_req = (meal.meal_cob - 0.25 * meal.carbs).max(0.0);
    let carbs_req = round_to(
        (threshold - carbs_req_bg - zero_temp_effect) / forecast.csf - cob_for_carbs_req,
        0,
    );
    let carbs_required =
        carbs_req >= profile.carbs_req_threshold && minutes_above_threshold <= 45.0;
    if carbs_required {
        result.carbs_req = Some(carbs_req);
        append(
            &mut result,
            format!(
                "{} add'l carbs req w/in {}m",
                carbs_req, minutes_above_threshold
            ),
        );
    }

    // Stage 4: temp basal
    if bg < threshold
        && iob.iob < -scheduled_basal * 20.0 / 60.0
        && min_delta > 0.0
        && min_delta > expected_delta
    {
        append(
            &mut result,
            format!(
                "IOB {} < {} and minDelta {} > expectedDelta {}",
                iob.iob,
                round_to(-scheduled_basal * 20.0 / 60.0, 2),
                min_delta,
                expected_delta
            ),
        );
    } else if bg < threshold || min_guard_bg < threshold {
        append(
            &mut result,
            format!(
                "minGuardBG {} < threshold {}",
                min_guard_bg,
                round_to(threshold, 0)
            ),
        );
        let worst_case_insulin_req = (target_bg - min_guard_bg) / sens;
        let duration_req = round_to(60.0 * worst_case_insulin_req / scheduled_basal, 0);
        let duration_req = (round_to(duration_req / 30.0, 0) * 30.0).clamp(30.0, 120.0);
        temps.set(0.0, duration_req, &mut result);
        return Ok((result, limits));
    }

    if profile.skip_neutral_temps {
        let minute_of_hour = profile::local_minute_of_day(profile, clock)? % 60;
        if minute_of_hour >= 55 {
            append(
                &mut result,
                format!("Canceling temp at {}m past the hour", minute_of_hour),
            );
            temps.cancel(&mut result);
            return Ok((result, limits));
        }
    }

    if eventual_bg < min_bg {
        append(
            &mut result,
            format!("Eventual BG {} < {}", eventual_bg, min_bg),
        );
        if min_delta > expected_delta && min_delta > 0.0 && !carbs_required {
            if naive_eventual_bg < 40.0 {
                append(&mut result, "naive_eventualBG < 40");
                temps.set(0.0, 30.0, &mut result);
                return Ok((result, limits));
            }
            if glucose.delta > min_delta {
                let tick = result.tick.clone().unwrap_or_default();
                append(
                    &mut result,
                    format!("but Delta {} > expectedDelta {}", tick, expected_delta),
                );
            } else {
                append(
                    &mut result,
                    format!(
                        "but Min. Delta {} > Exp. Delta {}",
                        round_to(min_delta, 2),
                        expected_delta
                    ),
                );
            }
            keep_or_set_basal(&temps, basal, &mut result);
            return Ok((result, limits));
        }

        // twice the insulin shortfall, delivered as a lower rate over 30 min
        let mut insulin_req = round_to(2.0 * ((eventual_bg - target_bg) / sens).min(0.0), 2);
        let naive_insulin_req = round_to(((naive_eventual_bg - target_bg) / sens).min(0.0), 2);
        if min_delta < 0.0 && min_delta > expected_delta {
            insulin_req = round_to(insulin_req * (min_delta / expected_delta), 2);
        }
        let rate = round_basal(basal + 2.0 * insulin_req, pump_model);

        let insulin_scheduled = current_temp.duration * (current_temp.rate - basal) / 60.0;
        if insulin_scheduled < insulin_req.min(naive_insulin_req) - basal * 0.3 {
            append(
                &mut result,
                format!(
                    "{}m@{} is a lot less than needed",
                    current_temp.duration, current_temp.rate
                ),
            );
            temps.set(rate, 30.0, &mut result);
            return Ok((result, limits));
        }
        if current_temp.duration > 5.0 && rate >= current_temp.rate * 0.8 {
            append(
                &mut result,
                format!("temp {} >~ req {}U/hr", current_temp.rate, rate),
            );
            return Ok((result, limits));
        }
        if rate <= 0.0 {
            let worst_case_insulin_req = (target_bg - naive_eventual_bg) / sens;
            let mut duration_req = round_to(60.0 * worst_case_insulin_req / scheduled_basal, 0);
            if duration_req < 0.0 {
                duration_req = 0.0;
            } else {
                duration_req = (round_to(duration_req / 30.0, 0) * 30.0).clamp(0.0, 120.0);
            }
            if duration_req > 0.0 {
                append(
                    &mut result,
                    format!("setting {}m zero temp", duration_req),
                );
                temps.set(rate, duration_req, &mut result);
                return Ok((result, limits));
            }
        } else {
            append(&mut result, format!("setting {}U/hr", rate));
        }
        temps.set(rate, 30.0, &mut result);
        return Ok((result, limits));
    }

    if min_delta < expected_delta && !smb_active {
        if glucose.delta < min_delta {
            let tick = result.tick.clone().unwrap_or_default();
            append(
                &mut result,
                format!(
                    "Eventual BG {} > {} but Delta {} < Exp. Delta {}",
                    eventual_bg, min_bg, tick, expected_delta
                ),
            );
        } else {
            append(
                &mut result,
                format!(
                    "Eventual BG {} > {} but Min. Delta {} < Exp. Delta {}",
                    eventual_bg,
                    min_bg,
                    round_to(min_delta, 2),
                    expected_delta
                ),
            );
        }
        keep_or_set_basal(&temps, basal, &mut result);
        return Ok((result, limits));
    }

    if eventual_bg.min(min_pred_bg) < max_bg && !smb_active {
        append(
            &mut result,
            format!(
                "{}-{} in range: no temp required",
                eventual_bg, min_pred_bg
            ),
        );
        keep_or_set_basal(&temps, basal, &mut result);
        return Ok((result, limits));
    }

    if eventual_bg >= max_bg {
        append(
            &mut result,
            format!("Eventual BG {} >= {}", eventual_bg, max_bg),
        );
    }
    if iob.iob > profile.max_iob {
        append(
            &mut result,
            format!("IOB {} > max_iob {}", iob.iob, profile.max_iob),
        );
        keep_or_set_basal(&temps, basal, &mut result);
        return Ok((result, limits));
    }

    // insulin to bring the lower of minPredBG and eventual BG down to target
    let mut insulin_req = round_to((min_pred_bg.min(eventual_bg) - target_bg) / sens, 2);
    if insulin_req > profile.max_iob - iob.iob {
        append(&mut result, format!("max_iob {}", profile.max_iob));
        insulin_req = profile.max_iob - iob.iob;
    }
    let mut rate = round_basal(basal + 2.0 * insulin_req, pump_model);
    let insulin_req = round_to(insulin_req, 3);
    result.insulin_req = Some(insulin_req);

    // Stage 5: microbolus
    if smb_active && bg > threshold {
        let minutes_since_last_bolus = inputs
            .iob
            .last_bolus_time
            .map(|t| round_to((clock - t) as f64 / MINUTE_MS as f64, 1))
            .unwrap_or(f64::MAX);
        let plan = smb::plan(
            profile,
            &MicroBolusInput {
                insulin_req,
                iob: iob.iob,
                meal_cob: meal.meal_cob,
                carb_ratio: snapshot.carb_ratio,
                scheduled_basal,
                basal,
                target_bg,
                naive_eventual_bg,
                min_iob_pred_bg: forecast.min_iob_pred_bg,
                sens,
                minutes_since_last_bolus,
            },
        );

        let mut note = format!("insulinReq {}", insulin_req);
        if plan.units >= plan.max_bolus {
            note.push_str(&format!("; maxBolus {}", plan.max_bolus));
        }
        if plan.low_temp_minutes > 0.0 {
            note.push_str(&format!(
                "; setting {}m low temp of {}U/h",
                plan.low_temp_minutes, plan.low_temp_rate
            ));
        }
        append(&mut result, note);

        match plan.wait {
            None => {
                if let Some(units) = plan.deliverable_units() {
                    result.units = Some(units);
                    append(&mut result, format!("Microbolusing {}U", units));
                }
            }
            Some((minutes, seconds)) => append(
                &mut result,
                format!("Waiting {}m {}s to microbolus again", minutes, seconds),
            ),
        }

        if plan.low_temp_minutes > 0.0 {
            result.rate = Some(plan.low_temp_rate);
            result.duration = Some(plan.low_temp_minutes);
            return Ok((result, limits));
        }
    }

    if rate > limits.max_safe_basal {
        append(
            &mut result,
            format!(
                "adj. req. rate: {} to maxSafeBasal: {}",
                rate,
                round_to(limits.max_safe_basal, 2)
            ),
        );
        rate = round_basal(limits.max_safe_basal, pump_model);
    }

    let insulin_scheduled = current_temp.duration * (current_temp.rate - basal) / 60.0;
    if insulin_scheduled >= insulin_req * 2.0 {
        append(
            &mut result,
            format!(
                "{}m@{} > 2 * insulinReq. Setting temp basal of {}U/hr",
                current_temp.duration, current_temp.rate, rate
            ),
        );
        temps.set(rate, 30.0, &mut result);
        return Ok((result, limits));
    }
    if current_temp.duration <= 0.0 {
        append(&mut result, format!("no temp, setting {}U/hr", rate));
        temps.set(rate, 30.0, &mut result);
        return Ok((result, limits));
    }
    if current_temp.duration > 5.0
        && round_basal(rate, pump_model) <= round_basal(current_temp.rate, pump_model)
    {
        append(
            &mut result,
            format!("temp {} >~ req {}U/hr", current_temp.rate, rate),
        );
        return Ok((result, limits));
    }

    append(
        &mut result,
        format!("temp {} < {}U/hr", current_temp.rate, rate),
    );
    temps.set(rate, 30.0, &mut result);
    Ok((result, limits))
}
