//! Basal and bolus limits.
//!
//! Every temp the decision tree proposes goes through [`TempBasalSetter`], and
//! the finished result goes through [`enforce`] once more after rounding so
//! that nothing leaves the engine above the configured ceilings.

use crate::rounding::{floor_to_increment, round_basal, round_to};
use crate::{CurrentTemp, DetermineBasalResult, Error, Profile, ProfileSnapshot, Result};

/// Highest rate allowed right now: the configured max basal, a multiple of the
/// highest daily basal, and a multiple of the current scheduled basal.
pub fn max_safe_basal(profile: &Profile, snapshot: &ProfileSnapshot) -> f64 {
    profile
        .max_basal
        .min(profile.max_daily_safety_multiplier * snapshot.max_daily_basal)
        .min(profile.current_basal_safety_multiplier * snapshot.basal)
}

/// Ceilings checked against the finished result.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SafetyLimits {
    pub max_safe_basal: f64,
    pub max_iob: f64,
    pub current_iob: f64,
    pub bolus_increment: f64,
}

impl SafetyLimits {
    pub fn new(profile: &Profile, snapshot: &ProfileSnapshot, current_iob: f64) -> Self {
        Self {
            max_safe_basal: max_safe_basal(profile, snapshot),
            max_iob: profile.max_iob,
            current_iob,
            bolus_increment: profile.bolus_increment,
        }
    }

    /// Largest bolus that keeps IOB at or below max IOB.
    pub fn max_bolus(&self) -> f64 {
        floor_to_increment((self.max_iob - self.current_iob).max(0.0), self.bolus_increment)
    }
}

/// Turns a requested rate into a temp basal on the result.
#[derive(Clone, Copy, Debug)]
pub struct TempBasalSetter<'a> {
    pub profile: &'a Profile,
    /// Scheduled basal at the clock
    pub scheduled_basal: f64,
    pub max_safe_basal: f64,
    pub current_temp: &'a CurrentTemp,
}

impl TempBasalSetter<'_> {
    fn round(&self, rate: f64) -> f64 {
        round_basal(rate, self.profile.pump_model.as_deref())
    }

    /// True when `rate` rounds to the same pump rate as the running temp.
    pub fn matches_current(&self, rate: f64) -> bool {
        self.round(rate) == self.round(self.current_temp.rate)
    }

    /// Request `rate` for `duration` minutes.
    ///
    /// Leaves the result unchanged when the running temp is already close
    /// enough, and honours `skip_neutral_temps` for rates equal to the
    /// scheduled basal.
    pub fn set(&self, rate: f64, duration: f64, result: &mut DetermineBasalResult) {
        let suggested = self.round(rate.clamp(0.0, self.max_safe_basal.max(0.0)));
        let current = self.current_temp;

        if current.duration > duration - 10.0
            && current.duration <= 120.0
            && suggested <= current.rate * 1.2
            && suggested >= current.rate * 0.8
            && duration > 0.0
        {
            append(
                result,
                format!(
                    "{}m left and {} ~ req {}U/hr: no temp required",
                    current.duration, current.rate, suggested
                ),
            );
            return;
        }

        if suggested == self.scheduled_basal {
            if self.profile.skip_neutral_temps {
                if current.duration > 0.0 {
                    append(
                        result,
                        "Suggested rate is same as profile rate, a temp basal is active, canceling current temp",
                    );
                    self.cancel(result);
                } else {
                    append(
                        result,
                        "Suggested rate is same as profile rate, no temp basal is active, doing nothing",
                    );
                }
                return;
            }
            append(
                result,
                format!("Setting neutral temp basal of {}U/hr", self.scheduled_basal),
            );
        }

        result.rate = Some(suggested);
        result.duration = Some(duration);
    }

    /// Cancel any running temp.
    pub fn cancel(&self, result: &mut DetermineBasalResult) {
        result.rate = Some(0.0);
        result.duration = Some(0.0);
    }
}

/// Append a sentence to the result's reason.
pub fn append(result: &mut DetermineBasalResult, text: impl AsRef<str>) {
    let text = text.as_ref();
    if !result.reason.is_empty() && !result.reason.ends_with(' ') {
        result.reason.push_str("; ");
    }
    result.reason.push_str(text);
}

/// Final clamp after rounding. Any non-finite number is an error.
pub fn enforce(result: &mut DetermineBasalResult, limits: &SafetyLimits) -> Result<()> {
    let numbers = [
        result.rate,
        result.duration,
        result.units,
        result.eventual_bg,
        result.insulin_req,
        result.iob,
        result.cob,
    ];
    if numbers.iter().flatten().any(|value| !value.is_finite()) {
        return Err(Error::Computation(
            "decision contains a non-finite value".into(),
        ));
    }

    let mut notes = Vec::new();

    if let Some(rate) = result.rate {
        let ceiling = limits.max_safe_basal.max(0.0);
        if rate < 0.0 {
            notes.push(format!("rate {} raised to 0", rate));
            result.rate = Some(0.0);
        } else if rate > ceiling + 1e-9 {
            let capped = round_to(ceiling, 3);
            notes.push(format!("rate {} capped at {}", rate, capped));
            result.rate = Some(capped);
        }
    }

    if let Some(units) = result.units {
        let max_bolus = limits.max_bolus();
        if units > max_bolus {
            notes.push(format!("bolus {} capped at {}", units, max_bolus));
            result.units = if max_bolus > 0.0 { Some(max_bolus) } else { None };
        } else if units <= 0.0 {
            result.units = None;
        }
    }

    if !notes.is_empty() {
        let note = format!("Safety: {}", notes.join(", "));
        tracing::warn!("{}", note);
        append(result, note);
        result.safety_clamped = true;
    }
    Ok(())
}
