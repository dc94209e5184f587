//! Super-micro-bolus eligibility and sizing.
//!
//! Eligibility is an ordered list of gates. The first gate that enables or
//! disables decides; every gate consulted is kept so the reason can show how
//! the decision was reached.

use crate::rounding::{floor_to_increment, round_to};
use crate::{MealData, Profile};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmbGate {
    MicrobolusAllowed,
    HighTempTarget,
    Always,
    WithCob,
    AfterCarbs,
    WithTempTarget,
    HighBg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    Pass,
    Enable,
    Disable,
}

const GATES: [SmbGate; 7] = [
    SmbGate::MicrobolusAllowed,
    SmbGate::HighTempTarget,
    SmbGate::Always,
    SmbGate::WithCob,
    SmbGate::AfterCarbs,
    SmbGate::WithTempTarget,
    SmbGate::HighBg,
];

/// Temp targets above this count as high, below as low.
const NORMAL_TARGET: f64 = 100.0;

/// State the gates look at.
#[derive(Clone, Copy, Debug)]
pub struct SmbContext<'a> {
    pub profile: &'a Profile,
    pub meal: &'a MealData,
    pub bg: f64,
    pub target_bg: f64,
    pub temp_target_set: bool,
    pub microbolus_allowed: bool,
}

impl SmbGate {
    pub fn name(&self) -> &'static str {
        match self {
            SmbGate::MicrobolusAllowed => "microbolus allowed",
            SmbGate::HighTempTarget => "high temp target",
            SmbGate::Always => "always",
            SmbGate::WithCob => "with COB",
            SmbGate::AfterCarbs => "after carbs",
            SmbGate::WithTempTarget => "with low temp target",
            SmbGate::HighBg => "high BG",
        }
    }

    fn evaluate(&self, ctx: &SmbContext<'_>) -> GateOutcome {
        let profile = ctx.profile;
        let enable_if = |condition: bool| {
            if condition {
                GateOutcome::Enable
            } else {
                GateOutcome::Pass
            }
        };
        match self {
            SmbGate::MicrobolusAllowed => {
                if ctx.microbolus_allowed {
                    GateOutcome::Pass
                } else {
                    GateOutcome::Disable
                }
            }
            SmbGate::HighTempTarget => {
                if !profile.allow_smb_with_high_temp_target
                    && ctx.temp_target_set
                    && ctx.target_bg > NORMAL_TARGET
                {
                    GateOutcome::Disable
                } else {
                    GateOutcome::Pass
                }
            }
            SmbGate::Always => enable_if(profile.enable_smb_always),
            SmbGate::WithCob => enable_if(profile.enable_smb_with_cob && ctx.meal.meal_cob > 0.0),
            SmbGate::AfterCarbs => enable_if(profile.enable_smb_after_carbs && ctx.meal.carbs > 0.0),
            SmbGate::WithTempTarget => enable_if(
                profile.enable_smb_with_temp_target
                    && ctx.temp_target_set
                    && ctx.target_bg < NORMAL_TARGET,
            ),
            SmbGate::HighBg => enable_if(
                profile.enable_smb_high_bg && ctx.bg >= profile.enable_smb_high_bg_target,
            ),
        }
    }
}

/// Outcome of the gate walk.
#[derive(Clone, Debug, PartialEq)]
pub struct SmbDecision {
    pub enabled: bool,
    pub trail: Vec<(SmbGate, GateOutcome)>,
}

impl SmbDecision {
    /// e.g. "SMB enabled (always)" or "SMB disabled (no enabling condition)".
    pub fn summary(&self) -> String {
        match self.trail.last() {
            Some((gate, GateOutcome::Enable)) => format!("SMB enabled ({})", gate.name()),
            Some((gate, GateOutcome::Disable)) => format!("SMB disabled ({})", gate.name()),
            _ => "SMB disabled (no enabling condition)".to_string(),
        }
    }
}

pub fn evaluate(ctx: &SmbContext<'_>) -> SmbDecision {
    let mut trail = Vec::with_capacity(GATES.len());
    for gate in GATES {
        let outcome = gate.evaluate(ctx);
        trail.push((gate, outcome));
        match outcome {
            GateOutcome::Enable => return SmbDecision { enabled: true, trail },
            GateOutcome::Disable => return SmbDecision { enabled: false, trail },
            GateOutcome::Pass => {}
        }
    }
    SmbDecision {
        enabled: false,
        trail,
    }
}

/// Inputs for sizing one microbolus.
#[derive(Clone, Copy, Debug)]
pub struct MicroBolusInput {
    pub insulin_req: f64,
    pub iob: f64,
    pub meal_cob: f64,
    pub carb_ratio: f64,
    /// Scheduled basal at the clock
    pub scheduled_basal: f64,
    /// Basal after sensitivity adjustment
    pub basal: f64,
    pub target_bg: f64,
    pub naive_eventual_bg: f64,
    pub min_iob_pred_bg: f64,
    pub sens: f64,
    pub minutes_since_last_bolus: f64,
}

/// Bolus plus the low temp that accompanies it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MicroBolusPlan {
    pub units: f64,
    pub max_bolus: f64,
    pub low_temp_rate: f64,
    pub low_temp_minutes: f64,
    /// Minutes and seconds left before the next bolus may be given
    pub wait: Option<(f64, f64)>,
}

impl MicroBolusPlan {
    pub fn deliverable_units(&self) -> Option<f64> {
        match self.wait {
            None if self.units > 0.0 => Some(self.units),
            _ => None,
        }
    }
}

/// Half the insulin requirement, capped at a number of basal minutes and
/// floored to the pump's bolus increment.
pub fn plan(profile: &Profile, input: &MicroBolusInput) -> MicroBolusPlan {
    let meal_insulin_req = round_to(input.meal_cob / input.carb_ratio, 3);
    let basal_minutes = if input.iob > meal_insulin_req && input.iob > 0.0 {
        profile.max_uam_smb_basal_minutes
    } else {
        profile.max_smb_basal_minutes
    };
    let max_bolus = round_to(input.scheduled_basal * basal_minutes / 60.0, 1);
    let units = floor_to_increment(
        (input.insulin_req / 2.0).min(max_bolus).max(0.0),
        profile.bolus_increment,
    );

    // zero temp long enough to bring the worst case back to target
    let worst_case_insulin_req =
        (input.target_bg - (input.naive_eventual_bg + input.min_iob_pred_bg) / 2.0) / input.sens;
    let mut duration_req = round_to(60.0 * worst_case_insulin_req / input.scheduled_basal, 0);
    if input.insulin_req > 0.0 && units < profile.bolus_increment {
        duration_req = 0.0;
    }

    let mut low_temp_rate = 0.0;
    if duration_req <= 0.0 {
        duration_req = 0.0;
    } else if duration_req >= 30.0 {
        duration_req = (round_to(duration_req / 30.0, 0) * 30.0).clamp(0.0, 60.0);
    } else {
        low_temp_rate = round_to(input.basal * duration_req / 30.0, 2);
        duration_req = 30.0;
    }

    let interval = profile.smb_interval.clamp(1.0, 10.0);
    let wait = if input.minutes_since_last_bolus > interval {
        None
    } else {
        let remaining = interval - input.minutes_since_last_bolus;
        Some((
            round_to(remaining, 0),
            round_to(remaining * 60.0, 0) % 60.0,
        ))
    };

    MicroBolusPlan {
        units,
        max_bolus,
        low_temp_rate,
        low_temp_minutes: duration_req,
        wait,
    }
}
