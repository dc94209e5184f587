//! Core domain types for the dosing engine.
//!
//! Every timestamp is epoch milliseconds. Glucose values are mg/dL, insulin
//! is in units (U), rates are U/hr and carbs are grams.

use crate::insulin::InsulinCurve;
use serde::{Deserialize, Serialize};

/// One minute in epoch milliseconds.
pub const MINUTE_MS: i64 = 60_000;

// ============================================================================
// Profile
// ============================================================================

/// Scheduled basal rate starting `offset_minutes` after local midnight.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BasalEntry {
    pub offset_minutes: u32,
    pub rate: f64,
}

/// Scheduled insulin sensitivity (mg/dL per U).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IsfEntry {
    pub offset_minutes: u32,
    pub sensitivity: f64,
}

/// Scheduled carb ratio (g per U).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CarbRatioEntry {
    pub offset_minutes: u32,
    pub ratio: f64,
}

/// Scheduled target band.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TargetEntry {
    pub offset_minutes: u32,
    pub low: f64,
    pub high: f64,
}

/// Dynamic ISF strategy, picked once per call.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DynamicIsfMode {
    #[default]
    Off,
    /// 277700 / (factor * TDD * BG)
    Original,
    /// 1800 / (factor * TDD * ln(BG / divisor + 1))
    Logarithmic,
    /// Sigmoid over the BG deviation from target
    Sigmoid,
}

/// Patient therapy settings.
///
/// Scalars (`current_basal`, `sens`, `carb_ratio`, `min_bg`/`max_bg`) are used
/// when the matching schedule is empty. Everything else has a default.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    /// Duration of insulin action, hours
    pub dia: f64,

    #[serde(default)]
    pub curve: InsulinCurve,

    #[serde(default)]
    pub use_custom_peak_time: bool,

    /// Custom peak, minutes after the dose
    #[serde(default)]
    pub insulin_peak_time: Option<f64>,

    #[serde(default)]
    pub current_basal: f64,

    #[serde(default)]
    pub basal_schedule: Vec<BasalEntry>,

    /// Highest scheduled basal; derived from the schedule when absent
    #[serde(default)]
    pub max_daily_basal: Option<f64>,

    pub max_basal: f64,

    pub max_iob: f64,

    #[serde(default)]
    pub min_bg: f64,

    #[serde(default)]
    pub max_bg: f64,

    #[serde(default)]
    pub target_schedule: Vec<TargetEntry>,

    #[serde(default)]
    pub sens: f64,

    #[serde(default)]
    pub isf_schedule: Vec<IsfEntry>,

    #[serde(default)]
    pub carb_ratio: f64,

    #[serde(default)]
    pub carb_ratio_schedule: Vec<CarbRatioEntry>,

    #[serde(default = "default_autosens_min")]
    pub autosens_min: f64,

    #[serde(default = "default_autosens_max")]
    pub autosens_max: f64,

    /// Minimum carb impact, mg/dL per 5 minutes
    #[serde(default = "default_min_5m_carbimpact")]
    pub min_5m_carbimpact: f64,

    #[serde(default = "default_max_cob")]
    pub max_cob: f64,

    /// Carb absorption window, hours
    #[serde(default = "default_max_meal_absorption_time")]
    pub max_meal_absorption_time: f64,

    #[serde(default)]
    pub enable_uam: bool,

    #[serde(default)]
    pub enable_smb_always: bool,

    #[serde(default)]
    pub enable_smb_with_cob: bool,

    #[serde(default)]
    pub enable_smb_with_temp_target: bool,

    #[serde(default)]
    pub enable_smb_after_carbs: bool,

    #[serde(default)]
    pub enable_smb_high_bg: bool,

    #[serde(default = "default_enable_smb_high_bg_target")]
    pub enable_smb_high_bg_target: f64,

    #[serde(default)]
    pub allow_smb_with_high_temp_target: bool,

    #[serde(default = "default_smb_basal_minutes")]
    pub max_smb_basal_minutes: f64,

    #[serde(default = "default_smb_basal_minutes")]
    pub max_uam_smb_basal_minutes: f64,

    /// Minimum minutes between SMBs
    #[serde(default = "default_smb_interval")]
    pub smb_interval: f64,

    #[serde(default = "default_bolus_increment")]
    pub bolus_increment: f64,

    #[serde(default = "default_max_daily_safety_multiplier")]
    pub max_daily_safety_multiplier: f64,

    #[serde(default = "default_current_basal_safety_multiplier")]
    pub current_basal_safety_multiplier: f64,

    #[serde(default)]
    pub skip_neutral_temps: bool,

    #[serde(default = "default_true")]
    pub sensitivity_raises_target: bool,

    #[serde(default)]
    pub resistance_lowers_target: bool,

    #[serde(default)]
    pub exercise_mode: bool,

    #[serde(default)]
    pub high_temp_target_raises_sensitivity: bool,

    #[serde(default)]
    pub low_temp_target_lowers_sensitivity: bool,

    #[serde(default = "default_half_basal_exercise_target")]
    pub half_basal_exercise_target: f64,

    #[serde(default = "default_remaining_carbs_cap")]
    pub remaining_carbs_cap: f64,

    #[serde(default = "default_remaining_carbs_fraction")]
    pub remaining_carbs_fraction: f64,

    #[serde(default = "default_carbs_req_threshold")]
    pub carbs_req_threshold: f64,

    #[serde(default = "default_noisy_cgm_target_multiplier")]
    pub noisy_cgm_target_multiplier: f64,

    #[serde(default)]
    pub pump_model: Option<String>,

    /// Offset of the patient's local time from UTC
    #[serde(default)]
    pub utc_offset_minutes: i32,

    #[serde(default)]
    pub dynamic_isf: DynamicIsfMode,

    #[serde(default = "default_adjustment_factor")]
    pub adjustment_factor: f64,

    #[serde(default = "default_adjustment_factor_sigmoid")]
    pub adjustment_factor_sigmoid: f64,

    /// Weight of the last 24h against the baseline when blending TDD
    #[serde(default = "default_tdd_weight")]
    pub tdd_weight: f64,

    /// Long-run average total daily dose, supplied by the host
    #[serde(default)]
    pub tdd_baseline: Option<f64>,
}

fn default_autosens_min() -> f64 {
    0.7
}

fn default_autosens_max() -> f64 {
    1.2
}

fn default_min_5m_carbimpact() -> f64 {
    8.0
}

fn default_max_cob() -> f64 {
    120.0
}

fn default_max_meal_absorption_time() -> f64 {
    6.0
}

fn default_enable_smb_high_bg_target() -> f64 {
    110.0
}

fn default_smb_basal_minutes() -> f64 {
    30.0
}

fn default_smb_interval() -> f64 {
    3.0
}

fn default_bolus_increment() -> f64 {
    0.1
}

fn default_max_daily_safety_multiplier() -> f64 {
    3.0
}

fn default_current_basal_safety_multiplier() -> f64 {
    4.0
}

fn default_true() -> bool {
    true
}

fn default_half_basal_exercise_target() -> f64 {
    160.0
}

fn default_remaining_carbs_cap() -> f64 {
    90.0
}

fn default_remaining_carbs_fraction() -> f64 {
    1.0
}

fn default_carbs_req_threshold() -> f64 {
    1.0
}

fn default_noisy_cgm_target_multiplier() -> f64 {
    1.3
}

fn default_adjustment_factor() -> f64 {
    0.8
}

fn default_adjustment_factor_sigmoid() -> f64 {
    0.5
}

fn default_tdd_weight() -> f64 {
    0.65
}

impl Profile {
    /// Minimal profile with scalar settings and defaults everywhere else.
    pub fn new(dia: f64, current_basal: f64, sens: f64, carb_ratio: f64) -> Self {
        Self {
            dia,
            curve: InsulinCurve::default(),
            use_custom_peak_time: false,
            insulin_peak_time: None,
            current_basal,
            basal_schedule: Vec::new(),
            max_daily_basal: None,
            max_basal: current_basal * 4.0,
            max_iob: 3.0,
            min_bg: 100.0,
            max_bg: 100.0,
            target_schedule: Vec::new(),
            sens,
            isf_schedule: Vec::new(),
            carb_ratio,
            carb_ratio_schedule: Vec::new(),
            autosens_min: default_autosens_min(),
            autosens_max: default_autosens_max(),
            min_5m_carbimpact: default_min_5m_carbimpact(),
            max_cob: default_max_cob(),
            max_meal_absorption_time: default_max_meal_absorption_time(),
            enable_uam: false,
            enable_smb_always: false,
            enable_smb_with_cob: false,
            enable_smb_with_temp_target: false,
            enable_smb_after_carbs: false,
            enable_smb_high_bg: false,
            enable_smb_high_bg_target: default_enable_smb_high_bg_target(),
            allow_smb_with_high_temp_target: false,
            max_smb_basal_minutes: default_smb_basal_minutes(),
            max_uam_smb_basal_minutes: default_smb_basal_minutes(),
            smb_interval: default_smb_interval(),
            bolus_increment: default_bolus_increment(),
            max_daily_safety_multiplier: default_max_daily_safety_multiplier(),
            current_basal_safety_multiplier: default_current_basal_safety_multiplier(),
            skip_neutral_temps: false,
            sensitivity_raises_target: true,
            resistance_lowers_target: false,
            exercise_mode: false,
            high_temp_target_raises_sensitivity: false,
            low_temp_target_lowers_sensitivity: false,
            half_basal_exercise_target: default_half_basal_exercise_target(),
            remaining_carbs_cap: default_remaining_carbs_cap(),
            remaining_carbs_fraction: default_remaining_carbs_fraction(),
            carbs_req_threshold: default_carbs_req_threshold(),
            noisy_cgm_target_multiplier: default_noisy_cgm_target_multiplier(),
            pump_model: None,
            utc_offset_minutes: 0,
            dynamic_isf: DynamicIsfMode::Off,
            adjustment_factor: default_adjustment_factor(),
            adjustment_factor_sigmoid: default_adjustment_factor_sigmoid(),
            tdd_weight: default_tdd_weight(),
            tdd_baseline: None,
        }
    }

    /// Same profile with a different insulin curve.
    pub fn with_curve(mut self, curve: InsulinCurve) -> Self {
        self.curve = curve;
        self
    }
}

/// Temporary target band overriding the schedule while active.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TempTarget {
    pub started_at: i64,
    pub duration_minutes: f64,
    pub low: f64,
    pub high: f64,
}

impl TempTarget {
    pub fn is_active(&self, at: i64) -> bool {
        let ends_at = self.started_at + (self.duration_minutes * MINUTE_MS as f64) as i64;
        self.duration_minutes > 0.0 && self.started_at <= at && at < ends_at
    }
}

/// Schedule values resolved for one instant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ProfileSnapshot {
    pub at: i64,
    pub basal: f64,
    pub isf: f64,
    pub carb_ratio: f64,
    pub min_bg: f64,
    pub max_bg: f64,
    pub target_bg: f64,
    pub max_daily_basal: f64,
    pub temp_target_set: bool,
}

// ============================================================================
// History
// ============================================================================

/// A recorded therapy event. Never mutated once recorded.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Treatment {
    Bolus {
        timestamp: i64,
        units: f64,
    },
    TempBasal {
        timestamp: i64,
        rate: f64,
        duration_minutes: f64,
    },
    Carbs {
        timestamp: i64,
        grams: f64,
    },
}

impl Treatment {
    pub fn timestamp(&self) -> i64 {
        match self {
            Treatment::Bolus { timestamp, .. }
            | Treatment::TempBasal { timestamp, .. }
            | Treatment::Carbs { timestamp, .. } => *timestamp,
        }
    }
}

/// A single CGM value.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GlucoseReading {
    pub timestamp: i64,
    pub glucose: f64,
    #[serde(default)]
    pub noise: u8,
    #[serde(default)]
    pub device: Option<String>,
}

/// Current glucose plus rolling deltas (mg/dL per 5 minutes).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GlucoseStatus {
    pub glucose: f64,
    pub delta: f64,
    pub short_avgdelta: f64,
    pub long_avgdelta: f64,
    pub timestamp: i64,
    pub noise: u8,
    pub device: Option<String>,
}

/// Temp basal the pump reports as running right now.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct CurrentTemp {
    #[serde(default)]
    pub rate: f64,
    /// Remaining minutes
    #[serde(default)]
    pub duration: f64,
}

// ============================================================================
// Insulin on board
// ============================================================================

/// Insulin totals at one instant.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct IobData {
    pub time: i64,
    pub iob: f64,
    /// U per minute of insulin currently acting
    pub activity: f64,
    pub basal_iob: f64,
    pub bolus_iob: f64,
    pub net_basal_insulin: f64,
    pub bolus_insulin: f64,
}

/// One prediction step: the real history and the zero-temp counterfactual.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IobTick {
    pub actual: IobData,
    pub zero_temp: IobData,
}

/// Most recent temp basal found in history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LastTemp {
    pub started_at: i64,
    pub rate: f64,
    pub duration_minutes: f64,
}

/// IOB from the clock forward in 5 minute steps.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IobProjection {
    pub ticks: Vec<IobTick>,
    pub last_bolus_time: Option<i64>,
    pub last_temp: Option<LastTemp>,
}

impl IobProjection {
    /// Totals at the clock.
    pub fn now(&self) -> Option<&IobTick> {
        self.ticks.first()
    }
}

// ============================================================================
// Meal and sensitivity
// ============================================================================

/// Carb absorption state derived from deviations.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct MealData {
    /// Carbs still considered on board, g
    pub carbs: f64,
    pub meal_cob: f64,
    pub current_deviation: f64,
    pub max_deviation: f64,
    pub min_deviation: f64,
    pub slope_from_max_deviation: f64,
    pub slope_from_min_deviation: f64,
    pub all_deviations: Vec<f64>,
    pub last_carb_time: Option<i64>,
}

/// Detected sensitivity multiplier.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AutosensResult {
    pub ratio: f64,
    pub new_isf: f64,
    pub deviations_used: usize,
    pub deviations_excluded: usize,
    pub median_deviation: f64,
    pub window_hours: f64,
    pub reason: String,
}

impl AutosensResult {
    pub fn neutral(isf: f64, window_hours: f64, reason: impl Into<String>) -> Self {
        Self {
            ratio: 1.0,
            new_isf: isf,
            deviations_used: 0,
            deviations_excluded: 0,
            median_deviation: 0.0,
            window_hours,
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Recommendation
// ============================================================================

/// Projected BG curves, one value per 5 minutes starting at the current BG.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct Predictions {
    pub iob: Vec<f64>,
    pub zero_temp: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uam: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cob: Option<Vec<f64>>,
    pub blended: Vec<f64>,
}

/// Output of one determine-basal run.
///
/// Either a decision (`rate`/`duration`, `units`, or neither for "no change")
/// or `error` is populated, never both.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Default)]
pub struct DetermineBasalResult {
    pub rate: Option<f64>,
    pub duration: Option<f64>,
    pub units: Option<f64>,
    pub reason: String,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub bg: Option<f64>,
    pub tick: Option<String>,
    pub eventual_bg: Option<f64>,
    pub target_bg: Option<f64>,
    pub threshold: Option<f64>,
    pub insulin_req: Option<f64>,
    pub carbs_req: Option<f64>,
    pub cob: Option<f64>,
    pub iob: Option<f64>,
    pub sensitivity_ratio: Option<f64>,
    pub variable_sens: Option<f64>,
    pub deliver_at: Option<i64>,
    pub predictions: Option<Predictions>,
    pub safety_clamped: bool,
}

impl DetermineBasalResult {
    /// Terminal error result: no rate, no units.
    pub fn failure(err: &crate::Error) -> Self {
        Self {
            reason: err.to_string(),
            error: Some(err.to_string()),
            error_kind: Some(err.category().to_string()),
            ..Self::default()
        }
    }

    pub fn has_temp(&self) -> bool {
        self.rate.is_some() && self.duration.is_some()
    }

    pub fn has_smb(&self) -> bool {
        self.units.map(|u| u > 0.0).unwrap_or(false)
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

// ============================================================================
// Request
// ============================================================================

/// Externally detected sensitivity, used instead of running autosens.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AutosensOverride {
    pub ratio: f64,
}

/// Everything one evaluation needs. The clock is explicit.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LoopRequest {
    pub profile: Profile,
    #[serde(default)]
    pub treatments: Vec<Treatment>,
    #[serde(default)]
    pub glucose: Vec<GlucoseReading>,
    #[serde(default)]
    pub current_temp: CurrentTemp,
    pub clock: i64,
    #[serde(default)]
    pub temp_targets: Vec<TempTarget>,
    #[serde(default)]
    pub microbolus_allowed: bool,
    #[serde(default)]
    pub autosens: Option<AutosensOverride>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_defaults_from_minimal_json() {
        let json = r#"{"dia": 5, "current_basal": 1.0, "max_basal": 3.0, "max_iob": 2.5,
                       "sens": 50, "carb_ratio": 10, "min_bg": 100, "max_bg": 110}"#;
        let profile: Profile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.curve, InsulinCurve::RapidActing);
        assert_eq!(profile.autosens_min, 0.7);
        assert_eq!(profile.autosens_max, 1.2);
        assert_eq!(profile.min_5m_carbimpact, 8.0);
        assert_eq!(profile.smb_interval, 3.0);
        assert!(profile.sensitivity_raises_target);
        assert_eq!(profile.dynamic_isf, DynamicIsfMode::Off);
    }

    #[test]
    fn test_treatment_tagged_serialization() {
        let bolus = Treatment::Bolus {
            timestamp: 1_000,
            units: 1.5,
        };
        let json = serde_json::to_string(&bolus).unwrap();
        assert!(json.contains(r#""type":"bolus""#));

        let temp: Treatment = serde_json::from_str(
            r#"{"type":"temp_basal","timestamp":5,"rate":0.5,"duration_minutes":30}"#,
        )
        .unwrap();
        assert_eq!(temp.timestamp(), 5);
    }

    #[test]
    fn test_temp_target_active_window() {
        let target = TempTarget {
            started_at: 0,
            duration_minutes: 60.0,
            low: 140.0,
            high: 140.0,
        };
        assert!(target.is_active(0));
        assert!(target.is_active(59 * MINUTE_MS));
        assert!(!target.is_active(60 * MINUTE_MS));
        assert!(!target.is_active(-1));
    }

    #[test]
    fn test_failure_result_has_no_decision() {
        let err = crate::Error::StaleOrMissingGlucose("no readings".into());
        let result = DetermineBasalResult::failure(&err);
        assert!(result.has_error());
        assert!(!result.has_temp());
        assert!(!result.has_smb());
        assert_eq!(result.error_kind.as_deref(), Some("stale_or_missing_glucose"));
    }
}
