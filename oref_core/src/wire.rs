//! Request and response JSON.
//!
//! Domain types serialize with snake_case names. Hosts built around the
//! JavaScript reference loop send and expect its field names instead:
//! camelCase keys, nested schedules (`isfProfile.sensitivities`,
//! `carb_ratios.schedule`, `bg_targets.targets`, `basalprofile`), Nightscout
//! treatments and entries, and `iobWithZeroTemp`/`predBGs` in responses.
//! All translation between the two lives here.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::config::Config;
use crate::{autosens, engine, glucose, iob, meal, profile};
use crate::{
    AutosensResult, DetermineBasalResult, Error, GlucoseReading, GlucoseStatus, IobData,
    IobProjection, LoopRequest, MealData, ProfileSnapshot, Result, TempTarget, Treatment,
};

/// Field naming of request and response JSON.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Naming {
    /// Reference loop names (`currenttemp`, `isfProfile`, `eventualBG`, ...)
    #[default]
    Legacy,
    /// Domain names
    Snake,
}

impl FromStr for Naming {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" | "camel" | "oref0" => Ok(Naming::Legacy),
            "snake" | "snake_case" => Ok(Naming::Snake),
            other => Err(Error::InvalidInput(format!("unknown naming '{}'", other))),
        }
    }
}

impl fmt::Display for Naming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Naming::Legacy => write!(f, "legacy"),
            Naming::Snake => write!(f, "snake"),
        }
    }
}

// ============================================================================
// Key tables
// ============================================================================

/// Profile keys whose legacy name differs from the domain name.
const PROFILE_KEY_PAIRS: &[(&str, &str)] = &[
    ("useCustomPeakTime", "use_custom_peak_time"),
    ("insulinPeakTime", "insulin_peak_time"),
    ("maxCOB", "max_cob"),
    ("maxMealAbsorptionTime", "max_meal_absorption_time"),
    ("enableUAM", "enable_uam"),
    ("enableSMB_always", "enable_smb_always"),
    ("enableSMB_with_COB", "enable_smb_with_cob"),
    ("enableSMB_with_temptarget", "enable_smb_with_temp_target"),
    ("enableSMB_after_carbs", "enable_smb_after_carbs"),
    ("enableSMB_high_bg", "enable_smb_high_bg"),
    ("enableSMB_high_bg_target", "enable_smb_high_bg_target"),
    ("allowSMB_with_high_temptarget", "allow_smb_with_high_temp_target"),
    ("maxSMBBasalMinutes", "max_smb_basal_minutes"),
    ("maxUAMSMBBasalMinutes", "max_uam_smb_basal_minutes"),
    ("SMBInterval", "smb_interval"),
    ("high_temptarget_raises_sensitivity", "high_temp_target_raises_sensitivity"),
    ("low_temptarget_lowers_sensitivity", "low_temp_target_lowers_sensitivity"),
    ("remainingCarbsCap", "remaining_carbs_cap"),
    ("remainingCarbsFraction", "remaining_carbs_fraction"),
    ("carbsReqThreshold", "carbs_req_threshold"),
    ("noisyCGMTargetMultiplier", "noisy_cgm_target_multiplier"),
    ("model", "pump_model"),
    ("adjustmentFactor", "adjustment_factor"),
    ("adjustmentFactorSigmoid", "adjustment_factor_sigmoid"),
    ("weightPercentage", "tdd_weight"),
];

static PROFILE_LEGACY_TO_SNAKE: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| PROFILE_KEY_PAIRS.iter().copied().collect());

/// Request keys, first match wins.
static REQUEST_KEYS: Lazy<HashMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    let mut keys: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
    keys.insert("treatments", &["treatments", "pumphistory", "history"]);
    keys.insert("carbs", &["carbhistory", "carbs"]);
    keys.insert("glucose", &["glucose", "glucose_data", "entries"]);
    keys.insert("current_temp", &["currenttemp", "currentTemp", "temp_basal"]);
    keys.insert("clock", &["clock", "currentTime", "systemTime", "time"]);
    keys.insert("temp_targets", &["tempTargets", "temptargets", "temp_targets"]);
    keys.insert("microbolus_allowed", &["microBolusAllowed", "microbolus_allowed"]);
    keys.insert("autosens", &["autosens", "autosens_data"]);
    keys
});

const TIMESTAMP_KEYS: &[&str] = &["timestamp", "created_at", "date", "mills", "dateString"];

// ============================================================================
// Helpers
// ============================================================================

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidInput(msg.into())
}

fn number(obj: &Map<String, Value>, key: &str) -> Option<f64> {
    match obj.get(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn first_key<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key).filter(|v| !v.is_null()))
}

/// Epoch milliseconds or an RFC 3339 string.
pub fn parse_timestamp(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .ok_or_else(|| invalid(format!("timestamp {} is not an integer", n))),
        Value::String(s) => {
            if let Ok(ms) = s.trim().parse::<i64>() {
                return Ok(ms);
            }
            DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| invalid(format!("timestamp '{}': {}", s, e)))
        }
        other => Err(invalid(format!("timestamp {} is not a number or string", other))),
    }
}

fn timestamp_of(obj: &Map<String, Value>) -> Result<i64> {
    let value = first_key(obj, TIMESTAMP_KEYS)
        .ok_or_else(|| invalid(format!("entry has no timestamp: {}", Value::Object(obj.clone()))))?;
    parse_timestamp(value)
}

/// RFC 3339 with milliseconds, UTC.
pub fn format_timestamp(ms: i64) -> Result<String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or(Error::InvalidTimestamp(ms))
}

/// "HH:MM" or "HH:MM:SS" to minutes after midnight.
fn minutes_from_start(start: &str) -> Option<f64> {
    let mut parts = start.split(':');
    let hours: f64 = parts.next()?.trim().parse().ok()?;
    let minutes: f64 = parts.next().unwrap_or("0").trim().parse().ok()?;
    Some(hours * 60.0 + minutes)
}

fn objects<'a>(value: &'a Value, what: &str) -> Result<Vec<&'a Map<String, Value>>> {
    let array = value
        .as_array()
        .ok_or_else(|| invalid(format!("{} must be an array", what)))?;
    array
        .iter()
        .map(|item| {
            item.as_object()
                .ok_or_else(|| invalid(format!("{} entries must be objects", what)))
        })
        .collect()
}

// ============================================================================
// Legacy profile
// ============================================================================

/// Rewrite a legacy schedule array into domain entries.
fn schedule_from_legacy(
    entries: &Value,
    what: &str,
    offset_keys: &[&str],
    value_keys: &[&str],
) -> Result<Value> {
    let mut out = Vec::new();
    for entry in objects(entries, what)? {
        let offset = offset_keys
            .iter()
            .find_map(|key| number(entry, key))
            .or_else(|| entry.get("start").and_then(Value::as_str).and_then(minutes_from_start))
            .ok_or_else(|| invalid(format!("{} entry has no offset", what)))?;
        let mut item = Map::new();
        item.insert("offset_minutes".into(), json!(offset.max(0.0).round() as u32));
        for key in value_keys {
            let value = number(entry, key)
                .ok_or_else(|| invalid(format!("{} entry has no {}", what, key)))?;
            item.insert((*key).into(), json!(value));
        }
        out.push(Value::Object(item));
    }
    Ok(Value::Array(out))
}

/// Legacy profile object to the domain's JSON shape.
fn profile_from_legacy(value: &Value) -> Result<Value> {
    let source = value
        .as_object()
        .ok_or_else(|| invalid("profile must be an object"))?;
    let mut out = Map::new();

    for (key, value) in source {
        let target = PROFILE_LEGACY_TO_SNAKE.get(key.as_str()).copied().unwrap_or(key.as_str());
        out.insert(target.to_string(), value.clone());
    }

    if let Some(model) = out.get("pump_model").cloned() {
        let model = match model {
            Value::String(s) => Value::String(s.trim_matches('"').to_string()),
            Value::Number(n) => Value::String(n.to_string()),
            _ => Value::Null,
        };
        out.insert("pump_model".into(), model);
    }

    if let Some(basal) = source.get("basalprofile") {
        out.insert(
            "basal_schedule".into(),
            schedule_from_legacy(basal, "basalprofile", &["minutes", "offset"], &["rate"])?,
        );
    }
    if let Some(sensitivities) = source.get("isfProfile").and_then(|p| p.get("sensitivities")) {
        out.insert(
            "isf_schedule".into(),
            schedule_from_legacy(sensitivities, "isfProfile.sensitivities", &["offset"], &["sensitivity"])?,
        );
    }
    if let Some(schedule) = source.get("carb_ratios").and_then(|p| p.get("schedule")) {
        out.insert(
            "carb_ratio_schedule".into(),
            schedule_from_legacy(schedule, "carb_ratios.schedule", &["offset"], &["ratio"])?,
        );
    }
    if let Some(targets) = source.get("bg_targets").and_then(|p| p.get("targets")) {
        out.insert(
            "target_schedule".into(),
            schedule_from_legacy(targets, "bg_targets.targets", &["offset"], &["low", "high"])?,
        );
    }

    let use_new_formula = source.get("useNewFormula").and_then(Value::as_bool).unwrap_or(false);
    let sigmoid = source.get("sigmoid").and_then(Value::as_bool).unwrap_or(false);
    if use_new_formula {
        let mode = if sigmoid { "sigmoid" } else { "logarithmic" };
        out.insert("dynamic_isf".into(), json!(mode));
    }

    // the reference loop reports weights as a fraction despite the name
    if let Some(weight) = number(source, "weightPercentage") {
        let fraction = if weight > 1.0 { weight / 100.0 } else { weight };
        out.insert("tdd_weight".into(), json!(fraction));
    }

    for legacy_only in ["basalprofile", "isfProfile", "carb_ratios", "bg_targets", "useNewFormula", "sigmoid"] {
        out.remove(legacy_only);
    }
    Ok(Value::Object(out))
}

// ============================================================================
// Nightscout history
// ============================================================================

/// Nightscout treatments (or pump history shaped like them) to domain treatments.
///
/// One record may carry both insulin and carbs ("Meal Bolus"); it becomes two
/// treatments.
pub fn treatments_from_legacy(value: &Value) -> Result<Vec<Treatment>> {
    let mut treatments = Vec::new();
    for entry in objects(value, "treatments")? {
        let timestamp = timestamp_of(entry)?;
        let event = entry
            .get("eventType")
            .or_else(|| entry.get("_type"))
            .and_then(Value::as_str)
            .unwrap_or("");

        if event.contains("Temp Basal") || event == "TempBasal" {
            let rate = number(entry, "absolute")
                .or_else(|| number(entry, "rate"))
                .ok_or_else(|| invalid(format!("temp basal at {} has no rate", timestamp)))?;
            let duration_minutes = number(entry, "duration")
                .or_else(|| number(entry, "duration (min)"))
                .unwrap_or(0.0);
            treatments.push(Treatment::TempBasal {
                timestamp,
                rate,
                duration_minutes,
            });
            continue;
        }

        if let Some(units) = number(entry, "insulin").or_else(|| number(entry, "amount")) {
            if units != 0.0 {
                treatments.push(Treatment::Bolus { timestamp, units });
            }
        }
        if let Some(grams) = number(entry, "carbs").or_else(|| number(entry, "nsCarbs")) {
            if grams != 0.0 {
                treatments.push(Treatment::Carbs { timestamp, grams });
            }
        }
    }
    Ok(treatments)
}

/// Nightscout SGV entries to readings. Entries without a glucose value
/// (calibrations, meter records) are skipped.
pub fn glucose_from_legacy(value: &Value) -> Result<Vec<GlucoseReading>> {
    let mut readings = Vec::new();
    for entry in objects(value, "glucose")? {
        let Some(glucose) = number(entry, "glucose").or_else(|| number(entry, "sgv")) else {
            continue;
        };
        readings.push(GlucoseReading {
            timestamp: timestamp_of(entry)?,
            glucose,
            noise: number(entry, "noise")
                .map(|n| n.clamp(0.0, u8::MAX as f64) as u8)
                .unwrap_or(0),
            device: entry.get("device").and_then(Value::as_str).map(str::to_string),
        });
    }
    Ok(readings)
}

/// Nightscout "Temporary Target" treatments.
pub fn temp_targets_from_legacy(value: &Value) -> Result<Vec<TempTarget>> {
    let mut targets = Vec::new();
    for entry in objects(value, "tempTargets")? {
        let started_at = timestamp_of(entry)?;
        let duration_minutes = number(entry, "duration").unwrap_or(0.0);
        let low = number(entry, "targetBottom").or_else(|| number(entry, "low"));
        let high = number(entry, "targetTop").or_else(|| number(entry, "high"));
        match (low, high) {
            (Some(low), Some(high)) => targets.push(TempTarget {
                started_at,
                duration_minutes,
                low,
                high,
            }),
            // a cancel carries no band
            _ if duration_minutes == 0.0 => targets.push(TempTarget {
                started_at,
                duration_minutes,
                low: 0.0,
                high: 0.0,
            }),
            _ => {
                return Err(invalid(format!(
                    "temp target at {} has no targetBottom/targetTop",
                    started_at
                )))
            }
        }
    }
    Ok(targets)
}

// ============================================================================
// Requests
// ============================================================================

/// Parse a request in either naming.
pub fn parse_request(input: &str, naming: Naming) -> Result<LoopRequest> {
    let value: Value = serde_json::from_str(input)?;
    match naming {
        Naming::Snake => Ok(serde_json::from_value(value)?),
        Naming::Legacy => request_from_legacy(&value),
    }
}

fn request_field<'a>(obj: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    REQUEST_KEYS.get(name).and_then(|keys| first_key(obj, keys))
}

fn request_from_legacy(value: &Value) -> Result<LoopRequest> {
    let obj = value
        .as_object()
        .ok_or_else(|| invalid("request must be a JSON object"))?;

    let profile_value = obj
        .get("profile")
        .ok_or_else(|| invalid("request has no profile"))?;
    let profile = serde_json::from_value(profile_from_legacy(profile_value)?)?;

    let mut treatments = match request_field(obj, "treatments") {
        Some(value) => treatments_from_legacy(value)?,
        None => Vec::new(),
    };
    if let Some(carbs) = request_field(obj, "carbs").filter(|v| v.is_array()) {
        treatments.extend(treatments_from_legacy(carbs)?);
    }

    let glucose = match request_field(obj, "glucose") {
        Some(value) => glucose_from_legacy(value)?,
        None => Vec::new(),
    };
    let temp_targets = match request_field(obj, "temp_targets") {
        Some(value) => temp_targets_from_legacy(value)?,
        None => Vec::new(),
    };
    let current_temp = match request_field(obj, "current_temp") {
        Some(value) => serde_json::from_value(value.clone())?,
        None => Default::default(),
    };
    let clock = request_field(obj, "clock")
        .map(parse_timestamp)
        .transpose()?
        .ok_or_else(|| invalid("request has no clock"))?;
    let microbolus_allowed = request_field(obj, "microbolus_allowed")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let autosens = match request_field(obj, "autosens") {
        Some(value) => Some(serde_json::from_value(value.clone())?),
        None => None,
    };

    Ok(LoopRequest {
        profile,
        treatments,
        glucose,
        current_temp,
        clock,
        temp_targets,
        microbolus_allowed,
        autosens,
    })
}

// ============================================================================
// Responses
// ============================================================================

fn iob_legacy(data: &IobData) -> Result<Value> {
    Ok(json!({
        "iob": data.iob,
        "activity": data.activity,
        "basaliob": data.basal_iob,
        "bolusiob": data.bolus_iob,
        "netbasalinsulin": data.net_basal_insulin,
        "bolusinsulin": data.bolus_insulin,
        "time": format_timestamp(data.time)?,
    }))
}

pub fn render_iob(projection: &IobProjection, naming: Naming) -> Result<Value> {
    if naming == Naming::Snake {
        return Ok(serde_json::to_value(projection)?);
    }
    let mut ticks = Vec::with_capacity(projection.ticks.len());
    for (i, tick) in projection.ticks.iter().enumerate() {
        let mut item = iob_legacy(&tick.actual)?;
        if let Value::Object(map) = &mut item {
            map.insert("iobWithZeroTemp".into(), iob_legacy(&tick.zero_temp)?);
            if i == 0 {
                if let Some(last_bolus) = projection.last_bolus_time {
                    map.insert("lastBolusTime".into(), json!(last_bolus));
                }
                if let Some(last) = &projection.last_temp {
                    map.insert(
                        "lastTemp".into(),
                        json!({
                            "rate": last.rate,
                            "timestamp": format_timestamp(last.started_at)?,
                            "started_at": format_timestamp(last.started_at)?,
                            "date": last.started_at,
                            "duration": last.duration_minutes,
                        }),
                    );
                }
            }
        }
        ticks.push(item);
    }
    Ok(Value::Array(ticks))
}

pub fn render_meal(meal: &MealData, naming: Naming) -> Result<Value> {
    if naming == Naming::Snake {
        return Ok(serde_json::to_value(meal)?);
    }
    let mut value = json!({
        "carbs": meal.carbs,
        "mealCOB": meal.meal_cob,
        "currentDeviation": meal.current_deviation,
        "maxDeviation": meal.max_deviation,
        "minDeviation": meal.min_deviation,
        "slopeFromMaxDeviation": meal.slope_from_max_deviation,
        "slopeFromMinDeviation": meal.slope_from_min_deviation,
        "allDeviations": meal.all_deviations,
    });
    if let (Some(last), Value::Object(map)) = (meal.last_carb_time, &mut value) {
        map.insert("lastCarbTime".into(), json!(last));
    }
    Ok(value)
}

pub fn render_autosens(result: &AutosensResult, naming: Naming) -> Result<Value> {
    match naming {
        Naming::Snake => Ok(serde_json::to_value(result)?),
        Naming::Legacy => Ok(json!({
            "ratio": result.ratio,
            "newisf": result.new_isf,
        })),
    }
}

pub fn render_glucose(status: &GlucoseStatus, naming: Naming) -> Result<Value> {
    match naming {
        Naming::Snake => Ok(serde_json::to_value(status)?),
        Naming::Legacy => Ok(json!({
            "glucose": status.glucose,
            "delta": status.delta,
            "short_avgdelta": status.short_avgdelta,
            "long_avgdelta": status.long_avgdelta,
            "date": status.timestamp,
            "noise": status.noise,
            "device": status.device,
        })),
    }
}

pub fn render_profile(snapshot: &ProfileSnapshot, naming: Naming) -> Result<Value> {
    match naming {
        Naming::Snake => Ok(serde_json::to_value(snapshot)?),
        Naming::Legacy => Ok(json!({
            "time": format_timestamp(snapshot.at)?,
            "current_basal": snapshot.basal,
            "sens": snapshot.isf,
            "carb_ratio": snapshot.carb_ratio,
            "min_bg": snapshot.min_bg,
            "max_bg": snapshot.max_bg,
            "target_bg": snapshot.target_bg,
            "max_daily_basal": snapshot.max_daily_basal,
            "temptargetSet": snapshot.temp_target_set,
        })),
    }
}

pub fn render_result(result: &DetermineBasalResult, naming: Naming) -> Result<Value> {
    if naming == Naming::Snake {
        return Ok(serde_json::to_value(result)?);
    }

    let mut map = Map::new();
    let mut put = |key: &str, value: Value| {
        if !value.is_null() {
            map.insert(key.to_string(), value);
        }
    };

    if result.rate.is_some() {
        put("temp", json!("absolute"));
    }
    put("rate", json!(result.rate));
    put("duration", json!(result.duration));
    put("units", json!(result.units));
    put("reason", json!(result.reason));
    put("error", json!(result.error));
    put("errorKind", json!(result.error_kind));
    put("bg", json!(result.bg));
    put("tick", json!(result.tick));
    put("eventualBG", json!(result.eventual_bg));
    put("targetBG", json!(result.target_bg));
    put("threshold", json!(result.threshold));
    put("insulinReq", json!(result.insulin_req));
    put("carbsReq", json!(result.carbs_req));
    put("COB", json!(result.cob));
    put("IOB", json!(result.iob));
    put("sensitivityRatio", json!(result.sensitivity_ratio));
    put("variable_sens", json!(result.variable_sens));
    if let Some(at) = result.deliver_at {
        put("deliverAt", json!(format_timestamp(at)?));
    }
    if let Some(predictions) = &result.predictions {
        let mut curves = Map::new();
        curves.insert("IOB".into(), json!(predictions.iob));
        curves.insert("ZT".into(), json!(predictions.zero_temp));
        if let Some(cob) = &predictions.cob {
            curves.insert("COB".into(), json!(cob));
        }
        if let Some(uam) = &predictions.uam {
            curves.insert("UAM".into(), json!(uam));
        }
        put("predBGs", Value::Object(curves));
    }
    if result.safety_clamped {
        put("safetyClamped", json!(true));
    }
    Ok(Value::Object(map))
}

/// Error body for operations that fail outright.
pub fn render_error(err: &Error, naming: Naming) -> Value {
    let kind_key = match naming {
        Naming::Legacy => "errorKind",
        Naming::Snake => "error_kind",
    };
    let mut map = Map::new();
    map.insert("error".into(), json!(err.to_string()));
    map.insert(kind_key.into(), json!(err.category()));
    Value::Object(map)
}

// ============================================================================
// Operations
// ============================================================================

/// One engine entry point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Glucose,
    Profile,
    Iob,
    Meal,
    Autosens,
    DetermineBasal,
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "glucose" => Ok(Operation::Glucose),
            "profile" => Ok(Operation::Profile),
            "iob" => Ok(Operation::Iob),
            "meal" => Ok(Operation::Meal),
            "autosens" => Ok(Operation::Autosens),
            "determine-basal" | "determine_basal" => Ok(Operation::DetermineBasal),
            other => Err(invalid(format!("unknown operation '{}'", other))),
        }
    }
}

/// Run `operation` on a parsed request and render its output.
pub fn run(operation: Operation, request: &LoopRequest, config: &Config) -> Result<Value> {
    let naming = config.output.naming;
    let profile = &request.profile;
    let clock = request.clock;
    tracing::debug!("running {:?} at {}", operation, clock);

    match operation {
        Operation::Glucose => render_glucose(&glucose::status(&request.glucose)?, naming),
        Operation::Profile => {
            profile::validate(profile)?;
            let snapshot = profile::resolve(profile, &request.temp_targets, clock)?;
            render_profile(&snapshot, naming)
        }
        Operation::Iob => {
            profile::validate(profile)?;
            let horizon =
                engine::prediction_horizon(profile, &MealData::default(), clock, &config.engine)?;
            let projection = iob::project(
                profile,
                &request.treatments,
                clock,
                horizon,
                config.engine.zero_temp_minutes,
            )?;
            render_iob(&projection, naming)
        }
        Operation::Meal => {
            let data = meal::calculate(profile, &request.treatments, &request.glucose, clock)?;
            render_meal(&data, naming)
        }
        Operation::Autosens => {
            let result = autosens::detect_lowest(request, &config.autosens)?;
            render_autosens(&result, naming)
        }
        Operation::DetermineBasal => {
            let result = engine::recommend(request, &config.engine, &config.autosens);
            render_result(&result, naming)
        }
    }
}

/// String in, string out. Failures come back as an error body, never a panic.
pub fn run_json(operation: &str, input: &str, config: &Config) -> String {
    let naming = config.output.naming;
    let outcome = operation
        .parse::<Operation>()
        .and_then(|op| Ok((op, parse_request(input, naming)?)))
        .and_then(|(op, request)| run(op, &request, config));

    let value = match outcome {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!("{} failed: {}", operation, err);
            render_error(&err, naming)
        }
    };
    to_json_string(&value, config.output.pretty)
}

pub fn to_json_string(value: &Value, pretty: bool) -> String {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    };
    // serializing a Value cannot fail
    rendered.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insulin::InsulinCurve;
    use crate::DynamicIsfMode;

    const T0: i64 = 1_704_067_200_000;

    fn legacy_profile() -> Value {
        json!({
            "dia": 5,
            "curve": "ultra-rapid",
            "useCustomPeakTime": true,
            "insulinPeakTime": 60,
            "current_basal": 0.9,
            "max_basal": 3,
            "max_iob": 2.5,
            "max_daily_basal": 1.2,
            "min_bg": 100,
            "max_bg": 110,
            "sens": 45,
            "carb_ratio": 9,
            "maxCOB": 100,
            "enableUAM": true,
            "enableSMB_with_COB": true,
            "SMBInterval": 5,
            "model": "\"554\"",
            "useNewFormula": true,
            "sigmoid": true,
            "basalprofile": [
                {"i": 0, "start": "00:00:00", "minutes": 0, "rate": 0.9},
                {"i": 1, "start": "06:00:00", "minutes": 360, "rate": 1.2}
            ],
            "isfProfile": {"sensitivities": [
                {"offset": 0, "sensitivity": 45, "start": "00:00:00"}
            ]},
            "carb_ratios": {"schedule": [
                {"offset": 0, "ratio": 9, "start": "00:00:00"},
                {"start": "12:00", "ratio": 11}
            ]},
            "bg_targets": {"targets": [
                {"offset": 0, "low": 100, "high": 110, "start": "00:00:00"}
            ]}
        })
    }

    #[test]
    fn test_naming_from_str() {
        assert_eq!("legacy".parse::<Naming>().unwrap(), Naming::Legacy);
        assert_eq!("SNAKE".parse::<Naming>().unwrap(), Naming::Snake);
        assert!("kebab".parse::<Naming>().is_err());
    }

    #[test]
    fn test_legacy_profile_mapping() {
        let value = profile_from_legacy(&legacy_profile()).unwrap();
        let profile: crate::Profile = serde_json::from_value(value).unwrap();
        assert_eq!(profile.curve, InsulinCurve::UltraRapid);
        assert!(profile.use_custom_peak_time);
        assert_eq!(profile.insulin_peak_time, Some(60.0));
        assert_eq!(profile.max_cob, 100.0);
        assert!(profile.enable_uam);
        assert!(profile.enable_smb_with_cob);
        assert_eq!(profile.smb_interval, 5.0);
        assert_eq!(profile.pump_model.as_deref(), Some("554"));
        assert_eq!(profile.dynamic_isf, DynamicIsfMode::Sigmoid);
        assert_eq!(profile.basal_schedule.len(), 2);
        assert_eq!(profile.basal_schedule[1].offset_minutes, 360);
        assert_eq!(profile.carb_ratio_schedule[1].offset_minutes, 720);
        assert_eq!(profile.isf_schedule[0].sensitivity, 45.0);
        assert_eq!(profile.target_schedule[0].high, 110.0);
    }

    #[test]
    fn test_nightscout_treatments() {
        let value = json!([
            {"eventType": "Meal Bolus", "created_at": "2024-01-01T00:00:00Z", "insulin": 2.0, "carbs": 30},
            {"eventType": "Temp Basal", "created_at": "2024-01-01T00:10:00.000Z", "absolute": 1.5, "duration": 30},
            {"eventType": "Correction Bolus", "date": T0 + 1_200_000, "insulin": 0.5},
            {"eventType": "Note", "date": T0, "notes": "ignored"}
        ]);
        let treatments = treatments_from_legacy(&value).unwrap();
        assert_eq!(
            treatments,
            vec![
                Treatment::Bolus { timestamp: T0, units: 2.0 },
                Treatment::Carbs { timestamp: T0, grams: 30.0 },
                Treatment::TempBasal {
                    timestamp: T0 + 600_000,
                    rate: 1.5,
                    duration_minutes: 30.0
                },
                Treatment::Bolus {
                    timestamp: T0 + 1_200_000,
                    units: 0.5
                },
            ]
        );
    }

    #[test]
    fn test_nightscout_entries() {
        let value = json!([
            {"sgv": 120, "date": T0, "noise": 1, "device": "xdrip"},
            {"type": "cal", "date": T0, "slope": 1000},
            {"glucose": 118, "dateString": "2024-01-01T00:00:00+00:00"}
        ]);
        let readings = glucose_from_legacy(&value).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].noise, 1);
        assert_eq!(readings[0].device.as_deref(), Some("xdrip"));
        assert_eq!(readings[1].timestamp, T0);
    }

    #[test]
    fn test_missing_timestamp_is_invalid_input() {
        let err = treatments_from_legacy(&json!([{"insulin": 1.0}])).unwrap_err();
        assert_eq!(err.category(), "invalid_input");
    }

    #[test]
    fn test_parse_legacy_request() {
        let request = json!({
            "profile": legacy_profile(),
            "pumphistory": [{"eventType": "Bolus", "timestamp": T0 - 600_000, "insulin": 1.0}],
            "carbhistory": [{"created_at": "2023-12-31T23:30:00Z", "carbs": 20}],
            "glucose": [{"sgv": 130, "date": T0}],
            "currenttemp": {"duration": 10, "rate": 0.5, "temp": "absolute"},
            "currentTime": "2024-01-01T00:00:00Z",
            "temptargets": [{"eventType": "Temporary Target", "created_at": T0 - 60_000, "duration": 30, "targetBottom": 80, "targetTop": 80}],
            "microBolusAllowed": true,
            "autosens": {"ratio": 0.9}
        });
        let parsed = parse_request(&request.to_string(), Naming::Legacy).unwrap();
        assert_eq!(parsed.clock, T0);
        assert_eq!(parsed.treatments.len(), 2);
        assert_eq!(parsed.glucose.len(), 1);
        assert_eq!(parsed.current_temp.rate, 0.5);
        assert_eq!(parsed.temp_targets[0].low, 80.0);
        assert!(parsed.microbolus_allowed);
        assert_eq!(parsed.autosens.unwrap().ratio, 0.9);
    }

    #[test]
    fn test_parse_snake_request() {
        let request = json!({
            "profile": {"dia": 5, "current_basal": 1.0, "max_basal": 3, "max_iob": 2,
                        "sens": 50, "carb_ratio": 10, "min_bg": 100, "max_bg": 110},
            "treatments": [{"type": "bolus", "timestamp": T0, "units": 1.0}],
            "clock": T0
        });
        let parsed = parse_request(&request.to_string(), Naming::Snake).unwrap();
        assert_eq!(parsed.treatments, vec![Treatment::Bolus { timestamp: T0, units: 1.0 }]);
        assert!(!parsed.microbolus_allowed);
    }

    #[test]
    fn test_render_result_legacy_keys() {
        let result = DetermineBasalResult {
            rate: Some(1.5),
            duration: Some(30.0),
            reason: "test".into(),
            eventual_bg: Some(140.0),
            cob: Some(0.0),
            iob: Some(0.5),
            deliver_at: Some(T0),
            predictions: Some(crate::Predictions {
                iob: vec![120.0, 118.0],
                zero_temp: vec![120.0, 121.0],
                uam: None,
                cob: None,
                blended: vec![120.0, 118.0],
            }),
            ..DetermineBasalResult::default()
        };
        let value = render_result(&result, Naming::Legacy).unwrap();
        assert_eq!(value["temp"], "absolute");
        assert_eq!(value["eventualBG"], 140.0);
        assert_eq!(value["IOB"], 0.5);
        assert_eq!(value["deliverAt"], "2024-01-01T00:00:00.000Z");
        assert_eq!(value["predBGs"]["ZT"][1], 121.0);
        assert!(value.get("units").is_none());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_render_iob_legacy_nests_zero_temp() {
        let data = IobData {
            time: T0,
            iob: 1.0,
            ..IobData::default()
        };
        let projection = IobProjection {
            ticks: vec![crate::IobTick {
                actual: data.clone(),
                zero_temp: IobData { iob: 0.8, ..data },
            }],
            last_bolus_time: Some(T0 - 60_000),
            last_temp: None,
        };
        let value = render_iob(&projection, Naming::Legacy).unwrap();
        assert_eq!(value[0]["iob"], 1.0);
        assert_eq!(value[0]["iobWithZeroTemp"]["iob"], 0.8);
        assert_eq!(value[0]["lastBolusTime"], T0 - 60_000);
        assert_eq!(value[0]["time"], "2024-01-01T00:00:00.000Z");
    }

    #[test]
    fn test_run_json_reports_errors() {
        let config = Config::default();
        let body: Value = serde_json::from_str(&run_json("iob", "not json", &config)).unwrap();
        assert_eq!(body["errorKind"], "invalid_input");

        let body: Value = serde_json::from_str(&run_json("teleport", "{}", &config)).unwrap();
        assert_eq!(body["errorKind"], "invalid_input");
    }

    #[test]
    fn test_run_json_iob() {
        let mut config = Config::default();
        config.output.naming = Naming::Snake;
        let request = json!({
            "profile": {"dia": 5, "current_basal": 1.0, "max_basal": 3, "max_iob": 2,
                        "sens": 50, "carb_ratio": 10, "min_bg": 100, "max_bg": 110},
            "treatments": [{"type": "bolus", "timestamp": T0, "units": 1.0}],
            "clock": T0
        });
        let body: Value =
            serde_json::from_str(&run_json("iob", &request.to_string(), &config)).unwrap();
        assert_eq!(body["ticks"][0]["actual"]["iob"], 1.0);
        assert_eq!(body["ticks"].as_array().unwrap().len(), 60);
    }

    #[test]
    fn test_timestamp_parsing() {
        assert_eq!(parse_timestamp(&json!(T0)).unwrap(), T0);
        assert_eq!(parse_timestamp(&json!("2024-01-01T01:00:00+01:00")).unwrap(), T0);
        assert_eq!(parse_timestamp(&json!(T0.to_string())).unwrap(), T0);
        assert!(parse_timestamp(&json!("yesterday")).is_err());
        assert_eq!(format_timestamp(T0).unwrap(), "2024-01-01T00:00:00.000Z");
    }
}
