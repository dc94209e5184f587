//! Profile validation and time-of-day schedule lookups.
//!
//! Schedules are small tables keyed by minutes after local midnight. A lookup
//! returns the last entry starting at or before the query minute. Before the
//! first entry of the day the previous day's last entry is still in effect.

use crate::insulin::CurveModel;
use crate::rounding::round_to;
use crate::{
    BasalEntry, CarbRatioEntry, Error, IsfEntry, Profile, ProfileSnapshot, Result, TargetEntry,
    TempTarget,
};
use chrono::{DateTime, FixedOffset, Timelike, Utc};

const MINUTES_PER_DAY: u32 = 1440;
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// A schedule row with a start offset.
pub trait Scheduled {
    fn offset_minutes(&self) -> u32;
}

impl Scheduled for BasalEntry {
    fn offset_minutes(&self) -> u32 {
        self.offset_minutes
    }
}

impl Scheduled for IsfEntry {
    fn offset_minutes(&self) -> u32 {
        self.offset_minutes
    }
}

impl Scheduled for CarbRatioEntry {
    fn offset_minutes(&self) -> u32 {
        self.offset_minutes
    }
}

impl Scheduled for TargetEntry {
    fn offset_minutes(&self) -> u32 {
        self.offset_minutes
    }
}

/// Entry in effect at `minute`, regardless of table order.
pub fn active_entry<T: Scheduled>(entries: &[T], minute: u32) -> Option<&T> {
    let mut current: Option<&T> = None;
    let mut latest: Option<&T> = None;

    for entry in entries {
        let offset = entry.offset_minutes();
        if offset <= minute && current.map_or(true, |c| offset >= c.offset_minutes()) {
            current = Some(entry);
        }
        if latest.map_or(true, |l| offset >= l.offset_minutes()) {
            latest = Some(entry);
        }
    }

    current.or(latest)
}

/// Minutes after local midnight for `at` in the profile's timezone.
pub fn local_minute_of_day(profile: &Profile, at: i64) -> Result<u32> {
    let offset = FixedOffset::east_opt(profile.utc_offset_minutes * 60).ok_or_else(|| {
        Error::InvalidProfile(format!(
            "utc offset {} minutes out of range",
            profile.utc_offset_minutes
        ))
    })?;
    let utc = DateTime::<Utc>::from_timestamp_millis(at).ok_or(Error::InvalidTimestamp(at))?;
    let local = utc.with_timezone(&offset);
    Ok(local.hour() * 60 + local.minute())
}

/// Scheduled basal rate (U/hr) at `at`.
pub fn basal_at(profile: &Profile, at: i64) -> Result<f64> {
    let rate = if profile.basal_schedule.is_empty() {
        profile.current_basal
    } else {
        let minute = local_minute_of_day(profile, at)?;
        active_entry(&profile.basal_schedule, minute)
            .map(|entry| entry.rate)
            .unwrap_or(profile.current_basal)
    };
    Ok(round_to(rate, 3))
}

/// Insulin sensitivity (mg/dL per U) at `at`.
pub fn isf_at(profile: &Profile, at: i64) -> Result<f64> {
    if profile.isf_schedule.is_empty() {
        return Ok(profile.sens);
    }
    let minute = local_minute_of_day(profile, at)?;
    Ok(active_entry(&profile.isf_schedule, minute)
        .map(|entry| entry.sensitivity)
        .unwrap_or(profile.sens))
}

/// Carb ratio (g per U) at `at`.
pub fn carb_ratio_at(profile: &Profile, at: i64) -> Result<f64> {
    if profile.carb_ratio_schedule.is_empty() {
        return Ok(profile.carb_ratio);
    }
    let minute = local_minute_of_day(profile, at)?;
    Ok(active_entry(&profile.carb_ratio_schedule, minute)
        .map(|entry| entry.ratio)
        .unwrap_or(profile.carb_ratio))
}

/// Target band in effect at one instant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BgTargets {
    pub min_bg: f64,
    pub max_bg: f64,
    pub target_bg: f64,
    pub temp_target_set: bool,
}

/// Target band at `at`; the most recently started temp target wins while active.
pub fn targets_at(profile: &Profile, temp_targets: &[TempTarget], at: i64) -> Result<BgTargets> {
    let latest_temp = temp_targets
        .iter()
        .filter(|target| target.started_at <= at)
        .max_by_key(|target| target.started_at);

    if let Some(target) = latest_temp.filter(|target| target.is_active(at)) {
        return Ok(BgTargets {
            min_bg: target.low,
            max_bg: target.high,
            target_bg: round_to((target.low + target.high) / 2.0, 0),
            temp_target_set: true,
        });
    }

    let (min_bg, max_bg) = if profile.target_schedule.is_empty() {
        (profile.min_bg, profile.max_bg)
    } else {
        let minute = local_minute_of_day(profile, at)?;
        active_entry(&profile.target_schedule, minute)
            .map(|entry| (entry.low, entry.high))
            .unwrap_or((profile.min_bg, profile.max_bg))
    };

    Ok(BgTargets {
        min_bg,
        max_bg,
        target_bg: round_to((min_bg + max_bg) / 2.0, 0),
        temp_target_set: false,
    })
}

/// Highest basal rate of the day.
pub fn max_daily_basal(profile: &Profile) -> f64 {
    if let Some(explicit) = profile.max_daily_basal {
        return explicit;
    }
    profile
        .basal_schedule
        .iter()
        .map(|entry| entry.rate)
        .fold(None, |acc: Option<f64>, rate| Some(acc.map_or(rate, |a| a.max(rate))))
        .unwrap_or(profile.current_basal)
}

/// Resolve every schedule at `at`.
pub fn resolve(profile: &Profile, temp_targets: &[TempTarget], at: i64) -> Result<ProfileSnapshot> {
    let targets = targets_at(profile, temp_targets, at)?;
    Ok(ProfileSnapshot {
        at,
        basal: basal_at(profile, at)?,
        isf: isf_at(profile, at)?,
        carb_ratio: carb_ratio_at(profile, at)?,
        min_bg: targets.min_bg,
        max_bg: targets.max_bg,
        target_bg: targets.target_bg,
        max_daily_basal: max_daily_basal(profile),
        temp_target_set: targets.temp_target_set,
    })
}

/// Check every bound the engines rely on.
pub fn validate(profile: &Profile) -> Result<()> {
    let invalid = |msg: String| Err(Error::InvalidProfile(msg));

    if !(profile.dia.is_finite() && profile.dia > 0.0) {
        return invalid(format!("DIA must be positive, got {}", profile.dia));
    }

    if profile.isf_schedule.is_empty() {
        if !(profile.sens.is_finite() && profile.sens > 0.0) {
            return invalid(format!("ISF must be positive, got {}", profile.sens));
        }
    } else if let Some(entry) = profile
        .isf_schedule
        .iter()
        .find(|entry| !(entry.sensitivity.is_finite() && entry.sensitivity > 0.0))
    {
        return invalid(format!(
            "ISF at minute {} must be positive, got {}",
            entry.offset_minutes, entry.sensitivity
        ));
    }

    if profile.carb_ratio_schedule.is_empty() {
        if !(profile.carb_ratio.is_finite() && profile.carb_ratio > 0.0) {
            return invalid(format!(
                "carb ratio must be positive, got {}",
                profile.carb_ratio
            ));
        }
    } else if let Some(entry) = profile
        .carb_ratio_schedule
        .iter()
        .find(|entry| !(entry.ratio.is_finite() && entry.ratio > 0.0))
    {
        return invalid(format!(
            "carb ratio at minute {} must be positive, got {}",
            entry.offset_minutes, entry.ratio
        ));
    }

    if profile.basal_schedule.is_empty() {
        if !(profile.current_basal.is_finite() && profile.current_basal > 0.0) {
            return invalid(format!(
                "current basal must be positive, got {}",
                profile.current_basal
            ));
        }
    } else {
        if profile
            .basal_schedule
            .iter()
            .any(|entry| !(entry.rate.is_finite() && entry.rate >= 0.0))
        {
            return invalid("basal schedule contains a negative rate".into());
        }
        if max_daily_basal(profile) <= 0.0 {
            return invalid("basal schedule has no positive rate".into());
        }
    }
    if let Some(explicit) = profile.max_daily_basal {
        if !(explicit.is_finite() && explicit > 0.0) {
            return invalid(format!("max daily basal must be positive, got {}", explicit));
        }
    }
    for (name, multiplier) in [
        ("max daily", profile.max_daily_safety_multiplier),
        ("current basal", profile.current_basal_safety_multiplier),
    ] {
        if !(multiplier.is_finite() && multiplier > 0.0) {
            return invalid(format!(
                "{} safety multiplier must be positive, got {}",
                name, multiplier
            ));
        }
    }

    if !(profile.autosens_min > 0.0
        && profile.autosens_min <= 1.0
        && profile.autosens_max >= 1.0
        && profile.autosens_max.is_finite())
    {
        return invalid(format!(
            "autosens bounds [{}, {}] must satisfy 0 < min <= 1 <= max",
            profile.autosens_min, profile.autosens_max
        ));
    }

    if !(profile.max_basal.is_finite() && profile.max_basal >= 0.0) {
        return invalid(format!("max basal must be >= 0, got {}", profile.max_basal));
    }
    if !(profile.max_iob.is_finite() && profile.max_iob >= 0.0) {
        return invalid(format!("max IOB must be >= 0, got {}", profile.max_iob));
    }
    if !(profile.bolus_increment.is_finite() && profile.bolus_increment > 0.0) {
        return invalid(format!(
            "bolus increment must be positive, got {}",
            profile.bolus_increment
        ));
    }

    if profile.target_schedule.is_empty() {
        if !(profile.min_bg > 0.0 && profile.min_bg <= profile.max_bg) {
            return invalid(format!(
                "target band [{}, {}] is inverted or non-positive",
                profile.min_bg, profile.max_bg
            ));
        }
    } else if let Some(entry) = profile
        .target_schedule
        .iter()
        .find(|entry| !(entry.low > 0.0 && entry.low <= entry.high))
    {
        return invalid(format!(
            "target at minute {} [{}, {}] is inverted or non-positive",
            entry.offset_minutes, entry.low, entry.high
        ));
    }

    let offsets = profile
        .basal_schedule
        .iter()
        .map(|e| e.offset_minutes)
        .chain(profile.isf_schedule.iter().map(|e| e.offset_minutes))
        .chain(profile.carb_ratio_schedule.iter().map(|e| e.offset_minutes))
        .chain(profile.target_schedule.iter().map(|e| e.offset_minutes));
    for offset in offsets {
        if offset >= MINUTES_PER_DAY {
            return invalid(format!("schedule offset {} is past midnight", offset));
        }
    }

    if profile.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
        return invalid(format!(
            "utc offset {} minutes out of range",
            profile.utc_offset_minutes
        ));
    }

    CurveModel::from_profile(profile)?;
    Ok(())
}
