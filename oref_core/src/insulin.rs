//! Insulin action curves.
//!
//! A curve answers two questions for a single unit dose `t` minutes after
//! delivery: how much of it is still on board, and how fast it is acting.
//! The model is resolved once per call from the profile.

use crate::{Error, Profile, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Template length of the bilinear curve, minutes.
const BILINEAR_END: f64 = 180.0;
/// Peak of the bilinear template, minutes.
const BILINEAR_PEAK: f64 = 75.0;
/// Fraction left at the bilinear peak, where the decay polynomial starts.
const BILINEAR_PEAK_IOB: f64 = 0.55556;
/// Where the bilinear decay polynomial bottoms out (x2 = 0.054233 / (2 * 0.001323)).
const BILINEAR_TAIL_VERTEX: f64 = 20.496_220;

/// Insulin curve family selected by the profile.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InsulinCurve {
    Bilinear,
    #[default]
    #[serde(alias = "rapid_acting", alias = "rapidacting")]
    RapidActing,
    #[serde(alias = "ultra_rapid", alias = "ultrarapid")]
    UltraRapid,
}

impl InsulinCurve {
    /// Peak time used when no custom peak is configured.
    pub fn default_peak(&self) -> f64 {
        match self {
            InsulinCurve::Bilinear => BILINEAR_PEAK,
            InsulinCurve::RapidActing => 75.0,
            InsulinCurve::UltraRapid => 55.0,
        }
    }

    /// Allowed custom peak range `(min, max)`.
    pub fn peak_range(&self) -> (f64, f64) {
        match self {
            InsulinCurve::Bilinear => (BILINEAR_PEAK, BILINEAR_PEAK),
            InsulinCurve::RapidActing => (50.0, 120.0),
            InsulinCurve::UltraRapid => (35.0, 100.0),
        }
    }

    /// Shortest DIA (hours) the curve is allowed to run with.
    pub fn min_dia(&self) -> f64 {
        match self {
            InsulinCurve::Bilinear => 3.0,
            InsulinCurve::RapidActing | InsulinCurve::UltraRapid => 5.0,
        }
    }

    pub fn is_exponential(&self) -> bool {
        !matches!(self, InsulinCurve::Bilinear)
    }
}

impl fmt::Display for InsulinCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InsulinCurve::Bilinear => "bilinear",
            InsulinCurve::RapidActing => "rapid-acting",
            InsulinCurve::UltraRapid => "ultra-rapid",
        };
        f.write_str(name)
    }
}

impl FromStr for InsulinCurve {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace(['_', '-'], "").as_str() {
            "bilinear" => Ok(InsulinCurve::Bilinear),
            "rapidacting" => Ok(InsulinCurve::RapidActing),
            "ultrarapid" => Ok(InsulinCurve::UltraRapid),
            _ => Err(Error::InvalidProfile(format!("unknown insulin curve: {}", s))),
        }
    }
}

/// Remaining fraction and activity of one unit at one instant.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CurveSample {
    /// 0..=1
    pub iob_fraction: f64,
    /// U per minute per unit dosed, never negative
    pub activity: f64,
}

impl CurveSample {
    const SPENT: CurveSample = CurveSample {
        iob_fraction: 0.0,
        activity: 0.0,
    };
}

/// Closed-form exponential curve parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExponentialCurve {
    pub dia_minutes: f64,
    pub peak_minutes: f64,
    tau: f64,
    a: f64,
    s: f64,
}

impl ExponentialCurve {
    pub fn new(dia_minutes: f64, peak_minutes: f64) -> Result<Self> {
        if !(peak_minutes > 0.0 && peak_minutes < dia_minutes) {
            return Err(Error::InvalidProfile(format!(
                "peak {} min must lie strictly inside DIA of {} min",
                peak_minutes, dia_minutes
            )));
        }

        let denominator = 1.0 - 2.0 * peak_minutes / dia_minutes;
        if denominator.abs() < 1e-9 {
            return Err(Error::Computation(format!(
                "peak {} min at half of DIA makes tau singular",
                peak_minutes
            )));
        }

        let tau = peak_minutes * (1.0 - peak_minutes / dia_minutes) / denominator;
        if !(tau.is_finite() && tau > 0.0) {
            return Err(Error::Computation(format!(
                "tau {} from peak {} min / DIA {} min is not a positive time constant",
                tau, peak_minutes, dia_minutes
            )));
        }
        let a = 2.0 * tau / dia_minutes;
        let s = 1.0 / (1.0 - a + (1.0 + a) * (-dia_minutes / tau).exp());
        if !s.is_finite() {
            return Err(Error::Computation(format!(
                "normalizing constant diverges for tau {}",
                tau
            )));
        }

        Ok(Self {
            dia_minutes,
            peak_minutes,
            tau,
            a,
            s,
        })
    }

    pub fn sample(&self, minutes: f64) -> CurveSample {
        if minutes < 0.0 {
            return CurveSample {
                iob_fraction: 1.0,
                activity: 0.0,
            };
        }
        if minutes >= self.dia_minutes {
            return CurveSample::SPENT;
        }

        let (t, tau, td, a, s) = (minutes, self.tau, self.dia_minutes, self.a, self.s);
        let decay = (-t / tau).exp();
        let activity = s / (tau * tau) * t * (1.0 - t / td) * decay;
        let iob = 1.0
            - s * (1.0 - a) * ((t * t / (tau * td * (1.0 - a)) - t / tau - 1.0) * decay + 1.0);

        CurveSample {
            iob_fraction: iob.clamp(0.0, 1.0),
            activity: activity.max(0.0),
        }
    }
}

/// Curve resolved for one call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CurveModel {
    Bilinear { dia_minutes: f64 },
    Exponential(ExponentialCurve),
}

impl CurveModel {
    /// Resolve the curve, effective DIA and effective peak from a profile.
    pub fn from_profile(profile: &Profile) -> Result<Self> {
        let dia_minutes = effective_dia(profile)? * 60.0;

        if !profile.curve.is_exponential() {
            return Ok(CurveModel::Bilinear { dia_minutes });
        }

        let peak = effective_peak(profile, dia_minutes)?;
        Ok(CurveModel::Exponential(ExponentialCurve::new(
            dia_minutes,
            peak,
        )?))
    }

    pub fn dia_minutes(&self) -> f64 {
        match self {
            CurveModel::Bilinear { dia_minutes } => *dia_minutes,
            CurveModel::Exponential(curve) => curve.dia_minutes,
        }
    }

    /// Peak activity time; the bilinear peak scales with DIA.
    pub fn peak_minutes(&self) -> f64 {
        match self {
            CurveModel::Bilinear { dia_minutes } => BILINEAR_PEAK * dia_minutes / BILINEAR_END,
            CurveModel::Exponential(curve) => curve.peak_minutes,
        }
    }

    pub fn sample(&self, minutes: f64) -> CurveSample {
        match self {
            CurveModel::Bilinear { dia_minutes } => bilinear(minutes, *dia_minutes),
            CurveModel::Exponential(curve) => curve.sample(minutes),
        }
    }

    pub fn iob_fraction(&self, minutes: f64) -> f64 {
        self.sample(minutes).iob_fraction
    }

    pub fn activity(&self, minutes: f64) -> f64 {
        self.sample(minutes).activity
    }
}

/// Configured DIA raised to the curve's minimum.
pub fn effective_dia(profile: &Profile) -> Result<f64> {
    if !(profile.dia.is_finite() && profile.dia > 0.0) {
        return Err(Error::InvalidProfile(format!(
            "DIA must be positive, got {}",
            profile.dia
        )));
    }
    let min_dia = profile.curve.min_dia();
    if profile.dia < min_dia {
        tracing::debug!(
            "DIA {}h raised to {}h minimum for {} curve",
            profile.dia,
            min_dia,
            profile.curve
        );
    }
    Ok(profile.dia.max(min_dia))
}

/// Peak fed to sensitivity formulas. The bilinear curve reports its
/// template peak here, not the DIA-stretched one.
pub fn sensitivity_peak(profile: &Profile) -> Result<f64> {
    if !profile.curve.is_exponential() {
        return Ok(BILINEAR_PEAK);
    }
    effective_peak(profile, effective_dia(profile)? * 60.0)
}

fn effective_peak(profile: &Profile, dia_minutes: f64) -> Result<f64> {
    let curve = profile.curve;
    let custom = match (profile.use_custom_peak_time, profile.insulin_peak_time) {
        (true, Some(peak)) => peak,
        _ => return Ok(curve.default_peak()),
    };

    if !(custom > 0.0 && custom < dia_minutes) {
        return Err(Error::InvalidProfile(format!(
            "custom peak {} min outside (0, {}) min",
            custom, dia_minutes
        )));
    }

    let (min_peak, max_peak) = curve.peak_range();
    let peak = custom.clamp(min_peak, max_peak);
    if peak != custom {
        tracing::debug!("custom peak {} min clamped to {} min", custom, peak);
    }
    Ok(peak)
}

/// Piecewise curve on a 180 minute template, stretched to the real DIA.
fn bilinear(minutes: f64, dia_minutes: f64) -> CurveSample {
    if minutes < 0.0 {
        return CurveSample {
            iob_fraction: 1.0,
            activity: 0.0,
        };
    }

    let scaled = minutes * BILINEAR_END / dia_minutes;
    let activity_peak = 2.0 / dia_minutes;
    let slope_up = activity_peak / BILINEAR_PEAK;
    let slope_down = -activity_peak / (BILINEAR_END - BILINEAR_PEAK);

    if scaled < BILINEAR_PEAK {
        let x1 = scaled / 5.0 + 1.0;
        // Rise polynomial ends at 0.55552; hold it at the decay branch's start.
        let iob = (-0.001852 * x1 * x1 + 0.001852 * x1 + 1.0).max(BILINEAR_PEAK_IOB);
        CurveSample {
            iob_fraction: iob.clamp(0.0, 1.0),
            activity: slope_up * scaled,
        }
    } else if scaled < BILINEAR_END {
        let x2 = (scaled - BILINEAR_PEAK) / 5.0;
        let iob = if x2 >= BILINEAR_TAIL_VERTEX {
            0.0
        } else {
            0.001323 * x2 * x2 - 0.054233 * x2 + BILINEAR_PEAK_IOB
        };
        CurveSample {
            iob_fraction: iob.clamp(0.0, 1.0),
            activity: (activity_peak + slope_down * (scaled - BILINEAR_PEAK)).max(0.0),
        }
    } else {
        CurveSample::SPENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(curve: InsulinCurve, dia: f64) -> Profile {
        Profile::new(dia, 1.0, 50.0, 10.0).with_curve(curve)
    }

    #[test]
    fn test_bilinear_fraction_at_known_points() {
        let model = CurveModel::from_profile(&profile(InsulinCurve::Bilinear, 3.0)).unwrap();
        assert_eq!(model.iob_fraction(0.0), 1.0);
        let one_hour = model.iob_fraction(60.0);
        assert!((one_hour - 0.711).abs() < 1e-3);
        assert_eq!(model.iob_fraction(180.0), 0.0);
    }

    #[test]
    fn test_bilinear_tail_never_negative() {
        let model = CurveModel::Bilinear { dia_minutes: 180.0 };
        for minute in 0..=200 {
            let sample = model.sample(minute as f64);
            assert!(sample.iob_fraction >= 0.0);
            assert!(sample.activity >= 0.0);
        }
        assert_eq!(model.iob_fraction(179.0), 0.0);
    }

    #[test]
    fn test_bilinear_monotone() {
        let model = CurveModel::Bilinear { dia_minutes: 240.0 };
        let mut previous = 1.0;
        for minute in 0..=240 {
            let fraction = model.iob_fraction(minute as f64);
            assert!(fraction <= previous + 1e-12, "rose at minute {}", minute);
            previous = fraction;
        }
    }

    #[test]
    fn test_exponential_starts_full_and_ends_spent() {
        let model = CurveModel::from_profile(&profile(InsulinCurve::RapidActing, 5.0)).unwrap();
        assert!((model.iob_fraction(0.0) - 1.0).abs() < 1e-9);
        assert!(model.iob_fraction(299.0) < 0.01);
        assert_eq!(model.iob_fraction(300.0), 0.0);
        assert_eq!(model.activity(0.0), 0.0);
    }

    #[test]
    fn test_exponential_activity_peaks_near_peak_time() {
        let model = CurveModel::from_profile(&profile(InsulinCurve::UltraRapid, 5.0)).unwrap();
        let at_peak = model.activity(55.0);
        assert!(at_peak > model.activity(20.0));
        assert!(at_peak > model.activity(120.0));
    }

    #[test]
    fn test_exponential_dia_raised_to_minimum() {
        let model = CurveModel::from_profile(&profile(InsulinCurve::RapidActing, 3.0)).unwrap();
        assert_eq!(model.dia_minutes(), 300.0);
    }

    #[test]
    fn test_custom_peak_clamped_to_range() {
        let mut p = profile(InsulinCurve::RapidActing, 5.0);
        p.use_custom_peak_time = true;
        p.insulin_peak_time = Some(200.0);
        let model = CurveModel::from_profile(&p).unwrap();
        assert_eq!(model.peak_minutes(), 120.0);
    }

    #[test]
    fn test_custom_peak_outside_dia_rejected() {
        let mut p = profile(InsulinCurve::RapidActing, 5.0);
        p.use_custom_peak_time = true;
        p.insulin_peak_time = Some(0.0);
        assert!(matches!(
            CurveModel::from_profile(&p),
            Err(Error::InvalidProfile(_))
        ));
    }

    #[test]
    fn test_sensitivity_peak_ignores_dia_stretch() {
        let p = profile(InsulinCurve::Bilinear, 5.0);
        assert_eq!(CurveModel::from_profile(&p).unwrap().peak_minutes(), 125.0);
        assert_eq!(sensitivity_peak(&p).unwrap(), 75.0);

        let mut p = profile(InsulinCurve::UltraRapid, 5.0);
        assert_eq!(sensitivity_peak(&p).unwrap(), 55.0);
        p.use_custom_peak_time = true;
        p.insulin_peak_time = Some(20.0);
        assert_eq!(sensitivity_peak(&p).unwrap(), 35.0);
    }

    #[test]
    fn test_half_dia_peak_is_singular() {
        let err = ExponentialCurve::new(300.0, 150.0).unwrap_err();
        assert!(matches!(err, Error::Computation(_)));
    }

    #[test]
    fn test_curve_parse_aliases() {
        assert_eq!("rapid_acting".parse::<InsulinCurve>().unwrap(), InsulinCurve::RapidActing);
        assert_eq!("Ultra-Rapid".parse::<InsulinCurve>().unwrap(), InsulinCurve::UltraRapid);
        assert!("linear".parse::<InsulinCurve>().is_err());
        assert_eq!(InsulinCurve::UltraRapid.to_string(), "ultra-rapid");
    }
}
