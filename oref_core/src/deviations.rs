//! Observed glucose change minus the change insulin alone explains.
//!
//! Shared by carb absorption and autosens so both read the same series.

use crate::glucose::GlucoseBucket;
use crate::insulin::CurveModel;
use crate::iob::DoseLedger;
use crate::profile;
use crate::rounding::round_to;
use crate::{Profile, Result};

/// Deviation analysis for one glucose bucket.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviationPoint {
    pub timestamp: i64,
    pub glucose: f64,
    /// Change from the previous bucket
    pub delta: f64,
    /// Mean change per bucket over the last three
    pub avg_delta: f64,
    /// Glucose impact of insulin activity over 5 minutes
    pub bgi: f64,
    pub deviation: f64,
    pub avg_deviation: f64,
    pub isf: f64,
    pub basal: f64,
    pub iob: f64,
}

/// One point for every bucket with three older buckets behind it, newest first.
pub fn series(
    profile: &Profile,
    ledger: &DoseLedger,
    model: &CurveModel,
    buckets: &[GlucoseBucket],
) -> Result<Vec<DeviationPoint>> {
    let mut points = Vec::with_capacity(buckets.len());

    for (i, bucket) in buckets.iter().enumerate() {
        let (Some(previous), Some(older)) = (buckets.get(i + 1), buckets.get(i + 3)) else {
            break;
        };

        let isf = profile::isf_at(profile, bucket.timestamp)?;
        let basal = profile::basal_at(profile, bucket.timestamp)?;
        let insulin = ledger.iob_at(model, bucket.timestamp);

        let delta = bucket.glucose - previous.glucose;
        let avg_delta = round_to((bucket.glucose - older.glucose) / 3.0, 2);
        let bgi = round_to(-insulin.activity * isf * 5.0, 2);

        points.push(DeviationPoint {
            timestamp: bucket.timestamp,
            glucose: bucket.glucose,
            delta,
            avg_delta,
            bgi,
            deviation: round_to(delta - bgi, 2),
            avg_deviation: round_to(avg_delta - bgi, 3),
            isf,
            basal,
            iob: insulin.iob,
        });
    }

    Ok(points)
}
