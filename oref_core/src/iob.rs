//! Insulin on board.
//!
//! Treatments are flattened into a ledger of doses: boluses as they are, temp
//! basals as per-minute slices of insulin above (or below) the scheduled
//! basal. IOB at an instant is the sum of every dose's remaining fraction.

use crate::insulin::CurveModel;
use crate::profile;
use crate::rounding::{round_half_up, round_to};
use crate::{
    Error, IobData, IobProjection, IobTick, LastTemp, Profile, Result, Treatment, MINUTE_MS,
};

/// Projection step.
pub const TICK_MINUTES: i64 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DoseKind {
    Bolus,
    /// Temp basal delivery minus the scheduled basal; may be negative
    NetBasal,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Dose {
    pub timestamp: i64,
    pub units: f64,
    pub kind: DoseKind,
}

/// Doses sorted by time, ready for repeated IOB queries.
#[derive(Clone, Debug, Default)]
pub struct DoseLedger {
    doses: Vec<Dose>,
    last_bolus_time: Option<i64>,
    last_temp: Option<LastTemp>,
}

#[derive(Clone, Copy, Debug)]
struct TempSegment {
    start: i64,
    rate: f64,
    duration_minutes: f64,
}

impl DoseLedger {
    /// Build the ledger from every treatment recorded at or before `until`.
    pub fn from_history(profile: &Profile, treatments: &[Treatment], until: i64) -> Result<Self> {
        let mut doses = Vec::new();
        let mut temps = Vec::new();
        let mut last_bolus_time: Option<i64> = None;

        for treatment in treatments.iter().filter(|t| t.timestamp() <= until) {
            match *treatment {
                Treatment::Bolus { timestamp, units } => {
                    if !(units.is_finite() && units >= 0.0) {
                        return Err(Error::InvalidTreatment(format!(
                            "bolus at {} has {} units",
                            timestamp, units
                        )));
                    }
                    if units > 0.0 {
                        doses.push(Dose {
                            timestamp,
                            units,
                            kind: DoseKind::Bolus,
                        });
                        last_bolus_time = Some(last_bolus_time.map_or(timestamp, |t| t.max(timestamp)));
                    }
                }
                Treatment::TempBasal {
                    timestamp,
                    rate,
                    duration_minutes,
                } => {
                    if !(rate.is_finite() && rate >= 0.0)
                        || !(duration_minutes.is_finite() && duration_minutes >= 0.0)
                    {
                        return Err(Error::InvalidTreatment(format!(
                            "temp basal at {} has rate {} for {} min",
                            timestamp, rate, duration_minutes
                        )));
                    }
                    temps.push(TempSegment {
                        start: timestamp,
                        rate,
                        duration_minutes,
                    });
                }
                Treatment::Carbs { .. } => {}
            }
        }

        temps.sort_by(|a, b| {
            a.start
                .cmp(&b.start)
                .then(a.rate.total_cmp(&b.rate))
                .then(a.duration_minutes.total_cmp(&b.duration_minutes))
        });

        let mut last_temp = None;
        for (i, temp) in temps.iter().enumerate() {
            let mut end = temp
                .start
                .saturating_add((temp.duration_minutes * MINUTE_MS as f64) as i64);
            if let Some(next) = temps.get(i + 1) {
                end = end.min(next.start);
            }
            // Nothing past `until` has been delivered yet.
            push_net_basal(profile, &mut doses, temp.start, end.min(until), |_| temp.rate)?;
            last_temp = Some(LastTemp {
                started_at: temp.start,
                rate: temp.rate,
                duration_minutes: (end - temp.start) as f64 / MINUTE_MS as f64,
            });
        }

        sort_doses(&mut doses);
        tracing::debug!(
            "dose ledger: {} doses from {} treatments",
            doses.len(),
            treatments.len()
        );

        Ok(Self {
            doses,
            last_bolus_time,
            last_temp,
        })
    }

    /// Counterfactual ledger where a zero temp starts at `from` and replaces
    /// whatever temp basal would have run afterwards.
    pub fn with_zero_temp(&self, profile: &Profile, from: i64, minutes: f64) -> Result<Self> {
        let mut doses: Vec<Dose> = self
            .doses
            .iter()
            .filter(|dose| dose.kind == DoseKind::Bolus || dose.timestamp < from)
            .copied()
            .collect();
        let end = from + (minutes * MINUTE_MS as f64) as i64;
        push_net_basal(profile, &mut doses, from, end, |_| 0.0)?;
        sort_doses(&mut doses);

        Ok(Self {
            doses,
            last_bolus_time: self.last_bolus_time,
            last_temp: self.last_temp.clone(),
        })
    }

    pub fn doses(&self) -> &[Dose] {
        &self.doses
    }

    pub fn last_bolus_time(&self) -> Option<i64> {
        self.last_bolus_time
    }

    pub fn last_temp(&self) -> Option<&LastTemp> {
        self.last_temp.as_ref()
    }

    /// Doses delivered in `(after, until]`.
    fn window(&self, after: i64, until: i64) -> &[Dose] {
        let start = self.doses.partition_point(|dose| dose.timestamp <= after);
        let end = self.doses.partition_point(|dose| dose.timestamp <= until);
        &self.doses[start..end.max(start)]
    }

    /// Totals at `at`. Doses older than DIA contribute nothing.
    pub fn iob_at(&self, model: &CurveModel, at: i64) -> IobData {
        let dia_ms = (model.dia_minutes() * MINUTE_MS as f64) as i64;

        let mut iob = 0.0;
        let mut activity = 0.0;
        let mut basal_iob = 0.0;
        let mut bolus_iob = 0.0;
        let mut net_basal_insulin = 0.0;
        let mut bolus_insulin = 0.0;

        for dose in self.window(at - dia_ms, at) {
            let minutes_ago = round_half_up((at - dose.timestamp) as f64 / MINUTE_MS as f64);
            let sample = model.sample(minutes_ago);
            let remaining = dose.units * sample.iob_fraction;

            iob += remaining;
            activity += dose.units * sample.activity;
            match dose.kind {
                DoseKind::Bolus => {
                    bolus_iob += remaining;
                    bolus_insulin += dose.units;
                }
                DoseKind::NetBasal => {
                    basal_iob += remaining;
                    net_basal_insulin += dose.units;
                }
            }
        }

        IobData {
            time: at,
            iob: round_to(iob, 3),
            activity: round_to(activity, 4),
            basal_iob: round_to(basal_iob, 3),
            bolus_iob: round_to(bolus_iob, 3),
            net_basal_insulin: round_to(net_basal_insulin, 3),
            bolus_insulin: round_to(bolus_insulin, 3),
        }
    }
}

fn sort_doses(doses: &mut [Dose]) {
    doses.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then(a.kind.cmp(&b.kind))
            .then(a.units.total_cmp(&b.units))
    });
}

/// Slice `[start, end)` into minutes of `rate(t) - scheduled basal`.
fn push_net_basal(
    profile: &Profile,
    doses: &mut Vec<Dose>,
    start: i64,
    end: i64,
    rate: impl Fn(i64) -> f64,
) -> Result<()> {
    let mut t = start;
    while t < end {
        let slice_ms = MINUTE_MS.min(end - t);
        let scheduled = profile::basal_at(profile, t)?;
        let net_rate = rate(t) - scheduled;
        if net_rate != 0.0 {
            doses.push(Dose {
                timestamp: t,
                units: net_rate * slice_ms as f64 / (60.0 * MINUTE_MS as f64),
                kind: DoseKind::NetBasal,
            });
        }
        t += slice_ms;
    }
    Ok(())
}

/// IOB at a single instant.
pub fn calculate(profile: &Profile, treatments: &[Treatment], at: i64) -> Result<IobData> {
    let model = CurveModel::from_profile(profile)?;
    let ledger = DoseLedger::from_history(profile, treatments, at)?;
    Ok(ledger.iob_at(&model, at))
}

/// IOB every 5 minutes from `clock` for `horizon_minutes`, with the zero-temp
/// counterfactual alongside each step.
pub fn project(
    profile: &Profile,
    treatments: &[Treatment],
    clock: i64,
    horizon_minutes: i64,
    zero_temp_minutes: f64,
) -> Result<IobProjection> {
    let model = CurveModel::from_profile(profile)?;
    let ledger = DoseLedger::from_history(profile, treatments, clock)?;
    let zero_temp = ledger.with_zero_temp(profile, clock, zero_temp_minutes)?;

    let steps = (horizon_minutes / TICK_MINUTES).max(1);
    let ticks = (0..steps)
        .map(|step| {
            let at = clock + step * TICK_MINUTES * MINUTE_MS;
            IobTick {
                actual: ledger.iob_at(&model, at),
                zero_temp: zero_temp.iob_at(&model, at),
            }
        })
        .collect::<Vec<_>>();

    if let Some(first) = ticks.first() {
        tracing::debug!(
            "IOB {} (basal {}, bolus {}), activity {}",
            first.actual.iob,
            first.actual.basal_iob,
            first.actual.bolus_iob,
            first.actual.activity
        );
    }

    Ok(IobProjection {
        ticks,
        last_bolus_time: ledger.last_bolus_time(),
        last_temp: ledger.last_temp().cloned(),
    })
}

/// Insulin delivered in the 24 hours up to `clock`: boluses plus scheduled
/// basal adjusted by any temp basals.
pub fn total_daily_dose(profile: &Profile, treatments: &[Treatment], clock: i64) -> Result<f64> {
    let day_ms = 24 * 60 * MINUTE_MS;
    let ledger = DoseLedger::from_history(profile, treatments, clock)?;

    let mut scheduled = 0.0;
    let mut t = clock - day_ms;
    while t < clock {
        scheduled += profile::basal_at(profile, t)? / 60.0;
        t += MINUTE_MS;
    }

    let delivered: f64 = ledger
        .window(clock - day_ms, clock)
        .iter()
        .map(|dose| dose.units)
        .sum();

    Ok(round_to((scheduled + delivered).max(0.0), 2))
}
