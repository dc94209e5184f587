//! Glucose status and 5-minute bucketing.

use crate::rounding::round_to;
use crate::{Error, GlucoseReading, GlucoseStatus, Result, MINUTE_MS};

/// Readings at or below this are sensor error codes.
pub const SENSOR_ERROR_CEILING: f64 = 38.0;
/// Longest gap that is filled by interpolation, minutes.
const MAX_INTERPOLATED_GAP: f64 = 240.0;

/// Current glucose and rolling deltas from readings in any order.
///
/// Readings within 2.5 minutes of the newest are averaged into it. `delta`
/// comes from readings 2.5–7.5 minutes old, `short_avgdelta` from 2.5–17.5
/// and `long_avgdelta` from 17.5–42.5, each scaled to mg/dL per 5 minutes.
pub fn status(readings: &[GlucoseReading]) -> Result<GlucoseStatus> {
    let mut data: Vec<&GlucoseReading> = readings
        .iter()
        .filter(|reading| reading.glucose.is_finite() && reading.glucose > 0.0)
        .collect();
    data.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let newest = *data
        .first()
        .ok_or_else(|| Error::StaleOrMissingGlucose("no glucose readings".into()))?;

    let mut now_glucose = newest.glucose;
    let mut now_time = newest.timestamp as f64;
    let mut last_deltas = Vec::new();
    let mut short_deltas = Vec::new();
    let mut long_deltas = Vec::new();

    for reading in data.iter().skip(1) {
        if reading.glucose <= SENSOR_ERROR_CEILING {
            continue;
        }
        if let (Some(device), Some(other)) = (&newest.device, &reading.device) {
            if device != other {
                continue;
            }
        }

        let minutes_ago = ((now_time - reading.timestamp as f64) / MINUTE_MS as f64).round();
        let change = now_glucose - reading.glucose;

        if minutes_ago > -2.0 && minutes_ago < 2.5 {
            now_glucose = (now_glucose + reading.glucose) / 2.0;
            now_time = (now_time + reading.timestamp as f64) / 2.0;
        } else if minutes_ago > 2.5 && minutes_ago < 17.5 {
            let avg_delta = change / minutes_ago * 5.0;
            short_deltas.push(avg_delta);
            if minutes_ago < 7.5 {
                last_deltas.push(avg_delta);
            }
        } else if minutes_ago > 17.5 && minutes_ago < 42.5 {
            long_deltas.push(change / minutes_ago * 5.0);
        }
    }

    Ok(GlucoseStatus {
        glucose: now_glucose,
        delta: round_to(mean(&last_deltas), 2),
        short_avgdelta: round_to(mean(&short_deltas), 2),
        long_avgdelta: round_to(mean(&long_deltas), 2),
        timestamp: now_time.round() as i64,
        noise: newest.noise,
        device: newest.device.clone(),
    })
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// One 5-minute glucose sample.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GlucoseBucket {
    pub timestamp: i64,
    pub glucose: f64,
}

/// Regularize readings in `[from, to]` into roughly 5-minute buckets, newest first.
///
/// Readings under 2 minutes apart are averaged. Gaps over 8 minutes are
/// filled by linear interpolation for at most 4 hours.
pub fn bucketize(readings: &[GlucoseReading], from: i64, to: i64) -> Vec<GlucoseBucket> {
    let mut data: Vec<&GlucoseReading> = readings
        .iter()
        .filter(|r| r.glucose.is_finite() && r.glucose > SENSOR_ERROR_CEILING)
        .filter(|r| r.timestamp >= from && r.timestamp <= to)
        .collect();
    data.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut buckets: Vec<GlucoseBucket> = Vec::with_capacity(data.len());

    for reading in data {
        let Some(last) = buckets.last().copied() else {
            buckets.push(GlucoseBucket {
                timestamp: reading.timestamp,
                glucose: reading.glucose,
            });
            continue;
        };

        let elapsed = (last.timestamp - reading.timestamp) as f64 / MINUTE_MS as f64;
        if elapsed > 8.0 {
            let mut remaining = elapsed.min(MAX_INTERPOLATED_GAP);
            let mut glucose = last.glucose;
            let mut timestamp = last.timestamp;
            while remaining > 5.0 {
                glucose += 5.0 / remaining * (reading.glucose - glucose);
                timestamp -= 5 * MINUTE_MS;
                buckets.push(GlucoseBucket {
                    timestamp,
                    glucose: round_to(glucose, 0),
                });
                remaining -= 5.0;
            }
        }

        push_or_merge(&mut buckets, reading);
    }

    buckets
}

fn push_or_merge(buckets: &mut Vec<GlucoseBucket>, reading: &GlucoseReading) {
    if let Some(last) = buckets.last_mut() {
        let elapsed = (last.timestamp - reading.timestamp) as f64 / MINUTE_MS as f64;
        if elapsed <= 2.0 {
            last.glucose = (last.glucose + reading.glucose) / 2.0;
            return;
        }
    }
    buckets.push(GlucoseBucket {
        timestamp: reading.timestamp,
        glucose: reading.glucose,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_704_067_200_000;

    fn reading(minutes_ago: i64, glucose: f64) -> GlucoseReading {
        GlucoseReading {
            timestamp: T0 - minutes_ago * MINUTE_MS,
            glucose,
            noise: 0,
            device: None,
        }
    }

    #[test]
    fn test_status_steady_rise() {
        let readings: Vec<_> = (0..10).map(|i| reading(i * 5, 150.0 - 2.0 * i as f64)).collect();
        let status = status(&readings).unwrap();
        assert_eq!(status.glucose, 150.0);
        assert_eq!(status.delta, 2.0);
        assert_eq!(status.short_avgdelta, 2.0);
        assert_eq!(status.long_avgdelta, 2.0);
        assert_eq!(status.timestamp, T0);
    }

    #[test]
    fn test_status_order_independent() {
        let mut readings: Vec<_> = (0..8).map(|i| reading(i * 5, 120.0 + i as f64)).collect();
        let forward = status(&readings).unwrap();
        readings.reverse();
        assert_eq!(forward, status(&readings).unwrap());
    }

    #[test]
    fn test_status_averages_near_duplicates() {
        let readings = vec![reading(0, 100.0), reading(1, 104.0), reading(5, 95.0)];
        let status = status(&readings).unwrap();
        assert_eq!(status.glucose, 102.0);
    }

    #[test]
    fn test_status_ignores_other_devices() {
        let mut other = reading(5, 300.0);
        other.device = Some("receiver".into());
        let mut newest = reading(0, 100.0);
        newest.device = Some("phone".into());
        let mut same = reading(10, 90.0);
        same.device = Some("phone".into());

        let status = status(&[newest, other, same]).unwrap();
        assert_eq!(status.delta, 0.0);
        assert_eq!(status.short_avgdelta, 5.0);
    }

    #[test]
    fn test_status_without_readings() {
        assert!(matches!(
            status(&[]),
            Err(Error::StaleOrMissingGlucose(_))
        ));
    }

    #[test]
    fn test_bucketize_interpolates_gap() {
        let readings = vec![reading(0, 100.0), reading(20, 120.0)];
        let buckets = bucketize(&readings, T0 - 60 * MINUTE_MS, T0);
        let values: Vec<f64> = buckets.iter().map(|b| b.glucose).collect();
        assert_eq!(values, vec![100.0, 105.0, 110.0, 115.0, 120.0]);
        assert_eq!(buckets[1].timestamp, T0 - 5 * MINUTE_MS);
    }

    #[test]
    fn test_bucketize_merges_close_readings() {
        let readings = vec![reading(0, 100.0), reading(1, 110.0), reading(5, 90.0)];
        let buckets = bucketize(&readings, T0 - 60 * MINUTE_MS, T0);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].glucose, 105.0);
    }

    #[test]
    fn test_bucketize_drops_error_codes_and_window() {
        let readings = vec![reading(0, 38.0), reading(5, 100.0), reading(120, 90.0)];
        let buckets = bucketize(&readings, T0 - 60 * MINUTE_MS, T0);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].glucose, 100.0);
    }
}
