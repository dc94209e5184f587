//! Rounding helpers shared by every engine.
//!
//! All published numbers pass through here so that identical inputs always
//! format identically, and negative zero never escapes.

/// Round half toward positive infinity (`2.5 -> 3`, `-2.5 -> -2`).
pub fn round_half_up(value: f64) -> f64 {
    let floor = value.floor();
    if value - floor >= 0.5 {
        floor + 1.0
    } else {
        floor
    }
}

/// Round to `digits` decimal places.
pub fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    positive_zero(round_half_up(value * scale) / scale)
}

/// Collapse `-0.0` to `0.0` so `{:.2}` never prints "-0.00".
pub fn positive_zero(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

/// Round a basal rate to what the pump can actually deliver.
///
/// x23/x54 pumps take 0.025 U/hr steps below 1 U/hr, everything else 0.05.
/// Between 1 and 10 U/hr the step is 0.05, above that 0.1.
pub fn round_basal(rate: f64, pump_model: Option<&str>) -> f64 {
    let fine_steps = pump_model
        .map(|model| model.ends_with("54") || model.ends_with("23"))
        .unwrap_or(false);
    let scale = if rate < 1.0 {
        if fine_steps {
            40.0
        } else {
            20.0
        }
    } else if rate < 10.0 {
        20.0
    } else {
        10.0
    };
    positive_zero(round_half_up(rate * scale) / scale)
}

/// Floor `units` to a whole number of `increment` steps.
pub fn floor_to_increment(units: f64, increment: f64) -> f64 {
    if increment <= 0.0 {
        return 0.0;
    }
    // Guard against 0.3 / 0.1 = 2.9999999999999996
    let steps = (units / increment + 1e-9).floor();
    positive_zero(round_to(steps * increment, 3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_half_up_direction() {
        assert_eq!(round_half_up(2.5), 3.0);
        assert_eq!(round_half_up(-2.5), -2.0);
        assert_eq!(round_half_up(-2.6), -3.0);
    }

    #[test]
    fn test_round_to_never_negative_zero() {
        let value = round_to(-0.0001, 2);
        assert_eq!(format!("{:.2}", value), "0.00");
        assert!(value.is_sign_positive());
    }

    #[test]
    fn test_round_basal_steps() {
        assert_eq!(round_basal(0.83, None), 0.85);
        assert_eq!(round_basal(0.83, Some("554")), 0.825);
        assert_eq!(round_basal(12.34, None), 12.3);
        assert_eq!(round_basal(0.0, None), 0.0);
    }

    #[test]
    fn test_floor_to_increment() {
        assert_eq!(floor_to_increment(0.3, 0.1), 0.3);
        assert_eq!(floor_to_increment(0.37, 0.05), 0.35);
        assert_eq!(floor_to_increment(0.04, 0.1), 0.0);
        assert_eq!(floor_to_increment(1.0, 0.0), 0.0);
    }
}
