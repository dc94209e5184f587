//! Error types for the oref_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for oref_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Profile fails a bound check (DIA, ISF, carb ratio, peak, autosens band)
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    /// No usable glucose reading inside the recency window
    #[error("Stale or missing glucose: {0}")]
    StaleOrMissingGlucose(String),

    /// Numerically degenerate parameters or a non-finite intermediate
    #[error("Computation error: {0}")]
    Computation(String),

    /// Treatment with a negative or non-finite amount
    #[error("Invalid treatment: {0}")]
    InvalidTreatment(String),

    /// Timestamp outside the representable calendar range
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    /// Malformed request payload
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Stable category name carried in `DetermineBasalResult::error_kind`.
    pub fn category(&self) -> &'static str {
        match self {
            Error::InvalidProfile(_) => "invalid_profile",
            Error::StaleOrMissingGlucose(_) => "stale_or_missing_glucose",
            Error::Computation(_) => "computation_error",
            Error::InvalidTreatment(_) => "invalid_treatment",
            Error::InvalidTimestamp(_) => "invalid_timestamp",
            Error::InvalidInput(_) | Error::Json(_) | Error::Csv(_) => "invalid_input",
            Error::Io(_) | Error::Toml(_) | Error::Config(_) => "environment",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_names() {
        assert_eq!(Error::InvalidProfile("dia".into()).category(), "invalid_profile");
        assert_eq!(
            Error::StaleOrMissingGlucose("none".into()).category(),
            "stale_or_missing_glucose"
        );
        assert_eq!(Error::Computation("tau".into()).category(), "computation_error");
    }

    #[test]
    fn test_display_includes_detail() {
        let err = Error::InvalidProfile("DIA must be positive".into());
        assert_eq!(err.to_string(), "Invalid profile: DIA must be positive");
    }
}
