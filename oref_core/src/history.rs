//! Loading requests and CGM exports from disk.

use crate::wire::{self, Naming};
use crate::{Error, GlucoseReading, LoopRequest, Result};
use chrono::DateTime;
use csv::ReaderBuilder;
use serde::Deserialize;
use std::io::Read;
use std::path::Path;

/// CSV row of a CGM export
#[derive(Debug, Deserialize)]
struct CsvRow {
    /// Epoch milliseconds or RFC 3339
    timestamp: String,
    glucose: f64,
    noise: Option<u8>,
    device: Option<String>,
}

impl TryFrom<CsvRow> for GlucoseReading {
    type Error = Error;

    fn try_from(row: CsvRow) -> Result<Self> {
        let raw = row.timestamp.trim();
        let timestamp = match raw.parse::<i64>() {
            Ok(ms) => ms,
            Err(_) => DateTime::parse_from_rfc3339(raw)
                .map_err(|e| Error::InvalidInput(format!("Invalid date '{}': {}", raw, e)))?
                .timestamp_millis(),
        };

        Ok(GlucoseReading {
            timestamp,
            glucose: row.glucose,
            noise: row.noise.unwrap_or(0),
            device: row.device.filter(|d| !d.is_empty()),
        })
    }
}

/// Read a whole file, or stdin when `path` is `-`.
pub fn read_input(path: &Path) -> Result<String> {
    let mut contents = String::new();
    if path.as_os_str() == "-" {
        std::io::stdin().read_to_string(&mut contents)?;
    } else {
        contents = std::fs::read_to_string(path)?;
    }
    Ok(contents)
}

/// Load and parse a request file.
pub fn load_request(path: &Path, naming: Naming) -> Result<LoopRequest> {
    let contents = read_input(path)?;
    let request = wire::parse_request(&contents, naming)?;
    tracing::debug!(
        "Loaded request with {} treatments and {} readings from {:?}",
        request.treatments.len(),
        request.glucose.len(),
        path
    );
    Ok(request)
}

/// Load all readings from a CSV export with a header row
/// (`timestamp,glucose[,noise][,device]`).
pub fn load_glucose_csv(path: &Path) -> Result<Vec<GlucoseReading>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut readings = Vec::new();
    for result in reader.deserialize() {
        let row: CsvRow = result?;
        readings.push(GlucoseReading::try_from(row)?);
    }

    tracing::debug!("Loaded {} readings from {:?}", readings.len(), path);
    Ok(readings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const T0: i64 = 1_704_067_200_000;

    #[test]
    fn test_load_glucose_csv() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "timestamp,glucose,noise,device").unwrap();
        writeln!(file, "{},120,1,dexcom", T0).unwrap();
        writeln!(file, "2024-01-01T00:05:00Z,125,,").unwrap();
        file.flush().unwrap();

        let readings = load_glucose_csv(file.path()).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].noise, 1);
        assert_eq!(readings[0].device.as_deref(), Some("dexcom"));
        assert_eq!(readings[1].timestamp, T0 + 300_000);
        assert_eq!(readings[1].device, None);
    }

    #[test]
    fn test_bad_csv_date_is_invalid_input() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "timestamp,glucose").unwrap();
        writeln!(file, "last tuesday,120").unwrap();
        file.flush().unwrap();

        let err = load_glucose_csv(file.path()).unwrap_err();
        assert_eq!(err.category(), "invalid_input");
    }

    #[test]
    fn test_load_request_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"profile": {{"dia": 5, "current_basal": 1.0, "max_basal": 3, "max_iob": 2,
                 "sens": 50, "carb_ratio": 10}}, "clock": {}}}"#,
            T0
        )
        .unwrap();
        file.flush().unwrap();

        let request = load_request(file.path(), Naming::Snake).unwrap();
        assert_eq!(request.clock, T0);
        assert!(request.glucose.is_empty());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_request(Path::new("/nonexistent/request.json"), Naming::Legacy).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
