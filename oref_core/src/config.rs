//! Configuration file support for oref.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/oref/config.toml`. The
//! engines never read it themselves; callers pass the sections explicitly.

use crate::wire::Naming;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,

    #[serde(default)]
    pub autosens: AutosensSettings,

    #[serde(default)]
    pub output: OutputConfig,
}

/// Limits applied by the determine-basal pipeline
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EngineSettings {
    /// Newest reading older than this is stale
    #[serde(default = "default_max_glucose_age_minutes")]
    pub max_glucose_age_minutes: f64,

    /// Newest reading further in the future than this is rejected
    #[serde(default = "default_max_glucose_future_minutes")]
    pub max_glucose_future_minutes: f64,

    /// Upper bound on the prediction horizon
    #[serde(default = "default_max_prediction_minutes")]
    pub max_prediction_minutes: i64,

    /// Length of the hypothetical zero temp used for the zero-temp curve
    #[serde(default = "default_zero_temp_minutes")]
    pub zero_temp_minutes: f64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_glucose_age_minutes: default_max_glucose_age_minutes(),
            max_glucose_future_minutes: default_max_glucose_future_minutes(),
            max_prediction_minutes: default_max_prediction_minutes(),
            zero_temp_minutes: default_zero_temp_minutes(),
        }
    }
}

/// Sensitivity detection parameters
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AutosensSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lookback windows; the lowest resulting ratio is used
    #[serde(default = "default_windows_hours")]
    pub windows_hours: Vec<f64>,

    /// Non-meal deviations required before a ratio other than 1.0 is trusted
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
}

impl Default for AutosensSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            windows_hours: default_windows_hours(),
            min_samples: default_min_samples(),
        }
    }
}

/// Response formatting
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    #[serde(default)]
    pub naming: Naming,

    #[serde(default = "default_true")]
    pub pretty: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            naming: Naming::default(),
            pretty: true,
        }
    }
}

// Default value functions
fn default_max_glucose_age_minutes() -> f64 {
    12.0
}

fn default_max_glucose_future_minutes() -> f64 {
    5.0
}

fn default_max_prediction_minutes() -> i64 {
    360
}

fn default_zero_temp_minutes() -> f64 {
    240.0
}

fn default_true() -> bool {
    true
}

fn default_windows_hours() -> Vec<f64> {
    vec![8.0, 24.0]
}

fn default_min_samples() -> usize {
    24
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::debug!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        base.join("oref").join("config.toml")
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_glucose_age_minutes <= 0.0 {
            return Err(Error::Config(
                "engine.max_glucose_age_minutes must be positive".into(),
            ));
        }
        if self.engine.max_prediction_minutes < 5 {
            return Err(Error::Config(
                "engine.max_prediction_minutes must be at least 5".into(),
            ));
        }
        if self.autosens.windows_hours.iter().any(|h| *h <= 0.0) {
            return Err(Error::Config(
                "autosens.windows_hours must all be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        let config_path = Self::default_config_path();
        self.save_to(&config_path)
    }

    /// Save the current configuration to a specific path, atomically
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let contents = self.to_toml()?;

        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(contents.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}
