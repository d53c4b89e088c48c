//! Session configuration.
//!
//! Config JSON follows the `spotcall.config.v1` schema. Every section is
//! optional and falls back to its defaults; unknown top-level keys are
//! rejected.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::acquisition::AcquisitionConfig;
use crate::basis::BasisConfig;
use crate::features::FeatureConfig;
use crate::phase::PhaseConfig;
use crate::report::ReportConfig;
use crate::segment::RoiDetectConfig;
use crate::unmix::UnmixConfig;

pub const CONFIG_SCHEMA_V1: &str = "spotcall.config.v1";

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "config I/O error: {}", e),
            Self::Json(e) => write!(f, "config parse error: {}", e),
            Self::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

// ── Config ─────────────────────────────────────────────────────────────────

/// Top-level configuration of a sequencing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SpotcallConfig {
    pub schema: String,
    pub roi: RoiDetectConfig,
    pub features: FeatureConfig,
    pub basis: BasisConfig,
    pub unmix: UnmixConfig,
    pub phase: PhaseConfig,
    pub acquisition: AcquisitionConfig,
    pub report: ReportConfig,
}

impl Default for SpotcallConfig {
    fn default() -> Self {
        Self {
            schema: CONFIG_SCHEMA_V1.to_string(),
            roi: RoiDetectConfig::default(),
            features: FeatureConfig::default(),
            basis: BasisConfig::default(),
            unmix: UnmixConfig::default(),
            phase: PhaseConfig::default(),
            acquisition: AcquisitionConfig::default(),
            report: ReportConfig::default(),
        }
    }
}

impl SpotcallConfig {
    /// Load and validate a config file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }

    pub fn from_json_str(data: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Report the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema != CONFIG_SCHEMA_V1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config schema '{}' (expected '{}')",
                self.schema, CONFIG_SCHEMA_V1
            )));
        }
        self.roi
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.features.dark_wavelength == self.features.uv_wavelength {
            return Err(ConfigError::Invalid(
                "dark and UV wavelengths must differ".to_string(),
            ));
        }
        if let Some(list) = &self.features.basis_wavelengths {
            if list.contains(&self.features.dark_wavelength) {
                return Err(ConfigError::Invalid(
                    "basis_wavelengths must not contain the dark wavelength".to_string(),
                ));
            }
        }
        if !(self.basis.max_condition_number >= 1.0) {
            return Err(ConfigError::Invalid(
                "basis.max_condition_number must be >= 1".to_string(),
            ));
        }
        if self.unmix.max_iter == 0 {
            return Err(ConfigError::Invalid("unmix.max_iter must be >= 1".to_string()));
        }
        if !(self.unmix.tol >= 0.0) || !(self.unmix.pinv_eps >= 0.0) {
            return Err(ConfigError::Invalid(
                "unmix tolerances must be finite and >= 0".to_string(),
            ));
        }
        self.phase
            .params
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if !(self.phase.max_condition_number >= 1.0) {
            return Err(ConfigError::Invalid(
                "phase.max_condition_number must be >= 1".to_string(),
            ));
        }
        self.report.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}
