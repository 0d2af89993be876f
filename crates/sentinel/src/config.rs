//! Sentinel configuration

use std::path::Path;

use anyhow::{Context, Result};
use sentinel_lib::{DetectorConfig, DetectorParams, JobConfig, ValidationError};
use serde::Deserialize;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SentinelConfig {
    /// Run settings shared by every detector
    #[serde(default)]
    pub job: JobConfig,

    /// Detector definitions
    #[serde(default)]
    pub detectors: Vec<DetectorDefinition>,
}

/// One detector as written in the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorDefinition {
    pub name: String,

    /// Strategy name, e.g. `stl_mad` or `cusum`
    #[serde(rename = "type")]
    pub detector_type: String,

    pub cohort_dimensions: Vec<String>,

    pub metrics: Vec<String>,

    /// Overrides on top of the default parameters
    #[serde(default)]
    pub params: DetectorParams,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl DetectorDefinition {
    /// Resolve the strategy and validate parameters
    pub fn to_config(&self) -> Result<DetectorConfig, ValidationError> {
        let config = DetectorConfig::new(
            self.name.clone(),
            &self.detector_type,
            self.cohort_dimensions.clone(),
            self.metrics.clone(),
            self.params.clone(),
        )?;
        Ok(if self.enabled { config } else { config.disabled() })
    }
}

impl SentinelConfig {
    /// Load configuration from an optional file and `SENTINEL_*` environment
    /// variables. Nested keys use `__`, e.g. `SENTINEL_JOB__MAX_WORKERS=8`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("SENTINEL")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?;

        let parsed: SentinelConfig = config
            .try_deserialize()
            .context("Invalid configuration")?;
        parsed.job.validate().context("Invalid job settings")?;
        Ok(parsed)
    }
}
