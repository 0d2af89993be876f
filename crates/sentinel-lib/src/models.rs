//! Core data models for cohort anomaly detection

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::correlator::CorrelationConfig;
use crate::error::ValidationError;
use crate::severity::{Severity, SeverityConfig};

/// Half-open time window `[from, to)` a run evaluates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a window, rejecting `to <= from`
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, ValidationError> {
        if to <= from {
            return Err(ValidationError::InvalidWindow { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.from && ts < self.to
    }
}

/// One fixed combination of dimension values, e.g. `merchant=m1`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CohortKey(BTreeMap<String, String>);

impl CohortKey {
    pub fn new<I, K, V>(dimensions: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self(
            dimensions
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn get(&self, dimension: &str) -> Option<&str> {
        self.0.get(dimension).map(String::as_str)
    }

    pub fn dimensions(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl fmt::Display for CohortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (dim, value) in &self.0 {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}={}", dim, value)?;
            first = false;
        }
        Ok(())
    }
}

/// A single observation; `None` marks a missing value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

/// Ordered metric series for one cohort
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub points: Vec<SeriesPoint>,
}

impl MetricSeries {
    pub fn new(points: Vec<SeriesPoint>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn values(&self) -> Vec<Option<f64>> {
        self.points.iter().map(|p| p.value).collect()
    }
}

/// Closed set of detection strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    /// Seasonal-trend decomposition with MAD scoring of the residual
    SeasonalDecomposition,
    /// Two-sided cumulative sum control chart
    CumulativeSum,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::SeasonalDecomposition => "seasonal_decomposition",
            DetectorKind::CumulativeSum => "cumulative_sum",
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DetectorKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stl_mad" | "stl" | "seasonal" | "seasonal_decomposition" => {
                Ok(DetectorKind::SeasonalDecomposition)
            }
            "cusum" | "cumulative_sum" => Ok(DetectorKind::CumulativeSum),
            _ => Err(ValidationError::UnknownDetectorType(s.to_string())),
        }
    }
}

/// Tunable detector parameters. Every field has a default so a config file
/// only needs to name what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorParams {
    /// Score threshold (sensitivity); also the CUSUM decision interval `h`
    pub k_threshold: f64,
    /// Consecutive exceedances required before an alert is confirmed
    pub persistence: u32,
    /// Minimum series length a detector will evaluate
    pub min_support: usize,
    /// Seasonal period in points; 1 disables the seasonal component
    pub season_length: usize,
    /// Moving-median window for the trend component
    pub trend_window: usize,
    /// CUSUM slack subtracted at every step, in scale units
    pub cusum_drift: f64,
    pub severity: SeverityConfig,
    pub correlation: CorrelationConfig,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            k_threshold: 3.5,
            persistence: 2,
            min_support: 30,
            season_length: 7,
            trend_window: 31,
            cusum_drift: 0.5,
            severity: SeverityConfig::default(),
            correlation: CorrelationConfig::default(),
        }
    }
}

impl DetectorParams {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.k_threshold.is_finite() || self.k_threshold <= 0.0 {
            return Err(ValidationError::param(
                "k_threshold",
                format!("must be a positive number, got {}", self.k_threshold),
            ));
        }
        if self.persistence < 1 {
            return Err(ValidationError::param("persistence", "must be at least 1"));
        }
        if self.min_support < 1 {
            return Err(ValidationError::param("min_support", "must be at least 1"));
        }
        if self.season_length < 1 {
            return Err(ValidationError::param("season_length", "must be at least 1"));
        }
        if self.trend_window < 3 {
            return Err(ValidationError::param("trend_window", "must be at least 3"));
        }
        if !self.cusum_drift.is_finite() || self.cusum_drift < 0.0 {
            return Err(ValidationError::param(
                "cusum_drift",
                format!("must be non-negative, got {}", self.cusum_drift),
            ));
        }
        self.severity.validate()?;
        self.correlation.validate()
    }
}

/// A configured detector instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub id: Uuid,
    pub name: String,
    pub detector_type: DetectorKind,
    pub cohort_dimensions: Vec<String>,
    pub metrics: Vec<String>,
    pub params: DetectorParams,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl DetectorConfig {
    /// Build a detector from a type string, failing on unknown types or bad params
    pub fn new(
        name: impl Into<String>,
        detector_type: &str,
        cohort_dimensions: Vec<String>,
        metrics: Vec<String>,
        params: DetectorParams,
    ) -> Result<Self, ValidationError> {
        let kind = detector_type.parse::<DetectorKind>()?;
        Self::with_kind(name, kind, cohort_dimensions, metrics, params)
    }

    pub fn with_kind(
        name: impl Into<String>,
        detector_type: DetectorKind,
        cohort_dimensions: Vec<String>,
        metrics: Vec<String>,
        params: DetectorParams,
    ) -> Result<Self, ValidationError> {
        let config = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            detector_type,
            cohort_dimensions,
            metrics,
            params,
            enabled: true,
            created_at: Utc::now(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Mark the detector as disabled
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::param("name", "must not be empty"));
        }
        if self.cohort_dimensions.is_empty() {
            return Err(ValidationError::param(
                "cohort_dimensions",
                "at least one dimension is required",
            ));
        }
        if self.metrics.is_empty() {
            return Err(ValidationError::param(
                "metrics",
                "at least one metric is required",
            ));
        }
        self.params.validate()
    }
}

/// Persisted lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    fn rank(self) -> u8 {
        match self {
            RunStatus::Created => 0,
            RunStatus::Running => 1,
            RunStatus::Completed | RunStatus::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Status only ever moves forward; terminal states are final
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        next.rank() > self.rank()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Created => write!(f, "CREATED"),
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Completed => write!(f, "COMPLETED"),
            RunStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Bookkeeping for one execution of a detector over a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRun {
    pub id: Uuid,
    pub detector_id: Uuid,
    pub window: TimeWindow,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cohorts_processed: u64,
    pub anomalies_found: u64,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
}

impl DetectionRun {
    pub fn new(detector_id: Uuid, window: TimeWindow) -> Self {
        Self {
            id: Uuid::new_v4(),
            detector_id,
            window,
            started_at: None,
            completed_at: None,
            cohorts_processed: 0,
            anomalies_found: 0,
            status: RunStatus::Created,
            failure_detail: None,
        }
    }

    /// Apply a status change if it moves forward. Returns false when the
    /// transition would revert or leave a terminal state.
    pub fn transition(&mut self, next: RunStatus, at: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        match next {
            RunStatus::Running => self.started_at = Some(at),
            RunStatus::Completed | RunStatus::Failed => self.completed_at = Some(at),
            RunStatus::Created => {}
        }
        self.status = next;
        true
    }
}

/// A confirmed anomaly. Only created after guardrail confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyEvent {
    pub id: Uuid,
    pub run_id: Uuid,
    pub detector_id: Uuid,
    pub cohort_key: CohortKey,
    pub metric: String,
    pub timestamp: DateTime<Utc>,
    pub score: f64,
    pub severity: Severity,
    pub persisted_n: u32,
    pub created_at: DateTime<Utc>,
}
