//! Error types for detection, guardrails and run orchestration
//!
//! Errors are split by blast radius:
//! - [`ValidationError`] and [`DetectionError`] stop a run before or while it executes
//! - [`SeriesError`] means one series cannot be evaluated
//! - [`SourceError`] is classified per call site into abort vs isolate

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Bad configuration or request parameters. Never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("invalid window: end {to} must be strictly after start {from}")]
    InvalidWindow {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[error("unknown detector type `{0}`")]
    UnknownDetectorType(String),

    #[error("detector {0} not found")]
    DetectorNotFound(Uuid),

    #[error("detector {0} is disabled")]
    DetectorDisabled(Uuid),
}

impl ValidationError {
    pub(crate) fn param(name: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// A series that cannot be evaluated by a detector.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SeriesError {
    #[error("insufficient data: need {needed} points, have {have}")]
    InsufficientData { needed: usize, have: usize },

    #[error("series is empty or has no observed values")]
    EmptyInput,
}

/// Failures reported by a cohort data source.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("data source connection failed: {0}")]
    Connection(String),

    #[error("data source did not respond within {0:?}")]
    Timeout(Duration),

    #[error("no rows for cohort {cohort}, metric {metric}")]
    EmptyResult { cohort: String, metric: String },

    #[error("query failed: {0}")]
    Query(String),
}

impl SourceError {
    /// Connection-level failures abort the whole run; everything else is
    /// isolated to the cohort that produced it.
    pub fn is_connection_level(&self) -> bool {
        matches!(self, SourceError::Connection(_) | SourceError::Timeout(_))
    }
}

/// Storage failures from a [`crate::repository::DetectionRepository`].
#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("record {0} not found")]
    NotFound(Uuid),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Run-level failures returned by the detection job.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("a detection run for detector {0} is already in progress")]
    ConcurrentRun(Uuid),

    /// The data source failed in a way the run cannot continue past; the
    /// run record is marked failed
    #[error("run {run_id} aborted: {source}")]
    Connection {
        run_id: Uuid,
        #[source]
        source: SourceError,
    },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl DetectionError {
    /// Id of the run record this error left behind, if one was created
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            DetectionError::Connection { run_id, .. } => Some(*run_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_level_classification() {
        assert!(SourceError::Connection("refused".into()).is_connection_level());
        assert!(SourceError::Timeout(Duration::from_secs(1)).is_connection_level());
        assert!(!SourceError::Query("bad column".into()).is_connection_level());
        assert!(!SourceError::EmptyResult {
            cohort: "merchant=m1".into(),
            metric: "volume".into(),
        }
        .is_connection_level());
    }

    #[test]
    fn test_error_messages() {
        let err = SeriesError::InsufficientData { needed: 50, have: 3 };
        assert_eq!(err.to_string(), "insufficient data: need 50 points, have 3");

        let err = ValidationError::UnknownDetectorType("prophet".into());
        assert_eq!(err.to_string(), "unknown detector type `prophet`");
    }
}
