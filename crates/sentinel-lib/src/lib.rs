//! Cohort metric anomaly detection library
//!
//! This crate provides the core functionality for:
//! - Scoring cohort metric series (seasonal decomposition + MAD, CUSUM)
//! - Debounce and run-concurrency guardrails
//! - Severity scoring of confirmed anomalies
//! - Detection run orchestration over a bounded worker pool
//! - Root-cause correlation
//! - Observability

pub mod correlator;
pub mod detector;
pub mod error;
pub mod guardrails;
pub mod job;
pub mod models;
pub mod observability;
pub mod repository;
pub mod service;
pub mod severity;
pub mod source;

pub use correlator::{
    AnomalyCorrelator, CandidateEntityGroup, Confidence, CorrelationConfig, EntityActivity,
    PatternType, RootPattern, Segment,
};
pub use detector::{create_detector, Detection, Detector};
pub use error::{DetectionError, RepositoryError, SeriesError, SourceError, ValidationError};
pub use guardrails::{ConcurrencyPolicy, GuardKey, Guardrails, PersistenceCheck, RunPermit};
pub use job::{DetectionJob, JobConfig, JobState};
pub use models::*;
pub use observability::{DetectionMetrics, StructuredLogger};
pub use repository::{AnomalyFilter, DetectionRepository, InMemoryRepository};
pub use service::AnomalyService;
pub use severity::{determine_severity, Severity, SeverityConfig};
pub use source::{CohortDataSource, StaticSource};
pub use uuid::Uuid;
