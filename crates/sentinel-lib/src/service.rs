//! Facade over detector registration, runs, anomaly queries and correlation

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::correlator::{AnomalyCorrelator, CandidateEntityGroup, CorrelationConfig, RootPattern, Segment};
use crate::error::{DetectionError, RepositoryError};
use crate::guardrails::Guardrails;
use crate::job::{DetectionJob, JobConfig};
use crate::models::{AnomalyEvent, CohortKey, DetectionRun, DetectorConfig};
use crate::repository::{AnomalyFilter, DetectionRepository};
use crate::source::CohortDataSource;

/// Entry point for callers of the detection library
pub struct AnomalyService {
    repository: Arc<dyn DetectionRepository>,
    guardrails: Arc<Guardrails>,
    job: DetectionJob,
}

impl AnomalyService {
    /// Create a service with its own guardrail state
    pub fn new(
        source: Arc<dyn CohortDataSource>,
        repository: Arc<dyn DetectionRepository>,
        config: JobConfig,
    ) -> Self {
        Self::with_guardrails(source, repository, Arc::new(Guardrails::new()), config)
    }

    /// Create a service sharing guardrail state with other components
    pub fn with_guardrails(
        source: Arc<dyn CohortDataSource>,
        repository: Arc<dyn DetectionRepository>,
        guardrails: Arc<Guardrails>,
        config: JobConfig,
    ) -> Self {
        let job = DetectionJob::new(
            source,
            Arc::clone(&repository),
            Arc::clone(&guardrails),
            config,
        );
        Self {
            repository,
            guardrails,
            job,
        }
    }

    /// Validate and store a detector definition
    pub async fn register_detector(&self, detector: DetectorConfig) -> Result<Uuid, DetectionError> {
        detector.validate()?;
        let id = detector.id;
        info!(
            detector_id = %id,
            name = %detector.name,
            detector_type = %detector.detector_type,
            metrics = ?detector.metrics,
            "Registered detector"
        );
        self.repository.save_detector(detector).await?;
        Ok(id)
    }

    pub async fn run_detection(
        &self,
        detector_id: Uuid,
        window_from: DateTime<Utc>,
        window_to: DateTime<Utc>,
    ) -> Result<DetectionRun, DetectionError> {
        self.job.run(detector_id, window_from, window_to).await
    }

    /// Stored events, newest first
    pub async fn get_recent_anomalies(
        &self,
        detector_id: Option<Uuid>,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<AnomalyEvent>, RepositoryError> {
        self.repository
            .list_events(&AnomalyFilter {
                detector_id,
                since,
                ..Default::default()
            })
            .await
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<DetectionRun>, RepositoryError> {
        self.repository.get_run(run_id).await
    }

    /// Rank root-cause hypotheses for `event` using its detector's
    /// correlation settings, or the defaults when the detector is gone
    pub async fn correlate(
        &self,
        event: &AnomalyEvent,
        segments: &[Segment],
        candidate_entities: &[CandidateEntityGroup],
    ) -> Result<Vec<RootPattern>, RepositoryError> {
        let config = self
            .repository
            .get_detector(event.detector_id)
            .await?
            .map(|detector| detector.params.correlation)
            .unwrap_or_else(CorrelationConfig::default);

        Ok(AnomalyCorrelator::new(config).correlate(event, segments, candidate_entities))
    }

    /// Clear debounce state. `None` matches everything for that part of the key.
    pub fn reset_guardrails(&self, cohort: Option<&CohortKey>, metric: Option<&str>) {
        match (cohort, metric) {
            (None, None) => self.guardrails.reset_all(),
            (cohort, metric) => self.guardrails.reset_matching(cohort, metric),
        }
        info!(
            cohort = ?cohort.map(ToString::to_string),
            metric = ?metric,
            "Guardrail state reset"
        );
    }

    pub fn guardrails(&self) -> &Arc<Guardrails> {
        &self.guardrails
    }
}
