//! Detection run orchestration
//!
//! A run validates its request, takes the detector's run permit, fetches
//! cohorts and fans them out over a bounded worker pool. Each worker scores
//! every configured metric, walks the scores through the guardrails and
//! persists the first confirmed anomaly per cohort metric.
//!
//! Cohort-level failures are logged and isolated. Connection-level data
//! source failures abort the run and leave it marked failed. Its counters
//! still cover every persisted event and every finished cohort.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::detector::{create_detector, Detector};
use crate::error::{DetectionError, RepositoryError, SourceError, ValidationError};
use crate::guardrails::{ConcurrencyPolicy, GuardKey, Guardrails};
use crate::models::{AnomalyEvent, CohortKey, DetectionRun, DetectorConfig, RunStatus, TimeWindow};
use crate::observability::{DetectionMetrics, StructuredLogger};
use crate::repository::DetectionRepository;
use crate::severity::{determine_severity, Severity};
use crate::source::CohortDataSource;

/// Configuration for detection runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// Maximum cohorts evaluated concurrently (default: 4)
    pub max_workers: usize,
    /// Timeout for each data source call (default: 30 seconds)
    pub fetch_timeout_secs: u64,
    /// Behaviour when the detector already has a run in flight
    pub concurrency_policy: ConcurrencyPolicy,
    /// Name attached to structured log records
    pub instance_name: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            fetch_timeout_secs: 30,
            concurrency_policy: ConcurrencyPolicy::FailFast,
            instance_name: "cohort-sentinel".to_string(),
        }
    }
}

impl JobConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_workers < 1 {
            return Err(ValidationError::param("max_workers", "must be at least 1"));
        }
        if self.fetch_timeout_secs < 1 {
            return Err(ValidationError::param(
                "fetch_timeout_secs",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// In-process progress of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    FetchingCohorts,
    Detecting,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Forward steps only; `Failed` is reachable from any non-terminal state
    pub fn can_transition_to(self, next: JobState) -> bool {
        match (self, next) {
            (JobState::Created, JobState::FetchingCohorts)
            | (JobState::FetchingCohorts, JobState::Detecting)
            | (JobState::Detecting, JobState::Completed) => true,
            (current, JobState::Failed) => !current.is_terminal(),
            _ => false,
        }
    }

    /// Status persisted on the run record for this state
    pub fn run_status(self) -> RunStatus {
        match self {
            JobState::Created => RunStatus::Created,
            JobState::FetchingCohorts | JobState::Detecting => RunStatus::Running,
            JobState::Completed => RunStatus::Completed,
            JobState::Failed => RunStatus::Failed,
        }
    }
}

/// Reasons a run stops before all cohorts are processed
#[derive(Debug, Error)]
enum Abort {
    #[error(transparent)]
    Source(SourceError),

    #[error(transparent)]
    Repository(RepositoryError),
}

impl Abort {
    fn into_error(self, run_id: Uuid) -> DetectionError {
        match self {
            Abort::Source(source) => DetectionError::Connection { run_id, source },
            Abort::Repository(err) => DetectionError::Repository(err),
        }
    }
}

/// Outcome of evaluating one cohort metric that did not yield an event
enum MetricFailure {
    Abort(Abort),
    Skip { kind: &'static str, reason: String },
}

/// Classify a data source error for a per-series call
fn classify(err: SourceError) -> MetricFailure {
    match err {
        err if err.is_connection_level() => MetricFailure::Abort(Abort::Source(err)),
        err @ SourceError::EmptyResult { .. } => MetricFailure::Skip {
            kind: "empty",
            reason: err.to_string(),
        },
        err => MetricFailure::Skip {
            kind: "query",
            reason: err.to_string(),
        },
    }
}

/// Everything a cohort worker needs, shared across the pool
struct CohortWorker {
    run_id: Uuid,
    detector: DetectorConfig,
    window: TimeWindow,
    strategy: Arc<dyn Detector>,
    source: Arc<dyn CohortDataSource>,
    repository: Arc<dyn DetectionRepository>,
    guardrails: Arc<Guardrails>,
    fetch_timeout: Duration,
    metrics: DetectionMetrics,
    logger: StructuredLogger,
}

impl CohortWorker {
    /// Evaluate every metric of one cohort and count the cohort as processed.
    /// Anomalies are counted as each event is persisted. Returns the number
    /// of events persisted.
    async fn process(&self, cohort: CohortKey) -> Result<u64, Abort> {
        let mut anomalies = 0;

        for metric in &self.detector.metrics {
            match self.evaluate(&cohort, metric).await {
                Ok(true) => anomalies += 1,
                Ok(false) => {}
                Err(MetricFailure::Abort(abort)) => return Err(abort),
                Err(MetricFailure::Skip { kind, reason }) => {
                    self.metrics.inc_cohort_errors(kind);
                    self.logger
                        .log_cohort_skipped(self.run_id, &cohort.to_string(), metric, &reason);
                }
            }
        }

        self.repository
            .increment_run_counters(self.run_id, 1, 0)
            .await
            .map_err(Abort::Repository)?;
        self.metrics.inc_cohorts_processed();
        Ok(anomalies)
    }

    /// Score one series and persist its first confirmed anomaly, if any
    async fn evaluate(&self, cohort: &CohortKey, metric: &str) -> Result<bool, MetricFailure> {
        let series = match timeout(
            self.fetch_timeout,
            self.source.get_series(cohort, metric, &self.window),
        )
        .await
        {
            Ok(Ok(series)) => series,
            Ok(Err(err)) => return Err(classify(err)),
            Err(_) => {
                return Err(MetricFailure::Abort(Abort::Source(SourceError::Timeout(
                    self.fetch_timeout,
                ))))
            }
        };

        let started = Instant::now();
        let detection = self
            .strategy
            .detect(&series.values())
            .map_err(|err| MetricFailure::Skip {
                kind: "series",
                reason: err.to_string(),
            })?;
        self.metrics
            .observe_series_eval(started.elapsed().as_secs_f64());

        let params = &self.detector.params;
        let key = GuardKey::new(self.detector.id, cohort.clone(), metric);
        let mut first_confirmation = true;
        let mut event = None;

        // Every point goes through the guardrails so the counters track the
        // series to its end, even after the event for this run is decided
        for (point, score) in series.points.iter().zip(&detection.scores) {
            let check = self.guardrails.check_persistence(
                &key,
                *score,
                params.k_threshold,
                params.persistence,
            );
            if !check.confirmed || !first_confirmation {
                continue;
            }
            first_confirmation = false;

            let severity = determine_severity(*score, check.consecutive, params);
            if severity == Severity::None {
                continue;
            }
            if !self.guardrails.is_alert_due(&key, point.timestamp) {
                debug!(
                    run_id = %self.run_id,
                    cohort = %cohort,
                    metric = %metric,
                    timestamp = %point.timestamp,
                    "Anomaly already alerted, suppressing"
                );
                continue;
            }

            event = Some(AnomalyEvent {
                id: Uuid::new_v4(),
                run_id: self.run_id,
                detector_id: self.detector.id,
                cohort_key: cohort.clone(),
                metric: metric.to_string(),
                timestamp: point.timestamp,
                score: *score,
                severity,
                persisted_n: check.consecutive,
                created_at: Utc::now(),
            });
        }

        let Some(event) = event else {
            return Ok(false);
        };

        // Alert recorded only once the event exists
        self.repository
            .create_event(event.clone())
            .await
            .map_err(|err| MetricFailure::Abort(Abort::Repository(err)))?;
        self.guardrails.record_alert(&key, event.timestamp);
        self.repository
            .increment_run_counters(self.run_id, 0, 1)
            .await
            .map_err(|err| MetricFailure::Abort(Abort::Repository(err)))?;
        self.metrics.inc_anomalies_emitted(event.severity);
        self.logger.log_anomaly(&event);
        Ok(true)
    }
}

/// Executes detection runs against a data source and repository
pub struct DetectionJob {
    /// Cohort data provider
    source: Arc<dyn CohortDataSource>,
    /// Detector, run and event storage
    repository: Arc<dyn DetectionRepository>,
    /// Debounce and run-concurrency state shared by all runs
    guardrails: Arc<Guardrails>,
    config: JobConfig,
    metrics: DetectionMetrics,
    logger: StructuredLogger,
}

impl DetectionJob {
    pub fn new(
        source: Arc<dyn CohortDataSource>,
        repository: Arc<dyn DetectionRepository>,
        guardrails: Arc<Guardrails>,
        config: JobConfig,
    ) -> Self {
        let logger = StructuredLogger::new(config.instance_name.clone());
        Self {
            source,
            repository,
            guardrails,
            config,
            metrics: DetectionMetrics::new(),
            logger,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Run one detector over `[window_from, window_to)`.
    ///
    /// Validation failures and concurrent-run rejections return before any
    /// run record exists. Once the run is recorded, aborts mark it failed and
    /// the returned error carries its id.
    pub async fn run(
        &self,
        detector_id: Uuid,
        window_from: DateTime<Utc>,
        window_to: DateTime<Utc>,
    ) -> Result<DetectionRun, DetectionError> {
        let window = TimeWindow::new(window_from, window_to)?;
        let detector = self
            .repository
            .get_detector(detector_id)
            .await?
            .ok_or(ValidationError::DetectorNotFound(detector_id))?;
        if !detector.enabled {
            return Err(ValidationError::DetectorDisabled(detector_id).into());
        }

        let _permit = self
            .guardrails
            .acquire_run(detector_id, self.config.concurrency_policy)
            .await?;

        let mut run = DetectionRun::new(detector_id, window);
        run.transition(RunStatus::Running, Utc::now());
        self.repository.create_run(run.clone()).await?;
        self.metrics.inc_runs_started();
        self.logger.log_run_started(&run, &detector.name);

        let started = Instant::now();
        let mut state = JobState::Created;
        let outcome = self.execute(detector, &run, &mut state).await;
        let elapsed = started.elapsed().as_secs_f64();

        match outcome {
            Ok(()) => {
                self.advance(run.id, &mut state, JobState::Completed);
                match self
                    .repository
                    .update_run_status(run.id, state.run_status(), None)
                    .await
                {
                    Ok(finished) => {
                        self.metrics
                            .observe_run_finished(&finished.status.to_string(), elapsed);
                        self.logger.log_run_completed(&finished, elapsed);
                        Ok(finished)
                    }
                    Err(err) => {
                        error!(run_id = %run.id, error = %err, "Failed to record run completion");
                        self.metrics
                            .observe_run_finished(&RunStatus::Failed.to_string(), elapsed);
                        self.logger.log_run_failed(run.id, detector_id, &err.to_string());
                        Err(err.into())
                    }
                }
            }
            Err(abort) => {
                self.advance(run.id, &mut state, JobState::Failed);
                let reason = abort.to_string();
                if let Err(err) = self
                    .repository
                    .update_run_status(run.id, state.run_status(), Some(reason.clone()))
                    .await
                {
                    error!(run_id = %run.id, error = %err, "Failed to record run failure");
                }
                self.metrics
                    .observe_run_finished(&RunStatus::Failed.to_string(), elapsed);
                self.logger.log_run_failed(run.id, detector_id, &reason);
                Err(abort.into_error(run.id))
            }
        }
    }

    fn advance(&self, run_id: Uuid, state: &mut JobState, next: JobState) {
        let current = *state;
        if current.can_transition_to(next) {
            debug!(run_id = %run_id, from = ?current, to = ?next, "Run state change");
            *state = next;
        } else {
            warn!(
                run_id = %run_id,
                from = ?current,
                to = ?next,
                "Ignoring invalid run state change"
            );
        }
    }

    async fn execute(
        &self,
        detector: DetectorConfig,
        run: &DetectionRun,
        state: &mut JobState,
    ) -> Result<(), Abort> {
        self.advance(run.id, state, JobState::FetchingCohorts);
        let fetch_timeout = self.config.fetch_timeout();

        let fetched = timeout(fetch_timeout, self.source.get_cohorts(&detector, &run.window)).await;
        let cohorts = match fetched {
            Ok(Ok(cohorts)) => cohorts,
            Ok(Err(SourceError::EmptyResult { .. })) => Vec::new(),
            Ok(Err(err)) => return Err(Abort::Source(err)),
            Err(_) => return Err(Abort::Source(SourceError::Timeout(fetch_timeout))),
        };

        self.advance(run.id, state, JobState::Detecting);
        info!(
            run_id = %run.id,
            detector = %detector.name,
            cohorts = cohorts.len(),
            max_workers = self.config.max_workers,
            "Evaluating cohorts"
        );

        let worker = Arc::new(CohortWorker {
            run_id: run.id,
            strategy: create_detector(detector.detector_type, &detector.params),
            detector,
            window: run.window,
            source: Arc::clone(&self.source),
            repository: Arc::clone(&self.repository),
            guardrails: Arc::clone(&self.guardrails),
            fetch_timeout,
            metrics: self.metrics.clone(),
            logger: self.logger.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut workers = JoinSet::new();

        for cohort in cohorts {
            let worker = Arc::clone(&worker);
            let semaphore = Arc::clone(&semaphore);
            workers.spawn(async move {
                // Closed when the run aborts
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return Ok(0);
                };
                worker.process(cohort).await
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(_)) => {}
                Ok(Err(abort)) => {
                    semaphore.close();
                    workers.shutdown().await;
                    return Err(abort);
                }
                Err(err) if err.is_panic() => {
                    self.metrics.inc_cohort_errors("panic");
                    warn!(run_id = %run.id, error = %err, "Cohort worker panicked, continuing");
                }
                Err(err) => {
                    debug!(run_id = %run.id, error = %err, "Cohort worker cancelled");
                }
            }
        }

        Ok(())
    }
}
