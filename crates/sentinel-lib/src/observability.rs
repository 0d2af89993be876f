//! Observability infrastructure for detection runs
//!
//! Provides:
//! - Prometheus metrics (run duration, run outcomes, cohort throughput, series evaluation latency)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Histogram, IntCounter,
    IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::models::{AnomalyEvent, DetectionRun};
use crate::severity::Severity;

/// Histogram buckets for per-series evaluation (in seconds)
const EVAL_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Histogram buckets for whole runs (in seconds)
const RUN_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<DetectionMetricsInner> = OnceLock::new();

struct DetectionMetricsInner {
    run_duration_seconds: Histogram,
    series_eval_latency_seconds: Histogram,
    runs_started: IntCounter,
    runs_finished: IntCounterVec,
    cohorts_processed: IntCounter,
    cohort_errors: IntCounterVec,
    anomalies_emitted: IntCounterVec,
}

impl DetectionMetricsInner {
    fn new() -> Self {
        Self {
            run_duration_seconds: register_histogram!(
                "cohort_sentinel_run_duration_seconds",
                "Wall-clock duration of detection runs",
                RUN_BUCKETS.to_vec()
            )
            .expect("Failed to register run_duration_seconds"),

            series_eval_latency_seconds: register_histogram!(
                "cohort_sentinel_series_eval_latency_seconds",
                "Time spent scoring one cohort metric series",
                EVAL_BUCKETS.to_vec()
            )
            .expect("Failed to register series_eval_latency_seconds"),

            runs_started: register_int_counter!(
                "cohort_sentinel_runs_started_total",
                "Total number of detection runs started"
            )
            .expect("Failed to register runs_started"),

            runs_finished: register_int_counter_vec!(
                "cohort_sentinel_runs_finished_total",
                "Total number of detection runs by terminal status",
                &["status"]
            )
            .expect("Failed to register runs_finished"),

            cohorts_processed: register_int_counter!(
                "cohort_sentinel_cohorts_processed_total",
                "Total number of cohorts processed"
            )
            .expect("Failed to register cohorts_processed"),

            cohort_errors: register_int_counter_vec!(
                "cohort_sentinel_cohort_errors_total",
                "Cohort-level failures isolated from their run",
                &["kind"]
            )
            .expect("Failed to register cohort_errors"),

            anomalies_emitted: register_int_counter_vec!(
                "cohort_sentinel_anomalies_emitted_total",
                "Total number of anomaly events persisted",
                &["severity"]
            )
            .expect("Failed to register anomalies_emitted"),
        }
    }
}

/// Detection metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct DetectionMetrics {
    _private: (),
}

impl Default for DetectionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(DetectionMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &DetectionMetricsInner {
        GLOBAL_METRICS.get_or_init(DetectionMetricsInner::new)
    }

    pub fn inc_runs_started(&self) {
        self.inner().runs_started.inc();
    }

    /// Record a terminal run with its duration
    pub fn observe_run_finished(&self, status: &str, duration_secs: f64) {
        self.inner()
            .runs_finished
            .with_label_values(&[status])
            .inc();
        self.inner().run_duration_seconds.observe(duration_secs);
    }

    pub fn observe_series_eval(&self, duration_secs: f64) {
        self.inner().series_eval_latency_seconds.observe(duration_secs);
    }

    pub fn inc_cohorts_processed(&self) {
        self.inner().cohorts_processed.inc();
    }

    /// Count an isolated cohort failure by kind (`empty`, `series`, `query`, `panic`)
    pub fn inc_cohort_errors(&self, kind: &str) {
        self.inner().cohort_errors.with_label_values(&[kind]).inc();
    }

    pub fn inc_anomalies_emitted(&self, severity: Severity) {
        self.inner()
            .anomalies_emitted
            .with_label_values(&[&severity.to_string()])
            .inc();
    }
}

/// Structured logger for detection events
///
/// Provides consistent JSON-formatted logging for run lifecycle,
/// emitted anomalies and skipped cohorts.
#[derive(Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    /// Log the start of a detection run
    pub fn log_run_started(&self, run: &DetectionRun, detector_name: &str) {
        info!(
            event = "run_started",
            instance = %self.instance,
            run_id = %run.id,
            detector_id = %run.detector_id,
            detector = %detector_name,
            window_from = %run.window.from,
            window_to = %run.window.to,
            "Detection run started"
        );
    }

    /// Log a completed detection run
    pub fn log_run_completed(&self, run: &DetectionRun, duration_secs: f64) {
        info!(
            event = "run_completed",
            instance = %self.instance,
            run_id = %run.id,
            detector_id = %run.detector_id,
            cohorts_processed = run.cohorts_processed,
            anomalies_found = run.anomalies_found,
            duration_secs = duration_secs,
            "Detection run completed"
        );
    }

    /// Log an aborted detection run
    pub fn log_run_failed(&self, run_id: Uuid, detector_id: Uuid, reason: &str) {
        warn!(
            event = "run_failed",
            instance = %self.instance,
            run_id = %run_id,
            detector_id = %detector_id,
            reason = %reason,
            "Detection run failed"
        );
    }

    /// Log a persisted anomaly event
    pub fn log_anomaly(&self, anomaly: &AnomalyEvent) {
        match anomaly.severity {
            Severity::Critical => {
                warn!(
                    event = "anomaly_detected",
                    instance = %self.instance,
                    run_id = %anomaly.run_id,
                    cohort = %anomaly.cohort_key,
                    metric = %anomaly.metric,
                    timestamp = %anomaly.timestamp,
                    score = anomaly.score,
                    severity = %anomaly.severity,
                    persisted_n = anomaly.persisted_n,
                    "Critical anomaly detected"
                );
            }
            _ => {
                info!(
                    event = "anomaly_detected",
                    instance = %self.instance,
                    run_id = %anomaly.run_id,
                    cohort = %anomaly.cohort_key,
                    metric = %anomaly.metric,
                    timestamp = %anomaly.timestamp,
                    score = anomaly.score,
                    severity = %anomaly.severity,
                    persisted_n = anomaly.persisted_n,
                    "Anomaly detected"
                );
            }
        }
    }

    /// Log a cohort metric that could not be evaluated
    pub fn log_cohort_skipped(&self, run_id: Uuid, cohort: &str, metric: &str, reason: &str) {
        warn!(
            event = "cohort_skipped",
            instance = %self.instance,
            run_id = %run_id,
            cohort = %cohort,
            metric = %metric,
            reason = %reason,
            "Cohort metric skipped"
        );
    }
}
