//! Persistence seam for detectors, runs and anomaly events

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::error::RepositoryError;
use crate::models::{AnomalyEvent, DetectionRun, DetectorConfig, RunStatus};

/// Query for stored anomaly events
#[derive(Debug, Clone, Default)]
pub struct AnomalyFilter {
    pub detector_id: Option<Uuid>,
    pub run_id: Option<Uuid>,
    /// Only events whose observation timestamp is at or after this instant
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl AnomalyFilter {
    fn matches(&self, event: &AnomalyEvent) -> bool {
        self.detector_id.map_or(true, |id| event.detector_id == id)
            && self.run_id.map_or(true, |id| event.run_id == id)
            && self.since.map_or(true, |since| event.timestamp >= since)
    }
}

/// Trait for storage implementations
#[async_trait]
pub trait DetectionRepository: Send + Sync {
    async fn save_detector(&self, detector: DetectorConfig) -> Result<(), RepositoryError>;

    async fn get_detector(&self, id: Uuid) -> Result<Option<DetectorConfig>, RepositoryError>;

    async fn create_run(&self, run: DetectionRun) -> Result<(), RepositoryError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<DetectionRun>, RepositoryError>;

    /// Move a run forward to `status`. Backward transitions are ignored and
    /// the stored run is returned unchanged.
    async fn update_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        detail: Option<String>,
    ) -> Result<DetectionRun, RepositoryError>;

    /// Add to the run counters atomically
    async fn increment_run_counters(
        &self,
        id: Uuid,
        cohorts: u64,
        anomalies: u64,
    ) -> Result<(), RepositoryError>;

    async fn create_event(&self, event: AnomalyEvent) -> Result<(), RepositoryError>;

    /// Matching events, newest observation first
    async fn list_events(&self, filter: &AnomalyFilter) -> Result<Vec<AnomalyEvent>, RepositoryError>;
}

/// Process-local repository
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    detectors: RwLock<HashMap<Uuid, DetectorConfig>>,
    runs: RwLock<HashMap<Uuid, DetectionRun>>,
    events: RwLock<Vec<AnomalyEvent>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// All runs recorded for a detector, oldest first
    pub async fn runs_for(&self, detector_id: Uuid) -> Vec<DetectionRun> {
        let runs = self.runs.read().await;
        let mut matching: Vec<DetectionRun> = runs
            .values()
            .filter(|r| r.detector_id == detector_id)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.started_at);
        matching
    }
}

#[async_trait]
impl DetectionRepository for InMemoryRepository {
    async fn save_detector(&self, detector: DetectorConfig) -> Result<(), RepositoryError> {
        let mut detectors = self.detectors.write().await;
        detectors.insert(detector.id, detector);
        Ok(())
    }

    async fn get_detector(&self, id: Uuid) -> Result<Option<DetectorConfig>, RepositoryError> {
        Ok(self.detectors.read().await.get(&id).cloned())
    }

    async fn create_run(&self, run: DetectionRun) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(RepositoryError::Storage(format!(
                "run {} already exists",
                run.id
            )));
        }
        runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<DetectionRun>, RepositoryError> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn update_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        detail: Option<String>,
    ) -> Result<DetectionRun, RepositoryError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;

        if run.transition(status, Utc::now()) {
            if detail.is_some() {
                run.failure_detail = detail;
            }
        } else {
            debug!(
                run_id = %id,
                current = %run.status,
                requested = %status,
                "Ignoring backward run status transition"
            );
        }
        Ok(run.clone())
    }

    async fn increment_run_counters(
        &self,
        id: Uuid,
        cohorts: u64,
        anomalies: u64,
    ) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or(RepositoryError::NotFound(id))?;
        run.cohorts_processed += cohorts;
        run.anomalies_found += anomalies;
        Ok(())
    }

    async fn create_event(&self, event: AnomalyEvent) -> Result<(), RepositoryError> {
        let mut events = self.events.write().await;
        if events.iter().any(|e| e.id == event.id) {
            return Err(RepositoryError::Storage(format!(
                "event {} already exists",
                event.id
            )));
        }
        events.push(event);
        Ok(())
    }

    async fn list_events(&self, filter: &AnomalyFilter) -> Result<Vec<AnomalyEvent>, RepositoryError> {
        let events = self.events.read().await;
        let mut matching: Vec<AnomalyEvent> =
            events.iter().filter(|e| filter.matches(e)).cloned().collect();

        matching.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CohortKey, TimeWindow};
    use crate::severity::Severity;
    use chrono::Duration;

    fn event(detector_id: Uuid, timestamp: DateTime<Utc>) -> AnomalyEvent {
        AnomalyEvent {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            detector_id,
            cohort_key: CohortKey::new([("merchant", "m1")]),
            metric: "volume".to_string(),
            timestamp,
            score: 6.0,
            severity: Severity::Warn,
            persisted_n: 2,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_run_counters_and_status() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        let mut run = DetectionRun::new(
            Uuid::new_v4(),
            TimeWindow::new(now - Duration::hours(1), now).unwrap(),
        );
        run.transition(RunStatus::Running, now);
        let id = run.id;
        repo.create_run(run).await.unwrap();

        repo.increment_run_counters(id, 1, 0).await.unwrap();
        repo.increment_run_counters(id, 1, 2).await.unwrap();

        let done = repo
            .update_run_status(id, RunStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(done.cohorts_processed, 2);
        assert_eq!(done.anomalies_found, 2);
        assert_eq!(done.status, RunStatus::Completed);

        // Terminal state is final
        let after = repo
            .update_run_status(id, RunStatus::Failed, Some("late".into()))
            .await
            .unwrap();
        assert_eq!(after.status, RunStatus::Completed);
        assert!(after.failure_detail.is_none());
    }

    #[tokio::test]
    async fn test_unknown_run_is_not_found() {
        let repo = InMemoryRepository::new();
        let id = Uuid::new_v4();
        assert!(matches!(
            repo.increment_run_counters(id, 1, 0).await,
            Err(RepositoryError::NotFound(missing)) if missing == id
        ));
    }

    #[tokio::test]
    async fn test_list_events_filters_and_orders() {
        let repo = InMemoryRepository::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let now = Utc::now();

        repo.create_event(event(a, now - Duration::hours(3))).await.unwrap();
        repo.create_event(event(a, now - Duration::hours(1))).await.unwrap();
        repo.create_event(event(b, now - Duration::hours(2))).await.unwrap();

        let all = repo.list_events(&AnomalyFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

        let recent_a = repo
            .list_events(&AnomalyFilter {
                detector_id: Some(a),
                since: Some(now - Duration::hours(2)),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recent_a.len(), 1);
        assert_eq!(recent_a[0].timestamp, now - Duration::hours(1));
    }

    #[tokio::test]
    async fn test_duplicate_event_rejected() {
        let repo = InMemoryRepository::new();
        let e = event(Uuid::new_v4(), Utc::now());
        repo.create_event(e.clone()).await.unwrap();
        assert!(repo.create_event(e).await.is_err());
    }
}
