//! Alert guardrails
//!
//! Handles:
//! - Debounce: consecutive-exceedance counters per detector, cohort and metric
//! - Duplicate suppression via the last alerted timestamp per key
//! - At most one in-flight run per detector

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::error::DetectionError;
use crate::models::CohortKey;

/// Key for debounce state
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GuardKey {
    pub detector_id: Uuid,
    pub cohort: CohortKey,
    pub metric: String,
}

impl GuardKey {
    pub fn new(detector_id: Uuid, cohort: CohortKey, metric: impl Into<String>) -> Self {
        Self {
            detector_id,
            cohort,
            metric: metric.into(),
        }
    }
}

#[derive(Debug, Default)]
struct PersistenceState {
    consecutive: u32,
    last_alert: Option<DateTime<Utc>>,
}

/// Outcome of one debounce observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceCheck {
    /// True only on the observation that brings the counter to `persistence`
    pub confirmed: bool,
    /// Consecutive exceedances including this observation
    pub consecutive: u32,
}

/// What to do when a run is requested while another run of the same
/// detector is in flight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyPolicy {
    /// Reject the new run with [`DetectionError::ConcurrentRun`]
    #[default]
    FailFast,
    /// Wait for the in-flight run to finish
    Queue,
}

/// Held for the lifetime of a run; releasing it lets the next run start
#[derive(Debug)]
pub struct RunPermit {
    detector_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl RunPermit {
    pub fn detector_id(&self) -> Uuid {
        self.detector_id
    }
}

/// Shared guardrail state. Each key has its own lock so workers on unrelated
/// cohorts never contend.
#[derive(Debug, Default)]
pub struct Guardrails {
    state: DashMap<GuardKey, Arc<Mutex<PersistenceState>>>,
    runs: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl Guardrails {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &GuardKey) -> Arc<Mutex<PersistenceState>> {
        if let Some(slot) = self.state.get(key) {
            return Arc::clone(&slot);
        }
        Arc::clone(&self.state.entry(key.clone()).or_default())
    }

    /// Record one observation for `key`.
    ///
    /// Increments the counter when `score > threshold` and resets it to zero
    /// otherwise. Confirms exactly when the counter reaches `persistence`;
    /// later exceedances of the same excursion do not confirm again.
    pub fn check_persistence(
        &self,
        key: &GuardKey,
        score: f64,
        threshold: f64,
        persistence: u32,
    ) -> PersistenceCheck {
        let slot = self.slot(key);
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);

        if score > threshold {
            state.consecutive = state.consecutive.saturating_add(1);
        } else {
            state.consecutive = 0;
        }

        PersistenceCheck {
            confirmed: state.consecutive == persistence.max(1),
            consecutive: state.consecutive,
        }
    }

    /// Record an alert at `at`. Returns false when an alert at or after `at`
    /// was already recorded for this key.
    pub fn record_alert(&self, key: &GuardKey, at: DateTime<Utc>) -> bool {
        let slot = self.slot(key);
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);

        match state.last_alert {
            Some(last) if last >= at => false,
            _ => {
                state.last_alert = Some(at);
                true
            }
        }
    }

    /// Whether `record_alert(key, at)` would accept, without recording it
    pub fn is_alert_due(&self, key: &GuardKey, at: DateTime<Utc>) -> bool {
        self.last_alert(key).map_or(true, |last| last < at)
    }

    /// Current consecutive-exceedance count for `key`
    pub fn consecutive(&self, key: &GuardKey) -> u32 {
        self.state
            .get(key)
            .map(|slot| {
                let state = slot.lock().unwrap_or_else(PoisonError::into_inner);
                state.consecutive
            })
            .unwrap_or(0)
    }

    pub fn last_alert(&self, key: &GuardKey) -> Option<DateTime<Utc>> {
        self.state
            .get(key)
            .and_then(|slot| {
                let state = slot.lock().unwrap_or_else(PoisonError::into_inner);
                state.last_alert
            })
    }

    /// Clear debounce state for one key
    pub fn reset(&self, key: &GuardKey) {
        self.state.remove(key);
    }

    /// Clear debounce state matching an optional cohort and metric
    pub fn reset_matching(&self, cohort: Option<&CohortKey>, metric: Option<&str>) {
        self.state.retain(|key, _| {
            let cohort_match = cohort.map_or(true, |c| &key.cohort == c);
            let metric_match = metric.map_or(true, |m| key.metric == m);
            !(cohort_match && metric_match)
        });
    }

    pub fn reset_all(&self) {
        self.state.clear();
    }

    /// Number of keys with debounce state
    pub fn tracked_keys(&self) -> usize {
        self.state.len()
    }

    /// Acquire the run slot for a detector
    pub async fn acquire_run(
        &self,
        detector_id: Uuid,
        policy: ConcurrencyPolicy,
    ) -> Result<RunPermit, DetectionError> {
        let lock = Arc::clone(&self.runs.entry(detector_id).or_default());

        let guard = match policy {
            ConcurrencyPolicy::FailFast => lock
                .try_lock_owned()
                .map_err(|_| DetectionError::ConcurrentRun(detector_id))?,
            ConcurrencyPolicy::Queue => lock.lock_owned().await,
        };

        Ok(RunPermit {
            detector_id,
            _guard: guard,
        })
    }

    /// True while a run of `detector_id` holds its permit
    pub fn is_run_in_flight(&self, detector_id: Uuid) -> bool {
        self.runs
            .get(&detector_id)
            .map(|lock| {
                let busy = lock.try_lock().is_err();
                busy
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::thread;

    fn key(cohort: &str, metric: &str) -> GuardKey {
        GuardKey::new(
            Uuid::nil(),
            CohortKey::new([("merchant", cohort)]),
            metric,
        )
    }

    #[test]
    fn test_confirms_exactly_on_persistence() {
        let guardrails = Guardrails::new();
        let k = key("m1", "volume");

        for _ in 0..2 {
            assert!(!guardrails.check_persistence(&k, 5.0, 3.5, 3).confirmed);
        }
        let third = guardrails.check_persistence(&k, 5.0, 3.5, 3);
        assert!(third.confirmed);
        assert_eq!(third.consecutive, 3);

        // Continuing excursion does not confirm again
        let fourth = guardrails.check_persistence(&k, 5.0, 3.5, 3);
        assert!(!fourth.confirmed);
        assert_eq!(fourth.consecutive, 4);
    }

    #[test]
    fn test_non_exceeding_observation_resets() {
        let guardrails = Guardrails::new();
        let k = key("m1", "volume");

        guardrails.check_persistence(&k, 5.0, 3.5, 3);
        guardrails.check_persistence(&k, 5.0, 3.5, 3);
        assert_eq!(guardrails.consecutive(&k), 2);

        // Equal to threshold is not an exceedance
        let check = guardrails.check_persistence(&k, 3.5, 3.5, 3);
        assert!(!check.confirmed);
        assert_eq!(guardrails.consecutive(&k), 0);

        assert!(!guardrails.check_persistence(&k, 5.0, 3.5, 3).confirmed);
        assert!(!guardrails.check_persistence(&k, 5.0, 3.5, 3).confirmed);
        assert!(guardrails.check_persistence(&k, 5.0, 3.5, 3).confirmed);
    }

    #[test]
    fn test_persistence_of_one_confirms_immediately() {
        let guardrails = Guardrails::new();
        let k = key("m1", "volume");
        assert!(guardrails.check_persistence(&k, 9.0, 3.5, 1).confirmed);
        assert!(!guardrails.check_persistence(&k, 9.0, 3.5, 1).confirmed);
    }

    #[test]
    fn test_keys_are_independent() {
        let guardrails = Guardrails::new();
        let a = key("m1", "volume");
        let b = key("m2", "volume");
        let c = key("m1", "risk_score");

        guardrails.check_persistence(&a, 5.0, 3.5, 2);
        guardrails.check_persistence(&b, 1.0, 3.5, 2);
        guardrails.check_persistence(&c, 5.0, 3.5, 2);

        assert!(guardrails.check_persistence(&a, 5.0, 3.5, 2).confirmed);
        assert!(!guardrails.check_persistence(&b, 5.0, 3.5, 2).confirmed);
        assert_eq!(guardrails.consecutive(&c), 1);
    }

    #[test]
    fn test_concurrent_updates_on_one_key_confirm_once() {
        let guardrails = Arc::new(Guardrails::new());
        let k = key("m1", "volume");

        let confirmations: usize = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let guardrails = Arc::clone(&guardrails);
                    let k = k.clone();
                    s.spawn(move || {
                        (0..50)
                            .filter(|_| guardrails.check_persistence(&k, 9.0, 3.5, 100).confirmed)
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(confirmations, 1);
        assert_eq!(guardrails.consecutive(&k), 400);
    }

    #[test]
    fn test_record_alert_suppresses_replays() {
        let guardrails = Guardrails::new();
        let k = key("m1", "volume");
        let t0 = Utc::now();

        assert!(guardrails.record_alert(&k, t0));
        assert!(!guardrails.record_alert(&k, t0));
        assert!(!guardrails.record_alert(&k, t0 - Duration::minutes(5)));
        assert!(guardrails.record_alert(&k, t0 + Duration::minutes(5)));
        assert_eq!(guardrails.last_alert(&k), Some(t0 + Duration::minutes(5)));
    }

    #[test]
    fn test_alert_due_does_not_record() {
        let guardrails = Guardrails::new();
        let k = key("m1", "volume");
        let t0 = Utc::now();

        assert!(guardrails.is_alert_due(&k, t0));
        assert!(guardrails.is_alert_due(&k, t0));
        assert_eq!(guardrails.last_alert(&k), None);

        guardrails.record_alert(&k, t0);
        assert!(!guardrails.is_alert_due(&k, t0));
        assert!(guardrails.is_alert_due(&k, t0 + Duration::seconds(1)));
    }

    #[test]
    fn test_reset_matching() {
        let guardrails = Guardrails::new();
        for (c, m) in [("m1", "volume"), ("m1", "risk_score"), ("m2", "volume")] {
            guardrails.check_persistence(&key(c, m), 5.0, 3.5, 2);
        }

        guardrails.reset_matching(None, Some("volume"));
        assert_eq!(guardrails.tracked_keys(), 1);
        assert_eq!(guardrails.consecutive(&key("m1", "risk_score")), 1);

        guardrails.reset_all();
        assert_eq!(guardrails.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn test_fail_fast_rejects_second_run() {
        let guardrails = Guardrails::new();
        let detector_id = Uuid::new_v4();

        let permit = guardrails
            .acquire_run(detector_id, ConcurrencyPolicy::FailFast)
            .await
            .unwrap();
        assert!(guardrails.is_run_in_flight(detector_id));

        let second = guardrails
            .acquire_run(detector_id, ConcurrencyPolicy::FailFast)
            .await;
        assert!(matches!(second, Err(DetectionError::ConcurrentRun(id)) if id == detector_id));

        // Other detectors are unaffected
        assert!(guardrails
            .acquire_run(Uuid::new_v4(), ConcurrencyPolicy::FailFast)
            .await
            .is_ok());

        drop(permit);
        assert!(!guardrails.is_run_in_flight(detector_id));
        assert!(guardrails
            .acquire_run(detector_id, ConcurrencyPolicy::FailFast)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_queue_waits_for_release() {
        let guardrails = Arc::new(Guardrails::new());
        let detector_id = Uuid::new_v4();

        let permit = guardrails
            .acquire_run(detector_id, ConcurrencyPolicy::Queue)
            .await
            .unwrap();

        let waiter = {
            let guardrails = Arc::clone(&guardrails);
            tokio::spawn(async move {
                guardrails
                    .acquire_run(detector_id, ConcurrencyPolicy::Queue)
                    .await
                    .map(|p| p.detector_id())
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        assert_eq!(waiter.await.unwrap().unwrap(), detector_id);
    }
}
