//! Cohort data sources
//!
//! The warehouse that supplies raw rows is an external collaborator; this
//! module defines the seam and an in-memory implementation.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use crate::error::SourceError;
use crate::models::{CohortKey, DetectorConfig, MetricSeries, TimeWindow};

/// Trait for cohort data retrieval implementations
#[async_trait]
pub trait CohortDataSource: Send + Sync {
    /// List cohorts for the detector's dimensions that have data in `window`
    async fn get_cohorts(
        &self,
        detector: &DetectorConfig,
        window: &TimeWindow,
    ) -> Result<Vec<CohortKey>, SourceError>;

    /// Ordered series for one cohort and metric within `window`
    async fn get_series(
        &self,
        cohort: &CohortKey,
        metric: &str,
        window: &TimeWindow,
    ) -> Result<MetricSeries, SourceError>;
}

/// In-memory data source over preloaded series
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    cohorts: BTreeMap<CohortKey, HashMap<String, MetricSeries>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) one cohort metric series
    pub fn with_series(
        mut self,
        cohort: CohortKey,
        metric: impl Into<String>,
        series: MetricSeries,
    ) -> Self {
        self.insert(cohort, metric, series);
        self
    }

    pub fn insert(&mut self, cohort: CohortKey, metric: impl Into<String>, series: MetricSeries) {
        self.cohorts
            .entry(cohort)
            .or_default()
            .insert(metric.into(), series);
    }

    pub fn cohort_count(&self) -> usize {
        self.cohorts.len()
    }
}

#[async_trait]
impl CohortDataSource for StaticSource {
    async fn get_cohorts(
        &self,
        detector: &DetectorConfig,
        _window: &TimeWindow,
    ) -> Result<Vec<CohortKey>, SourceError> {
        Ok(self
            .cohorts
            .keys()
            .filter(|key| {
                detector
                    .cohort_dimensions
                    .iter()
                    .all(|dim| key.get(dim).is_some())
            })
            .cloned()
            .collect())
    }

    async fn get_series(
        &self,
        cohort: &CohortKey,
        metric: &str,
        window: &TimeWindow,
    ) -> Result<MetricSeries, SourceError> {
        let empty = || SourceError::EmptyResult {
            cohort: cohort.to_string(),
            metric: metric.to_string(),
        };

        let series = self
            .cohorts
            .get(cohort)
            .and_then(|metrics| metrics.get(metric))
            .ok_or_else(empty)?;

        let points: Vec<_> = series
            .points
            .iter()
            .filter(|p| window.contains(p.timestamp))
            .copied()
            .collect();

        if points.is_empty() {
            return Err(empty());
        }
        Ok(MetricSeries::new(points))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DetectorParams, SeriesPoint};
    use chrono::{Duration, TimeZone, Utc};

    fn series(len: i64) -> MetricSeries {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        MetricSeries::new(
            (0..len)
                .map(|i| SeriesPoint {
                    timestamp: start + Duration::hours(i),
                    value: Some(i as f64),
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn test_cohorts_filtered_by_dimensions() {
        let source = StaticSource::new()
            .with_series(CohortKey::new([("merchant", "m1")]), "volume", series(5))
            .with_series(CohortKey::new([("device", "d1")]), "volume", series(5));

        let detector = DetectorConfig::new(
            "volume",
            "stl_mad",
            vec!["merchant".into()],
            vec!["volume".into()],
            DetectorParams::default(),
        )
        .unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + Duration::days(1)).unwrap();

        let cohorts = source.get_cohorts(&detector, &window).await.unwrap();
        assert_eq!(cohorts, vec![CohortKey::new([("merchant", "m1")])]);
    }

    #[tokio::test]
    async fn test_series_filtered_to_window() {
        let cohort = CohortKey::new([("merchant", "m1")]);
        let source = StaticSource::new().with_series(cohort.clone(), "volume", series(48));
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let window = TimeWindow::new(start, start + Duration::hours(24)).unwrap();

        let result = source.get_series(&cohort, "volume", &window).await.unwrap();
        assert_eq!(result.len(), 24);

        let later = TimeWindow::new(start + Duration::days(5), start + Duration::days(6)).unwrap();
        assert!(matches!(
            source.get_series(&cohort, "volume", &later).await,
            Err(SourceError::EmptyResult { .. })
        ));
        assert!(matches!(
            source.get_series(&cohort, "risk_score", &window).await,
            Err(SourceError::EmptyResult { .. })
        ));
    }
}
