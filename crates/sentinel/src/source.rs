//! JSON file data source
//!
//! Reads a document of the form
//! `{"cohorts": [{"key": {"merchant": "m1"}, "metrics": {"volume": [{"timestamp": ..., "value": ...}]}}]}`
//! once, on first use.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sentinel_lib::{
    CohortDataSource, CohortKey, DetectorConfig, MetricSeries, SeriesPoint, SourceError,
    StaticSource, TimeWindow,
};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::info;

#[derive(Debug, Deserialize)]
struct DataFile {
    cohorts: Vec<CohortRecord>,
}

#[derive(Debug, Deserialize)]
struct CohortRecord {
    key: BTreeMap<String, String>,
    #[serde(default)]
    metrics: HashMap<String, Vec<SeriesPoint>>,
}

/// Cohort data source backed by a JSON file
pub struct JsonFileSource {
    path: PathBuf,
    data: OnceCell<StaticSource>,
}

impl JsonFileSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            data: OnceCell::new(),
        }
    }

    async fn data(&self) -> Result<&StaticSource, SourceError> {
        self.data.get_or_try_init(|| self.load()).await
    }

    async fn load(&self) -> Result<StaticSource, SourceError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SourceError::Connection(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let file: DataFile = serde_json::from_str(&content).map_err(|e| {
            SourceError::Query(format!("malformed data file {}: {}", self.path.display(), e))
        })?;

        let mut source = StaticSource::new();
        for record in file.cohorts {
            let key = CohortKey::new(record.key);
            for (metric, mut points) in record.metrics {
                points.sort_by_key(|p| p.timestamp);
                source.insert(key.clone(), metric, MetricSeries::new(points));
            }
        }

        info!(
            path = %self.path.display(),
            cohorts = source.cohort_count(),
            "Loaded cohort data"
        );
        Ok(source)
    }
}

#[async_trait]
impl CohortDataSource for JsonFileSource {
    async fn get_cohorts(
        &self,
        detector: &DetectorConfig,
        window: &TimeWindow,
    ) -> Result<Vec<CohortKey>, SourceError> {
        self.data().await?.get_cohorts(detector, window).await
    }

    async fn get_series(
        &self,
        cohort: &CohortKey,
        metric: &str,
        window: &TimeWindow,
    ) -> Result<MetricSeries, SourceError> {
        self.data().await?.get_series(cohort, metric, window).await
    }
}
