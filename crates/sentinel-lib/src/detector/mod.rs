//! Series anomaly detectors
//!
//! This module provides:
//! - Seasonal-trend decomposition with MAD scoring (robust to single spikes)
//! - Two-sided CUSUM (sensitive to small sustained shifts)
//! - Gap imputation and support checks shared by both strategies

mod cusum;
mod seasonal;
pub mod stats;

pub use cusum::CumulativeSumDetector;
pub use seasonal::{Decomposition, SeasonalDecompositionDetector};

use std::sync::Arc;

use crate::error::SeriesError;
use crate::models::{DetectorKind, DetectorParams};

/// Per-point output of a detector, aligned with the input series
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub scores: Vec<f64>,
    pub flagged: Vec<bool>,
}

impl Detection {
    /// All-zero scores with nothing flagged
    pub fn quiet(len: usize) -> Self {
        Self {
            scores: vec![0.0; len],
            flagged: vec![false; len],
        }
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn flagged_indices(&self) -> Vec<usize> {
        self.flagged
            .iter()
            .enumerate()
            .filter_map(|(i, f)| f.then_some(i))
            .collect()
    }
}

/// Trait for series scoring strategies.
///
/// Implementations hold only configuration, so one instance can be shared
/// across concurrent cohort workers.
pub trait Detector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    /// Score every point of `values`; `None` marks a missing observation
    fn detect(&self, values: &[Option<f64>]) -> Result<Detection, SeriesError>;
}

/// Build the strategy for a detector kind
pub fn create_detector(kind: DetectorKind, params: &DetectorParams) -> Arc<dyn Detector> {
    match kind {
        DetectorKind::SeasonalDecomposition => {
            Arc::new(SeasonalDecompositionDetector::from_params(params))
        }
        DetectorKind::CumulativeSum => Arc::new(CumulativeSumDetector::from_params(params)),
    }
}

/// Fill gaps by linear interpolation between known neighbours.
///
/// Leading and trailing gaps take the nearest known value. Non-finite values
/// count as missing. Returns `None` when no value is known.
pub fn impute_gaps(values: &[Option<f64>]) -> Option<Vec<f64>> {
    let known: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.filter(|x| x.is_finite()).map(|x| (i, x)))
        .collect();

    let (first_idx, first_val) = *known.first()?;
    let (last_idx, last_val) = *known.last()?;

    let mut filled = vec![0.0; values.len()];
    filled[..=first_idx].fill(first_val);
    filled[last_idx..].fill(last_val);

    for pair in known.windows(2) {
        let (i0, v0) = pair[0];
        let (i1, v1) = pair[1];
        let span = (i1 - i0) as f64;
        for (offset, slot) in filled[i0..=i1].iter_mut().enumerate() {
            *slot = v0 + (v1 - v0) * offset as f64 / span;
        }
    }

    Some(filled)
}

/// Impute gaps and enforce the minimum support.
///
/// Emptiness is checked before support so an empty series always reports
/// [`SeriesError::EmptyInput`].
pub fn prepare_series(values: &[Option<f64>], min_support: usize) -> Result<Vec<f64>, SeriesError> {
    let filled = impute_gaps(values).ok_or(SeriesError::EmptyInput)?;
    if filled.len() < min_support {
        return Err(SeriesError::InsufficientData {
            needed: min_support,
            have: filled.len(),
        });
    }
    Ok(filled)
}
