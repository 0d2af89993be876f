//! Two-sided CUSUM detector
//!
//! Accumulates standardized deviations from a robust reference level and
//! flags points while the cumulative statistic exceeds the decision
//! threshold. Catches small sustained shifts that residual scoring smooths
//! over.

use super::stats::{median, median_absolute_deviation, std_dev, MAD_SCALE};
use super::{prepare_series, Detection, Detector};
use crate::error::SeriesError;
use crate::models::{DetectorKind, DetectorParams};

/// Cumulative sum control chart over a bounded series
#[derive(Debug, Clone)]
pub struct CumulativeSumDetector {
    /// Decision threshold `h`, in scale units
    pub threshold: f64,
    /// Slack subtracted at every step, in scale units
    pub drift: f64,
    /// Minimum series length
    pub min_support: usize,
}

/// One side of the chart
#[derive(Debug, Default)]
struct Side {
    sum: f64,
    in_excursion: bool,
}

impl Side {
    /// Accumulate one increment. Once a flagged excursion ends (the sum falls
    /// back to the threshold) the side restarts from zero.
    fn update(&mut self, increment: f64, threshold: f64) -> f64 {
        self.sum = (self.sum + increment).max(0.0);
        if self.sum > threshold {
            self.in_excursion = true;
        } else if self.in_excursion {
            self.sum = 0.0;
            self.in_excursion = false;
        }
        self.sum
    }
}

impl CumulativeSumDetector {
    pub fn from_params(params: &DetectorParams) -> Self {
        Self {
            threshold: params.k_threshold,
            drift: params.cusum_drift,
            min_support: params.min_support,
        }
    }

    /// Reference level and scale for standardization. The scale falls back to
    /// the standard deviation when more than half the points are identical.
    fn reference(values: &[f64]) -> (f64, f64) {
        let center = median(values);
        let scale = median_absolute_deviation(values, center) * MAD_SCALE;
        if scale > f64::EPSILON {
            (center, scale)
        } else {
            (center, std_dev(values))
        }
    }
}

impl Detector for CumulativeSumDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::CumulativeSum
    }

    fn detect(&self, values: &[Option<f64>]) -> Result<Detection, SeriesError> {
        let series = prepare_series(values, self.min_support)?;
        let (center, scale) = Self::reference(&series);
        if scale <= f64::EPSILON {
            return Ok(Detection::quiet(series.len()));
        }

        let mut upper = Side::default();
        let mut lower = Side::default();
        let mut scores = Vec::with_capacity(series.len());
        let mut flagged = Vec::with_capacity(series.len());

        for value in &series {
            let z = (value - center) / scale;
            let up = upper.update(z - self.drift, self.threshold);
            let down = lower.update(-z - self.drift, self.threshold);
            let score = up.max(down);
            scores.push(score);
            flagged.push(score > self.threshold);
        }

        Ok(Detection { scores, flagged })
    }
}
