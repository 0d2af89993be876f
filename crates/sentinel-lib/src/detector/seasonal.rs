//! Seasonal-trend decomposition with MAD scoring
//!
//! Splits a series into trend, seasonal and residual components and scores
//! each point by its robust z-score within the residual.

use super::stats::{median, median_absolute_deviation, moving_median, std_dev, MAD_SCALE};
use super::{prepare_series, Detection, Detector};
use crate::error::SeriesError;
use crate::models::{DetectorKind, DetectorParams};

/// Components of a decomposed series
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub trend: Vec<f64>,
    pub seasonal: Vec<f64>,
    pub residual: Vec<f64>,
}

/// STL-style decomposition detector scored by the median absolute deviation
#[derive(Debug, Clone)]
pub struct SeasonalDecompositionDetector {
    /// Robust z-score above which a point is flagged
    pub k_threshold: f64,
    /// Minimum series length
    pub min_support: usize,
    /// Seasonal period in points
    pub season_length: usize,
    /// Moving-median window for the trend
    pub trend_window: usize,
}

impl SeasonalDecompositionDetector {
    pub fn from_params(params: &DetectorParams) -> Self {
        Self {
            k_threshold: params.k_threshold,
            min_support: params.min_support,
            season_length: params.season_length,
            trend_window: params.trend_window,
        }
    }

    /// Decompose a gap-free series.
    ///
    /// Two passes: the first trend estimate is removed to find the seasonal
    /// profile, then the trend is re-estimated on the deseasonalised series.
    pub fn decompose(&self, values: &[f64]) -> Decomposition {
        let initial_trend = moving_median(values, self.trend_window);
        let detrended: Vec<f64> = values
            .iter()
            .zip(&initial_trend)
            .map(|(v, t)| v - t)
            .collect();
        let seasonal = self.seasonal_profile(&detrended);

        let deseasonalised: Vec<f64> = values
            .iter()
            .zip(&seasonal)
            .map(|(v, s)| v - s)
            .collect();
        let trend = moving_median(&deseasonalised, self.trend_window);

        let residual = values
            .iter()
            .zip(trend.iter().zip(&seasonal))
            .map(|(v, (t, s))| v - t - s)
            .collect();

        Decomposition {
            trend,
            seasonal,
            residual,
        }
    }

    /// Per-phase medians of the detrended series, centred to zero mean.
    /// Zero when there is no usable period or fewer than two full seasons.
    fn seasonal_profile(&self, detrended: &[f64]) -> Vec<f64> {
        let n = detrended.len();
        let period = self.season_length;
        if period < 2 || n < 2 * period {
            return vec![0.0; n];
        }

        let mut phase_medians: Vec<f64> = (0..period)
            .map(|phase| {
                let samples: Vec<f64> = detrended.iter().skip(phase).step_by(period).copied().collect();
                median(&samples)
            })
            .collect();

        let mean = phase_medians.iter().sum::<f64>() / period as f64;
        for m in &mut phase_medians {
            *m -= mean;
        }

        (0..n).map(|i| phase_medians[i % period]).collect()
    }

    /// Score a residual series.
    ///
    /// The scale falls back to the standard deviation when more than half the
    /// residuals are identical. Only a constant residual scores zero.
    fn score_residual(&self, residual: &[f64]) -> Detection {
        let center = median(residual);
        let mut scale = median_absolute_deviation(residual, center) * MAD_SCALE;
        if scale <= f64::EPSILON {
            scale = std_dev(residual);
        }
        if scale <= f64::EPSILON {
            return Detection::quiet(residual.len());
        }

        let scores: Vec<f64> = residual
            .iter()
            .map(|r| (r - center).abs() / scale)
            .collect();
        let flagged = scores.iter().map(|s| *s > self.k_threshold).collect();

        Detection { scores, flagged }
    }
}

impl Detector for SeasonalDecompositionDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::SeasonalDecomposition
    }

    fn detect(&self, values: &[Option<f64>]) -> Result<Detection, SeriesError> {
        let series = prepare_series(values, self.min_support)?;
        let decomposition = self.decompose(&series);
        Ok(self.score_residual(&decomposition.residual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic noise with standard deviation close to 5
    pub(crate) const NOISE: [f64; 20] = [
        -9.8, 9.8, 0.3, -3.0, 3.0, -5.8, 5.8, -0.9, 1.6, -4.7, 4.7, -1.6, 0.9, -7.2, 7.2, -2.3,
        2.3, -3.8, 3.8, -0.3,
    ];

    fn detector(k: f64, min_support: usize) -> SeasonalDecompositionDetector {
        SeasonalDecompositionDetector::from_params(&DetectorParams {
            k_threshold: k,
            min_support,
            ..Default::default()
        })
    }

    fn observed(values: &[f64]) -> Vec<Option<f64>> {
        values.iter().copied().map(Some).collect()
    }

    #[test]
    fn test_constant_series_has_no_deviation() {
        let detection = detector(3.5, 10).detect(&observed(&[42.0; 60])).unwrap();
        assert!(detection.scores.iter().all(|s| *s == 0.0));
        assert!(detection.flagged.iter().all(|f| !f));
    }

    #[test]
    fn test_sparse_series_spikes_are_flagged() {
        // Residual MAD is zero here; the scale comes from the standard deviation
        let mut values = vec![10.0; 60];
        values[40] = 500.0;
        values[41] = 500.0;
        let detection = detector(3.5, 10).detect(&observed(&values)).unwrap();
        assert_eq!(detection.flagged_indices(), vec![40, 41]);
        assert!(detection.scores[40] > 5.0);
        assert_eq!(detection.scores[0], 0.0);
    }

    #[test]
    fn test_level_shift_flags_final_points() {
        let values: Vec<f64> = (0..100)
            .map(|i| 100.0 + NOISE[i % NOISE.len()] + if i >= 90 { 30.0 } else { 0.0 })
            .collect();

        let detection = detector(3.5, 50).detect(&observed(&values)).unwrap();
        let flagged = detection.flagged_indices();

        assert!(!flagged.is_empty());
        assert!(flagged.iter().all(|&i| i >= 90), "flagged {:?}", flagged);
        assert!(detection.flagged[90] && detection.flagged[91]);
    }

    #[test]
    fn test_seasonality_is_not_flagged_but_spike_is() {
        // Weekly pattern with a large amplitude, plus one spike
        let profile = [0.0, 20.0, 35.0, 20.0, 0.0, -40.0, -35.0];
        let mut values: Vec<f64> = (0..84)
            .map(|i| 200.0 + profile[i % 7] + NOISE[i % NOISE.len()] * 0.4)
            .collect();
        values[60] += 60.0;

        let detection = detector(3.5, 30).detect(&observed(&values)).unwrap();
        assert_eq!(detection.flagged_indices(), vec![60]);
    }

    #[test]
    fn test_decomposition_recovers_seasonal_profile() {
        let profile = [0.0, 10.0, 0.0, -10.0];
        let values: Vec<f64> = (0..40).map(|i| 50.0 + profile[i % 4]).collect();
        let d = SeasonalDecompositionDetector::from_params(&DetectorParams {
            season_length: 4,
            trend_window: 9,
            ..Default::default()
        })
        .decompose(&values);

        for (i, s) in d.seasonal.iter().enumerate() {
            assert!((s - profile[i % 4]).abs() < 1e-9);
        }
        assert!(d.residual.iter().all(|r| r.abs() < 1e-9));
    }

    #[test]
    fn test_gaps_are_imputed() {
        let mut values = observed(&[5.0; 40]);
        values[3] = None;
        values[17] = None;
        let detection = detector(3.5, 40).detect(&values).unwrap();
        assert_eq!(detection.len(), 40);
    }
}
