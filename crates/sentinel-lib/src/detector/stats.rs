//! Robust statistics shared by the detectors

/// Scale factor that makes the MAD a consistent estimator of the standard
/// deviation for normally distributed data
pub const MAD_SCALE: f64 = 1.4826;

/// Median of a slice; 0.0 for an empty slice
pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Median absolute deviation around `center`, unscaled
pub fn median_absolute_deviation(values: &[f64], center: f64) -> f64 {
    let deviations: Vec<f64> = values.iter().map(|v| (v - center).abs()).collect();
    median(&deviations)
}

/// Population standard deviation
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

/// Moving median with a fixed-length window.
///
/// The window is forced odd and clipped to the series length. Near the edges
/// it is shifted inward rather than shrunk, so every estimate uses the same
/// number of points and a short excursion at the end of the series cannot
/// take over the estimate.
pub fn moving_median(values: &[f64], window: usize) -> Vec<f64> {
    let n = values.len();
    if n == 0 {
        return Vec::new();
    }

    let mut width = window.min(n).max(1);
    if width % 2 == 0 {
        width -= 1;
    }
    let half = width / 2;

    (0..n)
        .map(|i| {
            let start = i.saturating_sub(half).min(n - width);
            median(&values[start..start + width])
        })
        .collect()
}
