//! Severity scoring for confirmed anomalies
//!
//! Severity escalates with both the score magnitude relative to the
//! detector threshold and the number of consecutive exceedances.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::models::DetectorParams;

/// Severity tiers, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Info,
    Warn,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::None => write!(f, "none"),
            Severity::Info => write!(f, "info"),
            Severity::Warn => write!(f, "warn"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Escalation multipliers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityConfig {
    /// Score/threshold ratio at which severity becomes `warn`
    pub warn_ratio: f64,
    /// Score/threshold ratio at which severity becomes `critical`
    pub critical_ratio: f64,
    /// Consecutive exceedances at which severity becomes `warn`
    pub warn_persistence: u32,
    /// Consecutive exceedances at which severity becomes `critical`
    pub critical_persistence: u32,
}

impl Default for SeverityConfig {
    fn default() -> Self {
        Self {
            warn_ratio: 2.0,
            critical_ratio: 4.0,
            warn_persistence: 2,
            critical_persistence: 5,
        }
    }
}

impl SeverityConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.warn_ratio.is_finite() || self.warn_ratio < 1.0 {
            return Err(ValidationError::param(
                "severity.warn_ratio",
                "must be at least 1.0",
            ));
        }
        if !self.critical_ratio.is_finite() || self.critical_ratio < self.warn_ratio {
            return Err(ValidationError::param(
                "severity.critical_ratio",
                "must be at least warn_ratio",
            ));
        }
        if self.warn_persistence < 1 {
            return Err(ValidationError::param(
                "severity.warn_persistence",
                "must be at least 1",
            ));
        }
        if self.critical_persistence < self.warn_persistence {
            return Err(ValidationError::param(
                "severity.critical_persistence",
                "must be at least warn_persistence",
            ));
        }
        Ok(())
    }
}

/// Map a raw score and persistence count to a severity tier.
///
/// Scores at or below `params.k_threshold` (including 0 and NaN) are `None`.
pub fn determine_severity(score: f64, persisted_n: u32, params: &DetectorParams) -> Severity {
    let threshold = params.k_threshold;
    if score.is_nan() || score <= threshold || threshold <= 0.0 {
        return Severity::None;
    }

    let cfg = &params.severity;
    let ratio = score / threshold;

    if ratio >= cfg.critical_ratio || persisted_n >= cfg.critical_persistence {
        Severity::Critical
    } else if ratio >= cfg.warn_ratio || persisted_n >= cfg.warn_persistence {
        Severity::Warn
    } else {
        Severity::Info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(k: f64) -> DetectorParams {
        DetectorParams {
            k_threshold: k,
            ..Default::default()
        }
    }

    #[test]
    fn test_zero_score_is_none() {
        assert_eq!(determine_severity(0.0, 0, &params(3.5)), Severity::None);
        assert_eq!(determine_severity(0.0, 10, &params(3.5)), Severity::None);
    }

    #[test]
    fn test_below_or_at_threshold_is_none() {
        assert_eq!(determine_severity(3.5, 1, &params(3.5)), Severity::None);
        assert_eq!(determine_severity(2.0, 9, &params(3.5)), Severity::None);
        assert_eq!(determine_severity(f64::NAN, 9, &params(3.5)), Severity::None);
    }

    #[test]
    fn test_score_tiers() {
        let p = params(2.0);
        assert_eq!(determine_severity(3.0, 1, &p), Severity::Info);
        assert_eq!(determine_severity(5.0, 1, &p), Severity::Warn);
        assert_eq!(determine_severity(8.0, 1, &p), Severity::Critical);
    }

    #[test]
    fn test_persistence_escalates() {
        let p = params(2.0);
        assert_eq!(determine_severity(2.5, 2, &p), Severity::Warn);
        assert_eq!(determine_severity(2.5, 5, &p), Severity::Critical);
    }

    #[test]
    fn test_very_large_score_is_critical() {
        assert_eq!(determine_severity(1e9, 5, &params(3.5)), Severity::Critical);
    }

    #[test]
    fn test_severity_is_pure_and_monotonic() {
        let p = params(3.0);
        let scores = [0.0, 1.0, 3.1, 5.0, 6.5, 9.0, 12.5, 40.0];
        for n in 0..8 {
            let mut previous = Severity::None;
            for &score in &scores {
                let first = determine_severity(score, n, &p);
                assert_eq!(first, determine_severity(score, n, &p));
                assert!(first >= previous, "score {} n {} regressed", score, n);
                previous = first;
            }
        }
        for &score in &scores {
            let mut previous = Severity::None;
            for n in 0..8 {
                let current = determine_severity(score, n, &p);
                assert!(current >= previous);
                previous = current;
            }
        }
    }

    #[test]
    fn test_custom_multipliers() {
        let p = DetectorParams {
            k_threshold: 1.0,
            severity: SeverityConfig {
                warn_ratio: 1.5,
                critical_ratio: 3.0,
                warn_persistence: 4,
                critical_persistence: 8,
            },
            ..Default::default()
        };
        assert_eq!(determine_severity(1.6, 1, &p), Severity::Warn);
        assert_eq!(determine_severity(1.2, 3, &p), Severity::Info);
        assert_eq!(determine_severity(3.0, 1, &p), Severity::Critical);
    }

    #[test]
    fn test_config_validation() {
        assert!(SeverityConfig::default().validate().is_ok());
        let inverted = SeverityConfig {
            warn_ratio: 4.0,
            critical_ratio: 2.0,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }
}
