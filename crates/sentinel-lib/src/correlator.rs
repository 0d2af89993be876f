//! Root-cause correlation for confirmed anomalies
//!
//! This module provides:
//! - Concentration hypotheses from segments that own a large share of the delta
//! - Burst hypotheses from many entities acting with near-identical volume
//! - Multi-segment hypotheses when two segments jointly explain the delta
//!
//! The correlator works over summaries precomputed by the caller and has no
//! I/O of its own.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::models::AnomalyEvent;

/// Correlation thresholds, overridable per detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Minimum share of the delta for a concentration hypothesis
    pub concentration_threshold: f64,
    /// Share above which a concentration is dominant
    pub dominant_threshold: f64,
    /// A burst needs strictly more entities than this
    pub burst_entity_threshold: usize,
    /// Maximum coefficient of variation of entity activity in a burst
    pub burst_max_cv: f64,
    /// Combined share of the top two segments for a multi-segment hypothesis
    pub multi_segment_threshold: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            concentration_threshold: 0.3,
            dominant_threshold: 0.5,
            burst_entity_threshold: 10,
            burst_max_cv: 0.25,
            multi_segment_threshold: 0.7,
        }
    }
}

impl CorrelationConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let share = |name: &'static str, value: f64| {
            if value.is_finite() && value > 0.0 && value <= 1.0 {
                Ok(())
            } else {
                Err(ValidationError::param(
                    name,
                    format!("must be in (0, 1], got {}", value),
                ))
            }
        };
        share("concentration_threshold", self.concentration_threshold)?;
        share("dominant_threshold", self.dominant_threshold)?;
        share("multi_segment_threshold", self.multi_segment_threshold)?;

        if self.dominant_threshold < self.concentration_threshold {
            return Err(ValidationError::param(
                "dominant_threshold",
                "must not be below concentration_threshold",
            ));
        }
        if self.burst_entity_threshold < 1 {
            return Err(ValidationError::param(
                "burst_entity_threshold",
                "must be at least 1",
            ));
        }
        if !self.burst_max_cv.is_finite() || self.burst_max_cv < 0.0 {
            return Err(ValidationError::param(
                "burst_max_cv",
                format!("must be non-negative, got {}", self.burst_max_cv),
            ));
        }
        Ok(())
    }
}

/// Contribution of one dimension value to the anomalous delta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub dimension: String,
    pub value: String,
    /// Fraction of the delta attributable to this segment (0-1)
    pub share_of_delta: f64,
    pub entity_count: u64,
}

impl Segment {
    pub fn new(dimension: impl Into<String>, value: impl Into<String>, share_of_delta: f64) -> Self {
        Self {
            dimension: dimension.into(),
            value: value.into(),
            share_of_delta,
            entity_count: 0,
        }
    }

    pub fn with_entity_count(mut self, entity_count: u64) -> Self {
        self.entity_count = entity_count;
        self
    }

    fn label(&self) -> String {
        format!("{}={}", self.dimension, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityActivity {
    pub entity_id: String,
    pub activity_count: u64,
}

/// Entities of one type active during the anomaly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntityGroup {
    pub entity_type: String,
    pub entities: Vec<EntityActivity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Concentration,
    Burst,
    MultiSegment,
}

impl fmt::Display for PatternType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternType::Concentration => write!(f, "concentration"),
            PatternType::Burst => write!(f, "burst"),
            PatternType::MultiSegment => write!(f, "multi_segment"),
        }
    }
}

/// Ordered so that `High > Medium`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Medium,
    High,
}

/// A ranked root-cause hypothesis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootPattern {
    pub pattern_type: PatternType,
    pub description: String,
    pub confidence: Confidence,
    pub mitigation: String,
    /// Estimated fraction of the anomaly explained (0-1)
    pub impact: f64,
    pub dominant: bool,
}

/// Generates and ranks root-cause hypotheses
#[derive(Debug, Clone, Default)]
pub struct AnomalyCorrelator {
    config: CorrelationConfig,
}

impl AnomalyCorrelator {
    pub fn new(config: CorrelationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Hypotheses for `event`, highest confidence first, then by impact.
    /// Equal entries keep generation order.
    pub fn correlate(
        &self,
        event: &AnomalyEvent,
        segments: &[Segment],
        candidate_entities: &[CandidateEntityGroup],
    ) -> Vec<RootPattern> {
        let segments: Vec<&Segment> = segments
            .iter()
            .filter(|s| s.share_of_delta.is_finite() && s.share_of_delta >= 0.0)
            .collect();

        let mut patterns = Vec::new();
        patterns.extend(self.concentrations(event, &segments));
        patterns.extend(self.bursts(candidate_entities));
        patterns.extend(self.multi_segment(event, &segments));

        patterns.sort_by(|a, b| {
            b.confidence
                .cmp(&a.confidence)
                .then_with(|| b.impact.total_cmp(&a.impact))
        });
        patterns
    }

    fn concentrations(&self, event: &AnomalyEvent, segments: &[&Segment]) -> Vec<RootPattern> {
        segments
            .iter()
            .filter(|s| s.share_of_delta > self.config.concentration_threshold)
            .map(|segment| {
                let share = segment.share_of_delta.min(1.0);
                let dominant = share > self.config.dominant_threshold;
                RootPattern {
                    pattern_type: PatternType::Concentration,
                    description: format!(
                        "{} accounts for {:.0}% of the {} change in {}",
                        segment.label(),
                        share * 100.0,
                        event.metric,
                        event.cohort_key
                    ),
                    confidence: if dominant {
                        Confidence::High
                    } else {
                        Confidence::Medium
                    },
                    mitigation: format!(
                        "Review recent changes affecting {} and consider a targeted rule for it",
                        segment.label()
                    ),
                    impact: share,
                    dominant,
                }
            })
            .collect()
    }

    fn bursts(&self, groups: &[CandidateEntityGroup]) -> Vec<RootPattern> {
        // Merge groups sharing an entity type, keeping first-seen order
        let mut by_type: Vec<(&str, Vec<u64>)> = Vec::new();
        for group in groups {
            let counts = group.entities.iter().map(|e| e.activity_count);
            match by_type.iter_mut().find(|(t, _)| *t == group.entity_type) {
                Some((_, existing)) => existing.extend(counts),
                None => by_type.push((group.entity_type.as_str(), counts.collect())),
            }
        }

        by_type
            .into_iter()
            .filter_map(|(entity_type, counts)| self.burst(entity_type, &counts))
            .collect()
    }

    fn burst(&self, entity_type: &str, counts: &[u64]) -> Option<RootPattern> {
        let n = counts.len();
        if n <= self.config.burst_entity_threshold {
            return None;
        }

        let cv = coefficient_of_variation(counts)?;
        if cv > self.config.burst_max_cv {
            return None;
        }

        let confidence = if cv <= self.config.burst_max_cv / 2.0 {
            Confidence::High
        } else {
            Confidence::Medium
        };

        Some(RootPattern {
            pattern_type: PatternType::Burst,
            description: format!(
                "{} {} entities show near-uniform activity (cv {:.2})",
                n, entity_type, cv
            ),
            confidence,
            mitigation: format!(
                "Check the {} entities for coordinated or scripted behaviour and rate-limit them",
                entity_type
            ),
            impact: n as f64 / (n + self.config.burst_entity_threshold) as f64,
            dominant: false,
        })
    }

    fn multi_segment(&self, event: &AnomalyEvent, segments: &[&Segment]) -> Option<RootPattern> {
        let mut ranked = segments.to_vec();
        ranked.sort_by(|a, b| b.share_of_delta.total_cmp(&a.share_of_delta));

        let (first, second) = match ranked.as_slice() {
            [first, second, ..] => (*first, *second),
            _ => return None,
        };

        let combined = (first.share_of_delta + second.share_of_delta).min(1.0);
        if combined <= self.config.multi_segment_threshold {
            return None;
        }

        Some(RootPattern {
            pattern_type: PatternType::MultiSegment,
            description: format!(
                "{} and {} together account for {:.0}% of the {} change in {}",
                first.label(),
                second.label(),
                combined * 100.0,
                event.metric,
                event.cohort_key
            ),
            confidence: Confidence::Medium,
            mitigation: format!(
                "Investigate the interaction between {} and {}",
                first.label(),
                second.label()
            ),
            impact: combined,
            dominant: false,
        })
    }
}

/// Population coefficient of variation; `None` when there is no activity
fn coefficient_of_variation(counts: &[u64]) -> Option<f64> {
    if counts.is_empty() {
        return None;
    }
    let n = counts.len() as f64;
    let mean = counts.iter().map(|c| *c as f64).sum::<f64>() / n;
    if mean <= 0.0 {
        return None;
    }
    let variance = counts
        .iter()
        .map(|c| (*c as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    Some(variance.sqrt() / mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CohortKey;
    use crate::severity::Severity;
    use chrono::Utc;
    use uuid::Uuid;

    fn event() -> AnomalyEvent {
        AnomalyEvent {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            detector_id: Uuid::new_v4(),
            cohort_key: CohortKey::new([("merchant", "m1")]),
            metric: "chargeback_rate".to_string(),
            timestamp: Utc::now(),
            score: 7.5,
            severity: Severity::Warn,
            persisted_n: 2,
            created_at: Utc::now(),
        }
    }

    fn group(entity_type: &str, counts: &[u64]) -> CandidateEntityGroup {
        CandidateEntityGroup {
            entity_type: entity_type.to_string(),
            entities: counts
                .iter()
                .enumerate()
                .map(|(i, c)| EntityActivity {
                    entity_id: format!("{}-{}", entity_type, i),
                    activity_count: *c,
                })
                .collect(),
        }
    }

    #[test]
    fn test_dominant_concentration_ranked_first() {
        let correlator = AnomalyCorrelator::default();
        let segments = vec![
            Segment::new("device", "android", 0.1),
            Segment::new("country", "BR", 0.85).with_entity_count(40),
        ];

        let patterns = correlator.correlate(&event(), &segments, &[]);
        let first = &patterns[0];
        assert_eq!(first.pattern_type, PatternType::Concentration);
        assert_eq!(first.confidence, Confidence::High);
        assert!(first.dominant);
        assert!((first.impact - 0.85).abs() < 1e-12);
        assert!(first.description.contains("country=BR"));
    }

    #[test]
    fn test_medium_concentration_below_dominant() {
        let correlator = AnomalyCorrelator::default();
        let patterns =
            correlator.correlate(&event(), &[Segment::new("device", "ios", 0.4)], &[]);
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].confidence, Confidence::Medium);
        assert!(!patterns[0].dominant);
    }

    #[test]
    fn test_uniform_burst_yields_one_hypothesis() {
        let correlator = AnomalyCorrelator::default();
        let counts = [10, 11, 10, 9, 10, 10, 11, 9, 10, 10, 10, 11, 9, 10, 10];
        let patterns = correlator.correlate(&event(), &[], &[group("card", &counts)]);

        assert_eq!(patterns.len(), 1);
        let burst = &patterns[0];
        assert_eq!(burst.pattern_type, PatternType::Burst);
        assert_eq!(burst.confidence, Confidence::High);
        assert!((burst.impact - 15.0 / 25.0).abs() < 1e-12);
    }

    #[test]
    fn test_groups_of_same_type_merge_into_one_burst() {
        let correlator = AnomalyCorrelator::default();
        let groups = [group("card", &[5; 8]), group("card", &[5; 7])];
        let patterns = correlator.correlate(&event(), &[], &groups);
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].description.starts_with("15 card"));
    }

    #[test]
    fn test_no_burst_when_few_or_uneven() {
        let correlator = AnomalyCorrelator::default();

        // Exactly the threshold is not enough
        let few = correlator.correlate(&event(), &[], &[group("card", &[10; 10])]);
        assert!(few.is_empty());

        let mut uneven = vec![1u64; 14];
        uneven.push(200);
        let patterns = correlator.correlate(&event(), &[], &[group("card", &uneven)]);
        assert!(patterns.is_empty());

        let idle = correlator.correlate(&event(), &[], &[group("card", &[0; 20])]);
        assert!(idle.is_empty());
    }

    #[test]
    fn test_multi_segment_ordering() {
        let correlator = AnomalyCorrelator::default();
        let segments = vec![
            Segment::new("merchant", "m7", 0.35),
            Segment::new("device", "ios", 0.4),
        ];
        let patterns = correlator.correlate(&event(), &segments, &[]);

        let kinds: Vec<PatternType> = patterns.iter().map(|p| p.pattern_type).collect();
        assert_eq!(
            kinds,
            vec![
                PatternType::MultiSegment,
                PatternType::Concentration,
                PatternType::Concentration
            ]
        );
        assert!((patterns[0].impact - 0.75).abs() < 1e-12);
        assert!(patterns[1].impact > patterns[2].impact);
    }

    #[test]
    fn test_invalid_shares_ignored() {
        let correlator = AnomalyCorrelator::default();
        let segments = vec![
            Segment::new("device", "ios", f64::NAN),
            Segment::new("device", "web", -0.9),
        ];
        assert!(correlator.correlate(&event(), &segments, &[]).is_empty());
    }

    #[test]
    fn test_config_validation() {
        assert!(CorrelationConfig::default().validate().is_ok());

        let inverted = CorrelationConfig {
            concentration_threshold: 0.6,
            dominant_threshold: 0.5,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());

        let out_of_range = CorrelationConfig {
            multi_segment_threshold: 1.5,
            ..Default::default()
        };
        assert!(out_of_range.validate().is_err());
    }
}
