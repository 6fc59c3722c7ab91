//! Goal definitions and scoring.
//!
//! A [`Goal`] is a set of numeric success criteria plus free-text acceptance
//! criteria. Metrics arrive from an external collector as a
//! [`MetricsSnapshot`]; [`Goal::evaluate`] turns a snapshot into a score
//! (0..=100), the list of unmet criteria, and whether the goal is met.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metric read as the score when present in a snapshot.
pub const DEFAULT_SCORE_METRIC: &str = "quality_score";

/// How a metric is compared against its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Value must be greater than or equal to the threshold.
    #[default]
    AtLeast,
    /// Value must be less than or equal to the threshold.
    AtMost,
}

impl std::fmt::Display for Comparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Comparison::AtLeast => write!(f, ">="),
            Comparison::AtMost => write!(f, "<="),
        }
    }
}

/// A named numeric threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub metric: String,
    pub threshold: f64,
    #[serde(default)]
    pub comparison: Comparison,
}

impl SuccessCriterion {
    pub fn at_least(metric: &str, threshold: f64) -> Self {
        Self {
            metric: metric.to_string(),
            threshold,
            comparison: Comparison::AtLeast,
        }
    }

    pub fn at_most(metric: &str, threshold: f64) -> Self {
        Self {
            metric: metric.to_string(),
            threshold,
            comparison: Comparison::AtMost,
        }
    }

    pub fn is_met(&self, value: f64) -> bool {
        match self.comparison {
            Comparison::AtLeast => value >= self.threshold,
            Comparison::AtMost => value <= self.threshold,
        }
    }

    /// Fraction of the criterion achieved, in `0.0..=1.0`.
    fn attainment(&self, value: Option<f64>) -> f64 {
        let Some(value) = value else {
            return 0.0;
        };
        if self.is_met(value) {
            return 1.0;
        }
        let ratio = match self.comparison {
            Comparison::AtLeast if self.threshold > 0.0 => value / self.threshold,
            Comparison::AtMost if value > 0.0 => self.threshold / value,
            _ => 0.0,
        };
        ratio.clamp(0.0, 1.0)
    }
}

impl std::fmt::Display for SuccessCriterion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.metric, self.comparison, self.threshold)
    }
}

/// What a work item must achieve to be considered done.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Goal {
    #[serde(default)]
    pub criteria: Vec<SuccessCriterion>,
    /// Free-text acceptance criteria passed to executors verbatim.
    #[serde(default)]
    pub acceptance: Vec<String>,
    /// Snapshot field used directly as the score when present.
    #[serde(default = "default_score_metric")]
    pub score_metric: String,
}

fn default_score_metric() -> String {
    DEFAULT_SCORE_METRIC.to_string()
}

impl Default for Goal {
    fn default() -> Self {
        Self {
            criteria: Vec::new(),
            acceptance: Vec::new(),
            score_metric: default_score_metric(),
        }
    }
}

impl Goal {
    pub fn new(criteria: Vec<SuccessCriterion>) -> Self {
        Self {
            criteria,
            ..Self::default()
        }
    }

    pub fn with_acceptance(mut self, text: &str) -> Self {
        self.acceptance.push(text.to_string());
        self
    }

    /// Whether the goal has anything measurable to validate.
    pub fn is_measurable(&self) -> bool {
        !self.criteria.is_empty()
    }

    /// Score a snapshot against this goal.
    pub fn evaluate(&self, metrics: &MetricsSnapshot) -> Evaluation {
        let gaps: Vec<Gap> = self
            .criteria
            .iter()
            .filter_map(|criterion| {
                let actual = metrics.get(&criterion.metric);
                match actual {
                    Some(v) if criterion.is_met(v) => None,
                    _ => Some(Gap {
                        criterion: criterion.clone(),
                        actual,
                    }),
                }
            })
            .collect();

        let score = match metrics.get(&self.score_metric) {
            Some(v) => v.clamp(0.0, 100.0),
            None if self.criteria.is_empty() => 0.0,
            None => {
                let total: f64 = self
                    .criteria
                    .iter()
                    .map(|c| c.attainment(metrics.get(&c.metric)))
                    .sum();
                total / self.criteria.len() as f64 * 100.0
            }
        };

        Evaluation {
            score,
            goal_achieved: gaps.is_empty(),
            gaps,
        }
    }
}

/// Result of scoring one snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub score: f64,
    pub goal_achieved: bool,
    pub gaps: Vec<Gap>,
}

/// An unmet success criterion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gap {
    pub criterion: SuccessCriterion,
    /// Observed value, `None` when the collector did not report the metric.
    pub actual: Option<f64>,
}

impl std::fmt::Display for Gap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.actual {
            Some(v) => write!(f, "{} (actual {})", self.criterion, v),
            None => write!(f, "{} (not reported)", self.criterion),
        }
    }
}

/// Named numeric fields reported by a metrics collector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MetricsSnapshot(pub BTreeMap<String, f64>);

impl MetricsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: f64) -> Self {
        self.0.insert(name.to_string(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, f64)> for MetricsSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
