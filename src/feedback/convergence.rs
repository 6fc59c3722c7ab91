//! Convergence and divergence detection over a score history.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tuning for the feedback loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Number of trailing scores considered for convergence.
    pub window: usize,
    /// Variance (score points squared) below which a full window counts as converging.
    pub variance_threshold: f64,
    /// Consecutive negative deltas that count as divergence.
    pub divergence_streak: usize,
    pub max_iterations: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            window: 5,
            variance_threshold: 5.0,
            divergence_streak: 3,
            max_iterations: 10,
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.window < 2 {
            return Err(Error::Config("feedback.window must be at least 2".into()));
        }
        if self.variance_threshold < 0.0 {
            return Err(Error::Config(
                "feedback.variance_threshold must not be negative".into(),
            ));
        }
        if self.divergence_streak == 0 {
            return Err(Error::Config(
                "feedback.divergence_streak must be at least 1".into(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(Error::Config(
                "feedback.max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Statistics over the trailing window of scores.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceMetrics {
    /// Scores actually in the window (at most `LoopConfig::window`).
    pub samples: usize,
    pub mean: f64,
    /// Population variance.
    pub variance: f64,
    /// Least-squares slope, score points per iteration.
    pub slope: f64,
    /// Consecutive negative deltas at the end of the full history.
    pub negative_streak: usize,
    pub is_converging: bool,
    pub is_diverging: bool,
}

impl ConvergenceMetrics {
    pub fn compute(scores: &[f64], config: &LoopConfig) -> Self {
        let start = scores.len().saturating_sub(config.window);
        let window = &scores[start..];
        let samples = window.len();
        if samples == 0 {
            return Self::default();
        }

        let n = samples as f64;
        let mean = window.iter().sum::<f64>() / n;
        let variance = window.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        let slope = least_squares_slope(window, mean);
        let negative_streak = trailing_negative_deltas(scores);

        Self {
            samples,
            mean,
            variance,
            slope,
            negative_streak,
            is_converging: samples >= config.window && variance < config.variance_threshold,
            is_diverging: negative_streak >= config.divergence_streak,
        }
    }
}

fn least_squares_slope(window: &[f64], mean: f64) -> f64 {
    let n = window.len() as f64;
    if window.len() < 2 {
        return 0.0;
    }
    let x_mean = (n - 1.0) / 2.0;
    let (num, den) = window
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, y)| {
            let dx = i as f64 - x_mean;
            (num + dx * (y - mean), den + dx * dx)
        });
    if den == 0.0 {
        0.0
    } else {
        num / den
    }
}

fn trailing_negative_deltas(scores: &[f64]) -> usize {
    scores
        .windows(2)
        .rev()
        .take_while(|pair| pair[1] < pair[0])
        .count()
}
