//! Validation of integrated results against the work item's goal.
//!
//! After all groups complete, the [`FeedbackLoopController`] measures the
//! integrated work, decides whether it has converged, plateaued or is
//! getting worse, and requests refinement runs until one of those holds.

mod controller;
mod convergence;
mod metrics;

pub use controller::{FeedbackLoop, FeedbackLoopController, IterationRecord, LoopState};
pub use convergence::{ConvergenceMetrics, LoopConfig};
pub use metrics::{parse_metrics, CommandMetricsCollector, MetricsCollector, DEFAULT_METRICS_TIMEOUT_SECS};
