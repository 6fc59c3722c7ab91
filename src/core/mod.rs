//! Core domain models for conductor.
//!
//! Work items and their tasks, the dependency graph built from them, the
//! grouping of graph levels into executable batches, and the goals results
//! are measured against.

pub mod dag;
pub mod goal;
pub mod grouper;
pub mod id;
pub mod plan;
pub mod task;

pub use dag::{Dependency, DependencyGraph};
pub use goal::{Comparison, Evaluation, Gap, Goal, MetricsSnapshot, SuccessCriterion};
pub use grouper::{GroupingConfig, GroupingPlan, TaskGroup, TaskGrouper};
pub use id::{EscalationId, GroupId, LoopId, WorkItemId, WorkspaceId};
pub use plan::default_plan;
pub use task::{Capability, CapabilityFamily, Priority, TaskId, TaskNode, WorkItem};
