//! Execution of grouped work.
//!
//! The [`TaskScheduler`] decides what may run, the [`WorkerPool`] runs it
//! through registered [`Executor`]s, and the [`ExecutionCoordinator`] ties
//! both to the workspace manager. [`Orchestrator`] is the public entry
//! point wrapping all of it per work item.

mod coordinator;
mod executor;
mod health;
mod orchestrator;
mod pool;
mod scheduler;
mod status;

pub use coordinator::{CoordinatorConfig, ExecutionCoordinator, ExecutionSummary, OrchestrationContext};
pub use executor::{
    Artifact, CommandExecutor, CommandSpec, ExecutionOutcome, Executor, ExecutorRegistry,
};
pub use health::{
    HealthConfig, IdlePredicate, WorkspaceHealth, WorkspaceMonitor, DEFAULT_IDLE_THRESHOLD_SECS,
    DEFAULT_STUCK_THRESHOLD_SECS,
};
pub use orchestrator::{OrchestrationHandle, Orchestrator};
pub use pool::{WorkerCompletion, WorkerPool};
pub use scheduler::{
    Disposition, EntryStatus, GroupOutcome, RetryPolicy, ScheduleEntry, ScheduleSummary,
    TaskScheduler,
};
pub use status::{GroupReport, OrchestrationReport, OrchestrationState, OrchestrationStatus};
