use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::task::{Capability, TaskId};

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    DependencyCycle { cycle: Vec<TaskId> },

    #[error("Unknown task: {0}")]
    UnknownTask(TaskId),

    #[error("Failed to create workspace for group {group}: {reason}")]
    WorkspaceCreation { group: String, reason: String },

    #[error("Workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("Task group timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("Task execution failed: {0}")]
    TaskExecution(String),

    #[error("Merge conflict merging {branch} into {target}: {} file(s)", .files.len())]
    MergeConflict {
        branch: String,
        target: String,
        files: Vec<PathBuf>,
    },

    #[error("Version control error: {0}")]
    Vcs(String),

    #[error("No executor registered for capability {0}")]
    UnknownCapability(Capability),

    #[error("Executor not available: {0}")]
    ExecutorUnavailable(String),

    #[error("Worker pool is full (max: {max})")]
    WorkerPoolFull { max: usize },

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Invalid transition for {id} from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Feedback loop not found: {0}")]
    LoopNotFound(String),

    #[error("Feedback loop {id} already terminated ({state})")]
    LoopTerminated { id: String, state: String },

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Whether the failure is transient and may be retried with backoff.
    ///
    /// Timeouts, executor failures and workspace provisioning problems are
    /// retryable. Merge conflicts, cycles and misconfiguration are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TaskTimeout(_)
                | Error::TaskExecution(_)
                | Error::WorkspaceCreation { .. }
                | Error::Timeout(_)
                | Error::TaskJoin(_)
                | Error::Io(_)
        )
    }
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
