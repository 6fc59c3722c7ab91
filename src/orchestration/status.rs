//! Observable orchestration state and the final report.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::id::{GroupId, WorkItemId};
use crate::core::task::{Capability, TaskId};
use crate::escalation::Escalation;
use crate::feedback::{IterationRecord, LoopState};
use crate::orchestration::executor::Artifact;
use crate::orchestration::scheduler::EntryStatus;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Planning,
    Executing,
    Validating,
    Completed,
    Failed,
    Escalated,
    Cancelled,
}

impl OrchestrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrchestrationState::Completed
                | OrchestrationState::Failed
                | OrchestrationState::Escalated
                | OrchestrationState::Cancelled
        )
    }
}

impl std::fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrchestrationState::Planning => write!(f, "planning"),
            OrchestrationState::Executing => write!(f, "executing"),
            OrchestrationState::Validating => write!(f, "validating"),
            OrchestrationState::Completed => write!(f, "completed"),
            OrchestrationState::Failed => write!(f, "failed"),
            OrchestrationState::Escalated => write!(f, "escalated"),
            OrchestrationState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Point-in-time view of an orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationStatus {
    pub work_item: WorkItemId,
    pub state: OrchestrationState,
    /// Fraction of groups in a terminal state, `0.0..=1.0`.
    pub progress: f64,
    pub active_groups: usize,
    pub completed_groups: usize,
    pub failed_groups: usize,
    pub total_groups: usize,
    /// Feedback iterations run so far.
    pub iteration: u32,
    pub loop_state: Option<LoopState>,
    pub last_score: Option<f64>,
}

impl OrchestrationStatus {
    pub fn new(work_item: WorkItemId, total_groups: usize) -> Self {
        Self {
            work_item,
            state: OrchestrationState::Planning,
            progress: 0.0,
            active_groups: 0,
            completed_groups: 0,
            failed_groups: 0,
            total_groups,
            iteration: 0,
            loop_state: None,
            last_score: None,
        }
    }

    pub(crate) fn update_progress(&mut self, active: usize, completed: usize, failed: usize) {
        self.active_groups = active;
        self.completed_groups = completed;
        self.failed_groups = failed;
        self.progress = if self.total_groups == 0 {
            1.0
        } else {
            (completed + failed) as f64 / self.total_groups as f64
        };
    }
}

impl std::fmt::Display for OrchestrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {:.0}% ({} running, {} completed, {} failed of {})",
            self.state,
            self.progress * 100.0,
            self.active_groups,
            self.completed_groups,
            self.failed_groups,
            self.total_groups
        )?;
        if let Some(state) = self.loop_state {
            write!(f, " loop {} after {} iteration(s)", state, self.iteration)?;
        }
        Ok(())
    }
}

/// How one group ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupReport {
    pub group_id: GroupId,
    pub label: String,
    pub level: usize,
    pub capability: Capability,
    pub tasks: Vec<TaskId>,
    pub status: EntryStatus,
    /// Retries used.
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Wall time of the last attempt.
    pub elapsed_ms: u64,
}

/// Final, serializable record of an orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationReport {
    pub work_item: WorkItemId,
    pub title: String,
    pub state: OrchestrationState,
    pub integration_branch: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub levels: usize,
    pub groups: Vec<GroupReport>,
    #[serde(default)]
    pub iterations: Vec<IterationRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_state: Option<LoopState>,
    #[serde(default)]
    pub escalations: Vec<Escalation>,
}

impl OrchestrationReport {
    pub fn completed_groups(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.status == EntryStatus::Completed)
            .count()
    }

    pub fn failed_groups(&self) -> usize {
        self.groups
            .iter()
            .filter(|g| g.status == EntryStatus::Failed)
            .count()
    }

    pub fn duration(&self) -> std::time::Duration {
        crate::util::elapsed_between(self.started_at, self.finished_at)
    }

    /// Write the report as pretty JSON into `dir`, returning the file path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!(
            "{}-{}.json",
            self.finished_at.format("%Y%m%dT%H%M%S"),
            self.work_item.short()
        ));
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}
