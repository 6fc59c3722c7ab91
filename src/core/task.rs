//! Task data model for the dependency graph.
//!
//! Tasks are the atomic units of work handed to executors. Each task names
//! the capability it needs, a priority, an estimate and the tasks it
//! depends on. A [`WorkItem`] bundles the tasks for one issue together with
//! the goal its results are validated against.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::goal::Goal;
use crate::core::id::WorkItemId;

/// Identifier of a task within one work item.
///
/// Task ids are chosen by whoever plans the work (e.g. `"implement"`), so
/// unlike runtime ids they are plain strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The kind of executor a task requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Planning and decomposition.
    Coordinator,
    /// Issue analysis and triage.
    Issue,
    /// Code generation.
    #[serde(alias = "code_gen")]
    Codegen,
    /// Writing and running tests.
    Test,
    /// Code review.
    Review,
    /// Release and deployment.
    Deploy,
}

/// Capabilities in the same family can share a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityFamily {
    Analysis,
    Implementation,
    Release,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Coordinator,
        Capability::Issue,
        Capability::Codegen,
        Capability::Test,
        Capability::Review,
        Capability::Deploy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Coordinator => "coordinator",
            Capability::Issue => "issue",
            Capability::Codegen => "codegen",
            Capability::Test => "test",
            Capability::Review => "review",
            Capability::Deploy => "deploy",
        }
    }

    pub fn family(&self) -> CapabilityFamily {
        match self {
            Capability::Coordinator | Capability::Issue | Capability::Review => {
                CapabilityFamily::Analysis
            }
            Capability::Codegen | Capability::Test => CapabilityFamily::Implementation,
            Capability::Deploy => CapabilityFamily::Release,
        }
    }

    /// Whether tasks of both capabilities may be batched into one group.
    pub fn is_compatible_with(&self, other: Capability) -> bool {
        self.family() == other.family()
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Capability {
    type Err = crate::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| crate::Error::Validation(format!("unknown capability: {}", s)))
    }
}

/// Task priority. Ordering follows urgency: `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// A single node in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    /// Identifier, unique within the work item.
    pub id: TaskId,
    /// Human-readable title.
    pub title: String,
    /// What the task should accomplish.
    #[serde(default)]
    pub description: String,
    /// Executor kind required to run this task.
    pub capability: Capability,
    #[serde(default)]
    pub priority: Priority,
    /// Estimated duration in seconds.
    #[serde(default)]
    pub estimated_secs: u64,
    /// Tasks that must complete before this one starts.
    #[serde(default)]
    pub depends_on: BTreeSet<TaskId>,
}

impl TaskNode {
    /// Create a task with medium priority, no estimate and no dependencies.
    pub fn new(id: impl Into<TaskId>, title: &str, capability: Capability) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: String::new(),
            capability,
            priority: Priority::default(),
            estimated_secs: 0,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimate(mut self, secs: u64) -> Self {
        self.estimated_secs = secs;
        self
    }

    pub fn depends_on(mut self, id: impl Into<TaskId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs(self.estimated_secs)
    }
}

/// The top-level unit of work submitted for orchestration.
///
/// Immutable once submitted. When `tasks` is empty the default plan is used,
/// see [`crate::core::plan::default_plan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    #[serde(default)]
    pub id: WorkItemId,
    /// Issue number in the hosting service, if the item came from one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_number: Option<u64>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub goal: Goal,
    #[serde(default)]
    pub tasks: Vec<TaskNode>,
}

impl WorkItem {
    pub fn new(title: &str, description: &str) -> Self {
        Self {
            id: WorkItemId::new(),
            issue_number: None,
            title: title.to_string(),
            description: description.to_string(),
            goal: Goal::default(),
            tasks: Vec::new(),
        }
    }

    pub fn with_goal(mut self, goal: Goal) -> Self {
        self.goal = goal;
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<TaskNode>) -> Self {
        self.tasks = tasks;
        self
    }

    /// The tasks to orchestrate: the explicit ones, or the default plan.
    pub fn plan(&self) -> Vec<TaskNode> {
        if self.tasks.is_empty() {
            crate::core::plan::default_plan(self)
        } else {
            self.tasks.clone()
        }
    }
}
