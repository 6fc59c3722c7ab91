//! Executors: the external workers that actually perform a task group.
//!
//! Executors are resolved by [`Capability`] through an [`ExecutorRegistry`]
//! built once per orchestrator. Groups whose capability has no executor are
//! rejected before anything is dispatched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::core::grouper::TaskGroup;
use crate::core::task::Capability;
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Something an executor produced. Recorded in reports, never inspected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub description: String,
}

/// What an executor reports back for a group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn success(summary: &str) -> Self {
        Self {
            success: true,
            summary: summary.to_string(),
            ..Default::default()
        }
    }

    pub fn failure(error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }
}

/// Performs the tasks of a group inside its workspace.
///
/// `Err` is reserved for failures to run at all (missing binary, I/O);
/// work that ran and failed is an outcome with `success == false`. Both
/// feed the same retry path.
#[async_trait]
pub trait Executor: Send + Sync {
    fn capability(&self) -> Capability;

    fn name(&self) -> &str;

    async fn execute(&self, group: &TaskGroup, workspace: &Workspace) -> Result<ExecutionOutcome>;
}

/// A program plus arguments, as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }
}

/// Capability to executor map.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<Capability, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `executor` for its own capability, replacing any previous one.
    pub fn register(self, executor: Arc<dyn Executor>) -> Self {
        let capability = executor.capability();
        self.register_as(capability, executor)
    }

    /// Register `executor` for `capability`, e.g. one general-purpose
    /// executor serving several capabilities.
    pub fn register_as(mut self, capability: Capability, executor: Arc<dyn Executor>) -> Self {
        tracing::debug!(%capability, executor = executor.name(), "executor registered");
        self.executors.insert(capability, executor);
        self
    }

    pub fn resolve(&self, capability: Capability) -> Result<Arc<dyn Executor>> {
        self.executors
            .get(&capability)
            .cloned()
            .ok_or(Error::UnknownCapability(capability))
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.executors.contains_key(&capability)
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps: Vec<Capability> = self.executors.keys().copied().collect();
        caps.sort();
        caps
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    /// Fail with the first capability among `groups` nobody can execute.
    pub fn validate(&self, groups: &[TaskGroup]) -> Result<()> {
        for group in groups {
            if !self.contains(group.capability) {
                return Err(Error::UnknownCapability(group.capability));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

/// Runs a configured program in the workspace directory.
///
/// The program sees `CONDUCTOR_GROUP_ID`, `CONDUCTOR_CAPABILITY` and
/// `CONDUCTOR_CONTEXT` (path to the group's context file) in its
/// environment. Exit status 0 is success; the last stdout line becomes the
/// summary, stderr the error. Lines of the form `artifact: <path>` are
/// collected as artifacts.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    capability: Capability,
    name: String,
    program: PathBuf,
    args: Vec<String>,
}

impl CommandExecutor {
    /// Resolve `spec.command` on `PATH` now, so a missing binary is a
    /// startup error rather than a failure on first dispatch.
    pub fn new(capability: Capability, spec: &CommandSpec) -> Result<Self> {
        let program = which::which(&spec.command)
            .map_err(|_| Error::ExecutorUnavailable(spec.command.clone()))?;
        Ok(Self {
            capability,
            name: format!("{}:{}", capability, spec.command),
            program,
            args: spec.args.clone(),
        })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, group: &TaskGroup, workspace: &Workspace) -> Result<ExecutionOutcome> {
        tracing::debug!(
            executor = %self.name,
            group = %group.label(),
            cwd = %workspace.path.display(),
            "running executor command"
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&workspace.path)
            .env("CONDUCTOR_GROUP_ID", group.id.to_string())
            .env("CONDUCTOR_CAPABILITY", group.capability.as_str())
            .env("CONDUCTOR_CONTEXT", workspace.context_path())
            .kill_on_drop(true)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let artifacts = stdout
            .lines()
            .filter_map(|l| l.trim().strip_prefix("artifact:"))
            .map(|p| {
                let path = PathBuf::from(p.trim());
                Artifact {
                    name: path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| p.trim().to_string()),
                    path: Some(path),
                    description: String::new(),
                }
            })
            .collect();
        let summary = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string();

        if output.status.success() {
            return Ok(ExecutionOutcome {
                success: true,
                artifacts,
                summary,
                error: None,
            });
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let error = if stderr.is_empty() {
            format!("{} exited with {}", self.name, output.status)
        } else {
            stderr
        };
        Ok(ExecutionOutcome {
            success: false,
            artifacts,
            summary,
            error: Some(error),
        })
    }
}
