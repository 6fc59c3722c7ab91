//! Isolated, branch-scoped workspaces for task groups.
//!
//! Every dispatched group gets its own worktree on its own branch, so
//! concurrent executors never write the same files. The manager keeps the
//! workspace table for one orchestration and is driven only from the
//! coordinator's control loop.
//!
//! Work is never discarded: dirty worktrees are committed before removal, and
//! a branch is only deleted once it has been merged into the integration
//! branch.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cleanup::{CleanupConfig, CleanupReport};
use crate::core::goal::Goal;
use crate::core::grouper::TaskGroup;
use crate::core::id::{GroupId, WorkspaceId};
use crate::core::task::{Capability, TaskNode};
use crate::git::{MergeOutcome, VersionControl};
use crate::util::{blocking, elapsed_between, Clock, SystemClock};
use crate::{Error, Result};

/// Directory inside each workspace holding conductor's own files.
pub const CONTEXT_DIR: &str = ".conductor";
/// Execution context file written for executors.
pub const CONTEXT_FILE: &str = "context.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    /// Bound to a group that is executing.
    Active,
    /// Provisioned but not currently executing.
    Idle,
    Completed,
    Failed,
    /// Removal failed; waiting to be pruned.
    Cleanup,
}

impl WorkspaceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkspaceStatus::Completed | WorkspaceStatus::Failed | WorkspaceStatus::Cleanup
        )
    }

    fn is_reusable(&self) -> bool {
        matches!(self, WorkspaceStatus::Active | WorkspaceStatus::Idle)
    }
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkspaceStatus::Active => write!(f, "active"),
            WorkspaceStatus::Idle => write!(f, "idle"),
            WorkspaceStatus::Completed => write!(f, "completed"),
            WorkspaceStatus::Failed => write!(f, "failed"),
            WorkspaceStatus::Cleanup => write!(f, "cleanup"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub group_id: GroupId,
    pub branch: String,
    pub path: PathBuf,
    pub status: WorkspaceStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Whether the branch has been merged into the integration branch.
    pub merged: bool,
}

impl Workspace {
    pub fn context_path(&self) -> PathBuf {
        self.path.join(CONTEXT_DIR).join(CONTEXT_FILE)
    }
}

/// What an executor finds in `.conductor/context.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub workspace_id: WorkspaceId,
    pub group_id: GroupId,
    pub level: usize,
    pub capability: Capability,
    pub branch: String,
    pub tasks: Vec<TaskNode>,
    pub goal: Goal,
}

impl ExecutionContext {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Directory that holds all workspace directories.
    pub root: PathBuf,
    /// Prefix for workspace branch names.
    pub branch_prefix: String,
    /// Branch new workspaces start from; HEAD when `None`.
    pub base_ref: Option<String>,
    /// Branch finished work is merged into. Once it exists, new workspaces
    /// start from it so later levels see earlier results.
    pub integration_branch: Option<String>,
    pub cleanup: CleanupConfig,
    /// Push the integration branch after each merge.
    pub push: bool,
}

impl WorkspaceConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            branch_prefix: "conductor".to_string(),
            base_ref: None,
            integration_branch: None,
            cleanup: CleanupConfig::default(),
            push: false,
        }
    }
}

pub struct WorkspaceManager {
    vcs: Arc<dyn VersionControl>,
    config: WorkspaceConfig,
    goal: Goal,
    clock: Arc<dyn Clock>,
    workspaces: HashMap<WorkspaceId, Workspace>,
    by_group: HashMap<GroupId, WorkspaceId>,
}

impl WorkspaceManager {
    pub fn new(vcs: Arc<dyn VersionControl>, config: WorkspaceConfig, goal: Goal) -> Self {
        Self {
            vcs,
            config,
            goal,
            clock: Arc::new(SystemClock),
            workspaces: HashMap::new(),
            by_group: HashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &WorkspaceConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn get(&self, id: &WorkspaceId) -> Option<&Workspace> {
        self.workspaces.get(id)
    }

    /// The most recent workspace created for `group_id`.
    pub fn for_group(&self, group_id: &GroupId) -> Option<&Workspace> {
        self.by_group
            .get(group_id)
            .and_then(|id| self.workspaces.get(id))
    }

    /// All tracked workspaces, oldest first.
    pub fn list(&self) -> Vec<&Workspace> {
        let mut all: Vec<&Workspace> = self.workspaces.values().collect();
        all.sort_by_key(|w| w.created_at);
        all
    }

    pub fn len(&self) -> usize {
        self.workspaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workspaces.is_empty()
    }

    /// Provision a workspace for `group`.
    ///
    /// Idempotent by group id: an `active` or `idle` workspace already bound
    /// to the group is returned as is. Any failure is reported as a
    /// retryable [`Error::WorkspaceCreation`].
    pub fn create_workspace(&mut self, group: &TaskGroup) -> Result<Workspace> {
        let now = self.clock.now();
        if let Some(existing) = self
            .by_group
            .get(&group.id)
            .and_then(|id| self.workspaces.get_mut(id))
        {
            if existing.status.is_reusable() {
                tracing::info!(
                    group = %group.label(),
                    workspace = %existing.id.short(),
                    "reusing existing workspace"
                );
                existing.last_activity = now;
                return Ok(existing.clone());
            }
        }

        let creation_error = |reason: String| Error::WorkspaceCreation {
            group: group.label(),
            reason,
        };

        let id = WorkspaceId::new();
        let name = format!("{}-{}", group.id.short(), id.short());
        let branch = format!("{}/{}", self.config.branch_prefix, name);
        let path = self.config.root.join(&name);
        let base = self.creation_base().map_err(|e| creation_error(e.to_string()))?;

        fs::create_dir_all(&self.config.root).map_err(|e| creation_error(e.to_string()))?;
        self.vcs
            .create_worktree(&branch, &path, base.as_deref())
            .map_err(|e| creation_error(e.to_string()))?;

        let workspace = Workspace {
            id,
            group_id: group.id,
            branch,
            path,
            status: WorkspaceStatus::Active,
            created_at: now,
            last_activity: now,
            merged: false,
        };

        if let Err(e) = self.write_context(&workspace, group) {
            if let Err(cleanup) = self.vcs.remove_worktree(&workspace.path) {
                tracing::warn!(path = %workspace.path.display(), "cleanup after failed context write: {}", cleanup);
            }
            if let Err(cleanup) = self.vcs.delete_branch(&workspace.branch) {
                tracing::warn!(branch = %workspace.branch, "cleanup after failed context write: {}", cleanup);
            }
            return Err(creation_error(e.to_string()));
        }

        tracing::info!(
            group = %group.label(),
            workspace = %workspace.id.short(),
            branch = %workspace.branch,
            "workspace created"
        );
        self.by_group.insert(group.id, workspace.id);
        self.workspaces.insert(workspace.id, workspace.clone());
        Ok(workspace)
    }

    /// Record activity on a workspace.
    pub fn touch(&mut self, id: &WorkspaceId) -> Result<()> {
        let now = self.clock.now();
        let workspace = self.get_mut(id)?;
        workspace.last_activity = now;
        Ok(())
    }

    pub fn mark(&mut self, id: &WorkspaceId, status: WorkspaceStatus) -> Result<()> {
        let now = self.clock.now();
        let workspace = self.get_mut(id)?;
        tracing::debug!(workspace = %id.short(), from = %workspace.status, to = %status, "workspace status");
        workspace.status = status;
        workspace.last_activity = now;
        Ok(())
    }

    /// Commit outstanding changes and merge the workspace branch into the
    /// integration branch, creating it if needed.
    ///
    /// Returns `None` when no integration branch is configured. Merge
    /// conflicts surface as [`Error::MergeConflict`].
    pub fn finalize(&mut self, id: &WorkspaceId, message: &str) -> Result<Option<MergeOutcome>> {
        let workspace = self
            .get(id)
            .cloned()
            .ok_or_else(|| Error::WorkspaceNotFound(id.to_string()))?;

        if self.vcs.is_dirty(&workspace.path)? {
            self.vcs.commit_all(&workspace.path, message)?;
        }

        let Some(target) = self.config.integration_branch.clone() else {
            self.touch(id)?;
            return Ok(None);
        };
        if !self.vcs.branch_exists(&target)? {
            self.vcs
                .create_branch(&target, self.config.base_ref.as_deref())?;
        }

        let outcome = self.vcs.merge(&workspace.branch, &target)?;
        tracing::info!(branch = %workspace.branch, target = %target, ?outcome, "workspace merged");

        let now = self.clock.now();
        let entry = self.get_mut(id)?;
        entry.merged = true;
        entry.last_activity = now;

        if self.config.push {
            if let Err(e) = self.vcs.push(&workspace.path, &target) {
                tracing::warn!(branch = %target, "push failed: {}", e);
            }
        }
        Ok(Some(outcome))
    }

    /// Remove a workspace's directory, and its branch if already merged.
    ///
    /// Uncommitted changes are committed first. Returns `Ok(false)` when
    /// removal failed; the workspace is then marked `cleanup` and left for
    /// [`cleanup_all`](Self::cleanup_all).
    pub fn remove_workspace(&mut self, id: &WorkspaceId) -> Result<bool> {
        let workspace = self
            .get(id)
            .cloned()
            .ok_or_else(|| Error::WorkspaceNotFound(id.to_string()))?;

        if let Err(e) = self.try_remove(&workspace) {
            tracing::warn!(
                workspace = %id.short(),
                path = %workspace.path.display(),
                "workspace removal failed, pending cleanup: {}",
                e
            );
            self.mark(id, WorkspaceStatus::Cleanup)?;
            return Ok(false);
        }

        if workspace.merged {
            if let Err(e) = self.vcs.delete_branch(&workspace.branch) {
                tracing::warn!(branch = %workspace.branch, "branch deletion failed: {}", e);
            }
        } else {
            tracing::debug!(branch = %workspace.branch, "keeping unmerged branch");
        }

        self.workspaces.remove(id);
        if self.by_group.get(&workspace.group_id) == Some(id) {
            self.by_group.remove(&workspace.group_id);
        }
        tracing::info!(workspace = %id.short(), "workspace removed");
        Ok(true)
    }

    /// Prune terminal workspaces that have been idle past the timeout.
    pub fn cleanup_all(&mut self) -> CleanupReport {
        let now = self.clock.now();
        let timeout = self.config.cleanup.idle_timeout();
        self.prune_where(|w| {
            w.status.is_terminal() && elapsed_between(w.last_activity, now) >= timeout
        })
    }

    /// Remove every workspace regardless of state.
    pub fn teardown(&mut self) -> CleanupReport {
        self.prune_where(|_| true)
    }

    fn prune_where(&mut self, select: impl Fn(&Workspace) -> bool) -> CleanupReport {
        let mut report = CleanupReport::new();
        let (selected, skipped): (Vec<Workspace>, Vec<Workspace>) = self
            .list()
            .into_iter()
            .cloned()
            .partition(|w| select(w));
        report.skipped = skipped.into_iter().map(|w| w.path).collect();

        for workspace in selected {
            match self.remove_workspace(&workspace.id) {
                Ok(true) => report.removed.push(workspace.path),
                Ok(false) => report.failed.push((workspace.path, "removal failed".to_string())),
                Err(e) => report.failed.push((workspace.path, e.to_string())),
            }
        }

        if let Err(e) = self.vcs.prune() {
            tracing::debug!("prune after cleanup failed: {}", e);
        }
        if report.total_processed() > 0 {
            tracing::debug!(
                removed = report.removed_count(),
                skipped = report.skipped_count(),
                failed = report.failed_count(),
                "workspace cleanup"
            );
        }
        report
    }

    fn try_remove(&self, workspace: &Workspace) -> Result<()> {
        if workspace.path.exists() && self.vcs.is_dirty(&workspace.path)? {
            self.vcs.commit_all(
                &workspace.path,
                &format!("conductor: auto-commit before removing {}", workspace.branch),
            )?;
        }
        self.vcs.remove_worktree(&workspace.path)
    }

    fn creation_base(&self) -> Result<Option<String>> {
        if let Some(integration) = &self.config.integration_branch {
            if self.vcs.branch_exists(integration)? {
                return Ok(Some(integration.clone()));
            }
        }
        Ok(self.config.base_ref.clone())
    }

    fn write_context(&self, workspace: &Workspace, group: &TaskGroup) -> Result<()> {
        let dir = workspace.path.join(CONTEXT_DIR);
        fs::create_dir_all(&dir)?;
        // Keep conductor's files out of every commit.
        fs::write(dir.join(".gitignore"), "*\n")?;
        let context = ExecutionContext {
            workspace_id: workspace.id,
            group_id: group.id,
            level: group.level,
            capability: group.capability,
            branch: workspace.branch.clone(),
            tasks: group.tasks.clone(),
            goal: self.goal.clone(),
        };
        fs::write(workspace.context_path(), serde_json::to_string_pretty(&context)?)?;
        Ok(())
    }

    fn get_mut(&mut self, id: &WorkspaceId) -> Result<&mut Workspace> {
        self.workspaces
            .get_mut(id)
            .ok_or_else(|| Error::WorkspaceNotFound(id.to_string()))
    }
}

/// A manager shared between the control loop and the validation phase.
pub type SharedWorkspaces = Arc<Mutex<WorkspaceManager>>;

/// Run `f` against the shared manager on the blocking pool.
///
/// Workspace operations do git and filesystem work, so they must not run
/// on an async worker thread.
pub async fn with_manager<T, F>(shared: &SharedWorkspaces, f: F) -> Result<T>
where
    F: FnOnce(&mut WorkspaceManager) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let shared = Arc::clone(shared);
    blocking(move || {
        let mut manager = shared.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut manager)
    })
    .await
}
