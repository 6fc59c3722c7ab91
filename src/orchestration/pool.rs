//! Bounded pool of concurrent executor calls.
//!
//! The `WorkerPool` is the only concurrent part of an orchestration. Each
//! dispatched group runs on its own tokio task under a deadline; the result,
//! whatever it is, comes back on the completion channel. Workers never touch
//! scheduler or workspace state.
//!
//! A slot stays occupied until the control loop has received the
//! completion and called [`WorkerPool::release`], so the number of running
//! groups can never exceed `max_concurrent`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::grouper::TaskGroup;
use crate::core::id::{GroupId, WorkspaceId};
use crate::orchestration::executor::{ExecutionOutcome, Executor};
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Result of one dispatched group, sent back to the control loop.
#[derive(Debug)]
pub struct WorkerCompletion {
    pub group_id: GroupId,
    pub workspace_id: WorkspaceId,
    pub elapsed: Duration,
    /// `Err` for timeouts, panics and executors that could not run.
    pub result: Result<ExecutionOutcome>,
}

#[derive(Debug)]
struct ActiveWorker {
    workspace_id: WorkspaceId,
    started: Instant,
    handle: JoinHandle<()>,
}

pub struct WorkerPool {
    active: HashMap<GroupId, ActiveWorker>,
    max_concurrent: usize,
    deadline: Duration,
    completion_tx: mpsc::Sender<WorkerCompletion>,
}

impl WorkerPool {
    /// Create a pool running at most `max_concurrent` groups, each bounded
    /// by `deadline`.
    pub fn new(
        max_concurrent: usize,
        deadline: Duration,
        completion_tx: mpsc::Sender<WorkerCompletion>,
    ) -> Self {
        Self {
            active: HashMap::new(),
            max_concurrent,
            deadline,
            completion_tx,
        }
    }

    /// Start `executor` on `group` inside `workspace`.
    ///
    /// # Errors
    ///
    /// `WorkerPoolFull` when at capacity; `Validation` if the group is
    /// already running.
    pub fn dispatch(
        &mut self,
        group: TaskGroup,
        workspace: Workspace,
        executor: Arc<dyn Executor>,
    ) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                max: self.max_concurrent,
            });
        }
        if self.active.contains_key(&group.id) {
            return Err(Error::Validation(format!(
                "group {} is already running",
                group.label()
            )));
        }

        let group_id = group.id;
        let workspace_id = workspace.id;
        let deadline = self.deadline;
        let tx = self.completion_tx.clone();
        tracing::info!(
            group = %group.label(),
            executor = executor.name(),
            workspace = %workspace_id.short(),
            ?deadline,
            "dispatching group"
        );

        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let call = AssertUnwindSafe(executor.execute(&group, &workspace)).catch_unwind();
            let result = match tokio::time::timeout(deadline, call).await {
                Ok(Ok(result)) => result,
                Ok(Err(panic)) => Err(Error::TaskExecution(format!(
                    "executor panicked: {}",
                    panic_message(panic.as_ref())
                ))),
                Err(_) => Err(Error::TaskTimeout(deadline)),
            };
            let completion = WorkerCompletion {
                group_id,
                workspace_id,
                elapsed: started.elapsed(),
                result,
            };
            if tx.send(completion).await.is_err() {
                tracing::debug!(group = %group_id.short(), "completion dropped, coordinator gone");
            }
        });

        self.active.insert(
            group_id,
            ActiveWorker {
                workspace_id,
                started: Instant::now(),
                handle,
            },
        );
        Ok(())
    }

    /// Free the slot held by `group_id`. Returns how long it ran.
    pub fn release(&mut self, group_id: &GroupId) -> Option<Duration> {
        self.active.remove(group_id).map(|w| w.started.elapsed())
    }

    /// Abort every running worker. Their completions are never sent.
    pub fn abort_all(&mut self) {
        for (group_id, worker) in self.active.drain() {
            tracing::warn!(group = %group_id.short(), workspace = %worker.workspace_id.short(), "aborting worker");
            worker.handle.abort();
        }
    }

    pub fn is_running(&self, group_id: &GroupId) -> bool {
        self.active.contains_key(group_id)
    }

    /// Workspaces whose worker is still inside its deadline.
    pub fn live_workspaces(&self) -> Vec<WorkspaceId> {
        self.active
            .values()
            .filter(|w| w.started.elapsed() < self.deadline)
            .map(|w| w.workspace_id)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in self.active.values() {
            worker.handle.abort();
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
