//! The execution control loop.
//!
//! One `ExecutionCoordinator` owns one [`OrchestrationContext`]. It is the
//! single place scheduler and workspace state change: it picks eligible
//! groups, provisions workspaces, hands groups to the worker pool and
//! settles their results as completions come back on the channel.
//!
//! The loop suspends only when the pool is full, nothing is eligible yet, or
//! everything eligible is waiting out a retry backoff.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::core::grouper::TaskGroup;
use crate::core::id::{GroupId, WorkItemId, WorkspaceId};
use crate::escalation::{EscalationContext, EscalationManager, Severity};
use crate::orchestration::executor::{Artifact, ExecutorRegistry};
use crate::orchestration::health::{HealthConfig, WorkspaceHealth, WorkspaceMonitor};
use crate::orchestration::pool::{WorkerCompletion, WorkerPool};
use crate::orchestration::scheduler::{
    Disposition, GroupOutcome, RetryPolicy, ScheduleSummary, TaskScheduler,
};
use crate::orchestration::status::{GroupReport, OrchestrationStatus};
use crate::util::Clock;
use crate::workspace::{with_manager, SharedWorkspaces, WorkspaceStatus};
use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_concurrency: usize,
    /// Deadline for each dispatched group.
    pub group_timeout: Duration,
    /// Keep workspaces of failed attempts until cleanup.
    pub keep_failed: bool,
    /// How often terminal workspaces are pruned.
    pub cleanup_interval: Duration,
    /// Longest the loop sleeps without an event, bounding health-check latency.
    pub poll_interval: Duration,
    pub health: HealthConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 2,
            group_timeout: Duration::from_secs(1800),
            keep_failed: true,
            cleanup_interval: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            health: HealthConfig::default(),
        }
    }
}

/// Per-orchestration state, owned by exactly one coordinator.
pub struct OrchestrationContext {
    pub work_item: WorkItemId,
    pub scheduler: TaskScheduler,
    pub workspaces: SharedWorkspaces,
    pub pool: WorkerPool,
    pub completions: mpsc::Receiver<WorkerCompletion>,
    pub status: watch::Sender<OrchestrationStatus>,
    pub cancel: CancellationToken,
}

impl OrchestrationContext {
    pub fn new(
        work_item: WorkItemId,
        groups: Vec<TaskGroup>,
        retry: RetryPolicy,
        workspaces: SharedWorkspaces,
        config: &CoordinatorConfig,
        status: watch::Sender<OrchestrationStatus>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, completions) = mpsc::channel(config.max_concurrency.max(1) * 2);
        Self {
            work_item,
            scheduler: TaskScheduler::new(groups, retry),
            workspaces,
            pool: WorkerPool::new(config.max_concurrency, config.group_timeout, tx),
            completions,
            status,
            cancel,
        }
    }
}

/// What the execution phase produced.
#[derive(Debug, Clone)]
pub struct ExecutionSummary {
    pub groups: Vec<GroupReport>,
    pub schedule: ScheduleSummary,
    pub cancelled: bool,
}

impl ExecutionSummary {
    pub fn all_completed(&self) -> bool {
        !self.cancelled && self.schedule.completed == self.schedule.total
    }
}

/// Details of a group's latest attempt.
#[derive(Debug, Default)]
struct Attempt {
    summary: String,
    artifacts: Vec<Artifact>,
    branch: Option<String>,
    elapsed: Duration,
}

enum Wake {
    Completed(WorkerCompletion),
    Timer,
    Cancelled,
    Closed,
}

pub struct ExecutionCoordinator {
    ctx: OrchestrationContext,
    registry: Arc<ExecutorRegistry>,
    escalations: Arc<EscalationManager>,
    monitor: WorkspaceMonitor,
    config: CoordinatorConfig,
    attempts: HashMap<GroupId, Attempt>,
    reported_stuck: HashSet<WorkspaceId>,
    cancelled: bool,
}

impl ExecutionCoordinator {
    pub fn new(
        ctx: OrchestrationContext,
        registry: Arc<ExecutorRegistry>,
        escalations: Arc<EscalationManager>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            ctx,
            registry,
            escalations,
            monitor: WorkspaceMonitor::new(config.health),
            config,
            attempts: HashMap::new(),
            reported_stuck: HashSet::new(),
            cancelled: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.monitor = self.monitor.with_clock(clock);
        self
    }

    /// Run until every group is terminal, or until cancelled and drained.
    pub async fn run(mut self) -> Result<ExecutionSummary> {
        tracing::info!(
            work_item = %self.ctx.work_item.short(),
            groups = self.ctx.scheduler.entries().len(),
            max_concurrency = self.ctx.pool.max_concurrent(),
            "execution started"
        );
        let mut last_cleanup = Instant::now();

        loop {
            if !self.cancelled && self.ctx.cancel.is_cancelled() {
                self.begin_cancel();
            }
            if !self.cancelled {
                self.dispatch_ready().await;
            }
            self.publish();

            if !self.ctx.scheduler.has_work_remaining() && self.ctx.pool.active_count() == 0 {
                break;
            }
            if self.ctx.pool.active_count() == 0 && self.ctx.scheduler.next_retry_at().is_none() {
                // Nothing running and nothing will become eligible.
                tracing::error!(
                    max_concurrency = self.ctx.pool.max_concurrent(),
                    "scheduler stalled, failing remaining groups"
                );
                self.ctx.scheduler.cancel_remaining();
                self.publish();
                break;
            }

            self.check_health();
            if last_cleanup.elapsed() >= self.config.cleanup_interval {
                self.cleanup().await;
                last_cleanup = Instant::now();
            }

            match self.wait().await {
                Wake::Completed(done) => self.handle_completion(done).await,
                Wake::Timer | Wake::Cancelled => {}
                Wake::Closed => {
                    tracing::error!("completion channel closed with groups in flight");
                    self.ctx.pool.abort_all();
                }
            }
        }

        if self.cancelled {
            match with_manager(&self.ctx.workspaces, |m| Ok(m.teardown())).await {
                Ok(report) => tracing::info!(
                    removed = report.removed_count(),
                    failed = report.failed_count(),
                    "workspaces torn down after cancellation"
                ),
                Err(e) => tracing::warn!("teardown failed: {}", e),
            }
        }

        let summary = self.summary();
        tracing::info!(
            completed = summary.schedule.completed,
            failed = summary.schedule.failed,
            cancelled = summary.cancelled,
            "execution finished"
        );
        Ok(summary)
    }

    async fn wait(&mut self) -> Wake {
        let poll = tokio::time::sleep(self.config.poll_interval);
        let retry_at = self
            .ctx
            .scheduler
            .next_retry_at()
            .filter(|_| !self.cancelled);
        let retry = tokio::time::sleep_until(tokio::time::Instant::from_std(
            retry_at.unwrap_or_else(|| Instant::now() + self.config.poll_interval),
        ));
        let has_active = self.ctx.pool.active_count() > 0;
        let watch_cancel = !self.cancelled;

        tokio::select! {
            done = self.ctx.completions.recv(), if has_active => match done {
                Some(done) => Wake::Completed(done),
                None => Wake::Closed,
            },
            _ = retry, if retry_at.is_some() => Wake::Timer,
            _ = self.ctx.cancel.cancelled(), if watch_cancel => Wake::Cancelled,
            _ = poll => Wake::Timer,
        }
    }

    async fn dispatch_ready(&mut self) {
        while self.ctx.pool.has_capacity() {
            let Some(entry) = self.ctx.scheduler.get_next_group() else {
                break;
            };
            let group = entry.group.clone();
            self.launch(group).await;
        }
    }

    async fn launch(&mut self, group: TaskGroup) {
        let executor = match self.registry.resolve(group.capability) {
            Ok(executor) => executor,
            Err(e) => {
                self.record_outcome(&group.id, GroupOutcome::Failure(e)).await;
                return;
            }
        };

        let creating = group.clone();
        let workspace =
            match with_manager(&self.ctx.workspaces, move |m| m.create_workspace(&creating)).await
            {
                Ok(workspace) => workspace,
                Err(e) => {
                    tracing::warn!(group = %group.label(), "workspace creation failed: {}", e);
                    self.record_outcome(&group.id, GroupOutcome::Failure(e)).await;
                    return;
                }
            };

        if let Err(e) = self.ctx.scheduler.mark_running(&group.id) {
            tracing::error!(group = %group.label(), "cannot mark group running: {}", e);
            return;
        }
        self.attempts.insert(
            group.id,
            Attempt {
                branch: Some(workspace.branch.clone()),
                ..Default::default()
            },
        );

        let group_id = group.id;
        if let Err(e) = self.ctx.pool.dispatch(group, workspace, executor) {
            self.record_outcome(&group_id, GroupOutcome::Failure(e)).await;
        }
    }

    async fn handle_completion(&mut self, done: WorkerCompletion) {
        let WorkerCompletion {
            group_id,
            workspace_id,
            elapsed,
            result,
        } = done;
        self.ctx.pool.release(&group_id);
        let label = self
            .ctx
            .scheduler
            .entry(&group_id)
            .map(|e| e.group.label())
            .unwrap_or_else(|| group_id.short());

        let attempt = self.attempts.entry(group_id).or_default();
        attempt.elapsed = elapsed;

        let outcome = match result {
            Ok(outcome) if outcome.success => {
                attempt.summary = outcome.summary.clone();
                attempt.artifacts = outcome.artifacts;
                let message = if outcome.summary.is_empty() {
                    format!("conductor: {}", label)
                } else {
                    format!("conductor: {}\n\n{}", label, outcome.summary)
                };
                match with_manager(&self.ctx.workspaces, move |m| m.finalize(&workspace_id, &message))
                    .await
                {
                    Ok(merge) => {
                        tracing::debug!(group = %label, ?merge, "group finalized");
                        GroupOutcome::Success
                    }
                    Err(e) => GroupOutcome::Failure(e),
                }
            }
            Ok(outcome) => {
                attempt.summary = outcome.summary;
                attempt.artifacts = outcome.artifacts;
                GroupOutcome::Failure(Error::TaskExecution(
                    outcome
                        .error
                        .unwrap_or_else(|| "executor reported failure".to_string()),
                ))
            }
            Err(e) => GroupOutcome::Failure(e),
        };

        let succeeded = matches!(outcome, GroupOutcome::Success);
        self.settle_workspace(workspace_id, succeeded).await;
        self.record_outcome(&group_id, outcome).await;
    }

    async fn settle_workspace(&mut self, id: WorkspaceId, succeeded: bool) {
        let keep = !succeeded && self.config.keep_failed;
        let status = if succeeded {
            WorkspaceStatus::Completed
        } else {
            WorkspaceStatus::Failed
        };
        let result = with_manager(&self.ctx.workspaces, move |m| {
            m.mark(&id, status)?;
            if keep {
                Ok(true)
            } else {
                m.remove_workspace(&id)
            }
        })
        .await;
        match result {
            Ok(true) => {}
            Ok(false) => tracing::debug!(workspace = %id.short(), "workspace left for cleanup"),
            Err(e) => tracing::warn!(workspace = %id.short(), "settling workspace failed: {}", e),
        }
    }

    async fn record_outcome(&mut self, id: &GroupId, outcome: GroupOutcome) {
        match self.ctx.scheduler.complete_group(id, outcome) {
            Ok(Disposition::Failed {
                error,
                retries_exhausted,
                blocked,
            }) => self.escalate_failure(id, &error, retries_exhausted, blocked.len()).await,
            Ok(Disposition::Retrying { .. }) if self.cancelled => {
                // A cancelled run never re-dispatches, so the retry is dropped.
                self.ctx.scheduler.cancel_remaining();
                tracing::info!(group = %id.short(), "in-flight group failed after cancellation");
            }
            Ok(Disposition::Retrying { attempt, delay }) => {
                tracing::debug!(group = %id.short(), attempt, ?delay, "group re-enqueued")
            }
            Ok(Disposition::Completed) => {}
            Err(e) => tracing::error!(group = %id.short(), "cannot record outcome: {}", e),
        }
    }

    async fn escalate_failure(
        &self,
        id: &GroupId,
        error: &str,
        retries_exhausted: bool,
        blocked: usize,
    ) {
        let Some(entry) = self.ctx.scheduler.entry(id) else {
            return;
        };
        let label = entry.group.label();
        let reason = if retries_exhausted {
            format!("group {} failed after {} retries", label, entry.retry_count)
        } else {
            format!("group {} failed: {}", label, error)
        };
        let severity = if blocked > 0 {
            Severity::Critical
        } else {
            Severity::High
        };
        let context = EscalationContext::Schedule {
            work_item: self.ctx.work_item,
            group_id: *id,
            label,
            retry_count: entry.retry_count,
            error: error.to_string(),
            blocked,
        };
        self.escalations.escalate(context, &reason, severity).await;
    }

    fn begin_cancel(&mut self) {
        self.cancelled = true;
        let cancelled = self.ctx.scheduler.cancel_remaining();
        tracing::info!(
            cancelled = cancelled.len(),
            in_flight = self.ctx.pool.active_count(),
            "cancellation requested, draining in-flight groups"
        );
    }

    /// Running groups count as activity for their workspace while they are
    /// within the pool deadline, so only orphaned or overrunning workspaces
    /// are reported stuck.
    fn check_health(&mut self) {
        let shared = Arc::clone(&self.ctx.workspaces);
        let mut manager = shared.lock().unwrap_or_else(PoisonError::into_inner);
        for id in self.ctx.pool.live_workspaces() {
            if let Err(e) = manager.touch(&id) {
                tracing::debug!(workspace = %id.short(), "heartbeat skipped: {}", e);
            }
        }
        for (workspace, health) in self.monitor.check_all(manager.list()) {
            if let WorkspaceHealth::Stuck { idle_for } = health {
                if self.reported_stuck.insert(workspace.id) {
                    tracing::warn!(
                        workspace = %workspace.id.short(),
                        branch = %workspace.branch,
                        ?idle_for,
                        "workspace appears stuck"
                    );
                }
            }
        }
    }

    async fn cleanup(&mut self) {
        match with_manager(&self.ctx.workspaces, |m| Ok(m.cleanup_all())).await {
            Ok(report) if !report.is_success() => {
                tracing::warn!(failed = report.failed_count(), "periodic cleanup incomplete")
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("periodic cleanup failed: {}", e),
        }
    }

    fn publish(&self) {
        let summary = self.ctx.scheduler.summary();
        let active = self.ctx.pool.active_count();
        self.ctx.status.send_modify(|status| {
            status.update_progress(active, summary.completed, summary.failed)
        });
    }

    fn summary(&self) -> ExecutionSummary {
        let groups = self
            .ctx
            .scheduler
            .entries()
            .iter()
            .map(|entry| {
                let attempt = self.attempts.get(&entry.id());
                GroupReport {
                    group_id: entry.id(),
                    label: entry.group.label(),
                    level: entry.level(),
                    capability: entry.group.capability,
                    tasks: entry.group.task_ids(),
                    status: entry.status,
                    retries: entry.retry_count,
                    error: entry.last_error.clone(),
                    summary: attempt.map(|a| a.summary.clone()).unwrap_or_default(),
                    artifacts: attempt.map(|a| a.artifacts.clone()).unwrap_or_default(),
                    branch: attempt.and_then(|a| a.branch.clone()),
                    elapsed_ms: attempt.map(|a| a.elapsed.as_millis() as u64).unwrap_or(0),
                }
            })
            .collect();
        ExecutionSummary {
            groups,
            schedule: self.ctx.scheduler.summary(),
            cancelled: self.cancelled,
        }
    }
}
