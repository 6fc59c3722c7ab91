//! Public entry point: submit a work item, watch it, cancel it.
//!
//! A submitted item runs as one pipeline task. The execution phase drives
//! every group to a terminal state through an [`ExecutionCoordinator`]. When
//! all groups completed and the goal is measurable, the validation phase
//! hands a workspace on the integration branch to the
//! [`FeedbackLoopController`] until the loop reaches a terminal state.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::dag::DependencyGraph;
use crate::core::grouper::{GroupingPlan, TaskGroup, TaskGrouper};
use crate::core::id::WorkItemId;
use crate::core::task::{Capability, WorkItem};
use crate::escalation::{EscalationContext, EscalationManager, Severity};
use crate::feedback::{FeedbackLoopController, IterationRecord, LoopState, MetricsCollector};
use crate::git::VersionControl;
use crate::orchestration::coordinator::{
    CoordinatorConfig, ExecutionCoordinator, OrchestrationContext,
};
use crate::orchestration::executor::ExecutorRegistry;
use crate::orchestration::health::HealthConfig;
use crate::orchestration::status::{
    OrchestrationReport, OrchestrationState, OrchestrationStatus,
};
use crate::util::{Clock, SystemClock};
use crate::workspace::{
    with_manager, SharedWorkspaces, WorkspaceConfig, WorkspaceManager, WorkspaceStatus,
};
use crate::{Error, Result};

pub struct Orchestrator {
    config: Config,
    registry: Arc<ExecutorRegistry>,
    vcs: Arc<dyn VersionControl>,
    collector: Option<Arc<dyn MetricsCollector>>,
    escalations: Arc<EscalationManager>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        registry: ExecutorRegistry,
        vcs: Arc<dyn VersionControl>,
        collector: Option<Arc<dyn MetricsCollector>>,
        escalations: Arc<EscalationManager>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            registry: Arc::new(registry),
            vcs,
            collector,
            escalations,
            clock: Arc::new(SystemClock),
            poll_interval: CoordinatorConfig::default().poll_interval,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Upper bound on how long the control loop sleeps between health checks.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn escalations(&self) -> &Arc<EscalationManager> {
        &self.escalations
    }

    /// Build the dependency graph and grouping for `item` without running it.
    pub fn plan(&self, item: &WorkItem) -> Result<(DependencyGraph, GroupingPlan)> {
        let graph = DependencyGraph::from_nodes(item.plan())?;
        let plan = TaskGrouper::new(self.config.grouping)?.group(&graph);
        Ok((graph, plan))
    }

    /// Validate `item` and start orchestrating it.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `DependencyCycle` or `UnknownTask` for a malformed plan,
    /// `UnknownCapability` when a group has no registered executor.
    pub fn submit(&self, item: WorkItem) -> Result<OrchestrationHandle> {
        let (_, plan) = self.plan(&item)?;
        self.registry.validate(&plan.groups)?;
        let collector = self
            .collector
            .clone()
            .filter(|_| item.goal.is_measurable());
        if collector.is_some() && !self.registry.contains(Capability::Codegen) {
            return Err(Error::UnknownCapability(Capability::Codegen));
        }

        let short = item.id.short();
        let integration_branch = format!("{}/integration/{}", self.config.branch_prefix, short);
        let mut ws_config = WorkspaceConfig::new(self.config.workspace_root().join(&short));
        ws_config.branch_prefix = self.config.branch_prefix.clone();
        ws_config.base_ref = self.config.base_ref.clone();
        ws_config.integration_branch = Some(integration_branch.clone());
        ws_config.cleanup = self.config.cleanup;
        ws_config.push = self.config.push;
        let manager = WorkspaceManager::new(self.vcs.clone(), ws_config, item.goal.clone())
            .with_clock(self.clock.clone());

        let coordinator = CoordinatorConfig {
            max_concurrency: self.config.max_concurrency,
            group_timeout: self.config.group_timeout(),
            keep_failed: self.config.cleanup.keep_failed,
            poll_interval: self.poll_interval,
            health: HealthConfig::with_stuck_threshold(
                self.config.group_timeout() / 2,
            ),
            ..Default::default()
        };

        let (status_tx, status_rx) = watch::channel(OrchestrationStatus::new(item.id, plan.len()));
        let cancel = CancellationToken::new();
        tracing::info!(
            work_item = %short,
            title = %item.title,
            groups = plan.len(),
            levels = plan.level_count(),
            optimal_concurrency = plan.optimal_concurrency,
            "work item submitted"
        );

        let work_item = item.id;
        let pipeline = Pipeline {
            item,
            plan,
            integration_branch,
            workspaces: Arc::new(Mutex::new(manager)),
            coordinator,
            config: self.config.clone(),
            registry: self.registry.clone(),
            collector,
            escalations: self.escalations.clone(),
            clock: self.clock.clone(),
            status: status_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(pipeline.run());

        Ok(OrchestrationHandle {
            work_item,
            status: status_rx,
            cancel,
            task,
        })
    }

    pub fn status(&self, handle: &OrchestrationHandle) -> OrchestrationStatus {
        handle.status()
    }

    pub fn cancel(&self, handle: &OrchestrationHandle) {
        handle.cancel();
    }
}

/// A running orchestration.
pub struct OrchestrationHandle {
    work_item: WorkItemId,
    status: watch::Receiver<OrchestrationStatus>,
    cancel: CancellationToken,
    task: JoinHandle<Result<OrchestrationReport>>,
}

impl OrchestrationHandle {
    pub fn work_item(&self) -> WorkItemId {
        self.work_item
    }

    /// Latest published status.
    pub fn status(&self) -> OrchestrationStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestrationStatus> {
        self.status.clone()
    }

    /// Stop dispatching; in-flight groups finish and workspaces are torn down.
    pub fn cancel(&self) {
        tracing::info!(work_item = %self.work_item.short(), "cancel requested");
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the pipeline to finish and return its report.
    pub async fn wait(self) -> Result<OrchestrationReport> {
        self.task
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }
}

struct Pipeline {
    item: WorkItem,
    plan: GroupingPlan,
    integration_branch: String,
    workspaces: SharedWorkspaces,
    coordinator: CoordinatorConfig,
    config: Config,
    registry: Arc<ExecutorRegistry>,
    collector: Option<Arc<dyn MetricsCollector>>,
    escalations: Arc<EscalationManager>,
    clock: Arc<dyn Clock>,
    status: watch::Sender<OrchestrationStatus>,
    cancel: CancellationToken,
}

impl Pipeline {
    async fn run(self) -> Result<OrchestrationReport> {
        let started_at = self.clock.now();
        self.set_state(OrchestrationState::Executing);

        let ctx = OrchestrationContext::new(
            self.item.id,
            self.plan.groups.clone(),
            self.config.retry,
            self.workspaces.clone(),
            &self.coordinator,
            self.status.clone(),
            self.cancel.clone(),
        );
        let execution = ExecutionCoordinator::new(
            ctx,
            self.registry.clone(),
            self.escalations.clone(),
            self.coordinator.clone(),
        )
        .with_clock(self.clock.clone())
        .run()
        .await?;

        let mut iterations = Vec::new();
        let mut loop_state = None;
        let state = if execution.cancelled {
            OrchestrationState::Cancelled
        } else if !execution.all_completed() {
            OrchestrationState::Failed
        } else if let Some(collector) = self.collector.clone() {
            self.set_state(OrchestrationState::Validating);
            match self.validate(collector.as_ref(), &mut iterations).await {
                Ok(Some(LoopState::Converged)) => {
                    loop_state = Some(LoopState::Converged);
                    OrchestrationState::Completed
                }
                Ok(Some(other)) => {
                    loop_state = Some(other);
                    OrchestrationState::Escalated
                }
                Ok(None) => OrchestrationState::Cancelled,
                Err(e) => {
                    tracing::error!(work_item = %self.item.id.short(), "validation failed: {}", e);
                    let context = EscalationContext::Orchestration {
                        work_item: self.item.id,
                        title: self.item.title.clone(),
                        state: OrchestrationState::Failed.to_string(),
                    };
                    self.escalations
                        .escalate(context, &format!("validation failed: {}", e), Severity::High)
                        .await;
                    OrchestrationState::Failed
                }
            }
        } else {
            OrchestrationState::Completed
        };
        self.set_state(state);
        tracing::info!(work_item = %self.item.id.short(), %state, "orchestration finished");

        Ok(OrchestrationReport {
            work_item: self.item.id,
            title: self.item.title.clone(),
            state,
            integration_branch: self.integration_branch.clone(),
            started_at,
            finished_at: self.clock.now(),
            levels: self.plan.level_count(),
            groups: execution.groups,
            iterations,
            loop_state,
            escalations: self.escalations.history_for(&self.item.id).await,
        })
    }

    /// Run the feedback loop on a workspace holding the merged result.
    /// `Ok(None)` means it was cancelled.
    async fn validate(
        &self,
        collector: &dyn MetricsCollector,
        iterations: &mut Vec<IterationRecord>,
    ) -> Result<Option<LoopState>> {
        let executor = self.registry.resolve(Capability::Codegen)?;
        let group = TaskGroup::refinement(self.plan.level_count(), &[]);
        let workspace = with_manager(&self.workspaces, move |m| m.create_workspace(&group)).await?;

        let mut controller =
            FeedbackLoopController::new(self.config.feedback, self.escalations.clone())
                .with_work_item(self.item.id)
                .with_refinement_timeout(self.coordinator.group_timeout)
                .with_clock(self.clock.clone());
        let loop_id = controller.start_loop(self.item.goal.clone());
        tracing::info!(
            work_item = %self.item.id.short(),
            loop_id = %loop_id.short(),
            workspace = %workspace.id.short(),
            "validation started"
        );

        let status = &self.status;
        let observe = |record: &IterationRecord| {
            status.send_modify(|s| {
                s.iteration = record.iteration;
                s.loop_state = Some(record.state);
                s.last_score = Some(record.score);
            });
        };
        let outcome = tokio::select! {
            result = controller.run(&loop_id, &workspace, executor.as_ref(), collector, observe) => Some(result),
            _ = self.cancel.cancelled() => None,
        };
        if let Some(feedback_loop) = controller.get(&loop_id) {
            iterations.extend(feedback_loop.history.iter().cloned());
        }
        let result = match outcome {
            Some(result) => result.map(Some),
            None => Ok(None),
        };

        let converged = matches!(result, Ok(Some(LoopState::Converged)));
        let id = workspace.id;
        let message = format!("conductor: validation refinements for {}", self.item.title);
        let settled = with_manager(&self.workspaces, move |m| {
            if converged {
                m.finalize(&id, &message)?;
                m.mark(&id, WorkspaceStatus::Completed)?;
            } else {
                m.mark(&id, WorkspaceStatus::Failed)?;
            }
            m.remove_workspace(&id)
        })
        .await;
        if let Err(e) = settled {
            tracing::warn!(workspace = %id.short(), "settling validation workspace failed: {}", e);
        }
        result
    }

    fn set_state(&self, state: OrchestrationState) {
        self.status.send_modify(|s| s.state = state);
    }
}
