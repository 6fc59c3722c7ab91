//! The feedback loop state machine.
//!
//! Each iteration scores a metrics snapshot against the goal and then
//! decides, in this order:
//!
//! 1. all criteria met: `converged`
//! 2. a full window with variance under the threshold, goal unmet: the loop
//!    has plateaued, `escalated`
//! 3. a sustained negative trend: `diverged`, escalated
//! 4. the iteration ceiling reached: `max_iterations_reached`, escalated
//! 5. otherwise keep `running`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::goal::{Evaluation, Gap, Goal, MetricsSnapshot};
use crate::core::grouper::TaskGroup;
use crate::core::id::{LoopId, WorkItemId};
use crate::escalation::{EscalationContext, EscalationManager, Severity};
use crate::feedback::convergence::{ConvergenceMetrics, LoopConfig};
use crate::feedback::metrics::MetricsCollector;
use crate::orchestration::Executor;
use crate::util::{Clock, SystemClock};
use crate::workspace::Workspace;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Running,
    Converged,
    Diverged,
    /// Plateaued below the goal.
    Escalated,
    MaxIterationsReached,
}

impl LoopState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, LoopState::Running)
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoopState::Running => write!(f, "running"),
            LoopState::Converged => write!(f, "converged"),
            LoopState::Diverged => write!(f, "diverged"),
            LoopState::Escalated => write!(f, "escalated"),
            LoopState::MaxIterationsReached => write!(f, "max_iterations_reached"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based.
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    pub metrics: MetricsSnapshot,
    pub score: f64,
    /// Change from the previous iteration; `None` on the first.
    pub score_delta: Option<f64>,
    pub goal_achieved: bool,
    pub gaps: Vec<Gap>,
    pub convergence: ConvergenceMetrics,
    /// Loop state after this iteration.
    pub state: LoopState,
}

/// One goal-driven loop and its history.
#[derive(Debug, Clone)]
pub struct FeedbackLoop {
    pub id: LoopId,
    pub goal: Goal,
    pub state: LoopState,
    pub history: Vec<IterationRecord>,
    pub started_at: DateTime<Utc>,
}

impl FeedbackLoop {
    pub fn scores(&self) -> Vec<f64> {
        self.history.iter().map(|r| r.score).collect()
    }

    pub fn last(&self) -> Option<&IterationRecord> {
        self.history.last()
    }

    pub fn iterations(&self) -> u32 {
        self.history.len() as u32
    }
}

pub struct FeedbackLoopController {
    config: LoopConfig,
    loops: HashMap<LoopId, FeedbackLoop>,
    escalations: Arc<EscalationManager>,
    clock: Arc<dyn Clock>,
    work_item: Option<WorkItemId>,
    refinement_timeout: Option<Duration>,
}

impl FeedbackLoopController {
    pub fn new(config: LoopConfig, escalations: Arc<EscalationManager>) -> Self {
        Self {
            config,
            loops: HashMap::new(),
            escalations,
            clock: Arc::new(SystemClock),
            work_item: None,
            refinement_timeout: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Tag escalations with the work item being validated.
    pub fn with_work_item(mut self, work_item: WorkItemId) -> Self {
        self.work_item = Some(work_item);
        self
    }

    /// Deadline for each refinement run in [`run`](Self::run).
    pub fn with_refinement_timeout(mut self, timeout: Duration) -> Self {
        self.refinement_timeout = Some(timeout);
        self
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn start_loop(&mut self, goal: Goal) -> LoopId {
        let id = LoopId::new();
        tracing::info!(loop_id = %id.short(), criteria = goal.criteria.len(), "feedback loop started");
        self.loops.insert(
            id,
            FeedbackLoop {
                id,
                goal,
                state: LoopState::Running,
                history: Vec::new(),
                started_at: self.clock.now(),
            },
        );
        id
    }

    pub fn get(&self, id: &LoopId) -> Option<&FeedbackLoop> {
        self.loops.get(id)
    }

    pub fn state(&self, id: &LoopId) -> Option<LoopState> {
        self.loops.get(id).map(|l| l.state)
    }

    /// Score `metrics`, record the iteration and advance the loop state.
    pub async fn execute_iteration(
        &mut self,
        id: &LoopId,
        metrics: MetricsSnapshot,
    ) -> Result<IterationRecord> {
        let config = self.config;
        let now = self.clock.now();
        let feedback_loop = self
            .loops
            .get_mut(id)
            .ok_or_else(|| Error::LoopNotFound(id.to_string()))?;
        if feedback_loop.state.is_terminal() {
            return Err(Error::LoopTerminated {
                id: id.to_string(),
                state: feedback_loop.state.to_string(),
            });
        }

        let evaluation = feedback_loop.goal.evaluate(&metrics);
        let iteration = feedback_loop.iterations() + 1;
        let score_delta = feedback_loop.last().map(|r| evaluation.score - r.score);
        let mut scores = feedback_loop.scores();
        scores.push(evaluation.score);
        let convergence = ConvergenceMetrics::compute(&scores, &config);
        let state = decide(&evaluation, &convergence, iteration, &config);

        let record = IterationRecord {
            iteration,
            timestamp: now,
            metrics,
            score: evaluation.score,
            score_delta,
            goal_achieved: evaluation.goal_achieved,
            gaps: evaluation.gaps,
            convergence,
            state,
        };
        feedback_loop.history.push(record.clone());
        feedback_loop.state = state;

        tracing::info!(
            loop_id = %id.short(),
            iteration,
            score = record.score,
            variance = convergence.variance,
            state = %state,
            "feedback iteration"
        );

        if let Some((reason, severity)) = escalation_for(&record) {
            let context = EscalationContext::Loop {
                work_item: self.work_item,
                loop_id: *id,
                state: state.to_string(),
                iteration,
                score: record.score,
                gaps: record.gaps.iter().map(|g| g.to_string()).collect(),
            };
            self.escalations.escalate(context, &reason, severity).await;
        }
        Ok(record)
    }

    /// Drive a loop to a terminal state.
    ///
    /// Each round collects metrics from `workspace`, records an iteration
    /// and, while the loop keeps running, has `executor` work a refinement
    /// group built from the remaining gaps. A failed refinement is logged;
    /// the next measurement decides what happens.
    pub async fn run(
        &mut self,
        id: &LoopId,
        workspace: &Workspace,
        executor: &dyn Executor,
        collector: &dyn MetricsCollector,
        mut observe: impl FnMut(&IterationRecord) + Send,
    ) -> Result<LoopState> {
        loop {
            let metrics = collector.collect(workspace).await?;
            let record = self.execute_iteration(id, metrics).await?;
            observe(&record);
            if record.state.is_terminal() {
                return Ok(record.state);
            }

            let group = TaskGroup::refinement(0, &record.gaps);
            let result = match self.refinement_timeout {
                Some(deadline) => tokio::time::timeout(deadline, executor.execute(&group, workspace))
                    .await
                    .unwrap_or(Err(Error::TaskTimeout(deadline))),
                None => executor.execute(&group, workspace).await,
            };
            match result {
                Ok(outcome) if outcome.success => {
                    tracing::debug!(loop_id = %id.short(), "refinement finished: {}", outcome.summary)
                }
                Ok(outcome) => tracing::warn!(
                    loop_id = %id.short(),
                    "refinement reported failure: {}",
                    outcome.error.unwrap_or_default()
                ),
                Err(e) => tracing::warn!(loop_id = %id.short(), "refinement failed: {}", e),
            }
        }
    }
}

fn decide(
    evaluation: &Evaluation,
    convergence: &ConvergenceMetrics,
    iteration: u32,
    config: &LoopConfig,
) -> LoopState {
    if evaluation.goal_achieved {
        LoopState::Converged
    } else if convergence.is_converging {
        LoopState::Escalated
    } else if convergence.is_diverging {
        LoopState::Diverged
    } else if iteration >= config.max_iterations {
        LoopState::MaxIterationsReached
    } else {
        LoopState::Running
    }
}

fn escalation_for(record: &IterationRecord) -> Option<(String, Severity)> {
    match record.state {
        LoopState::Running | LoopState::Converged => None,
        LoopState::Escalated => Some((
            format!(
                "stagnant: score plateaued at {:.1} with {} unmet criteria",
                record.score,
                record.gaps.len()
            ),
            Severity::Medium,
        )),
        LoopState::Diverged => Some((
            format!(
                "diverged: score fell {} iterations in a row to {:.1}",
                record.convergence.negative_streak, record.score
            ),
            Severity::High,
        )),
        LoopState::MaxIterationsReached => Some((
            format!(
                "goal not met after {} iterations (score {:.1})",
                record.iteration, record.score
            ),
            Severity::Medium,
        )),
    }
}
