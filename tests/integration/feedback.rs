//! Validation phase: the feedback loop run after all groups complete.

use std::sync::Arc;
use std::time::Duration;

use conductor::core::{Capability, Goal, SuccessCriterion};
use conductor::escalation::Severity;
use conductor::feedback::{LoopState, MetricsCollector};
use conductor::orchestration::{OrchestrationState, Orchestrator};
use conductor::Error;
use tempfile::TempDir;

use crate::fixtures::*;

struct Validation {
    _root: TempDir,
    executor: Arc<ScriptedExecutor>,
    channel: Arc<RecordingChannel>,
    orchestrator: Orchestrator,
}

fn setup(collector: Arc<ScriptedCollector>) -> Validation {
    let root = TempDir::new().unwrap();
    let executor = Arc::new(ScriptedExecutor::new(Capability::Codegen));
    let channel = RecordingChannel::new();
    let collector: Arc<dyn MetricsCollector> = collector;
    let orchestrator = Orchestrator::new(
        test_config(root.path(), 2),
        registry_of(&[executor.clone()]),
        MemoryVcs::new(),
        Some(collector),
        escalations(&channel),
    )
    .unwrap()
    .with_poll_interval(Duration::from_millis(50));
    Validation {
        _root: root,
        executor,
        channel,
        orchestrator,
    }
}

fn coverage_goal() -> Goal {
    Goal::new(vec![SuccessCriterion::at_least("coverage", 80.0)])
}

#[tokio::test]
async fn test_converging_goal_completes() {
    let collector = ScriptedCollector::series("coverage", &[50.0, 70.0, 85.0]);
    let v = setup(collector.clone());

    let item = work_item("Raise coverage", independent_tasks(2)).with_goal(coverage_goal());
    let report = v.orchestrator.submit(item).unwrap().wait().await.unwrap();

    assert_eq!(report.state, OrchestrationState::Completed);
    assert_eq!(report.loop_state, Some(LoopState::Converged));
    assert_eq!(report.iterations.len(), 3);
    assert!(report.iterations[2].goal_achieved);
    assert_eq!(collector.collected(), 3);
    // two groups plus one refinement after each unmet measurement
    assert_eq!(v.executor.attempts(), 4);
    assert!(v.channel.received().is_empty());
}

#[tokio::test]
async fn test_diverging_scores_escalate() {
    let collector = ScriptedCollector::series("coverage", &[60.0, 50.0, 40.0, 30.0]);
    let v = setup(collector);

    let item = work_item("Raise coverage", independent_tasks(1)).with_goal(coverage_goal());
    let report = v.orchestrator.submit(item).unwrap().wait().await.unwrap();

    assert_eq!(report.state, OrchestrationState::Escalated);
    assert_eq!(report.loop_state, Some(LoopState::Diverged));
    assert_eq!(report.iterations.len(), 4);

    let received = v.channel.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].severity, Severity::High);
    assert_eq!(received[0].context["kind"], "loop");
    assert_eq!(report.escalations.len(), 1);
}

#[tokio::test]
async fn test_plateau_escalates_as_stagnant() {
    let collector = ScriptedCollector::series("coverage", &[50.0]);
    let v = setup(collector);

    let item = work_item("Raise coverage", independent_tasks(1)).with_goal(coverage_goal());
    let report = v.orchestrator.submit(item).unwrap().wait().await.unwrap();

    assert_eq!(report.state, OrchestrationState::Escalated);
    assert_eq!(report.loop_state, Some(LoopState::Escalated));
    // a full window of identical scores
    assert_eq!(report.iterations.len(), 5);
    let received = v.channel.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].severity, Severity::Medium);
    assert!(received[0].reason.starts_with("stagnant"));
}

#[tokio::test]
async fn test_unmeasurable_goal_skips_validation() {
    let collector = ScriptedCollector::series("coverage", &[10.0]);
    let v = setup(collector.clone());

    let report = v
        .orchestrator
        .submit(work_item("No goal", independent_tasks(1)))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.state, OrchestrationState::Completed);
    assert!(report.loop_state.is_none());
    assert_eq!(collector.collected(), 0);
}

#[tokio::test]
async fn test_validation_requires_codegen_executor() {
    let root = TempDir::new().unwrap();
    let collector: Arc<dyn MetricsCollector> = ScriptedCollector::series("coverage", &[10.0]);
    let orchestrator = Orchestrator::new(
        test_config(root.path(), 1),
        registry_of(&[Arc::new(ScriptedExecutor::new(Capability::Test))]),
        MemoryVcs::new(),
        Some(collector),
        escalations(&RecordingChannel::new()),
    )
    .unwrap();

    let tasks = vec![conductor::core::TaskNode::new("t", "Tests", Capability::Test)];
    let item = work_item("Tests only", tasks).with_goal(coverage_goal());
    let err = orchestrator.submit(item).err().unwrap();
    assert!(matches!(err, Error::UnknownCapability(Capability::Codegen)));
}
