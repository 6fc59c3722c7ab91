//! Cancellation: no new dispatches, in-flight groups drain, workspaces are
//! torn down and the orchestration ends `cancelled`.

use std::sync::Arc;
use std::time::Duration;

use conductor::core::Capability;
use conductor::orchestration::{EntryStatus, OrchestrationState, Orchestrator};
use tempfile::TempDir;

use crate::fixtures::*;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_drains_and_tears_down() {
    let root = TempDir::new().unwrap();
    let vcs = MemoryVcs::new();
    let executor = Arc::new(
        ScriptedExecutor::new(Capability::Codegen).with_delay(Duration::from_millis(200)),
    );
    let mut config = test_config(root.path(), 1);
    config.cleanup.keep_failed = true;
    let orchestrator = Orchestrator::new(
        config,
        registry_of(&[executor.clone()]),
        vcs.clone(),
        None,
        escalations(&RecordingChannel::new()),
    )
    .unwrap()
    .with_poll_interval(Duration::from_millis(20));

    let handle = orchestrator.submit(work_item("Long chain", chain(5))).unwrap();
    let mut status = handle.subscribe();
    while status.changed().await.is_ok() {
        if status.borrow_and_update().active_groups == 1 {
            break;
        }
    }
    orchestrator.cancel(&handle);
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, OrchestrationState::Cancelled);
    // the group running at cancel time finished; nothing new started
    assert_eq!(executor.attempts(), 1);
    assert_eq!(report.completed_groups(), 1);
    let cancelled: Vec<_> = report
        .groups
        .iter()
        .filter(|g| g.status == EntryStatus::Failed)
        .collect();
    assert_eq!(cancelled.len(), 4);
    assert!(cancelled
        .iter()
        .all(|g| g.error.as_deref() == Some("cancelled")));

    // every workspace directory is gone
    let item_dir = root.path().join(report.work_item.short());
    let leftover = std::fs::read_dir(&item_dir)
        .map(|entries| entries.flatten().count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_during_validation() {
    let root = TempDir::new().unwrap();
    let executor = Arc::new(
        ScriptedExecutor::new(Capability::Codegen).with_delay(Duration::from_millis(100)),
    );
    // never reaches the goal and never plateaus within the time the test waits
    let collector: Arc<dyn conductor::feedback::MetricsCollector> =
        ScriptedCollector::series("coverage", &[10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0]);
    let orchestrator = Orchestrator::new(
        test_config(root.path(), 1),
        registry_of(&[executor.clone()]),
        MemoryVcs::new(),
        Some(collector),
        escalations(&RecordingChannel::new()),
    )
    .unwrap()
    .with_poll_interval(Duration::from_millis(20));

    let goal = conductor::core::Goal::new(vec![conductor::core::SuccessCriterion::at_least(
        "coverage", 90.0,
    )]);
    let handle = orchestrator
        .submit(work_item("Validate", independent_tasks(1)).with_goal(goal))
        .unwrap();

    let mut status = handle.subscribe();
    while status.changed().await.is_ok() {
        if status.borrow_and_update().state == OrchestrationState::Validating {
            break;
        }
    }
    handle.cancel();
    let report = handle.wait().await.unwrap();

    assert_eq!(report.state, OrchestrationState::Cancelled);
    assert!(report.loop_state.is_none());
    assert_eq!(report.completed_groups(), 1);
}

/// Cancels while one group is in flight and returns the final report.
async fn cancel_in_flight(
    executor: Arc<ScriptedExecutor>,
    tweak: impl FnOnce(&mut conductor::config::Config),
) -> (TempDir, conductor::orchestration::OrchestrationReport) {
    let root = TempDir::new().unwrap();
    let mut config = test_config(root.path(), 1);
    config.retry.max_retries = 3;
    config.cleanup.keep_failed = true;
    tweak(&mut config);
    let orchestrator = Orchestrator::new(
        config,
        registry_of(&[executor]),
        MemoryVcs::new(),
        None,
        escalations(&RecordingChannel::new()),
    )
    .unwrap()
    .with_poll_interval(Duration::from_millis(20));

    let handle = orchestrator
        .submit(work_item("Doomed", independent_tasks(1)))
        .unwrap();
    let mut status = handle.subscribe();
    while status.changed().await.is_ok() {
        if status.borrow_and_update().active_groups == 1 {
            break;
        }
    }
    handle.cancel();
    let report = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .expect("orchestration did not finish after cancel")
        .unwrap();
    (root, report)
}

fn assert_torn_down(root: &TempDir, report: &conductor::orchestration::OrchestrationReport) {
    let item_dir = root.path().join(report.work_item.short());
    let leftover = std::fs::read_dir(&item_dir)
        .map(|entries| entries.flatten().count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_flight_failure_after_cancel_is_not_retried() {
    let executor = Arc::new(
        ScriptedExecutor::new(Capability::Codegen)
            .with_delay(Duration::from_millis(200))
            .always_failing("task-0"),
    );
    let (root, report) = cancel_in_flight(executor.clone(), |_| {}).await;

    assert_eq!(report.state, OrchestrationState::Cancelled);
    assert_eq!(executor.attempts(), 1);
    assert_eq!(report.groups[0].status, EntryStatus::Failed);
    assert_eq!(report.groups[0].error.as_deref(), Some("cancelled"));
    assert_torn_down(&root, &report);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_in_flight_timeout_after_cancel_is_not_retried() {
    let executor = Arc::new(
        ScriptedExecutor::new(Capability::Codegen).with_delay(Duration::from_secs(10)),
    );
    let (root, report) = cancel_in_flight(executor.clone(), |c| c.group_timeout_secs = 1).await;

    assert_eq!(report.state, OrchestrationState::Cancelled);
    assert_eq!(executor.attempts(), 1);
    assert_eq!(report.groups[0].status, EntryStatus::Failed);
    assert_torn_down(&root, &report);
}
