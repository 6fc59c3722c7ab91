//! Parallel execution correctness.
//!
//! The pool must never run more than `max_concurrency` groups, and no group
//! may start before every group on a lower level has finished.

use std::sync::Arc;
use std::time::Duration;

use conductor::core::{Capability, TaskNode};
use conductor::orchestration::{OrchestrationState, Orchestrator};
use tempfile::TempDir;

use crate::fixtures::*;

fn orchestrator(root: &TempDir, max_concurrency: usize, executor: &Arc<ScriptedExecutor>) -> Orchestrator {
    Orchestrator::new(
        test_config(root.path(), max_concurrency),
        registry_of(&[executor.clone()]),
        MemoryVcs::new(),
        None,
        escalations(&RecordingChannel::new()),
    )
    .unwrap()
    .with_poll_interval(Duration::from_millis(50))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrency_limit_is_never_exceeded() {
    let root = TempDir::new().unwrap();
    let executor = Arc::new(
        ScriptedExecutor::new(Capability::Codegen).with_delay(Duration::from_millis(150)),
    );
    let report = orchestrator(&root, 3, &executor)
        .submit(work_item("Wide", independent_tasks(8)))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.state, OrchestrationState::Completed);
    assert_eq!(executor.attempts(), 8);
    assert!(executor.peak() <= 3, "peak concurrency {}", executor.peak());
    assert!(executor.peak() >= 2, "groups never overlapped");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_slot_runs_groups_one_at_a_time() {
    let root = TempDir::new().unwrap();
    let executor = Arc::new(
        ScriptedExecutor::new(Capability::Codegen).with_delay(Duration::from_millis(20)),
    );
    orchestrator(&root, 1, &executor)
        .submit(work_item("Narrow", independent_tasks(4)))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(executor.peak(), 1);
    let calls = executor.calls();
    for pair in calls.windows(2) {
        assert!(pair[0].finished <= pair[1].started);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_level_barrier_holds() {
    let root = TempDir::new().unwrap();
    let executor = Arc::new(
        ScriptedExecutor::new(Capability::Codegen).with_delay(Duration::from_millis(30)),
    );
    // one slow root plus an unrelated fast task at level 0, dependents at level 1
    let tasks = vec![
        TaskNode::new("slow", "Slow root", Capability::Codegen).with_estimate(600),
        TaskNode::new("fast", "Fast root", Capability::Codegen).with_estimate(10),
        TaskNode::new("after-slow", "After slow", Capability::Codegen).depends_on("slow"),
        TaskNode::new("after-fast", "After fast", Capability::Codegen).depends_on("fast"),
    ];
    let report = orchestrator(&root, 4, &executor)
        .submit(work_item("Barrier", tasks))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(report.state, OrchestrationState::Completed);

    let calls = executor.calls();
    let last_level0_finish = calls
        .iter()
        .filter(|c| c.level == 0)
        .map(|c| c.finished)
        .max()
        .unwrap();
    let first_level1_start = calls
        .iter()
        .filter(|c| c.level == 1)
        .map(|c| c.started)
        .min()
        .unwrap();
    assert!(last_level0_finish <= first_level1_start);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_status_reports_progress() {
    let root = TempDir::new().unwrap();
    let executor = Arc::new(
        ScriptedExecutor::new(Capability::Codegen).with_delay(Duration::from_millis(20)),
    );
    let handle = orchestrator(&root, 2, &executor)
        .submit(work_item("Progress", chain(3)))
        .unwrap();
    assert_eq!(handle.status().total_groups, 3);

    let mut status = handle.subscribe();
    let mut seen_partial = false;
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        if current.progress > 0.0 && current.progress < 1.0 {
            seen_partial = true;
        }
        if current.state.is_terminal() {
            break;
        }
    }
    let report = handle.wait().await.unwrap();

    assert!(seen_partial);
    assert_eq!(report.state, OrchestrationState::Completed);
}
