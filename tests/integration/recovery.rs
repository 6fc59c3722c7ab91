//! Failure handling: retries with backoff, timeouts, terminal failures and
//! the escalations they raise.

use std::sync::Arc;
use std::time::Duration;

use conductor::core::{Capability, TaskNode};
use conductor::escalation::Severity;
use conductor::orchestration::{EntryStatus, OrchestrationState, Orchestrator};
use tempfile::TempDir;

use crate::fixtures::*;

struct Run {
    _root: TempDir,
    channel: Arc<RecordingChannel>,
    orchestrator: Orchestrator,
}

fn setup(executor: &Arc<ScriptedExecutor>, vcs: Arc<MemoryVcs>, tweak: impl FnOnce(&mut conductor::config::Config)) -> Run {
    let root = TempDir::new().unwrap();
    let mut config = test_config(root.path(), 2);
    tweak(&mut config);
    let channel = RecordingChannel::new();
    let orchestrator = Orchestrator::new(
        config,
        registry_of(&[executor.clone()]),
        vcs,
        None,
        escalations(&channel),
    )
    .unwrap()
    .with_poll_interval(Duration::from_millis(50));
    Run {
        _root: root,
        channel,
        orchestrator,
    }
}

// ========== Retries ==========

#[tokio::test]
async fn test_transient_failures_are_retried_to_success() {
    let executor = Arc::new(ScriptedExecutor::new(Capability::Codegen).failing_first(2));
    let run = setup(&executor, MemoryVcs::new(), |_| {});

    let report = run
        .orchestrator
        .submit(work_item("Flaky", independent_tasks(1)))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.state, OrchestrationState::Completed);
    assert_eq!(executor.attempts(), 3);
    assert_eq!(report.groups[0].retries, 2);
    assert!(run.channel.received().is_empty());
}

#[tokio::test]
async fn test_exhausted_retries_fail_and_escalate() {
    let executor = Arc::new(ScriptedExecutor::new(Capability::Codegen).always_failing("task-0"));
    let run = setup(&executor, MemoryVcs::new(), |c| c.retry.max_retries = 1);

    let report = run
        .orchestrator
        .submit(work_item("Broken", independent_tasks(2)))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.state, OrchestrationState::Failed);
    assert_eq!(report.completed_groups(), 1);
    assert_eq!(report.failed_groups(), 1);

    let failed = report
        .groups
        .iter()
        .find(|g| g.status == EntryStatus::Failed)
        .unwrap();
    assert_eq!(failed.retries, 1);
    assert!(failed.error.as_deref().unwrap().contains("scripted failure"));

    let received = run.channel.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].severity, Severity::High);
    assert_eq!(received[0].context["kind"], "schedule");
    assert_eq!(received[0].context["retry_count"], "1");
    assert_eq!(report.escalations.len(), 1);
}

#[tokio::test]
async fn test_failed_group_blocks_its_dependents() {
    let executor = Arc::new(ScriptedExecutor::new(Capability::Codegen).always_failing("step-0"));
    let run = setup(&executor, MemoryVcs::new(), |c| c.retry.max_retries = 0);

    let report = run
        .orchestrator
        .submit(work_item("Chain", chain(3)))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.state, OrchestrationState::Failed);
    assert_eq!(report.failed_groups(), 3);
    assert_eq!(executor.attempts(), 1);
    let received = run.channel.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].severity, Severity::Critical);
    assert_eq!(received[0].context["blocked_groups"], "2");
}

// ========== Non-retryable failures ==========

#[tokio::test]
async fn test_merge_conflict_is_not_retried() {
    let executor = Arc::new(ScriptedExecutor::new(Capability::Codegen));
    let vcs = MemoryVcs::new();
    // every workspace branch lives under the prefix
    vcs.conflict_on("conductor/");
    let run = setup(&executor, vcs.clone(), |c| c.retry.max_retries = 3);

    let report = run
        .orchestrator
        .submit(work_item("Conflicted", independent_tasks(1)))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(report.state, OrchestrationState::Failed);
    assert_eq!(executor.attempts(), 1);
    assert!(report.groups[0]
        .error
        .as_deref()
        .unwrap()
        .contains("Merge conflict"));
    assert!(vcs.merges().is_empty());
}

// ========== Timeouts ==========

#[tokio::test]
async fn test_group_timeout_counts_as_failure() {
    let executor = Arc::new(
        ScriptedExecutor::new(Capability::Codegen).with_delay(Duration::from_secs(10)),
    );
    let run = setup(&executor, MemoryVcs::new(), |c| {
        c.group_timeout_secs = 1;
        c.retry.max_retries = 0;
    });

    let started = std::time::Instant::now();
    let report = run
        .orchestrator
        .submit(work_item("Slow", vec![TaskNode::new("slow", "Slow", Capability::Codegen)]))
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(8));
    assert_eq!(report.state, OrchestrationState::Failed);
    assert!(report.groups[0]
        .error
        .as_deref()
        .unwrap()
        .contains("timed out"));
}
