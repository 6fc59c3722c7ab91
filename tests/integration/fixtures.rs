//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - An in-memory version control fake
//! - Scripted executors, metrics collectors and notification channels
//! - Predefined task sets

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;

use conductor::config::Config;
use conductor::core::{Capability, GroupingConfig, MetricsSnapshot, TaskGroup, TaskNode, WorkItem};
use conductor::escalation::{Escalation, EscalationConfig, EscalationManager, NotificationChannel};
use conductor::feedback::{LoopConfig, MetricsCollector};
use conductor::git::{MergeOutcome, VersionControl};
use conductor::orchestration::{ExecutionOutcome, Executor, ExecutorRegistry, RetryPolicy};
use conductor::workspace::Workspace;
use conductor::{Error, Result};

// ========== Repositories ==========

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();

        for args in [
            vec!["init"],
            vec!["config", "user.email", "test@test.com"],
            vec!["config", "user.name", "Test User"],
        ] {
            git(&path, &args);
        }

        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    /// Contents of `file` at the tip of `branch`, if present.
    pub fn file_on_branch(&self, branch: &str, file: &str) -> Option<String> {
        let repo = git2::Repository::open(&self.path).ok()?;
        let tree = repo
            .find_branch(branch, git2::BranchType::Local)
            .ok()?
            .into_reference()
            .peel_to_tree()
            .ok()?;
        let entry = tree.get_path(Path::new(file)).ok()?;
        let blob = repo.find_blob(entry.id()).ok()?;
        Some(String::from_utf8_lossy(blob.content()).to_string())
    }

    pub fn branches(&self) -> Vec<String> {
        let repo = git2::Repository::open(&self.path).expect("Failed to open repo");
        let branches = repo
            .branches(Some(git2::BranchType::Local))
            .expect("Failed to list branches");
        branches
            .flatten()
            .filter_map(|(b, _)| b.name().ok().flatten().map(String::from))
            .collect()
    }

    /// Current branch of the main checkout.
    pub fn head_branch(&self) -> String {
        let repo = git2::Repository::open(&self.path).expect("Failed to open repo");
        let head = repo.head().expect("Failed to read HEAD");
        head.shorthand().unwrap_or_default().to_string()
    }
}

fn git(path: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(path)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

// ========== In-memory version control ==========

/// Version control fake: worktrees are plain directories, branches a set.
#[derive(Default)]
pub struct MemoryVcs {
    branches: Mutex<HashSet<String>>,
    merges: Mutex<Vec<(String, String)>>,
    removed: Mutex<Vec<PathBuf>>,
    /// Merging a branch whose name contains one of these conflicts.
    conflicting: Mutex<Vec<String>>,
}

impl MemoryVcs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn conflict_on(&self, fragment: &str) {
        self.conflicting.lock().unwrap().push(fragment.to_string());
    }

    pub fn merges(&self) -> Vec<(String, String)> {
        self.merges.lock().unwrap().clone()
    }

    pub fn branches(&self) -> HashSet<String> {
        self.branches.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.removed.lock().unwrap().clone()
    }
}

impl VersionControl for MemoryVcs {
    fn create_branch(&self, name: &str, _base: Option<&str>) -> Result<()> {
        self.branches.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    fn branch_exists(&self, name: &str) -> Result<bool> {
        Ok(self.branches.lock().unwrap().contains(name))
    }

    fn create_worktree(&self, branch: &str, path: &Path, _base: Option<&str>) -> Result<()> {
        std::fs::create_dir_all(path)?;
        self.branches.lock().unwrap().insert(branch.to_string());
        Ok(())
    }

    fn is_dirty(&self, _path: &Path) -> Result<bool> {
        Ok(false)
    }

    fn commit_all(&self, _path: &Path, _message: &str) -> Result<()> {
        Ok(())
    }

    fn remove_worktree(&self, path: &Path) -> Result<()> {
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        self.removed.lock().unwrap().push(path.to_path_buf());
        Ok(())
    }

    fn delete_branch(&self, name: &str) -> Result<()> {
        self.branches.lock().unwrap().remove(name);
        Ok(())
    }

    fn push(&self, _path: &Path, _branch: &str) -> Result<()> {
        Ok(())
    }

    fn merge(&self, branch: &str, target: &str) -> Result<MergeOutcome> {
        if self
            .conflicting
            .lock()
            .unwrap()
            .iter()
            .any(|f| branch.contains(f.as_str()))
        {
            return Err(Error::MergeConflict {
                branch: branch.to_string(),
                target: target.to_string(),
                files: vec![PathBuf::from("src/lib.rs")],
            });
        }
        self.merges
            .lock()
            .unwrap()
            .push((branch.to_string(), target.to_string()));
        Ok(MergeOutcome::Merged {
            commit: format!("{:040}", self.merges.lock().unwrap().len()),
        })
    }
}

// ========== Executors ==========

/// One recorded executor call.
#[derive(Debug, Clone)]
pub struct Call {
    pub label: String,
    pub level: usize,
    pub tasks: Vec<String>,
    pub started: Instant,
    pub finished: Instant,
}

/// Executor whose behavior is configured up front and which records
/// every call, including how many ran at once.
pub struct ScriptedExecutor {
    capability: Capability,
    delay: Duration,
    /// Calls that fail before the executor starts succeeding.
    fail_first: usize,
    /// Fail every call for groups containing this task.
    always_fail_task: Option<String>,
    /// Write `<task id>.txt` into the workspace for each task.
    write_files: bool,
    calls: Mutex<Vec<Call>>,
    attempts: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(capability: Capability) -> Self {
        Self {
            capability,
            delay: Duration::from_millis(0),
            fail_first: 0,
            always_fail_task: None,
            write_files: false,
            calls: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn always_failing(mut self, task: &str) -> Self {
        self.always_fail_task = Some(task.to_string());
        self
    }

    pub fn writing_files(mut self) -> Self {
        self.write_files = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, group: &TaskGroup, workspace: &Workspace) -> Result<ExecutionOutcome> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        let started = Instant::now();

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.write_files {
            for task in &group.tasks {
                std::fs::write(
                    workspace.path.join(format!("{}.txt", task.id)),
                    format!("{}\n", task.title),
                )?;
            }
        }

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call {
            label: group.label(),
            level: group.level,
            tasks: group.tasks.iter().map(|t| t.id.to_string()).collect(),
            started,
            finished: Instant::now(),
        });

        let doomed = self
            .always_fail_task
            .as_ref()
            .is_some_and(|t| group.tasks.iter().any(|task| task.id.as_str() == t));
        if doomed || attempt < self.fail_first {
            return Ok(ExecutionOutcome::failure("scripted failure"));
        }
        Ok(ExecutionOutcome::success(&format!("did {}", group.label())))
    }
}

// ========== Metrics ==========

/// Returns queued snapshots in order, repeating the last one.
pub struct ScriptedCollector {
    snapshots: Mutex<VecDeque<MetricsSnapshot>>,
    last: Mutex<Option<MetricsSnapshot>>,
    collected: AtomicUsize,
}

impl ScriptedCollector {
    /// One snapshot per value of `metric`.
    pub fn series(metric: &str, values: &[f64]) -> Arc<Self> {
        Arc::new(Self {
            snapshots: Mutex::new(
                values
                    .iter()
                    .map(|v| MetricsSnapshot::new().with(metric, *v))
                    .collect(),
            ),
            last: Mutex::new(None),
            collected: AtomicUsize::new(0),
        })
    }

    pub fn collected(&self) -> usize {
        self.collected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsCollector for ScriptedCollector {
    async fn collect(&self, _workspace: &Workspace) -> Result<MetricsSnapshot> {
        self.collected.fetch_add(1, Ordering::SeqCst);
        let next = self.snapshots.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(snapshot) = next {
            *last = Some(snapshot);
        }
        last.clone()
            .ok_or_else(|| Error::Validation("no metrics scripted".to_string()))
    }
}

// ========== Escalations ==========

#[derive(Default)]
pub struct RecordingChannel {
    received: Mutex<Vec<Escalation>>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<Escalation> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationChannel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, escalation: &Escalation) -> Result<()> {
        self.received.lock().unwrap().push(escalation.clone());
        Ok(())
    }
}

pub fn escalations(channel: &Arc<RecordingChannel>) -> Arc<EscalationManager> {
    Arc::new(EscalationManager::new(EscalationConfig::default()).with_channel(channel.clone()))
}

// ========== Configuration and task sets ==========

/// Config with workspaces under `root`, fast retries and one task per group.
pub fn test_config(root: &Path, max_concurrency: usize) -> Config {
    Config {
        max_concurrency,
        group_timeout_secs: 30,
        workspace_dir: root.to_string_lossy().to_string(),
        grouping: GroupingConfig {
            min_group_size: 1,
            max_group_size: 1,
            max_concurrent_groups: 8,
        },
        retry: RetryPolicy {
            max_retries: 2,
            base_delay_ms: 5,
            max_delay_ms: 20,
        },
        feedback: LoopConfig::default(),
        ..Default::default()
    }
}

pub fn registry_of(executors: &[Arc<ScriptedExecutor>]) -> ExecutorRegistry {
    executors
        .iter()
        .fold(ExecutorRegistry::new(), |registry, executor| {
            registry.register(executor.clone())
        })
}

/// `count` independent codegen tasks.
pub fn independent_tasks(count: usize) -> Vec<TaskNode> {
    (0..count)
        .map(|i| TaskNode::new(format!("task-{}", i).as_str(), &format!("Task {}", i), Capability::Codegen))
        .collect()
}

/// A straight chain `step-0 -> step-1 -> ...` of codegen tasks.
pub fn chain(count: usize) -> Vec<TaskNode> {
    (0..count)
        .map(|i| {
            let node = TaskNode::new(format!("step-{}", i).as_str(), &format!("Step {}", i), Capability::Codegen);
            if i == 0 {
                node
            } else {
                node.depends_on(format!("step-{}", i - 1).as_str())
            }
        })
        .collect()
}

/// Diamond: `schema` -> {`api`, `migrations`} -> `integration`.
pub fn diamond() -> Vec<TaskNode> {
    vec![
        TaskNode::new("schema", "Define schema", Capability::Codegen),
        TaskNode::new("api", "Build API", Capability::Codegen).depends_on("schema"),
        TaskNode::new("migrations", "Write migrations", Capability::Codegen).depends_on("schema"),
        TaskNode::new("integration", "Wire together", Capability::Codegen)
            .depends_on("api")
            .depends_on("migrations"),
    ]
}

pub fn work_item(title: &str, tasks: Vec<TaskNode>) -> WorkItem {
    WorkItem::new(title, "integration test").with_tasks(tasks)
}
