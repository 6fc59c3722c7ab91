//! Scheduler for task group dispatch.
//!
//! The TaskScheduler owns one [`ScheduleEntry`] per [`TaskGroup`] and is the
//! only place dependency ordering is enforced. Each entry moves through
//! `pending -> scheduled -> running -> {completed | failed}`; a retryable
//! failure sends it back to `scheduled` with an exponential backoff until
//! the retry ceiling is reached.
//!
//! The scheduler is plain synchronous state. It is owned and mutated by the
//! coordinator's control loop only; workers never touch it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::core::grouper::TaskGroup;
use crate::core::id::GroupId;
use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// Retry ceiling and backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry_count`: `base * 2^retry_count`, capped.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = 2u64.saturating_pow(retry_count);
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Lifecycle state of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    Scheduled,
    Running,
    Completed,
    Failed,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Completed | EntryStatus::Failed)
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryStatus::Pending => write!(f, "pending"),
            EntryStatus::Scheduled => write!(f, "scheduled"),
            EntryStatus::Running => write!(f, "running"),
            EntryStatus::Completed => write!(f, "completed"),
            EntryStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A task group plus its scheduler-owned state.
#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub group: TaskGroup,
    pub status: EntryStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    /// Set while waiting out a retry backoff.
    pub retry_at: Option<Instant>,
    seq: usize,
}

impl ScheduleEntry {
    pub fn id(&self) -> GroupId {
        self.group.id
    }

    pub fn level(&self) -> usize {
        self.group.level
    }

    fn is_dispatchable(&self, now: Instant) -> bool {
        match self.status {
            EntryStatus::Pending => true,
            EntryStatus::Scheduled => self.retry_at.is_some_and(|at| at <= now),
            _ => false,
        }
    }
}

/// Outcome reported for a finished group.
#[derive(Debug)]
pub enum GroupOutcome {
    Success,
    Failure(Error),
}

/// What the scheduler did with a reported outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Completed,
    /// Re-enqueued; eligible again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Terminal failure. `blocked` lists dependent groups failed along with it.
    Failed {
        error: String,
        retries_exhausted: bool,
        blocked: Vec<GroupId>,
    },
}

/// Counts of entries by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSummary {
    pub total: usize,
    pub pending: usize,
    pub scheduled: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
}

impl ScheduleSummary {
    pub fn terminal(&self) -> usize {
        self.completed + self.failed
    }
}

pub struct TaskScheduler {
    entries: Vec<ScheduleEntry>,
    index: HashMap<GroupId, usize>,
    /// Groups containing a dependent of a task in the key group.
    dependents: HashMap<GroupId, HashSet<GroupId>>,
    policy: RetryPolicy,
}

impl TaskScheduler {
    pub fn new(groups: Vec<TaskGroup>, policy: RetryPolicy) -> Self {
        let mut owner: HashMap<TaskId, GroupId> = HashMap::new();
        for group in &groups {
            for task in &group.tasks {
                owner.insert(task.id.clone(), group.id);
            }
        }

        let mut dependents: HashMap<GroupId, HashSet<GroupId>> = HashMap::new();
        for group in &groups {
            for task in &group.tasks {
                for dep in &task.depends_on {
                    if let Some(&prereq) = owner.get(dep) {
                        if prereq != group.id {
                            dependents.entry(prereq).or_default().insert(group.id);
                        }
                    }
                }
            }
        }

        let mut index = HashMap::with_capacity(groups.len());
        let entries = groups
            .into_iter()
            .enumerate()
            .map(|(seq, group)| {
                index.insert(group.id, seq);
                ScheduleEntry {
                    group,
                    status: EntryStatus::Pending,
                    retry_count: 0,
                    last_error: None,
                    retry_at: None,
                    seq,
                }
            })
            .collect();

        Self {
            entries,
            index,
            dependents,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn entry(&self, id: &GroupId) -> Option<&ScheduleEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    /// True while any entry is not terminal.
    pub fn has_work_remaining(&self) -> bool {
        self.entries.iter().any(|e| !e.status.is_terminal())
    }

    pub fn running_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::Running)
            .count()
    }

    /// Lowest level that still has a non-terminal entry.
    pub fn lowest_unresolved_level(&self) -> Option<usize> {
        self.entries
            .iter()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.level())
            .min()
    }

    /// Select the next group to dispatch and mark it `scheduled`.
    pub fn get_next_group(&mut self) -> Option<&ScheduleEntry> {
        self.get_next_group_at(Instant::now())
    }

    /// As [`get_next_group`](Self::get_next_group), with an explicit clock.
    ///
    /// Only entries on the lowest unresolved level are eligible, so nothing
    /// at level L is returned while any group below L is pending, scheduled
    /// or running. Among eligible entries the highest priority wins, then the
    /// shortest estimate, then submission order.
    pub fn get_next_group_at(&mut self, now: Instant) -> Option<&ScheduleEntry> {
        let level = self.lowest_unresolved_level()?;
        let pick = self
            .entries
            .iter()
            .filter(|e| e.level() == level && e.is_dispatchable(now))
            .min_by(|a, b| {
                b.group
                    .priority
                    .cmp(&a.group.priority)
                    .then(a.group.estimated_secs.cmp(&b.group.estimated_secs))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|e| e.seq)?;

        let entry = &mut self.entries[pick];
        entry.status = EntryStatus::Scheduled;
        entry.retry_at = None;
        tracing::debug!(
            group = %entry.group.label(),
            retry_count = entry.retry_count,
            "group scheduled"
        );
        Some(&self.entries[pick])
    }

    /// Record that a scheduled group has been handed to a worker.
    pub fn mark_running(&mut self, id: &GroupId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if entry.status != EntryStatus::Scheduled || entry.retry_at.is_some() {
            return Err(invalid(id, entry.status, EntryStatus::Running));
        }
        entry.status = EntryStatus::Running;
        Ok(())
    }

    /// Record a group's outcome.
    ///
    /// Failures with a retryable error are re-enqueued after
    /// `policy.delay_for(retry_count)` until `max_retries` is used up; any
    /// other failure is terminal and also fails every group that depends on
    /// this one.
    pub fn complete_group(&mut self, id: &GroupId, outcome: GroupOutcome) -> Result<Disposition> {
        self.complete_group_at(id, outcome, Instant::now())
    }

    pub fn complete_group_at(
        &mut self,
        id: &GroupId,
        outcome: GroupOutcome,
        now: Instant,
    ) -> Result<Disposition> {
        let policy = self.policy;
        let entry = self.entry_mut(id)?;
        if !matches!(entry.status, EntryStatus::Scheduled | EntryStatus::Running)
            || entry.retry_at.is_some()
        {
            let to = match outcome {
                GroupOutcome::Success => EntryStatus::Completed,
                GroupOutcome::Failure(_) => EntryStatus::Failed,
            };
            return Err(invalid(id, entry.status, to));
        }

        let error = match outcome {
            GroupOutcome::Success => {
                entry.status = EntryStatus::Completed;
                entry.last_error = None;
                tracing::info!(group = %entry.group.label(), "group completed");
                return Ok(Disposition::Completed);
            }
            GroupOutcome::Failure(error) => error,
        };

        entry.last_error = Some(error.to_string());
        if error.is_retryable() && entry.retry_count < policy.max_retries {
            entry.retry_count += 1;
            let delay = policy.delay_for(entry.retry_count);
            entry.status = EntryStatus::Scheduled;
            entry.retry_at = Some(now + delay);
            tracing::warn!(
                group = %entry.group.label(),
                attempt = entry.retry_count,
                ?delay,
                "group failed, retrying: {}",
                error
            );
            return Ok(Disposition::Retrying {
                attempt: entry.retry_count,
                delay,
            });
        }

        let retries_exhausted = error.is_retryable();
        entry.status = EntryStatus::Failed;
        tracing::warn!(
            group = %entry.group.label(),
            retries = entry.retry_count,
            "group failed terminally: {}",
            error
        );
        let blocked = self.fail_dependents(id);
        Ok(Disposition::Failed {
            error: error.to_string(),
            retries_exhausted,
            blocked,
        })
    }

    /// Fail every pending or scheduled entry. Running entries are left to finish.
    pub fn cancel_remaining(&mut self) -> Vec<GroupId> {
        let mut cancelled = Vec::new();
        for entry in &mut self.entries {
            if matches!(entry.status, EntryStatus::Pending | EntryStatus::Scheduled) {
                entry.status = EntryStatus::Failed;
                entry.retry_at = None;
                entry.last_error = Some("cancelled".to_string());
                cancelled.push(entry.id());
            }
        }
        cancelled
    }

    /// Earliest instant at which a backed-off entry becomes eligible.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.entries
            .iter()
            .filter(|e| e.status == EntryStatus::Scheduled)
            .filter_map(|e| e.retry_at)
            .min()
    }

    pub fn summary(&self) -> ScheduleSummary {
        let mut summary = ScheduleSummary {
            total: self.entries.len(),
            ..Default::default()
        };
        for entry in &self.entries {
            match entry.status {
                EntryStatus::Pending => summary.pending += 1,
                EntryStatus::Scheduled => summary.scheduled += 1,
                EntryStatus::Running => summary.running += 1,
                EntryStatus::Completed => summary.completed += 1,
                EntryStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    fn entry_mut(&mut self, id: &GroupId) -> Result<&mut ScheduleEntry> {
        let i = *self
            .index
            .get(id)
            .ok_or_else(|| Error::GroupNotFound(id.to_string()))?;
        Ok(&mut self.entries[i])
    }

    fn fail_dependents(&mut self, failed: &GroupId) -> Vec<GroupId> {
        let mut blocked = Vec::new();
        let mut queue: VecDeque<GroupId> = VecDeque::from([*failed]);
        while let Some(current) = queue.pop_front() {
            let Some(deps) = self.dependents.get(&current) else {
                continue;
            };
            for dep in deps.clone() {
                let Some(&i) = self.index.get(&dep) else {
                    continue;
                };
                let entry = &mut self.entries[i];
                if entry.status.is_terminal() {
                    continue;
                }
                entry.status = EntryStatus::Failed;
                entry.retry_at = None;
                entry.last_error = Some(format!("dependency group {} failed", current.short()));
                blocked.push(dep);
                queue.push_back(dep);
            }
        }
        blocked
    }
}

fn invalid(id: &GroupId, from: EntryStatus, to: EntryStatus) -> Error {
    Error::InvalidTransition {
        id: id.short(),
        from: from.to_string(),
        to: to.to_string(),
    }
}
