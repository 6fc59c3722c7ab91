//! Partitioning of graph nodes into executable batches.
//!
//! Tasks are split by level, then by capability. Oversized partitions are
//! chunked at `max_group_size`; undersized ones are merged with compatible
//! partitions on the same level. A group never spans two levels.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::dag::DependencyGraph;
use crate::core::goal::Gap;
use crate::core::id::GroupId;
use crate::core::task::{Capability, Priority, TaskId, TaskNode};
use crate::error::{Error, Result};

/// Size and concurrency bounds for grouping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    pub min_group_size: usize,
    pub max_group_size: usize,
    pub max_concurrent_groups: usize,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            min_group_size: 1,
            max_group_size: 5,
            max_concurrent_groups: 4,
        }
    }
}

impl GroupingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_group_size == 0 {
            return Err(Error::Config("min_group_size must be at least 1".into()));
        }
        if self.min_group_size > self.max_group_size {
            return Err(Error::Config(format!(
                "min_group_size ({}) exceeds max_group_size ({})",
                self.min_group_size, self.max_group_size
            )));
        }
        if self.max_concurrent_groups == 0 {
            return Err(Error::Config("max_concurrent_groups must be at least 1".into()));
        }
        Ok(())
    }
}

/// An ordered batch of tasks on one level, dispatched to one executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: GroupId,
    pub level: usize,
    /// Capability used to pick the executor. For merged groups this is the
    /// capability contributing the most tasks.
    pub capability: Capability,
    pub tasks: Vec<TaskNode>,
    /// Highest priority among the tasks.
    pub priority: Priority,
    /// Sum of the task estimates, in seconds.
    pub estimated_secs: u64,
}

impl TaskGroup {
    /// Build a group, deriving capability, priority and estimate from `tasks`.
    ///
    /// `tasks` must not be empty.
    pub fn new(level: usize, tasks: Vec<TaskNode>) -> Self {
        let capability = dominant_capability(&tasks).unwrap_or(Capability::Codegen);
        let priority = tasks.iter().map(|t| t.priority).max().unwrap_or_default();
        let estimated_secs = tasks.iter().map(|t| t.estimated_secs).sum();
        Self {
            id: GroupId::new(),
            level,
            capability,
            tasks,
            priority,
            estimated_secs,
        }
    }

    /// A one-off codegen batch addressing unmet goal criteria.
    pub fn refinement(level: usize, gaps: &[Gap]) -> Self {
        let tasks = if gaps.is_empty() {
            vec![TaskNode::new("refine", "Improve overall quality", Capability::Codegen)
                .with_priority(Priority::High)]
        } else {
            gaps.iter()
                .map(|gap| {
                    TaskNode::new(
                        format!("refine-{}", gap.criterion.metric),
                        &format!("Bring {}", gap.criterion),
                        Capability::Codegen,
                    )
                    .with_description(&gap.to_string())
                    .with_priority(Priority::High)
                })
                .collect()
        };
        Self::new(level, tasks)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id.clone()).collect()
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.iter().any(|t| &t.id == id)
    }

    pub fn estimated_duration(&self) -> Duration {
        Duration::from_secs(self.estimated_secs)
    }

    /// Short label for logs and branch names, e.g. `L1-codegen-3f2a9c1d`.
    pub fn label(&self) -> String {
        format!("L{}-{}-{}", self.level, self.capability, self.id.short())
    }
}

/// Output of [`TaskGrouper::group`].
#[derive(Debug, Clone)]
pub struct GroupingPlan {
    /// Groups sorted by (level asc, priority desc, estimate asc).
    pub groups: Vec<TaskGroup>,
    /// `min(groups at the lowest level, max_concurrent_groups)`.
    pub optimal_concurrency: usize,
}

impl GroupingPlan {
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups_at_level(&self, level: usize) -> impl Iterator<Item = &TaskGroup> {
        self.groups.iter().filter(move |g| g.level == level)
    }

    pub fn level_count(&self) -> usize {
        self.groups.iter().map(|g| g.level + 1).max().unwrap_or(0)
    }
}

pub struct TaskGrouper {
    config: GroupingConfig,
}

impl TaskGrouper {
    pub fn new(config: GroupingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &GroupingConfig {
        &self.config
    }

    pub fn group(&self, graph: &DependencyGraph) -> GroupingPlan {
        let mut partitions: BTreeMap<usize, BTreeMap<Capability, Vec<TaskNode>>> = BTreeMap::new();
        for node in graph.nodes() {
            let level = graph.level(&node.id).unwrap_or(0);
            partitions
                .entry(level)
                .or_default()
                .entry(node.capability)
                .or_default()
                .push(node.clone());
        }

        let mut groups = Vec::new();
        for (level, by_capability) in partitions {
            let mut chunks: Vec<Vec<TaskNode>> = Vec::new();
            for (_, mut tasks) in by_capability {
                tasks.sort_by(|a, b| {
                    b.priority
                        .cmp(&a.priority)
                        .then(a.estimated_secs.cmp(&b.estimated_secs))
                        .then_with(|| a.id.cmp(&b.id))
                });
                chunks.extend(tasks.chunks(self.config.max_group_size).map(|c| c.to_vec()));
            }
            self.merge_undersized(&mut chunks);
            groups.extend(chunks.into_iter().map(|tasks| TaskGroup::new(level, tasks)));
        }

        groups.sort_by(|a, b| {
            a.level
                .cmp(&b.level)
                .then(b.priority.cmp(&a.priority))
                .then(a.estimated_secs.cmp(&b.estimated_secs))
        });

        let lowest = groups.first().map(|g| g.level);
        let at_lowest = groups.iter().filter(|g| Some(g.level) == lowest).count();
        let optimal_concurrency = at_lowest.min(self.config.max_concurrent_groups);

        tracing::debug!(
            groups = groups.len(),
            optimal_concurrency,
            "grouped {} tasks",
            graph.len()
        );

        GroupingPlan {
            groups,
            optimal_concurrency,
        }
    }

    /// Fold undersized chunks of one level into compatible undersized chunks
    /// while staying within `max_group_size`.
    fn merge_undersized(&self, chunks: &mut Vec<Vec<TaskNode>>) {
        let min = self.config.min_group_size;
        let max = self.config.max_group_size;

        let mut i = 0;
        while i < chunks.len() {
            if chunks[i].len() < min {
                let family = chunks[i][0].capability.family();
                let mut j = i + 1;
                while j < chunks.len() && chunks[i].len() < min {
                    let candidate = &chunks[j];
                    if candidate.len() < min
                        && candidate[0].capability.family() == family
                        && chunks[i].len() + candidate.len() <= max
                    {
                        let taken = chunks.remove(j);
                        chunks[i].extend(taken);
                    } else {
                        j += 1;
                    }
                }
            }
            i += 1;
        }
    }
}

fn dominant_capability(tasks: &[TaskNode]) -> Option<Capability> {
    let mut counts: Vec<(Capability, usize)> = Vec::new();
    for task in tasks {
        match counts.iter_mut().find(|(c, _)| *c == task.capability) {
            Some((_, n)) => *n += 1,
            None => counts.push((task.capability, 1)),
        }
    }
    // max_by_key keeps the last maximum; reverse so ties go to the first seen.
    counts
        .into_iter()
        .rev()
        .max_by_key(|(_, n)| *n)
        .map(|(c, _)| c)
}
