//! Default decomposition for work items that arrive without a task list.
//!
//! The canonical plan analyzes the issue, implements it, and then tests and
//! reviews the implementation in parallel:
//!
//! ```text
//! analyze (issue) -> implement (codegen) -> test (test)
//!                                        -> review (review)
//! ```

use crate::core::task::{Capability, Priority, TaskNode, WorkItem};

/// Build the canonical four-task plan for `item`.
pub fn default_plan(item: &WorkItem) -> Vec<TaskNode> {
    let subject = match item.issue_number {
        Some(n) => format!("#{} {}", n, item.title),
        None => item.title.clone(),
    };

    vec![
        TaskNode::new("analyze", &format!("Analyze {}", subject), Capability::Issue)
            .with_description(&item.description)
            .with_priority(Priority::High)
            .with_estimate(300),
        TaskNode::new("implement", &format!("Implement {}", subject), Capability::Codegen)
            .with_description(&item.description)
            .with_priority(Priority::High)
            .with_estimate(1800)
            .depends_on("analyze"),
        TaskNode::new("test", &format!("Test {}", subject), Capability::Test)
            .with_priority(Priority::Medium)
            .with_estimate(900)
            .depends_on("implement"),
        TaskNode::new("review", &format!("Review {}", subject), Capability::Review)
            .with_priority(Priority::Medium)
            .with_estimate(600)
            .depends_on("implement"),
    ]
}
