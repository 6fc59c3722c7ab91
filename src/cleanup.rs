//! Workspace cleanup policy and reporting.
//!
//! Finished workspaces are removed as soon as their group completes. Failed
//! ones may be kept around for debugging; those, and any workspace whose
//! removal failed, are pruned later by
//! [`WorkspaceManager::cleanup_all`](crate::workspace::WorkspaceManager::cleanup_all)
//! once they have been idle longer than the configured timeout.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for cleanup behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// Idle time after which terminal workspaces are pruned, in seconds.
    pub idle_timeout_secs: u64,
    /// Whether to keep workspaces of failed groups (for debugging).
    pub keep_failed: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 3_600,
            keep_failed: true,
        }
    }
}

impl CleanupConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Report of cleanup operations performed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Workspaces that were successfully removed.
    pub removed: Vec<PathBuf>,
    /// Workspaces left alone (still in use, or not idle long enough).
    pub skipped: Vec<PathBuf>,
    /// Workspaces whose removal failed, with the reason.
    pub failed: Vec<(PathBuf, String)>,
}

impl CleanupReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_processed(&self) -> usize {
        self.removed.len() + self.skipped.len() + self.failed.len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Whether all cleanup operations succeeded.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.skipped.extend(other.skipped);
        self.failed.extend(other.failed);
    }
}
