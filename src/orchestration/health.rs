//! Health polling for running workspaces.
//!
//! The `WorkspaceMonitor` classifies a workspace from its last recorded
//! activity. It is a plain poller: the clock and the idle predicate are
//! injected, and every check returns a value instead of firing callbacks.
//! The coordinator calls it on each wake-up and logs what is stuck.

use std::sync::Arc;
use std::time::Duration;

use crate::util::{elapsed_between, Clock, SystemClock};
use crate::workspace::{Workspace, WorkspaceStatus};

/// Default inactivity before a workspace is considered idle.
pub const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 60;

/// Default inactivity before a workspace is considered stuck.
pub const DEFAULT_STUCK_THRESHOLD_SECS: u64 = 300; // 5 minutes

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub idle_after: Duration,
    pub stuck_after: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            idle_after: Duration::from_secs(DEFAULT_IDLE_THRESHOLD_SECS),
            stuck_after: Duration::from_secs(DEFAULT_STUCK_THRESHOLD_SECS),
        }
    }
}

impl HealthConfig {
    pub fn with_stuck_threshold(stuck_after: Duration) -> Self {
        Self {
            stuck_after,
            idle_after: stuck_after.min(Duration::from_secs(DEFAULT_IDLE_THRESHOLD_SECS)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceHealth {
    Active,
    Idle { idle_for: Duration },
    Stuck { idle_for: Duration },
}

impl WorkspaceHealth {
    pub fn is_stuck(&self) -> bool {
        matches!(self, WorkspaceHealth::Stuck { .. })
    }
}

/// Decides whether a workspace has gone quiet, given its inactivity.
pub type IdlePredicate = Box<dyn Fn(&Workspace, Duration) -> bool + Send + Sync>;

pub struct WorkspaceMonitor {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    is_idle: IdlePredicate,
}

impl WorkspaceMonitor {
    /// A monitor using the system clock and treating any workspace quiet
    /// for `idle_after` as idle.
    pub fn new(config: HealthConfig) -> Self {
        let idle_after = config.idle_after;
        Self {
            config,
            clock: Arc::new(SystemClock),
            is_idle: Box::new(move |_, quiet_for| quiet_for >= idle_after),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_idle_predicate(
        mut self,
        predicate: impl Fn(&Workspace, Duration) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.is_idle = Box::new(predicate);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn check(&self, workspace: &Workspace) -> WorkspaceHealth {
        let idle_for = elapsed_between(workspace.last_activity, self.clock.now());
        if !(self.is_idle)(workspace, idle_for) {
            WorkspaceHealth::Active
        } else if idle_for >= self.config.stuck_after {
            WorkspaceHealth::Stuck { idle_for }
        } else {
            WorkspaceHealth::Idle { idle_for }
        }
    }

    /// Check every `active` workspace; others are not expected to make progress.
    pub fn check_all<'a>(
        &self,
        workspaces: impl IntoIterator<Item = &'a Workspace>,
    ) -> Vec<(&'a Workspace, WorkspaceHealth)> {
        workspaces
            .into_iter()
            .filter(|w| w.status == WorkspaceStatus::Active)
            .map(|w| (w, self.check(w)))
            .collect()
    }
}
