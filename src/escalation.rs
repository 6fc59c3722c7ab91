//! Escalation of states automation cannot resolve.
//!
//! An escalation is a notification, not a control path: by the time one is
//! raised the loop or schedule entry has already reached its terminal
//! state. Channel failures are logged and swallowed so shutdown is never
//! held up by a broken notifier.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::core::id::{EscalationId, GroupId, LoopId, WorkItemId};
use crate::util::{Clock, SystemClock};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raised escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: EscalationId,
    pub reason: String,
    /// Who should act on it.
    pub target: String,
    pub severity: Severity,
    /// Flattened [`EscalationContext`].
    pub context: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl Escalation {
    pub fn work_item(&self) -> Option<&str> {
        self.context.get("work_item").map(String::as_str)
    }
}

/// Where an escalation came from.
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationContext {
    /// A feedback loop reached a state needing attention.
    Loop {
        work_item: Option<WorkItemId>,
        loop_id: LoopId,
        state: String,
        iteration: u32,
        score: f64,
        gaps: Vec<String>,
    },
    /// A schedule entry failed terminally.
    Schedule {
        work_item: WorkItemId,
        group_id: GroupId,
        label: String,
        retry_count: u32,
        error: String,
        blocked: usize,
    },
    /// The orchestration as a whole.
    Orchestration {
        work_item: WorkItemId,
        title: String,
        state: String,
    },
}

impl EscalationContext {
    pub fn kind(&self) -> &'static str {
        match self {
            EscalationContext::Loop { .. } => "loop",
            EscalationContext::Schedule { .. } => "schedule",
            EscalationContext::Orchestration { .. } => "orchestration",
        }
    }

    /// Key/value form stored on the [`Escalation`].
    pub fn into_fields(self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("kind".to_string(), self.kind().to_string());
        let mut put = |k: &str, v: String| {
            fields.insert(k.to_string(), v);
        };
        match self {
            EscalationContext::Loop {
                work_item,
                loop_id,
                state,
                iteration,
                score,
                gaps,
            } => {
                if let Some(item) = work_item {
                    put("work_item", item.to_string());
                }
                put("loop_id", loop_id.to_string());
                put("state", state);
                put("iteration", iteration.to_string());
                put("score", format!("{:.2}", score));
                if !gaps.is_empty() {
                    put("gaps", gaps.join("; "));
                }
            }
            EscalationContext::Schedule {
                work_item,
                group_id,
                label,
                retry_count,
                error,
                blocked,
            } => {
                put("work_item", work_item.to_string());
                put("group_id", group_id.to_string());
                put("group", label);
                put("retry_count", retry_count.to_string());
                put("error", error);
                put("blocked_groups", blocked.to_string());
            }
            EscalationContext::Orchestration {
                work_item,
                title,
                state,
            } => {
                put("work_item", work_item.to_string());
                put("title", title);
                put("state", state);
            }
        }
        fields
    }
}

/// Target routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub default_target: String,
    /// Severity name (`low`, `medium`, `high`, `critical`) to target.
    pub targets: BTreeMap<String, String>,
    /// Also append escalations to `~/.conductor/logs/escalations.jsonl`.
    pub jsonl: bool,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            default_target: "maintainer".to_string(),
            targets: BTreeMap::new(),
            jsonl: true,
        }
    }
}

impl EscalationConfig {
    pub fn target_for(&self, severity: Severity) -> &str {
        self.targets
            .get(severity.as_str())
            .unwrap_or(&self.default_target)
    }
}

/// A sink escalations are delivered to.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, escalation: &Escalation) -> Result<()>;
}

/// Writes escalations to the tracing log.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, escalation: &Escalation) -> Result<()> {
        let context = escalation
            .context
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        match escalation.severity {
            Severity::Low | Severity::Medium => tracing::warn!(
                id = %escalation.id.short(),
                severity = %escalation.severity,
                target = %escalation.target,
                "escalation: {} [{}]",
                escalation.reason,
                context
            ),
            Severity::High | Severity::Critical => tracing::error!(
                id = %escalation.id.short(),
                severity = %escalation.severity,
                target = %escalation.target,
                "escalation: {} [{}]",
                escalation.reason,
                context
            ),
        }
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
#[derive(Debug, Clone)]
pub struct JsonlChannel {
    path: PathBuf,
}

impl JsonlChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.conductor/logs/escalations.jsonl`
    pub fn default_location() -> Result<Self> {
        Ok(Self::new(crate::config::Config::logs_dir()?.join("escalations.jsonl")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NotificationChannel for JsonlChannel {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn notify(&self, escalation: &Escalation) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(escalation)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Formats escalations and fans them out to every channel.
pub struct EscalationManager {
    config: EscalationConfig,
    channels: Vec<Arc<dyn NotificationChannel>>,
    history: Mutex<Vec<Escalation>>,
    clock: Arc<dyn Clock>,
}

impl EscalationManager {
    /// A manager with no channels; see [`with_channel`](Self::with_channel).
    pub fn new(config: EscalationConfig) -> Self {
        Self {
            config,
            channels: Vec::new(),
            history: Mutex::new(Vec::new()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EscalationConfig {
        &self.config
    }

    /// Raise an escalation and deliver it to every channel.
    ///
    /// Never fails: a channel error is logged and the remaining channels
    /// are still notified.
    pub async fn escalate(
        &self,
        context: EscalationContext,
        reason: &str,
        severity: Severity,
    ) -> Escalation {
        let escalation = Escalation {
            id: EscalationId::new(),
            reason: reason.to_string(),
            target: self.config.target_for(severity).to_string(),
            severity,
            context: context.into_fields(),
            timestamp: self.clock.now(),
        };

        for channel in &self.channels {
            if let Err(e) = channel.notify(&escalation).await {
                tracing::warn!(
                    channel = channel.name(),
                    escalation = %escalation.id.short(),
                    "notification failed: {}",
                    e
                );
            }
        }

        self.history.lock().await.push(escalation.clone());
        escalation
    }

    /// Every escalation raised so far, oldest first.
    pub async fn history(&self) -> Vec<Escalation> {
        self.history.lock().await.clone()
    }

    /// Escalations raised on behalf of one work item.
    pub async fn history_for(&self, work_item: &WorkItemId) -> Vec<Escalation> {
        let key = work_item.to_string();
        self.history
            .lock()
            .await
            .iter()
            .filter(|e| e.work_item() == Some(key.as_str()))
            .cloned()
            .collect()
    }
}

impl Default for EscalationManager {
    fn default() -> Self {
        Self::new(EscalationConfig::default()).with_channel(Arc::new(LogChannel))
    }
}
