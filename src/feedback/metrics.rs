//! Metrics collection for the validation phase.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::core::goal::MetricsSnapshot;
use crate::orchestration::CommandSpec;
use crate::workspace::Workspace;
use crate::{Error, Result};

/// Default timeout for a metrics command (5 minutes).
pub const DEFAULT_METRICS_TIMEOUT_SECS: u64 = 300;

/// Produces a [`MetricsSnapshot`] for a workspace.
///
/// Must be deterministic for a given workspace state.
#[async_trait]
pub trait MetricsCollector: Send + Sync {
    async fn collect(&self, workspace: &Workspace) -> Result<MetricsSnapshot>;
}

/// Runs a command in the workspace and reads a JSON object of numbers from
/// its stdout, e.g. `{"coverage": 81.5, "quality_score": 77}`.
#[derive(Debug, Clone)]
pub struct CommandMetricsCollector {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandMetricsCollector {
    /// Resolve `spec.command` on `PATH`.
    pub fn new(spec: &CommandSpec) -> Result<Self> {
        let program = which::which(&spec.command)
            .map_err(|_| Error::ExecutorUnavailable(spec.command.clone()))?;
        Ok(Self {
            program,
            args: spec.args.clone(),
            timeout: Duration::from_secs(DEFAULT_METRICS_TIMEOUT_SECS),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl MetricsCollector for CommandMetricsCollector {
    async fn collect(&self, workspace: &Workspace) -> Result<MetricsSnapshot> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .args(&self.args)
                .current_dir(&workspace.path)
                .env("CONDUCTOR_CONTEXT", workspace.context_path())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(Error::TaskExecution(format!(
                "metrics command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_metrics(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse collector output.
///
/// Accepts either the whole output as one JSON object or, failing that, the
/// last line that is one. Non-numeric fields are ignored.
pub fn parse_metrics(output: &str) -> Result<MetricsSnapshot> {
    let trimmed = output.trim();
    let object = serde_json::from_str::<serde_json::Value>(trimmed)
        .ok()
        .filter(|v| v.is_object())
        .or_else(|| {
            trimmed
                .lines()
                .rev()
                .filter(|l| l.trim_start().starts_with('{'))
                .find_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
                .filter(|v| v.is_object())
        })
        .ok_or_else(|| Error::Validation("metrics output contains no JSON object".into()))?;

    let serde_json::Value::Object(fields) = object else {
        return Err(Error::Validation("metrics output is not a JSON object".into()));
    };
    Ok(fields
        .into_iter()
        .filter_map(|(name, value)| value.as_f64().map(|v| (name, v)))
        .collect())
}
