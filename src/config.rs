use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cleanup::CleanupConfig;
use crate::core::grouper::GroupingConfig;
use crate::core::task::Capability;
use crate::escalation::EscalationConfig;
use crate::feedback::LoopConfig;
use crate::orchestration::{CommandSpec, RetryPolicy};
use crate::{Error, Result};

const DEFAULT_CAPACITY_HINT: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Groups running at once. Defaults from the core count and `capacity_hint`.
    pub max_concurrency: usize,
    /// Upper bound on useful parallelism for this machine's executors.
    pub capacity_hint: usize,
    pub group_timeout_secs: u64,
    pub branch_prefix: String,
    /// Where workspaces are created; `~` is expanded.
    pub workspace_dir: String,
    /// Ref new workspaces branch from before the integration branch exists.
    pub base_ref: Option<String>,
    /// Push the integration branch after each merge.
    pub push: bool,
    pub grouping: GroupingConfig,
    pub retry: RetryPolicy,
    pub feedback: LoopConfig,
    pub cleanup: CleanupConfig,
    pub escalation: EscalationConfig,
    /// Executor commands keyed by capability name.
    pub executors: BTreeMap<String, CommandSpec>,
    /// Command printing a JSON metrics object for the validation phase.
    pub metrics: Option<CommandSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(DEFAULT_CAPACITY_HINT),
            capacity_hint: DEFAULT_CAPACITY_HINT,
            group_timeout_secs: 1_800,
            branch_prefix: "conductor".to_string(),
            workspace_dir: "~/.conductor/workspaces".to_string(),
            base_ref: None,
            push: false,
            grouping: GroupingConfig::default(),
            retry: RetryPolicy::default(),
            feedback: LoopConfig::default(),
            cleanup: CleanupConfig::default(),
            escalation: EscalationConfig::default(),
            executors: BTreeMap::new(),
            metrics: None,
        }
    }
}

/// `max(1, min(cores, capacity_hint) / 2)`
pub fn default_concurrency(capacity_hint: usize) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cores.min(capacity_hint) / 2).max(1)
}

impl Config {
    pub fn conductor_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".conductor"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("conductor.toml"))
    }

    pub fn reports_dir() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("reports"))
    }

    pub fn logs_dir() -> Result<PathBuf> {
        Ok(Self::conductor_dir()?.join("logs"))
    }

    pub fn workspace_root(&self) -> PathBuf {
        expand_tilde(&self.workspace_dir)
    }

    pub fn group_timeout(&self) -> Duration {
        Duration::from_secs(self.group_timeout_secs)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        tracing::debug!("Config::load path={}", path.display());
        if !path.exists() {
            tracing::debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        tracing::debug!(
            max_concurrency = config.max_concurrency,
            workspace_dir = %config.workspace_dir,
            executors = config.executors.len(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                tracing::debug!("Creating config directory {}", parent.display());
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            Self::conductor_dir()?,
            Self::reports_dir()?,
            Self::logs_dir()?,
            self.workspace_root(),
        ] {
            if !dir.exists() {
                tracing::debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(&dir)?;
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::Config("max_concurrency must be at least 1".to_string()));
        }
        if self.group_timeout_secs == 0 {
            return Err(Error::Config("group_timeout_secs must be at least 1".to_string()));
        }
        if self.branch_prefix.trim().is_empty() {
            return Err(Error::Config("branch_prefix must not be empty".to_string()));
        }
        self.grouping
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        self.feedback
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        self.executor_specs()?;
        Ok(())
    }

    /// Executor commands with their capability names parsed.
    pub fn executor_specs(&self) -> Result<Vec<(Capability, CommandSpec)>> {
        self.executors
            .iter()
            .map(|(name, spec)| {
                let capability = name
                    .parse::<Capability>()
                    .map_err(|_| Error::Config(format!("unknown executor capability: {}", name)))?;
                Ok((capability, spec.clone()))
            })
            .collect()
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
