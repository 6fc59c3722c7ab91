use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};

use conductor::config::Config;
use conductor::core::{DependencyGraph, TaskGrouper, WorkItem};
use conductor::escalation::{EscalationManager, JsonlChannel, LogChannel};
use conductor::feedback::{CommandMetricsCollector, MetricsCollector};
use conductor::git::GitOps;
use conductor::orchestration::{
    CommandExecutor, ExecutorRegistry, OrchestrationReport, OrchestrationState, Orchestrator,
};
use conductor::{Error, Result};

/// Conductor - dependency-aware task orchestration with goal-driven validation
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(
    after_help = "ENVIRONMENT:\n    CONDUCTOR_DEBUG=1     Enable debug logging (alternative to --debug)"
)]
pub struct Cli {
    /// Enable debug logging (writes to ~/.conductor/conductor.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Write the default configuration and create conductor's directories
    Init {
        /// Overwrite an existing configuration file
        #[arg(long)]
        force: bool,
    },

    /// Show how a work item would be leveled and grouped, without running it
    Plan {
        /// Work item file (TOML or JSON)
        file: PathBuf,
    },

    /// Orchestrate a work item to completion
    Run {
        /// Work item file (TOML or JSON)
        file: PathBuf,

        /// Repository to work in (defaults to the current directory)
        #[arg(long)]
        repo: Option<PathBuf>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    conductor::log::init_with_debug(cli.debug);
    tracing::info!(debug = cli.debug, "conductor starting");

    match cli.command {
        Command::Init { force } => run_init(force),
        Command::Plan { file } => run_plan(&file),
        Command::Run { file, repo, json } => {
            let report = run_orchestration(&file, repo, json)?;
            if report.state != OrchestrationState::Completed {
                std::process::exit(2);
            }
            Ok(())
        }
    }
}

fn run_init(force: bool) -> Result<()> {
    let path = Config::config_path()?;
    let config = if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        Config::load()?
    } else {
        let config = Config::default();
        config.save()?;
        println!("Wrote {}", path.display());
        config
    };
    config.ensure_dirs()?;
    println!("Workspaces: {}", config.workspace_root().display());
    println!("Reports:    {}", Config::reports_dir()?.display());
    Ok(())
}

fn load_work_item(path: &Path) -> Result<WorkItem> {
    let text = std::fs::read_to_string(path)?;
    let item = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text)?,
        _ => toml::from_str(&text)?,
    };
    Ok(item)
}

fn run_plan(file: &Path) -> Result<()> {
    let config = Config::load()?;
    let item = load_work_item(file)?;
    let graph = DependencyGraph::from_nodes(item.plan())?;
    let plan = TaskGrouper::new(config.grouping)?.group(&graph);

    println!("{}", item.title);
    println!(
        "{} task(s), {} dependency edge(s), {} group(s), optimal concurrency {}",
        graph.len(),
        graph.edge_count(),
        plan.len(),
        plan.optimal_concurrency
    );
    for level in 0..plan.level_count() {
        println!();
        println!("Level {}", level);
        for group in plan.groups_at_level(level) {
            println!(
                "  {} [{}] priority {:?}, ~{}s",
                group.label(),
                group.capability,
                group.priority,
                group.estimated_secs
            );
            for task in &group.tasks {
                println!("    - {}: {}", task.id, task.title);
            }
        }
    }
    if item.goal.is_measurable() {
        println!();
        println!("Goal:");
        for criterion in &item.goal.criteria {
            println!("  - {}", criterion);
        }
    }
    Ok(())
}

fn build_registry(config: &Config) -> Result<ExecutorRegistry> {
    let mut registry = ExecutorRegistry::new();
    for (capability, spec) in config.executor_specs()? {
        registry = registry.register(Arc::new(CommandExecutor::new(capability, &spec)?));
    }
    if registry.is_empty() {
        return Err(Error::Config(format!(
            "no executors configured, add [executors.<capability>] to {}",
            Config::config_path()?.display()
        )));
    }
    Ok(registry)
}

fn run_orchestration(file: &Path, repo: Option<PathBuf>, json: bool) -> Result<OrchestrationReport> {
    let config = Config::load()?;
    config.ensure_dirs()?;
    let item = load_work_item(file)?;
    let repo = match repo {
        Some(repo) => repo,
        None => std::env::current_dir()?,
    };
    tracing::info!(file = %file.display(), repo = %repo.display(), "run command");

    let vcs = Arc::new(GitOps::new(&repo)?);
    let registry = build_registry(&config)?;
    let collector: Option<Arc<dyn MetricsCollector>> = match &config.metrics {
        Some(spec) => Some(Arc::new(
            CommandMetricsCollector::new(spec)?.with_timeout(config.group_timeout()),
        )),
        None => None,
    };
    let mut escalations =
        EscalationManager::new(config.escalation.clone()).with_channel(Arc::new(LogChannel));
    if config.escalation.jsonl {
        escalations = escalations.with_channel(Arc::new(JsonlChannel::default_location()?));
    }

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async {
        let orchestrator =
            Orchestrator::new(config, registry, vcs, collector, Arc::new(escalations))?;
        let handle = orchestrator.submit(item)?;
        println!("Orchestrating {} ({})", file.display(), handle.work_item().short());

        let mut status = handle.subscribe();
        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    println!("{}", current);
                    if current.state.is_terminal() {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    println!("Cancelling, waiting for running groups to finish...");
                    orchestrator.cancel(&handle);
                }
            }
        }
        handle.wait().await
    })?;

    let path = report.save(&Config::reports_dir()?)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        println!("{}: {}", report.title, report.state);
        println!(
            "  groups: {} completed, {} failed of {}",
            report.completed_groups(),
            report.failed_groups(),
            report.groups.len()
        );
        if let Some(state) = report.loop_state {
            println!(
                "  validation: {} after {} iteration(s)",
                state,
                report.iterations.len()
            );
        }
        for escalation in &report.escalations {
            println!(
                "  escalated ({}) to {}: {}",
                escalation.severity, escalation.target, escalation.reason
            );
        }
        println!("  integration branch: {}", report.integration_branch);
        println!("  duration: {:?}", report.duration());
    }
    println!("Report saved to {}", path.display());
    Ok(report)
}
