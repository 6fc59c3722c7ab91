//! Structured logging for conductor.
//!
//! Log levels:
//! - ERROR: Failures that abort an orchestration
//! - WARN: Recoverable conditions (retries, cleanup failures, escalations)
//! - INFO: High-level orchestration events (submit, group completion, loop decisions)
//! - DEBUG: Detailed operation traces (scheduler transitions, git operations)
//! - TRACE: Very detailed traces (worker channel traffic)
//!
//! Debug mode can be enabled with `--debug` flag or `CONDUCTOR_DEBUG=1` env var.
//! `RUST_LOG` takes precedence over both when set.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();

/// Environment variable that switches on debug logging.
pub const DEBUG_ENV: &str = "CONDUCTOR_DEBUG";

/// Initialize logging to ~/.conductor/conductor.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// The log file is truncated on every start. Calling this more than once is
/// harmless; only the first subscriber is installed.
pub fn init_with_debug(debug: bool) {
    let level = if debug || env_debug() { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let Some(dir) = dirs::home_dir().map(|h| h.join(".conductor")) else {
        return;
    };
    let _ = std::fs::create_dir_all(&dir);
    let path = dir.join("conductor.log");
    let file = match std::fs::File::create(&path) {
        Ok(file) => file,
        Err(_) => return,
    };
    LOG_PATH.set(path).ok();

    let layer = fmt::layer()
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(true);

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();
}

/// Path of the active log file, if logging has been initialized.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn env_debug() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}
