//! Structured logging for dagrun.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent a run from progressing
//! - WARN: Unexpected conditions that are recoverable (backpressure, fallbacks)
//! - INFO: Run and layer lifecycle (submission, layer start/finish, halts)
//! - DEBUG: Per-task dispatch, scaling decisions, isolation allocation
//! - TRACE: Raw backend traffic
//!
//! Debug mode can be enabled with `init_with_debug(true)` or `DAGRUN_DEBUG=1`.
//! `RUST_LOG` overrides both when set.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::Result;

/// Initialize logging to ~/.dagrun/dagrun.log at INFO level.
pub fn init() -> Result<()> {
    init_with_debug(false)
}

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) -> Result<()> {
    let path = Config::dagrun_dir()?.join("dagrun.log");
    init_to_file(&path, debug)
}

/// Initialize logging into a specific file, truncating it first.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_to_file(path: &Path, debug: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug || env_debug())));

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .is_ok();
    if installed {
        let debug_mode = debug;
        tracing::info!(path = %path.display(), debug_mode, "logging initialized");
    }
    Ok(())
}

/// Check whether `DAGRUN_DEBUG` asks for debug output.
pub fn env_debug() -> bool {
    std::env::var("DAGRUN_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "dagrun=debug"
    } else {
        "dagrun=info"
    }
}

/// Default log file location.
pub fn log_path() -> Result<PathBuf> {
    Ok(Config::dagrun_dir()?.join("dagrun.log"))
}
