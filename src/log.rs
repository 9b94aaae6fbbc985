//! Structured logging for debugging meshengine.
//!
//! Log levels follow `tracing`:
//! - ERROR: Run-level failures (planner gave up, checkpoint write failed)
//! - WARN: Recoverable conditions (tool retry, malformed plan being repaired)
//! - INFO: Run lifecycle (phase changes, iteration summaries)
//! - DEBUG: Task dispatch and completion, cache hits
//! - TRACE: Tool arguments and results
//!
//! Debug mode can be enabled with `--debug` flag or `MESHENGINE_DEBUG=1`.
//! `MESHENGINE_LOG` takes an `EnvFilter` directive and overrides both.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

pub const DEBUG_ENV: &str = "MESHENGINE_DEBUG";
pub const FILTER_ENV: &str = "MESHENGINE_LOG";

/// Initialize logging to ~/.meshengine/engine.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_flag(DEBUG_ENV);
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let Some(dir) = dirs::home_dir().map(|h| h.join(".meshengine")) else {
        return;
    };
    let _ = std::fs::create_dir_all(&dir);
    let path = dir.join("engine.log");
    let _ = init_file(&path, debug_enabled);
}

/// Install a subscriber writing to `path`, truncating the file first.
///
/// Returns `false` if the file could not be created or a global subscriber
/// is already installed.
pub fn init_file(path: &Path, debug: bool) -> bool {
    let Ok(file) = File::create(path) else {
        return false;
    };
    LOG_PATH.set(path.to_path_buf()).ok();

    tracing_subscriber::fmt()
        .with_env_filter(filter_for(debug))
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .is_ok()
}

fn filter_for(debug: bool) -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| {
        EnvFilter::new(if debug {
            "meshengine=debug"
        } else {
            "meshengine=info"
        })
    })
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the active log file, if logging was initialized.
pub fn log_path() -> Option<&'static Path> {
    LOG_PATH.get().map(PathBuf::as_path)
}
