//! Structured logging for conductor.
//!
//! Call sites use the `tracing` macros. This module only installs the
//! subscriber, which writes to `~/.conductor/conductor.log`.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent operations from completing
//! - WARN: Unexpected conditions that are recoverable (fallbacks, open circuits)
//! - INFO: High-level lifecycle notifications (startup, sessions, runs)
//! - DEBUG: Detailed operation traces (dispatches, level transitions)
//! - TRACE: Per-attempt detail
//!
//! Debug mode can be enabled with `--debug` flag or `CONDUCTOR_DEBUG=1` env var.
//! `RUST_LOG` overrides both.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

static LOG_PATH: OnceLock<PathBuf> = OnceLock::new();
static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Initialize logging to ~/.conductor/conductor.log
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) {
    let debug_enabled = debug || env_debug();
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let Some(file) = open_log_file() else {
        return;
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(make_filter(debug_enabled))
        .with_target(true)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Path of the active log file, if logging was initialized.
pub fn log_path() -> Option<&'static PathBuf> {
    LOG_PATH.get()
}

fn env_debug() -> bool {
    std::env::var("CONDUCTOR_DEBUG")
        .map(|v| parse_debug_flag(&v))
        .unwrap_or(false)
}

fn parse_debug_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

fn make_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(debug)))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn open_log_file() -> Option<File> {
    let dir = dirs::home_dir()?.join(".conductor");
    std::fs::create_dir_all(&dir).ok()?;
    let path = dir.join("conductor.log");
    // Truncate file on startup
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .ok()?;
    LOG_PATH.set(path).ok();
    Some(file)
}
