//! Tracing setup for processes embedding the engine.
//!
//! The engine itself only emits `tracing` events; installing a subscriber is
//! the host's choice. [`init_logging`] appends to a file under the XDG state
//! directory and [`init_logging_stderr`] is the fallback when that fails.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "dmove.log";

/// Used when `RUST_LOG` is unset or does not parse.
const DEFAULT_FILTER: &str = "info,dmove_core=debug";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// `~/.local/state/dmove/dmove.log`, creating the directory.
pub fn default_log_path() -> Result<PathBuf> {
    let dirs = xdg::BaseDirectories::with_prefix("dmove")?;
    dirs.place_state_file(LOG_FILE_NAME)
        .context("failed to create log directory")
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

/// Append structured logs to `path`. Errors if the file cannot be opened or
/// a global subscriber is already installed.
pub fn init_logging_at(path: &Path) -> Result<()> {
    let file = open_log_file(path)?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;
    tracing::info!(path = %path.display(), "dmove logging initialized");
    Ok(())
}

/// Log to the default file. Returns the file's path.
pub fn init_logging() -> Result<PathBuf> {
    let path = default_log_path()?;
    init_logging_at(&path)?;
    Ok(path)
}

/// Log to stderr. A no-op when a subscriber is already installed, so tests
/// may call it freely.
pub fn init_logging_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn log_file_is_created_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join(LOG_FILE_NAME);
        open_log_file(&path).unwrap().write_all(b"one\n").unwrap();
        open_log_file(&path).unwrap().write_all(b"two\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn stderr_init_tolerates_repeats() {
        init_logging_stderr();
        init_logging_stderr();
        tracing::debug!("still logging");
    }
}
