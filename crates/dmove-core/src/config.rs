use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineOptions;
use crate::manager::TransferManagerOptions;
use crate::plan::PlanLimits;
use crate::retry::RetryPolicy;

/// Retry policy parameters (optional section in config.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts per remote call (including the first).
    pub max_attempts: u32,
    /// Base delay in seconds for exponential backoff (e.g. 0.25 = 250ms).
    pub base_delay_secs: f64,
    /// Maximum backoff delay in seconds.
    pub max_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 0.25,
            max_delay_secs: 30,
        }
    }
}

/// Global configuration loaded from `~/.config/dmove/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Network/other worker threads. None = max(5, available parallelism).
    #[serde(default)]
    pub num_threads: Option<usize>,
    /// Memory budget in bytes. None = 128 MiB per worker thread.
    #[serde(default)]
    pub max_memory_size: Option<u64>,
    /// Worker threads dedicated to disk I/O tasks.
    pub disk_io_threads: usize,
    /// Directory holding job plans. None = `~/.local/state/dmove/plans`.
    #[serde(default)]
    pub plans_dir: Option<PathBuf>,
    /// Chunk size for multi-block uploads in bytes.
    pub upload_block_size: u64,
    /// Chunk size for ranged downloads in bytes.
    pub download_block_size: u64,
    /// Maximum done bits per plan part.
    pub subtasks_per_part: usize,
    /// Cap on subtasks generated by one expansion step.
    pub max_subtasks_generated: usize,
    /// Page size for remote listings.
    pub list_page_size: usize,
    /// The job engine pulls more tasks while fewer than this many are outstanding.
    pub task_refill_threshold: usize,
    /// Delay between polls of a pending server-side copy, in milliseconds.
    pub copy_poll_interval_ms: u64,
    /// Minimum interval between progress callbacks for one job, in milliseconds.
    pub progress_interval_ms: u64,
    /// Optional retry policy for remote calls; if missing, built-in defaults are used.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            max_memory_size: None,
            disk_io_threads: 2,
            plans_dir: None,
            upload_block_size: 8 * 1024 * 1024,
            download_block_size: 8 * 1024 * 1024,
            subtasks_per_part: 50_000,
            max_subtasks_generated: 1_000_000,
            list_page_size: 250,
            task_refill_threshold: 5_000,
            copy_poll_interval_ms: 1_000,
            progress_interval_ms: 500,
            retry: None,
        }
    }
}

impl EngineConfig {
    /// Plan directory from config, or the XDG state default.
    pub fn plans_dir(&self) -> Result<PathBuf> {
        match &self.plans_dir {
            Some(p) => Ok(p.clone()),
            None => default_plans_dir(),
        }
    }

    /// Options for [`crate::TransferManager::new`].
    pub fn manager_options(&self) -> Result<TransferManagerOptions> {
        Ok(TransferManagerOptions {
            plans_dir: self.plans_dir()?,
            engine: EngineOptions {
                num_threads: self.num_threads,
                max_memory_size: self.max_memory_size,
                disk_io_threads: self.disk_io_threads,
            },
            limits: PlanLimits {
                upload_block_size: self.upload_block_size,
                download_block_size: self.download_block_size,
                subtasks_per_part: self.subtasks_per_part,
                max_subtasks_generated: self.max_subtasks_generated,
                list_page_size: self.list_page_size,
            },
            task_refill_threshold: self.task_refill_threshold,
            copy_poll_interval: Duration::from_millis(self.copy_poll_interval_ms),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            retry: self.retry.as_ref().map(RetryPolicy::from).unwrap_or_default(),
        })
    }
}

/// `~/.local/state/dmove/plans`.
pub fn default_plans_dir() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("dmove")?;
    Ok(xdg_dirs.get_state_home().join("dmove").join("plans"))
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("dmove")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<EngineConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = EngineConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: EngineConfig =
        toml::from_str(&data).with_context(|| format!("invalid config at {}", path.display()))?;
    Ok(cfg)
}
