// ABOUTME: Tracing subscriber setup for applications embedding the pool
// ABOUTME: JSON-lines file output with a timestamped name, or plain stderr output

use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "goxel_pool=info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub filter: String,

    /// Write JSON lines to a file instead of stderr
    pub json_file: bool,

    /// Directory for log files. Defaults to `~/.goxel/logs`
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_FILTER.to_string(),
            json_file: false,
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    fn resolve_log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .map(|home| home.join(".goxel").join("logs"))
                .unwrap_or_else(|| PathBuf::from(".goxel/logs"))
        })
    }
}

/// Install the global subscriber.
///
/// Returns the log file path when file output is enabled. Fails if a subscriber is
/// already installed.
pub fn init(config: &LoggingConfig) -> Result<Option<PathBuf>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .with_context(|| format!("Invalid log filter '{}'", config.filter))?;

    if !config.json_file {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(None);
    }

    let log_dir = config.resolve_log_dir();
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let log_file = log_dir.join(format!(
        "goxel-pool-{}.jsonl",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_writer(file)
                .with_ansi(false),
        )
        .with(filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(Some(log_file))
}
