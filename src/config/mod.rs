// ABOUTME: File-level client configuration: daemon socket, pool tunables and logging
// Loaded from TOML; every section is optional and falls back to defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::logging::LoggingConfig;
use crate::pool::PoolConfig;
use crate::transport::UnixSocketConnector;

/// Environment variable overriding the daemon socket path.
pub const SOCKET_ENV_VAR: &str = "GOXEL_SOCKET";

const SOCKET_FILE_NAME: &str = "goxel.sock";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub daemon: DaemonConfig,
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Explicit socket path. Resolved from the environment when unset
    pub socket_path: Option<PathBuf>,
}

impl DaemonConfig {
    /// Configured path, then `GOXEL_SOCKET`, then the runtime dir, then `/tmp`.
    pub fn resolve_socket_path(&self) -> PathBuf {
        if let Some(path) = &self.socket_path {
            return path.clone();
        }
        if let Some(path) = std::env::var_os(SOCKET_ENV_VAR).filter(|v| !v.is_empty()) {
            return PathBuf::from(path);
        }
        dirs::runtime_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(SOCKET_FILE_NAME)
    }

    pub fn connector(&self) -> UnixSocketConnector {
        UnixSocketConnector::new(self.resolve_socket_path())
    }
}

impl ClientConfig {
    /// Load and validate configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to load config from {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config")?;
        config.pool.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }
}
