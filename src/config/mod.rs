pub mod schema;

pub use schema::{
    AgencyConfig, Config, ElectionConfig, LoggingConfig, MutexConfig, RetryConfig,
    SessionConfig, StorageConfig,
};

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "tabsync", "tabsync")
}

/// `<config_dir>/config.toml`, if the platform has a config directory.
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Directory holding the sqlite store when no explicit path is configured.
pub fn default_data_dir() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".tabsync"))
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    ///
    /// A missing default file is not an error; an explicitly named one is.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if explicit {
                bail!("Config file {} does not exist", path.display());
            }
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(contents).map_err(|e| anyhow::anyhow!("Failed to parse config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.app_prefix.trim().is_empty() {
            bail!("app_prefix cannot be empty");
        }
        if self.storage.capacity_bytes == 0 {
            bail!("storage.capacity_bytes must be greater than zero");
        }
        let election = &self.election;
        if election.expiry_ms == 0 || election.heartbeat_interval_ms == 0 {
            bail!("election.expiry_ms and election.heartbeat_interval_ms must be greater than zero");
        }
        if election.heartbeat_interval_ms >= election.expiry_ms {
            bail!(
                "election.heartbeat_interval_ms ({}) must be shorter than election.expiry_ms ({})",
                election.heartbeat_interval_ms,
                election.expiry_ms
            );
        }
        if election.retry_interval_ms == 0 {
            bail!("election.retry_interval_ms must be greater than zero");
        }
        if self.mutex.default_timeout_ms == 0 || self.agency.lock_timeout_ms == 0 {
            bail!("lock timeouts must be greater than zero");
        }
        if election.backoff.multiplier < 1.0 {
            bail!("election.backoff.multiplier must be at least 1.0");
        }
        if election.backoff.max_delay_ms < election.backoff.base_delay_ms {
            bail!("election.backoff.max_delay_ms must not be below base_delay_ms");
        }
        Ok(())
    }

    /// The sqlite file path, falling back to the platform data directory.
    pub fn store_path(&self) -> PathBuf {
        self.storage
            .path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("store.db"))
    }
}
