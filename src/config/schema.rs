use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ── Top-level ───────────────────────────────────────────────────

/// Complete coordination configuration, as read from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Namespace prepended to every key this crate writes (`<prefix>_master_tab`, ...).
    pub app_prefix: String,
    pub storage: StorageConfig,
    pub election: ElectionConfig,
    pub mutex: MutexConfig,
    pub agency: AgencyConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_prefix: "tabsync".into(),
            storage: StorageConfig::default(),
            election: ElectionConfig::default(),
            mutex: MutexConfig::default(),
            agency: AgencyConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ── Storage ─────────────────────────────────────────────────────

/// Shared key-value store settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Store backend: `memory` (single process) or `sqlite` (shared between processes).
    pub backend: String,
    /// Database file for the `sqlite` backend. Defaults to `<data_dir>/store.db`.
    pub path: Option<PathBuf>,
    /// Capacity in bytes (keys + values). Writes beyond it fail with quota exceeded.
    pub capacity_bytes: usize,
    /// Entries whose `timestamp` is older than this are removed by the cleanup pass.
    pub retention_secs: u64,
    /// Key suffixes (after `<prefix>_`) that cleanup never removes.
    pub essential_keys: Vec<String>,
    /// Use the store's compare-and-swap when it has one instead of verify-after-write.
    pub atomic_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".into(),
            path: None,
            capacity_bytes: 5 * 1024 * 1024,
            retention_secs: 24 * 3600,
            essential_keys: vec!["master_tab".into(), "auth".into(), "session".into()],
            atomic_writes: true,
        }
    }
}

// ── Election ────────────────────────────────────────────────────

/// Master election timing.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ElectionConfig {
    /// A master record whose last heartbeat is older than this is stale.
    pub expiry_ms: u64,
    /// How often the master rewrites its heartbeat.
    pub heartbeat_interval_ms: u64,
    /// How often a non-master re-runs the election once backoff is exhausted.
    pub retry_interval_ms: u64,
    /// Backoff between election rounds that lost a race.
    pub backoff: RetryConfig,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            expiry_ms: 10_000,
            heartbeat_interval_ms: 3_000,
            retry_interval_ms: 15_000,
            backoff: RetryConfig {
                max_attempts: 5,
                base_delay_ms: 50,
                multiplier: 2.0,
                max_delay_ms: 1_000,
                jitter: true,
            },
        }
    }
}

// ── Mutex ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct MutexConfig {
    /// Lock lifetime used when a caller does not pass one.
    pub default_timeout_ms: u64,
}

impl Default for MutexConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 5_000,
        }
    }
}

// ── Consumers ───────────────────────────────────────────────────

/// Agency selection lock settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct AgencyConfig {
    pub lock_timeout_ms: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for AgencyConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 10_000,
            retry_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

/// Session refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Refresh a session this long before it expires.
    pub refresh_margin_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            refresh_margin_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "tabsync=info,warn".into(),
        }
    }
}

// ── Shared ──────────────────────────────────────────────────────

/// Retry schedule, see [`crate::retry::RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 2_000,
            jitter: true,
        }
    }
}
