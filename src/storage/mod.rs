//! Shared key-value store and the error-absorbing accessor in front of it.
//!
//! Every participant reads and writes coordination records through a
//! [`StorageAccessor`]. Raw backends report failures as [`StoreError`]; the
//! accessor turns all of them into `None`/`false` so callers never handle
//! storage faults directly. A write rejected for capacity triggers one cleanup
//! pass and exactly one retry.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::clock::Clock;
use crate::config::Config;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// Failure reported by a raw store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage quota exceeded")]
    QuotaExceeded,
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("operation not supported by this store")]
    Unsupported,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// A synchronous, capacity-limited string store shared by all participants.
///
/// Visibility is last-write-wins. Backends that can perform a conditional
/// write atomically override [`SharedStore::compare_and_swap`] and report it
/// through [`SharedStore::supports_atomic`].
pub trait SharedStore: Send + Sync {
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn remove(&self, key: &str) -> Result<(), StoreError>;

    fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Replace the value at `key` only if it currently equals `expected`
    /// (`None` = absent). `new = None` deletes. Returns whether the swap happened.
    fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&str>,
        _new: Option<&str>,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unsupported)
    }

    fn supports_atomic(&self) -> bool {
        false
    }
}

/// Factory: create the store backend named in config.
pub fn create_store(config: &Config) -> anyhow::Result<Arc<dyn SharedStore>> {
    let storage = &config.storage;
    match storage.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::with_capacity(storage.capacity_bytes))),
        "sqlite" => {
            let path = config.store_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Arc::new(SqliteStore::open(&path, storage.capacity_bytes)?))
        }
        other if other.trim().is_empty() => {
            anyhow::bail!("storage.backend cannot be empty. Supported values: memory, sqlite")
        }
        other => anyhow::bail!("Unknown storage backend '{other}'. Supported values: memory, sqlite"),
    }
}

/// What the cleanup pass may delete.
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Entries with a `timestamp` older than `now - retention_ms` are removed.
    pub retention_ms: i64,
    /// Keys starting with any of these are never removed.
    pub essential_prefixes: Vec<String>,
}

impl RetentionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retention_ms: i64::try_from(config.storage.retention_secs)
                .unwrap_or(i64::MAX / 1000)
                .saturating_mul(1000),
            essential_prefixes: config
                .storage
                .essential_keys
                .iter()
                .map(|k| format!("{}_{k}", config.app_prefix))
                .collect(),
        }
    }

    pub fn is_essential(&self, key: &str) -> bool {
        self.essential_prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }
}

/// Error-absorbing front for a [`SharedStore`].
pub struct StorageAccessor {
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    retention: RetentionPolicy,
    atomic_writes: bool,
}

impl StorageAccessor {
    pub fn new(
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        retention: RetentionPolicy,
        atomic_writes: bool,
    ) -> Self {
        Self {
            store,
            clock,
            retention,
            atomic_writes,
        }
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    /// Whether conditional writes go through the store's compare-and-swap.
    pub fn atomic(&self) -> bool {
        self.atomic_writes && self.store.supports_atomic()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(key, "Storage read failed: {e}");
                None
            }
        }
    }

    pub fn set(&self, key: &str, value: &str) -> bool {
        match self.store.set(key, value) {
            Ok(()) => true,
            Err(StoreError::QuotaExceeded) => {
                let removed = self.cleanup();
                tracing::warn!(key, removed, "Storage quota exceeded, retrying after cleanup");
                match self.store.set(key, value) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!(key, "Storage write failed after cleanup: {e}");
                        false
                    }
                }
            }
            Err(e) => {
                tracing::warn!(key, "Storage write failed: {e}");
                false
            }
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        match self.store.remove(key) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key, "Storage remove failed: {e}");
                false
            }
        }
    }

    /// Conditional write. `false` on conflict, on error, or when the store
    /// has no compare-and-swap.
    pub fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: Option<&str>) -> bool {
        let attempt = self.store.compare_and_swap(key, expected, new);
        let attempt = match (attempt, new) {
            (Err(StoreError::QuotaExceeded), Some(_)) => {
                let removed = self.cleanup();
                tracing::warn!(key, removed, "Storage quota exceeded, retrying after cleanup");
                self.store.compare_and_swap(key, expected, new)
            }
            (other, _) => other,
        };
        match attempt {
            Ok(swapped) => swapped,
            Err(e) => {
                tracing::warn!(key, "Storage conditional write failed: {e}");
                false
            }
        }
    }

    /// Read and decode a JSON record. Undecodable values read as absent.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        decode_json(key, &raw)
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw),
            Err(e) => {
                tracing::warn!(key, "Failed to encode entry: {e}");
                false
            }
        }
    }

    /// Remove aged entries to free capacity. Returns how many were removed.
    ///
    /// An entry is aged when its JSON object has an `expiresAt` in the past,
    /// or has no `expiresAt` and a `timestamp` older than the retention
    /// window. Essential keys and values without those fields are kept.
    pub fn cleanup(&self) -> usize {
        let keys = match self.store.keys() {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!("Storage cleanup could not list keys: {e}");
                return 0;
            }
        };

        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(self.retention.retention_ms);
        let mut removed = 0;

        for key in keys {
            if self.retention.is_essential(&key) {
                continue;
            }
            let Ok(Some(raw)) = self.store.get(&key) else {
                continue;
            };
            if !is_aged(&raw, now, cutoff) {
                continue;
            }
            // In atomic mode only delete the exact value judged aged; a
            // participant may have written a live record since the read.
            let result = if self.atomic() {
                self.store.compare_and_swap(&key, Some(&raw), None)
            } else {
                self.store.remove(&key).map(|()| true)
            };
            match result {
                Ok(true) => removed += 1,
                Ok(false) => tracing::debug!(key, "Storage cleanup skipped entry rewritten since read"),
                Err(e) => tracing::warn!(key, "Storage cleanup remove failed: {e}"),
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Storage cleanup removed aged entries");
        }
        removed
    }
}

/// Decode a stored JSON value, logging and discarding corrupted ones.
pub fn decode_json<T: DeserializeOwned>(key: &str, raw: &str) -> Option<T> {
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, "Ignoring corrupted entry: {e}");
            None
        }
    }
}

fn is_aged(raw: &str, now: i64, cutoff: i64) -> bool {
    let Ok(serde_json::Value::Object(fields)) = serde_json::from_str::<serde_json::Value>(raw)
    else {
        return false;
    };
    // An explicit expiry decides on its own: a lock acquired long ago but
    // extended into the future is still live.
    if let Some(at) = fields.get("expiresAt").and_then(serde_json::Value::as_i64) {
        return at < now;
    }
    fields
        .get("timestamp")
        .and_then(serde_json::Value::as_i64)
        .is_some_and(|ts| ts < cutoff)
}
