//! In-process shared store.
//!
//! Participants in the same process share one `Arc<MemoryStore>` the way
//! browser tabs of one origin share their storage area.

use super::{SharedStore, StoreError};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// Capacity-limited in-memory map. Capacity counts key and value bytes.
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
    capacity_bytes: usize,
}

impl MemoryStore {
    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capacity_bytes,
        }
    }

    /// Bytes currently used.
    pub fn used_bytes(&self) -> usize {
        let entries = self.entries.lock();
        entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn check_capacity(
        &self,
        entries: &BTreeMap<String, String>,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let used: usize = entries
            .iter()
            .filter(|(k, _)| k.as_str() != key)
            .map(|(k, v)| k.len() + v.len())
            .sum();
        if used + key.len() + value.len() > self.capacity_bytes {
            return Err(StoreError::QuotaExceeded);
        }
        Ok(())
    }
}

impl SharedStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        self.check_capacity(&entries, key, value)?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.entries.lock().keys().cloned().collect())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        if entries.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                self.check_capacity(&entries, key, value)?;
                entries.insert(key.to_string(), value.to_string());
            }
            None => {
                entries.remove(key);
            }
        }
        Ok(true)
    }

    fn supports_atomic(&self) -> bool {
        true
    }
}
