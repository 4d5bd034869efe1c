//! SQLite-backed shared store.
//!
//! Several processes on one host open the same database file and coordinate
//! through it. Table:
//! - `kv`: key, value, updated_at

use super::{SharedStore, StoreError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::time::Duration;

/// How long a writer waits on another process's lock before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteStore {
    conn: Mutex<Connection>,
    capacity_bytes: usize,
}

impl SqliteStore {
    /// Open (or create) the store database at the given path.
    pub fn open(path: &Path, capacity_bytes: usize) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init(conn, capacity_bytes)
    }

    pub fn open_in_memory(capacity_bytes: usize) -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?, capacity_bytes)
    }

    fn init(conn: Connection, capacity_bytes: usize) -> Result<Self, StoreError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL mode for concurrent readers across processes
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;

             CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
             );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            capacity_bytes,
        })
    }

    fn check_capacity(&self, conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(CAST(key AS BLOB)) + LENGTH(CAST(value AS BLOB))), 0)
             FROM kv WHERE key != ?1",
            params![key],
            |row| row.get(0),
        )?;
        let used = usize::try_from(used).unwrap_or(0);
        if used + key.len() + value.len() > self.capacity_bytes {
            return Err(StoreError::QuotaExceeded);
        }
        Ok(())
    }
}

fn upsert(conn: &Connection, key: &str, value: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, chrono::Utc::now().timestamp_millis()],
    )?;
    Ok(())
}

fn read(conn: &Connection, key: &str) -> Result<Option<String>, StoreError> {
    Ok(conn
        .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
            row.get(0)
        })
        .optional()?)
}

impl SharedStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock();
        read(&conn, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        self.check_capacity(&tx, key, value)?;
        upsert(&tx, key, value)?;
        tx.commit()?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.lock();
        // IMMEDIATE takes the write lock up front so no other process can
        // slip a write between the read and the swap.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = read(&tx, key)?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        match new {
            Some(value) => {
                self.check_capacity(&tx, key, value)?;
                upsert(&tx, key, value)?;
            }
            None => {
                tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            }
        }
        tx.commit()?;
        Ok(true)
    }

    fn supports_atomic(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn set_get_remove_roundtrip() {
        let store = SqliteStore::open_in_memory(1_024).unwrap();
        store.set("a", "1").unwrap();
        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));
        store.remove("a").unwrap();
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn quota_counts_bytes() {
        let store = SqliteStore::open_in_memory(10).unwrap();
        store.set("k", "é".repeat(4).as_str()).unwrap();
        assert!(matches!(store.set("j", "xx"), Err(StoreError::QuotaExceeded)));
    }

    #[test]
    fn two_handles_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let first = SqliteStore::open(&path, 4_096).unwrap();
        let second = SqliteStore::open(&path, 4_096).unwrap();

        assert!(first.compare_and_swap("lock", None, Some("A")).unwrap());
        assert!(!second.compare_and_swap("lock", None, Some("B")).unwrap());
        assert_eq!(second.get("lock").unwrap().as_deref(), Some("A"));
        assert_eq!(second.keys().unwrap(), vec!["lock".to_string()]);
    }

    #[test]
    fn concurrent_cas_has_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        SqliteStore::open(&path, 4_096).unwrap();

        let winners = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let path = path.clone();
                let winners = Arc::clone(&winners);
                std::thread::spawn(move || {
                    let store = SqliteStore::open(&path, 4_096).unwrap();
                    let me = format!("p{i}");
                    if store.compare_and_swap("slot", None, Some(&me)).unwrap() {
                        winners.lock().push(me);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.lock().len(), 1);
    }
}
