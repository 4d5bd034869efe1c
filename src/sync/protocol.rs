//! Shared-store record schema and broadcast message types.
//!
//! Records are JSON with camelCase fields and live under
//! `<prefix>_master_tab` and `<prefix>_mutex_<name>`. Any participant sharing
//! the store can read them, so this module is effectively the wire format.

use serde::{Deserialize, Serialize};

/// Record schema version written by this crate.
pub const SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    SCHEMA_VERSION
}

// ── Keys ────────────────────────────────────────────────────────

/// Namespaced store keys for one application prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn master(&self) -> String {
        format!("{}_master_tab", self.prefix)
    }

    pub fn mutex(&self, lock_name: &str) -> String {
        format!("{}_mutex_{lock_name}", self.prefix)
    }

    /// Lock name for a mutex key, or `None` if the key is not one.
    pub fn lock_name<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix("_mutex_")
    }
}

// ── Participant ids ─────────────────────────────────────────────

const TAB_SUFFIX_LEN: usize = 8;

/// `tab_<13-digit ms>_<8 base36 chars>`.
///
/// Zero padding keeps lexicographic order equal to creation order, so older
/// participants outrank newer ones when an election is challenged.
pub fn generate_tab_id(now_ms: i64) -> String {
    use rand::RngExt;
    const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    let suffix: String = (0..TAB_SUFFIX_LEN)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("tab_{:013}_{suffix}", now_ms.max(0))
}

/// Fresh election tiebreaker: `now_ms + U[0, 1)`.
pub fn generate_version(now_ms: i64) -> f64 {
    now_ms as f64 + rand::random::<f64>()
}

// ── Records ─────────────────────────────────────────────────────

/// Who the master is and when it last proved liveness.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterRecord {
    pub tab_id: String,
    pub timestamp: i64,
    pub last_heartbeat: i64,
    pub version: f64,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl MasterRecord {
    pub fn new(tab_id: &str, now_ms: i64) -> Self {
        Self {
            tab_id: tab_id.to_string(),
            timestamp: now_ms,
            last_heartbeat: now_ms,
            version: generate_version(now_ms),
            schema_version: SCHEMA_VERSION,
        }
    }

    /// Stale once `now > lastHeartbeat + expiry`.
    pub fn is_stale(&self, now_ms: i64, expiry_ms: i64) -> bool {
        now_ms > self.last_heartbeat.saturating_add(expiry_ms)
    }

    /// Written by a newer schema than this crate understands.
    pub fn is_foreign(&self) -> bool {
        self.schema_version > SCHEMA_VERSION
    }
}

/// One acquisition of a named advisory lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutexRecord {
    pub tab_id: String,
    pub timestamp: i64,
    pub expires_at: i64,
    pub lock_id: String,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

impl MutexRecord {
    pub fn new(tab_id: &str, now_ms: i64, timeout_ms: i64) -> Self {
        Self {
            tab_id: tab_id.to_string(),
            timestamp: now_ms,
            expires_at: now_ms.saturating_add(timeout_ms),
            lock_id: uuid::Uuid::new_v4().to_string(),
            schema_version: SCHEMA_VERSION,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at
    }

    pub fn is_owned_by(&self, tab_id: &str, lock_id: &str) -> bool {
        self.tab_id == tab_id && self.lock_id == lock_id
    }
}

// ── Broadcast messages ──────────────────────────────────────────

/// Discriminant of a [`BroadcastMessage`], used to register listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    MasterChanged,
    MutexLock,
    MutexUnlock,
    AuthStateChange,
    ModalState,
}

/// Auth lifecycle events relayed to other participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// Everything sent over the broadcast channel.
///
/// Delivery is best-effort; the store stays the source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BroadcastMessage {
    /// `master_tab = None` means the master stepped down.
    #[serde(rename_all = "camelCase")]
    MasterChanged {
        master_tab: Option<String>,
        version: Option<f64>,
    },

    #[serde(rename_all = "camelCase")]
    MutexLock {
        lock_name: String,
        lock_id: String,
        expires_at: i64,
    },

    #[serde(rename_all = "camelCase")]
    MutexUnlock { lock_name: String, lock_id: String },

    /// Session payload is opaque JSON so consumers own its shape.
    #[serde(rename_all = "camelCase")]
    AuthStateChange {
        event: AuthEvent,
        session: Option<serde_json::Value>,
    },

    #[serde(rename_all = "camelCase")]
    ModalState { modal: String, open: bool },
}

impl BroadcastMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::MasterChanged { .. } => MessageKind::MasterChanged,
            Self::MutexLock { .. } => MessageKind::MutexLock,
            Self::MutexUnlock { .. } => MessageKind::MutexUnlock,
            Self::AuthStateChange { .. } => MessageKind::AuthStateChange,
            Self::ModalState { .. } => MessageKind::ModalState,
        }
    }
}

/// A message plus its origin, as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub message: BroadcastMessage,
    pub tab_id: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let keys = KeySpace::new("crm");
        assert_eq!(keys.master(), "crm_master_tab");
        assert_eq!(keys.mutex("agency_selection"), "crm_mutex_agency_selection");
        assert_eq!(keys.lock_name("crm_mutex_agency_selection"), Some("agency_selection"));
        assert_eq!(keys.lock_name("crm_master_tab"), None);
        assert_eq!(keys.lock_name("other_mutex_x"), None);
    }

    #[test]
    fn tab_ids_sort_by_creation_time() {
        let early = generate_tab_id(999);
        let late = generate_tab_id(1_700_000_000_000);
        assert!(early < late);
        assert_eq!(early.len(), "tab_".len() + 13 + 1 + TAB_SUFFIX_LEN);
        assert_ne!(generate_tab_id(5), generate_tab_id(5));
    }

    #[test]
    fn master_record_uses_camel_case_wire_names() {
        let record = MasterRecord::new("tab_a", 1_000);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["tabId"], "tab_a");
        assert_eq!(json["lastHeartbeat"], 1_000);
        assert_eq!(json["schemaVersion"], 1);
        assert!(json["version"].as_f64().unwrap() >= 1_000.0);
    }

    #[test]
    fn records_without_schema_version_default_to_current() {
        let legacy = r#"{"tabId":"A","timestamp":1,"expiresAt":2,"lockId":"L1"}"#;
        let record: MutexRecord = serde_json::from_str(legacy).unwrap();
        assert_eq!(record.schema_version, SCHEMA_VERSION);
        assert!(record.is_owned_by("A", "L1"));
        assert!(!record.is_owned_by("B", "L1"));
    }

    #[test]
    fn staleness_and_expiry_boundaries() {
        let master = MasterRecord::new("t", 1_000);
        assert!(!master.is_stale(6_000, 5_000));
        assert!(master.is_stale(6_001, 5_000));

        let lock = MutexRecord::new("t", 1_000, 2_000);
        assert_eq!(lock.expires_at, 3_000);
        assert!(!lock.is_expired(3_000));
        assert!(lock.is_expired(3_001));
    }

    #[test]
    fn envelope_wire_shape() {
        let env = Envelope {
            message: BroadcastMessage::MutexLock {
                lock_name: "x".into(),
                lock_id: "L".into(),
                expires_at: 10,
            },
            tab_id: "tab_1".into(),
            timestamp: 5,
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "MUTEX_LOCK");
        assert_eq!(json["data"]["lockName"], "x");
        assert_eq!(json["tabId"], "tab_1");

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back.message.kind(), MessageKind::MutexLock);
    }

    #[test]
    fn foreign_schema_detected() {
        let mut record = MasterRecord::new("t", 0);
        record.schema_version = SCHEMA_VERSION + 1;
        assert!(record.is_foreign());
    }
}
