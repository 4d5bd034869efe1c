//! Named, expiring advisory locks over the shared store.
//!
//! A lock is the record at `<prefix>_mutex_<name>`. `expiresAt` is the only
//! expiry mechanism: every acquirer removes an expired record before writing
//! its own, and the holder schedules a local timer that releases at expiry.
//! Releases check both `tabId` and `lockId`, so a participant whose lock
//! expired and was re-acquired elsewhere cannot delete the new holder's record.

use crate::clock::{duration_ms, Clock};
use crate::retry::RetryPolicy;
use crate::storage::{decode_json, StorageAccessor};
use crate::sync::channel::BroadcastChannel;
use crate::sync::protocol::{BroadcastMessage, KeySpace, MutexRecord};
use crate::sync::CoordinationError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// A lock this participant currently holds.
struct HeldLock {
    lock_id: String,
    expires_at: i64,
    timer: Option<JoinHandle<()>>,
}

pub struct MutexManager {
    tab_id: String,
    keys: KeySpace,
    accessor: Arc<StorageAccessor>,
    channel: Arc<BroadcastChannel>,
    clock: Arc<dyn Clock>,
    held: Mutex<HashMap<String, HeldLock>>,
    this: Weak<MutexManager>,
}

impl MutexManager {
    pub fn new(
        tab_id: &str,
        keys: KeySpace,
        accessor: Arc<StorageAccessor>,
        channel: Arc<BroadcastChannel>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            tab_id: tab_id.to_string(),
            keys,
            accessor,
            channel,
            clock,
            held: Mutex::new(HashMap::new()),
            this: this.clone(),
        })
    }

    /// Try once to take `lock_name` for `timeout`. Never waits.
    ///
    /// Fails if this participant already holds it, if another participant
    /// holds a live record, or if our write does not survive verification.
    pub fn acquire_mutex(&self, lock_name: &str, timeout: Duration) -> bool {
        // Held for the whole attempt so two local callers cannot both claim
        // the same name between the check and the insert.
        let mut held = self.held.lock();
        if held.contains_key(lock_name) {
            tracing::debug!(tab_id = %self.tab_id, lock = lock_name, "Lock already held locally");
            return false;
        }

        let key = self.keys.mutex(lock_name);
        let now = self.clock.now_ms();
        let mut expected = self.accessor.get(&key);

        if let Some(raw) = expected.clone() {
            match decode_json::<MutexRecord>(&key, &raw) {
                Some(existing) if !existing.is_expired(now) => {
                    tracing::debug!(tab_id = %self.tab_id, lock = lock_name, holder = %existing.tab_id, "Lock is held");
                    return false;
                }
                // Expired or corrupted: clear it before claiming.
                _ => {
                    let cleared = if self.accessor.atomic() {
                        self.accessor.compare_and_swap(&key, Some(&raw), None)
                    } else {
                        self.accessor.remove(&key)
                    };
                    if !cleared {
                        return false;
                    }
                    expected = None;
                }
            }
        }

        let record = MutexRecord::new(&self.tab_id, now, duration_ms(timeout));
        if !self.write_verified(&key, expected.as_deref(), &record) {
            tracing::debug!(tab_id = %self.tab_id, lock = lock_name, "Lost lock race");
            return false;
        }

        let timer = self.schedule_expiry(lock_name, &record.lock_id, timeout);
        held.insert(
            lock_name.to_string(),
            HeldLock {
                lock_id: record.lock_id.clone(),
                expires_at: record.expires_at,
                timer,
            },
        );
        drop(held);

        tracing::debug!(tab_id = %self.tab_id, lock = lock_name, expires_at = record.expires_at, "Acquired lock");
        self.channel.post_message(BroadcastMessage::MutexLock {
            lock_name: lock_name.to_string(),
            lock_id: record.lock_id,
            expires_at: record.expires_at,
        });
        true
    }

    fn write_verified(&self, key: &str, expected: Option<&str>, record: &MutexRecord) -> bool {
        let Ok(json) = serde_json::to_string(record) else {
            return false;
        };
        if self.accessor.atomic() {
            return self.accessor.compare_and_swap(key, expected, Some(&json));
        }
        if !self.accessor.set(key, &json) {
            return false;
        }
        self.accessor
            .get_json::<MutexRecord>(key)
            .is_some_and(|stored| stored.is_owned_by(&record.tab_id, &record.lock_id))
    }

    fn schedule_expiry(
        &self,
        lock_name: &str,
        lock_id: &str,
        timeout: Duration,
    ) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let manager = self.this.clone();
        let lock_name = lock_name.to_string();
        let lock_id = lock_id.to_string();
        Some(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(manager) = manager.upgrade() {
                manager.expire(&lock_name, &lock_id);
            }
        }))
    }

    /// Timer path: release only if the same acquisition is still held.
    fn expire(&self, lock_name: &str, lock_id: &str) {
        let still_held = self
            .held
            .lock()
            .get(lock_name)
            .is_some_and(|h| h.lock_id == lock_id);
        if still_held {
            tracing::debug!(tab_id = %self.tab_id, lock = lock_name, "Lock timed out, releasing");
            self.release_mutex(lock_name);
        }
    }

    /// Release a lock we hold. Returns whether the stored record was removed.
    ///
    /// A name this participant does not hold is a no-op. The stored record is
    /// only removed while it still carries our `tabId` and `lockId`.
    pub fn release_mutex(&self, lock_name: &str) -> bool {
        let Some(held) = self.held.lock().remove(lock_name) else {
            return false;
        };
        if let Some(timer) = held.timer {
            timer.abort();
        }

        let key = self.keys.mutex(lock_name);
        let removed = match self.accessor.get(&key) {
            Some(raw) => {
                let ours = decode_json::<MutexRecord>(&key, &raw)
                    .is_some_and(|r| r.is_owned_by(&self.tab_id, &held.lock_id));
                if !ours {
                    tracing::debug!(tab_id = %self.tab_id, lock = lock_name, "Lock was taken over, leaving record");
                    false
                } else if self.accessor.atomic() {
                    self.accessor.compare_and_swap(&key, Some(&raw), None)
                } else {
                    self.accessor.remove(&key)
                }
            }
            None => false,
        };

        self.channel.post_message(BroadcastMessage::MutexUnlock {
            lock_name: lock_name.to_string(),
            lock_id: held.lock_id,
        });
        removed
    }

    /// Acquire and return a guard that releases on drop.
    pub fn lock(&self, lock_name: &str, timeout: Duration) -> Option<LockGuard> {
        if !self.acquire_mutex(lock_name, timeout) {
            return None;
        }
        let manager = self.this.upgrade()?;
        Some(LockGuard {
            manager,
            lock_name: lock_name.to_string(),
            released: false,
        })
    }

    /// Poll [`MutexManager::lock`] on `policy`'s schedule.
    pub async fn acquire_with_retry(
        &self,
        lock_name: &str,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<LockGuard, CoordinationError> {
        let mut attempts = 0;
        loop {
            if let Some(guard) = self.lock(lock_name, timeout) {
                return Ok(guard);
            }
            attempts += 1;
            if !policy.allows(attempts) {
                return Err(CoordinationError::AcquireTimeout {
                    lock: lock_name.to_string(),
                    attempts,
                });
            }
            tokio::time::sleep(policy.delay_for(attempts - 1)).await;
        }
    }

    /// Whether anyone holds a live record for `lock_name`.
    pub fn is_locked(&self, lock_name: &str) -> bool {
        let key = self.keys.mutex(lock_name);
        self.accessor
            .get_json::<MutexRecord>(&key)
            .is_some_and(|r| !r.is_expired(self.clock.now_ms()))
    }

    /// Whether this participant holds `lock_name` and it has not expired.
    pub fn holds(&self, lock_name: &str) -> bool {
        let now = self.clock.now_ms();
        self.held
            .lock()
            .get(lock_name)
            .is_some_and(|h| now <= h.expires_at)
    }

    pub fn held_locks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.held.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Release everything this participant holds. Returns how many records were removed.
    pub fn release_all(&self) -> usize {
        self.held_locks()
            .iter()
            .filter(|name| self.release_mutex(name))
            .count()
    }
}

/// Holds a lock until dropped or explicitly released.
pub struct LockGuard {
    manager: Arc<MutexManager>,
    lock_name: String,
    released: bool,
}

impl LockGuard {
    pub fn lock_name(&self) -> &str {
        &self.lock_name
    }

    pub fn release(mut self) -> bool {
        self.released = true;
        self.manager.release_mutex(&self.lock_name)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.manager.release_mutex(&self.lock_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::{MemoryStore, RetentionPolicy, SharedStore};
    use crate::sync::channel::BroadcastHub;
    use crate::sync::election::tests::InterleavingStore;
    use crate::sync::protocol::MessageKind;

    const SECOND: Duration = Duration::from_secs(1);

    fn manager(
        id: &str,
        store: Arc<dyn SharedStore>,
        hub: &BroadcastHub,
        clock: Arc<ManualClock>,
    ) -> Arc<MutexManager> {
        let accessor = Arc::new(StorageAccessor::new(
            store,
            clock.clone(),
            RetentionPolicy {
                retention_ms: 60_000,
                essential_prefixes: Vec::new(),
            },
            true,
        ));
        let channel = Arc::new(BroadcastChannel::open(hub, id, clock.clone()));
        MutexManager::new(id, KeySpace::new("app"), accessor, channel, clock)
    }

    fn setup() -> (Arc<dyn SharedStore>, BroadcastHub, Arc<ManualClock>) {
        (
            Arc::new(MemoryStore::with_capacity(8_192)),
            BroadcastHub::new(),
            Arc::new(ManualClock::new(0)),
        )
    }

    #[test]
    fn second_acquire_from_same_participant_fails() {
        let (store, hub, clock) = setup();
        let a = manager("A", store, &hub, clock);
        assert!(a.acquire_mutex("x", 5 * SECOND));
        assert!(!a.acquire_mutex("x", 5 * SECOND));
        assert_eq!(a.held_locks(), vec!["x".to_string()]);
    }

    #[test]
    fn live_lock_blocks_other_participants() {
        let (store, hub, clock) = setup();
        let a = manager("A", store.clone(), &hub, clock.clone());
        let b = manager("B", store, &hub, clock);
        assert!(a.acquire_mutex("x", 5 * SECOND));
        assert!(!b.acquire_mutex("x", 5 * SECOND));
        assert!(b.is_locked("x"));
        assert!(b.acquire_mutex("y", 5 * SECOND));
    }

    #[test]
    fn expired_record_is_cleaned_and_claimed() {
        let (store, hub, clock) = setup();
        store
            .set(
                "app_mutex_x",
                r#"{"tabId":"A","timestamp":0,"expiresAt":1000,"lockId":"L1"}"#,
            )
            .unwrap();
        clock.set(1_001);
        let b = manager("B", store.clone(), &hub, clock);
        assert!(b.acquire_mutex("x", 5 * SECOND));

        let raw = store.get("app_mutex_x").unwrap().unwrap();
        let record: MutexRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record.tab_id, "B");
        assert_eq!(record.expires_at, 6_001);
    }

    #[test]
    fn corrupted_record_does_not_block_forever() {
        let (store, hub, clock) = setup();
        store.set("app_mutex_x", "%%%").unwrap();
        let a = manager("A", store, &hub, clock);
        assert!(a.acquire_mutex("x", SECOND));
    }

    #[test]
    fn release_by_non_holder_leaves_record() {
        let (store, hub, clock) = setup();
        store
            .set(
                "app_mutex_lock1",
                r#"{"tabId":"A","timestamp":0,"expiresAt":99999,"lockId":"L1"}"#,
            )
            .unwrap();
        let b = manager("B", store.clone(), &hub, clock);
        assert!(!b.release_mutex("lock1"));
        assert!(store.get("app_mutex_lock1").unwrap().is_some());
    }

    #[test]
    fn stale_holder_cannot_release_new_owner() {
        let (store, hub, clock) = setup();
        let a = manager("A", store.clone(), &hub, clock.clone());
        let b = manager("B", store.clone(), &hub, clock.clone());

        assert!(a.acquire_mutex("x", SECOND));
        clock.advance(2 * SECOND);
        assert!(!a.holds("x"));
        assert!(b.acquire_mutex("x", SECOND));

        // A still has a local entry (no runtime, so no timer fired).
        assert!(!a.release_mutex("x"));
        assert!(a.held_locks().is_empty());
        assert!(b.is_locked("x"));
        assert!(b.release_mutex("x"));
        assert!(!b.is_locked("x"));
    }

    #[test]
    fn release_never_held_is_silent() {
        let (store, hub, clock) = setup();
        let a = manager("A", store.clone(), &hub, clock.clone());
        let b = manager("B", store, &hub, clock);
        let hits = Arc::new(Mutex::new(0));
        let sink = Arc::clone(&hits);
        b.channel
            .add_event_listener(MessageKind::MutexUnlock, move |_| *sink.lock() += 1);

        assert!(!a.release_mutex("nothing"));
        b.channel.drain();
        assert_eq!(*hits.lock(), 0);
    }

    #[test]
    fn acquire_and_release_are_broadcast() {
        let (store, hub, clock) = setup();
        let a = manager("A", store.clone(), &hub, clock.clone());
        let b = manager("B", store, &hub, clock);
        let seen = Arc::new(Mutex::new(Vec::new()));
        for kind in [MessageKind::MutexLock, MessageKind::MutexUnlock] {
            let sink = Arc::clone(&seen);
            b.channel
                .add_event_listener(kind, move |env| sink.lock().push(env.message.kind()));
        }

        assert!(a.acquire_mutex("x", SECOND));
        assert!(a.release_mutex("x"));
        b.channel.drain();
        assert_eq!(
            *seen.lock(),
            vec![MessageKind::MutexLock, MessageKind::MutexUnlock]
        );
    }

    #[test]
    fn guard_releases_on_drop() {
        let (store, hub, clock) = setup();
        let a = manager("A", store.clone(), &hub, clock.clone());
        let b = manager("B", store, &hub, clock);
        {
            let guard = a.lock("x", SECOND).unwrap();
            assert_eq!(guard.lock_name(), "x");
            assert!(b.lock("x", SECOND).is_none());
        }
        assert!(b.lock("x", SECOND).is_some());
    }

    #[test]
    fn release_all_clears_everything() {
        let (store, hub, clock) = setup();
        let a = manager("A", store.clone(), &hub, clock);
        assert!(a.acquire_mutex("x", SECOND));
        assert!(a.acquire_mutex("y", SECOND));
        assert_eq!(a.release_all(), 2);
        assert!(store.keys().unwrap().is_empty());
    }

    /// Lock holder acquires at t=0 for 2s; a second participant polls at
    /// 100ms and then every 500ms. It gets the lock on the first poll after
    /// expiry.
    #[test]
    fn contender_wins_after_holder_expires() {
        let (store, hub, clock) = setup();
        let tab1 = manager("tab1", store.clone(), &hub, clock.clone());
        let tab2 = manager("tab2", store, &hub, clock.clone());

        assert!(tab1.acquire_mutex("agency_selection", 2 * SECOND));
        clock.set(100);
        assert!(!tab2.acquire_mutex("agency_selection", 2 * SECOND));

        let mut won_at = None;
        for _ in 0..5 {
            clock.advance(Duration::from_millis(500));
            if tab2.acquire_mutex("agency_selection", 2 * SECOND) {
                won_at = Some(clock.now_ms());
                break;
            }
        }
        assert_eq!(won_at, Some(2_100));
    }

    #[tokio::test]
    async fn timer_releases_at_expiry() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::with_capacity(8_192));
        let hub = BroadcastHub::new();
        let clock = Arc::new(ManualClock::new(0));
        let a = manager("A", store.clone(), &hub, clock);

        assert!(a.acquire_mutex("x", Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(a.held_locks().is_empty());
        assert!(store.get("app_mutex_x").unwrap().is_none());
    }

    #[tokio::test]
    async fn acquire_with_retry_reports_timeout() {
        let (store, hub, clock) = setup();
        let a = manager("A", store.clone(), &hub, clock.clone());
        let b = manager("B", store, &hub, clock);
        let _held = a.lock("x", 60 * SECOND).unwrap();

        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));
        match b.acquire_with_retry("x", SECOND, &policy).await {
            Err(CoordinationError::AcquireTimeout { lock, attempts }) => {
                assert_eq!(lock, "x");
                assert_eq!(attempts, 3);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("lock should be busy"),
        }
    }

    #[test]
    fn concurrent_local_acquires_grant_one() {
        for _ in 0..20 {
            let store: Arc<dyn SharedStore> = Arc::new(InterleavingStore::new(200));
            let hub = BroadcastHub::new();
            let a = manager("A", store.clone(), &hub, Arc::new(ManualClock::new(0)));

            let granted = std::thread::scope(|s| {
                let attempts: Vec<_> = (0..6)
                    .map(|_| s.spawn(|| a.acquire_mutex("x", 5 * SECOND)))
                    .collect();
                attempts
                    .into_iter()
                    .map(|h| h.join().unwrap())
                    .filter(|ok| *ok)
                    .count()
            });

            assert_eq!(granted, 1);
            assert_eq!(a.held_locks(), vec!["x".to_string()]);
            assert!(a.release_mutex("x"));
            assert!(store.get("app_mutex_x").unwrap().is_none());
        }
    }

    /// Verify-after-write can let two participants both think they hold the
    /// lock; the store still names exactly one owner and only that owner's
    /// release removes it.
    #[test]
    fn racing_acquires_without_cas_leave_single_stored_owner() {
        for _ in 0..20 {
            let store: Arc<dyn SharedStore> = Arc::new(InterleavingStore::new(300));
            let hub = BroadcastHub::new();
            let clock = Arc::new(ManualClock::new(0));
            let managers: Vec<_> = (0..4)
                .map(|i| manager(&format!("T{i}"), store.clone(), &hub, clock.clone()))
                .collect();

            std::thread::scope(|s| {
                for m in &managers {
                    s.spawn(|| m.acquire_mutex("x", 5 * SECOND));
                }
            });

            let holders = managers.iter().filter(|m| m.holds("x")).count();
            assert!(holders >= 1);
            let removed = managers.iter().filter(|m| m.release_mutex("x")).count();
            assert_eq!(removed, 1);
            assert!(store.get("app_mutex_x").unwrap().is_none());
        }
    }
}
