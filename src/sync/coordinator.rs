//! One participant's coordination state.
//!
//! A [`TabCoordinator`] owns everything a participant needs: its id, the
//! accessor over the shared store, its endpoint on the broadcast hub, the
//! master election and the mutex manager. Construct one per participant,
//! call [`TabCoordinator::start`] inside a tokio runtime, and call
//! [`TabCoordinator::shutdown`] when the participant goes away.

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::retry::RetryPolicy;
use crate::storage::{decode_json, RetentionPolicy, SharedStore, StorageAccessor};
use crate::sync::channel::{BroadcastChannel, BroadcastHub};
use crate::sync::election::{ElectionSettings, MasterElection};
use crate::sync::mutex::{LockGuard, MutexManager};
use crate::sync::protocol::{
    generate_tab_id, AuthEvent, BroadcastMessage, Envelope, KeySpace, MasterRecord, MessageKind,
    MutexRecord,
};
use crate::sync::CoordinationError;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct TabCoordinator {
    tab_id: String,
    config: Config,
    keys: KeySpace,
    accessor: Arc<StorageAccessor>,
    channel: Arc<BroadcastChannel>,
    election: Arc<MasterElection>,
    mutexes: Arc<MutexManager>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TabCoordinator {
    pub fn new(config: &Config, store: Arc<dyn SharedStore>, hub: &BroadcastHub) -> Self {
        Self::with_clock(config, store, hub, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &Config,
        store: Arc<dyn SharedStore>,
        hub: &BroadcastHub,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tab_id = generate_tab_id(clock.now_ms());
        let keys = KeySpace::new(config.app_prefix.clone());
        let accessor = Arc::new(StorageAccessor::new(
            store,
            Arc::clone(&clock),
            RetentionPolicy::from_config(config),
            config.storage.atomic_writes,
        ));
        let channel = Arc::new(BroadcastChannel::open(hub, &tab_id, Arc::clone(&clock)));
        let election = MasterElection::new(
            &tab_id,
            &keys,
            Arc::clone(&accessor),
            Arc::clone(&channel),
            Arc::clone(&clock),
            ElectionSettings::from(&config.election),
        );
        let mutexes = MutexManager::new(
            &tab_id,
            keys.clone(),
            Arc::clone(&accessor),
            Arc::clone(&channel),
            Arc::clone(&clock),
        );

        tracing::debug!(tab_id = %tab_id, atomic = accessor.atomic(), store = accessor.store().name(), "Coordinator created");

        Self {
            tab_id,
            config: config.clone(),
            keys,
            accessor,
            channel,
            election,
            mutexes,
            clock,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn accessor(&self) -> &Arc<StorageAccessor> {
        &self.accessor
    }

    pub fn election(&self) -> &Arc<MasterElection> {
        &self.election
    }

    pub fn mutexes(&self) -> &Arc<MutexManager> {
        &self.mutexes
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Spawn the broadcast dispatcher and the election driver.
    pub fn start(&self) -> Result<(), CoordinationError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| CoordinationError::NoRuntime)?;
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Ok(());
        }
        tasks.push(self.channel.spawn_dispatcher());
        tasks.push(runtime.spawn(Arc::clone(&self.election).run(self.cancel.clone())));
        tracing::info!(tab_id = %self.tab_id, "Coordinator started");
        Ok(())
    }

    /// Participant is going away: stop background work, release every held
    /// lock and give up mastership.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
            // Cancelled or finished, either is fine here.
            let _ = task.await;
        }

        let released = self.mutexes.release_all();
        self.election.relinquish();
        tracing::info!(tab_id = %self.tab_id, released, "Coordinator shut down");
    }

    /// Dispatch queued broadcasts when no dispatcher task is running.
    pub fn process_pending_messages(&self) -> usize {
        self.channel.drain()
    }

    // ── Election ────────────────────────────────────────────────

    pub fn is_master(&self) -> bool {
        self.election.is_master()
    }

    pub async fn elect_master(&self) -> bool {
        self.election.elect_master().await
    }

    // ── Mutex ───────────────────────────────────────────────────

    pub fn default_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.config.mutex.default_timeout_ms)
    }

    pub fn acquire_mutex(&self, lock_name: &str, timeout: Duration) -> bool {
        self.mutexes.acquire_mutex(lock_name, timeout)
    }

    pub fn release_mutex(&self, lock_name: &str) -> bool {
        self.mutexes.release_mutex(lock_name)
    }

    pub fn lock(&self, lock_name: &str, timeout: Duration) -> Option<LockGuard> {
        self.mutexes.lock(lock_name, timeout)
    }

    pub async fn acquire_with_retry(
        &self,
        lock_name: &str,
        timeout: Duration,
        policy: &RetryPolicy,
    ) -> Result<LockGuard, CoordinationError> {
        self.mutexes.acquire_with_retry(lock_name, timeout, policy).await
    }

    // ── Broadcasts ──────────────────────────────────────────────

    pub fn broadcast_auth_state(&self, event: AuthEvent, session: Option<serde_json::Value>) {
        self.channel
            .post_message(BroadcastMessage::AuthStateChange { event, session });
    }

    pub fn broadcast_modal_state(&self, modal: &str, open: bool) {
        self.channel.post_message(BroadcastMessage::ModalState {
            modal: modal.to_string(),
            open,
        });
    }

    /// Register a listener for broadcasts of `kind` from other participants.
    pub fn on<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.channel.add_event_listener(kind, handler);
    }
}

impl Drop for TabCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Coordination records currently in a store.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub master: Option<MasterRecord>,
    pub locks: Vec<LockEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    pub name: String,
    #[serde(flatten)]
    pub record: MutexRecord,
}

impl StoreSnapshot {
    pub fn read(accessor: &StorageAccessor, keys: &KeySpace) -> Self {
        let master = accessor.get_json(&keys.master());
        let stored_keys = match accessor.store().keys() {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!("Listing store keys failed: {e}");
                Vec::new()
            }
        };
        let locks = stored_keys
            .iter()
            .filter_map(|key| {
                let name = keys.lock_name(key)?;
                let raw = accessor.get(key)?;
                let record = decode_json::<MutexRecord>(key, &raw)?;
                Some(LockEntry {
                    name: name.to_string(),
                    record,
                })
            })
            .collect();
        Self { master, locks }
    }
}
