//! Master election over the shared store.
//!
//! One participant at a time should hold the `<prefix>_master_tab` record and
//! keep its `lastHeartbeat` fresh. Others claim the record once it goes stale,
//! and a participant whose id sorts before the incumbent's may challenge a
//! live master, so leadership converges on the oldest live participant.
//!
//! When the store has a compare-and-swap every write is conditional and two
//! participants can never both pass the same round. Without one, writes are
//! verified by reading them back, which narrows but does not close the window
//! where two participants both believe they won; the next heartbeat or
//! `MASTER_CHANGED` notification corrects it.

use crate::clock::Clock;
use crate::config::ElectionConfig;
use crate::retry::RetryPolicy;
use crate::storage::{decode_json, StorageAccessor};
use crate::sync::channel::BroadcastChannel;
use crate::sync::protocol::{BroadcastMessage, Envelope, KeySpace, MasterRecord, MessageKind};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Local view of this participant's role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Unelected,
    Claiming,
    Master,
}

/// Result of a single election round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This participant holds the record.
    Won,
    /// A live master outranks us; nothing was written.
    Deferred,
    /// A claim or challenge was written but did not survive verification.
    Lost,
}

/// Election timing, resolved from [`ElectionConfig`].
#[derive(Debug, Clone)]
pub struct ElectionSettings {
    pub expiry_ms: i64,
    pub heartbeat_interval: Duration,
    pub retry_interval: Duration,
    pub backoff: RetryPolicy,
}

impl From<&ElectionConfig> for ElectionSettings {
    fn from(cfg: &ElectionConfig) -> Self {
        Self {
            expiry_ms: i64::try_from(cfg.expiry_ms).unwrap_or(i64::MAX),
            heartbeat_interval: Duration::from_millis(cfg.heartbeat_interval_ms),
            retry_interval: Duration::from_millis(cfg.retry_interval_ms),
            backoff: RetryPolicy::from(&cfg.backoff),
        }
    }
}

pub struct MasterElection {
    tab_id: String,
    key: String,
    accessor: Arc<StorageAccessor>,
    channel: Arc<BroadcastChannel>,
    clock: Arc<dyn Clock>,
    settings: ElectionSettings,
    state: Mutex<ElectionState>,
}

impl MasterElection {
    /// Create the election and subscribe it to `MASTER_CHANGED` on `channel`.
    pub fn new(
        tab_id: &str,
        keys: &KeySpace,
        accessor: Arc<StorageAccessor>,
        channel: Arc<BroadcastChannel>,
        clock: Arc<dyn Clock>,
        settings: ElectionSettings,
    ) -> Arc<Self> {
        let election = Arc::new(Self {
            tab_id: tab_id.to_string(),
            key: keys.master(),
            accessor,
            channel: Arc::clone(&channel),
            clock,
            settings,
            state: Mutex::new(ElectionState::Unelected),
        });

        let weak = Arc::downgrade(&election);
        channel.add_event_listener(MessageKind::MasterChanged, move |env: &Envelope| {
            if let Some(election) = weak.upgrade() {
                election.on_master_changed(env);
            }
        });

        election
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    pub fn state(&self) -> ElectionState {
        *self.state.lock()
    }

    pub fn is_master(&self) -> bool {
        self.state() == ElectionState::Master
    }

    pub fn settings(&self) -> &ElectionSettings {
        &self.settings
    }

    /// The stored master record, if present and not stale.
    pub fn current_master(&self) -> Option<MasterRecord> {
        let record: MasterRecord = self.accessor.get_json(&self.key)?;
        (!record.is_stale(self.clock.now_ms(), self.settings.expiry_ms)).then_some(record)
    }

    /// Run election rounds until one is won, a live master outranks us, or
    /// the backoff budget runs out.
    pub async fn elect_master(&self) -> bool {
        let mut attempt = 0;
        loop {
            match self.try_elect() {
                ElectionOutcome::Won => return true,
                ElectionOutcome::Deferred => return false,
                ElectionOutcome::Lost => {
                    if !self.settings.backoff.allows(attempt + 1) {
                        tracing::debug!(tab_id = %self.tab_id, attempts = attempt + 1, "Election retries exhausted");
                        return false;
                    }
                    let delay = self.settings.backoff.delay_for(attempt);
                    tracing::debug!(tab_id = %self.tab_id, attempt, ?delay, "Lost election race, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One election round.
    pub fn try_elect(&self) -> ElectionOutcome {
        {
            let mut state = self.state.lock();
            if *state != ElectionState::Master {
                *state = ElectionState::Claiming;
            }
        }

        let outcome = self.elect_round();
        match outcome {
            ElectionOutcome::Won => self.become_master(),
            _ => {
                let mut state = self.state.lock();
                if *state == ElectionState::Claiming {
                    *state = ElectionState::Unelected;
                }
            }
        }
        outcome
    }

    fn elect_round(&self) -> ElectionOutcome {
        let now = self.clock.now_ms();
        let raw = self.accessor.get(&self.key);
        let record: Option<MasterRecord> = raw
            .as_deref()
            .and_then(|r| decode_json(&self.key, r));

        match (raw.as_deref(), record) {
            (Some(raw), Some(incumbent)) if !incumbent.is_stale(now, self.settings.expiry_ms) => {
                if incumbent.tab_id == self.tab_id {
                    self.refresh(raw, &incumbent, now)
                } else if incumbent.is_foreign() || self.tab_id >= incumbent.tab_id {
                    ElectionOutcome::Deferred
                } else {
                    self.challenge(raw, &incumbent, now)
                }
            }
            (raw, _) => self.claim(raw, now),
        }
    }

    /// Write a fresh record over an absent, stale or corrupted one.
    fn claim(&self, expected: Option<&str>, now: i64) -> ElectionOutcome {
        let record = MasterRecord::new(&self.tab_id, now);
        tracing::debug!(tab_id = %self.tab_id, version = record.version, "Claiming master record");
        self.write_conditionally(expected, &record)
    }

    /// Replace a live master that sorts after us, but only while the stored
    /// record still belongs to that master.
    fn challenge(&self, raw: &str, incumbent: &MasterRecord, now: i64) -> ElectionOutcome {
        if !self.accessor.atomic() {
            let current: Option<MasterRecord> = self.accessor.get_json(&self.key);
            if current.map(|c| c.tab_id) != Some(incumbent.tab_id.clone()) {
                return ElectionOutcome::Lost;
            }
        }
        let record = MasterRecord::new(&self.tab_id, now);
        tracing::debug!(tab_id = %self.tab_id, incumbent = %incumbent.tab_id, "Challenging master");
        self.write_conditionally(Some(raw), &record)
    }

    /// Re-adopt our own live record (e.g. after a restart that kept the id).
    fn refresh(&self, raw: &str, ours: &MasterRecord, now: i64) -> ElectionOutcome {
        let record = MasterRecord {
            last_heartbeat: now,
            ..ours.clone()
        };
        self.write_conditionally(Some(raw), &record)
    }

    fn write_conditionally(&self, expected: Option<&str>, record: &MasterRecord) -> ElectionOutcome {
        let Ok(json) = serde_json::to_string(record) else {
            return ElectionOutcome::Lost;
        };

        if self.accessor.atomic() {
            return if self.accessor.compare_and_swap(&self.key, expected, Some(&json)) {
                ElectionOutcome::Won
            } else {
                ElectionOutcome::Lost
            };
        }

        if !self.accessor.set(&self.key, &json) {
            return ElectionOutcome::Lost;
        }
        // Read-after-write: another participant writing in between shows up
        // here. Compare the exact text written; `version` does not survive a
        // float round trip bit for bit.
        if self.accessor.get(&self.key).as_deref() == Some(json.as_str()) {
            ElectionOutcome::Won
        } else {
            ElectionOutcome::Lost
        }
    }

    fn become_master(&self) {
        let was = std::mem::replace(&mut *self.state.lock(), ElectionState::Master);
        if was == ElectionState::Master {
            return;
        }
        let version = self
            .current_master()
            .filter(|r| r.tab_id == self.tab_id)
            .map(|r| r.version);
        tracing::info!(tab_id = %self.tab_id, "Became master");
        self.channel.post_message(BroadcastMessage::MasterChanged {
            master_tab: Some(self.tab_id.clone()),
            version,
        });
    }

    fn step_down(&self, reason: &str) {
        let was = std::mem::replace(&mut *self.state.lock(), ElectionState::Unelected);
        if was == ElectionState::Master {
            tracing::info!(tab_id = %self.tab_id, reason, "Lost mastership");
        }
    }

    fn owns_record(&self) -> bool {
        let stored: Option<MasterRecord> = self.accessor.get_json(&self.key);
        stored.is_some_and(|r| r.tab_id == self.tab_id)
    }

    /// Rewrite `lastHeartbeat`. Returns `false`, and clears the master flag,
    /// once the stored record is no longer ours.
    pub fn heartbeat(&self) -> bool {
        if !self.is_master() {
            return false;
        }

        let now = self.clock.now_ms();
        let raw = self.accessor.get(&self.key);
        let record: Option<MasterRecord> = raw
            .as_deref()
            .and_then(|r| decode_json(&self.key, r));

        let (Some(raw), Some(record)) = (raw, record) else {
            self.step_down("master record disappeared");
            return false;
        };
        if record.tab_id != self.tab_id {
            tracing::debug!(tab_id = %self.tab_id, superseded_by = %record.tab_id, "Heartbeat found another master");
            self.step_down("superseded");
            return false;
        }

        if self.refresh(&raw, &record, now) == ElectionOutcome::Won || self.owns_record() {
            true
        } else {
            self.step_down("heartbeat write lost");
            false
        }
    }

    /// Re-check the store and drop the master flag if the record is not ours.
    pub fn verify_master(&self) -> bool {
        if !self.is_master() {
            return false;
        }
        if self.owns_record() {
            return true;
        }
        self.step_down("superseded");
        false
    }

    /// Step down voluntarily, deleting the record if it is still ours.
    pub fn relinquish(&self) {
        let raw = self.accessor.get(&self.key);
        let ours = raw
            .as_deref()
            .and_then(|r| decode_json::<MasterRecord>(&self.key, r))
            .is_some_and(|r| r.tab_id == self.tab_id);

        if let (true, Some(raw)) = (ours, raw.as_deref()) {
            if self.accessor.atomic() {
                self.accessor.compare_and_swap(&self.key, Some(raw), None);
            } else {
                self.accessor.remove(&self.key);
            }
        }

        let was_master = self.is_master();
        self.step_down("relinquished");
        if was_master {
            self.channel.post_message(BroadcastMessage::MasterChanged {
                master_tab: None,
                version: None,
            });
        }
    }

    fn on_master_changed(&self, env: &Envelope) {
        if env.tab_id == self.tab_id {
            return;
        }
        self.verify_master();
    }

    /// Heartbeat while master, otherwise keep trying to become one.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let wait = if self.is_master() {
                if self.heartbeat() {
                    self.settings.heartbeat_interval
                } else {
                    Duration::ZERO
                }
            } else if self.elect_master().await {
                self.settings.heartbeat_interval
            } else {
                self.settings.retry_interval
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::debug!(tab_id = %self.tab_id, "Election driver stopped");
    }
}
