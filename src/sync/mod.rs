//! Coordination between participants that share one store.
//!
//! - `protocol`: record schema, store keys and broadcast message types
//! - `channel`: best-effort pub/sub between participants
//! - `election`: single-master election with heartbeats
//! - `mutex`: named, expiring advisory locks
//! - `coordinator`: one participant's view of all of the above
//!
//! The store is the source of truth. Broadcasts only tell other participants
//! to look again sooner.

pub mod channel;
pub mod coordinator;
pub mod election;
pub mod mutex;
pub mod protocol;

pub use channel::{BroadcastChannel, BroadcastHub};
pub use coordinator::{StoreSnapshot, TabCoordinator};
pub use election::{ElectionOutcome, ElectionSettings, ElectionState, MasterElection};
pub use mutex::{LockGuard, MutexManager};
pub use protocol::{
    AuthEvent, BroadcastMessage, Envelope, KeySpace, MasterRecord, MessageKind, MutexRecord,
};

/// Failures surfaced to callers of the coordination layer.
///
/// The primitives themselves report contention as `false`; these only come
/// out of the retrying helpers and the coordinator lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    #[error("lock '{lock}' still held elsewhere after {attempts} attempts")]
    AcquireTimeout { lock: String, attempts: u32 },
    #[error("coordinator must be started inside a tokio runtime")]
    NoRuntime,
}
