//! Best-effort pub/sub between participants.
//!
//! A [`BroadcastHub`] plays the role of a named channel; each participant
//! opens its own [`BroadcastChannel`] on it. Messages posted by one channel
//! reach the listeners of every *other* channel on the hub. Nothing is
//! persisted and a lagging receiver drops messages, so correctness never
//! depends on delivery.

use crate::clock::Clock;
use crate::sync::protocol::{BroadcastMessage, Envelope, MessageKind};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::task::JoinHandle;

/// Messages buffered per receiver before the slowest one starts lagging.
const HUB_CAPACITY: usize = 256;

type Listener = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Shared medium every participant's channel attaches to.
#[derive(Clone)]
pub struct BroadcastHub {
    tx: broadcast::Sender<Envelope>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(HUB_CAPACITY);
        Self { tx }
    }

    /// Number of channels currently attached.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One participant's endpoint on a [`BroadcastHub`].
pub struct BroadcastChannel {
    tab_id: String,
    tx: broadcast::Sender<Envelope>,
    /// Taken by the dispatcher task once spawned; `drain` then has nothing to do.
    rx: Mutex<Option<broadcast::Receiver<Envelope>>>,
    listeners: RwLock<HashMap<MessageKind, Vec<Listener>>>,
    clock: Arc<dyn Clock>,
}

impl BroadcastChannel {
    pub fn open(hub: &BroadcastHub, tab_id: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            tab_id: tab_id.to_string(),
            tx: hub.tx.clone(),
            rx: Mutex::new(Some(hub.tx.subscribe())),
            listeners: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn tab_id(&self) -> &str {
        &self.tab_id
    }

    /// Fire-and-forget. Returns how many channels (including this one) were attached.
    pub fn post_message(&self, message: BroadcastMessage) -> usize {
        let envelope = Envelope {
            message,
            tab_id: self.tab_id.clone(),
            timestamp: self.clock.now_ms(),
        };
        // An error only means nobody is listening.
        self.tx.send(envelope).unwrap_or(0)
    }

    pub fn add_event_listener<F>(&self, kind: MessageKind, handler: F)
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Invoke the listeners for one envelope. Our own posts are skipped.
    pub fn dispatch(&self, envelope: &Envelope) {
        if envelope.tab_id == self.tab_id {
            return;
        }
        let handlers: Vec<Listener> = self
            .listeners
            .read()
            .get(&envelope.message.kind())
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(envelope);
        }
    }

    /// Deliver everything already queued, without waiting. Returns how many
    /// envelopes from other participants were dispatched.
    pub fn drain(&self) -> usize {
        let mut delivered = 0;
        loop {
            let next = match self.rx.lock().as_mut() {
                Some(rx) => rx.try_recv(),
                None => return delivered,
            };
            match next {
                Ok(envelope) => {
                    if envelope.tab_id != self.tab_id {
                        delivered += 1;
                    }
                    self.dispatch(&envelope);
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(tab_id = %self.tab_id, skipped, "Broadcast receiver lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return delivered,
            }
        }
    }

    /// Spawn a task that dispatches messages as they arrive.
    pub fn spawn_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        let taken = channel.rx.lock().take();
        let mut rx = taken.unwrap_or_else(|| channel.tx.subscribe());
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => channel.dispatch(&envelope),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(tab_id = %channel.tab_id, skipped, "Broadcast dispatcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
