//! Session refresh shared across participants.
//!
//! Every participant sees the same session (persisted under
//! `<prefix>_session`), but only the elected master calls the identity
//! provider when it is about to expire. The refreshed session is broadcast
//! as `AUTH_STATE_CHANGE`, so other participants pick it up without calling
//! the provider themselves.

use crate::sync::protocol::{AuthEvent, BroadcastMessage, Envelope, MessageKind};
use crate::sync::TabCoordinator;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Store key suffix for the persisted session.
const SESSION_KEY: &str = "session";

/// An authenticated session as issued by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry of `access_token`, ms since the epoch.
    pub expires_at: i64,
}

impl AuthSession {
    pub fn needs_refresh(&self, now_ms: i64, margin_ms: i64) -> bool {
        now_ms.saturating_add(margin_ms) >= self.expires_at
    }
}

/// Backend that exchanges a refresh token for a new session.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn refresh(&self, session: &AuthSession) -> anyhow::Result<AuthSession>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Nobody is signed in.
    NoSession,
    /// The session is not close to expiry.
    Fresh,
    /// Refresh is due but another participant is master and will do it.
    Deferred,
    Refreshed(AuthSession),
}

pub struct SessionRefresher {
    coordinator: Arc<TabCoordinator>,
    provider: Arc<dyn IdentityProvider>,
    key: String,
    margin_ms: i64,
    current: Arc<RwLock<Option<AuthSession>>>,
}

impl SessionRefresher {
    /// Load any persisted session and start applying sessions broadcast by
    /// other participants.
    pub fn new(coordinator: Arc<TabCoordinator>, provider: Arc<dyn IdentityProvider>) -> Self {
        let key = format!("{}_{SESSION_KEY}", coordinator.keys().prefix());
        let margin_ms = i64::try_from(coordinator.config().session.refresh_margin_secs)
            .unwrap_or(i64::MAX / 1000)
            .saturating_mul(1000);
        let current = Arc::new(RwLock::new(
            coordinator.accessor().get_json::<AuthSession>(&key),
        ));

        let sink = Arc::clone(&current);
        let tab_id = coordinator.tab_id().to_string();
        coordinator.on(MessageKind::AuthStateChange, move |env: &Envelope| {
            apply_broadcast(&tab_id, &sink, env);
        });

        Self {
            coordinator,
            provider,
            key,
            margin_ms,
            current,
        }
    }

    pub fn session(&self) -> Option<AuthSession> {
        self.current.read().clone()
    }

    pub fn sign_in(&self, session: AuthSession) {
        tracing::info!(tab_id = %self.coordinator.tab_id(), user_id = %session.user_id, "Signed in");
        self.store(&session);
        self.coordinator
            .broadcast_auth_state(AuthEvent::SignedIn, serde_json::to_value(&session).ok());
    }

    pub fn sign_out(&self) {
        *self.current.write() = None;
        self.coordinator.accessor().remove(&self.key);
        tracing::info!(tab_id = %self.coordinator.tab_id(), "Signed out");
        self.coordinator.broadcast_auth_state(AuthEvent::SignedOut, None);
    }

    /// Refresh the session if it is about to expire and this participant is
    /// master. Provider failures leave the current session in place.
    pub async fn refresh_if_needed(&self) -> anyhow::Result<RefreshOutcome> {
        let Some(session) = self.session() else {
            return Ok(RefreshOutcome::NoSession);
        };
        let now = self.coordinator.clock().now_ms();
        if !session.needs_refresh(now, self.margin_ms) {
            return Ok(RefreshOutcome::Fresh);
        }
        if !self.coordinator.is_master() {
            tracing::debug!(tab_id = %self.coordinator.tab_id(), "Session refresh left to master");
            return Ok(RefreshOutcome::Deferred);
        }

        let refreshed = self.provider.refresh(&session).await?;
        self.store(&refreshed);
        tracing::info!(tab_id = %self.coordinator.tab_id(), expires_at = refreshed.expires_at, "Session refreshed");
        self.coordinator.broadcast_auth_state(
            AuthEvent::TokenRefreshed,
            serde_json::to_value(&refreshed).ok(),
        );
        Ok(RefreshOutcome::Refreshed(refreshed))
    }

    fn store(&self, session: &AuthSession) {
        *self.current.write() = Some(session.clone());
        if !self.coordinator.accessor().set_json(&self.key, session) {
            tracing::warn!(key = %self.key, "Session not persisted");
        }
    }
}

fn apply_broadcast(tab_id: &str, current: &RwLock<Option<AuthSession>>, env: &Envelope) {
    let BroadcastMessage::AuthStateChange { event, session } = &env.message else {
        return;
    };
    match event {
        AuthEvent::SignedOut => *current.write() = None,
        AuthEvent::SignedIn | AuthEvent::TokenRefreshed => {
            let Some(payload) = session else {
                return;
            };
            match serde_json::from_value::<AuthSession>(payload.clone()) {
                Ok(session) => *current.write() = Some(session),
                Err(e) => {
                    tracing::warn!(tab_id, from = %env.tab_id, "Ignoring malformed session broadcast: {e}");
                }
            }
        }
    }
}
