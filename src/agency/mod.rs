//! Current-agency selection, serialized across participants.
//!
//! Selecting an agency is a multi-step sequence (check access, load the
//! agency, persist the choice) that must not interleave with the same
//! sequence in another participant. It runs under the `agency_selection`
//! lock; the lock is always released afterwards, whatever the outcome.

use crate::retry::RetryPolicy;
use crate::sync::{CoordinationError, TabCoordinator};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

pub const AGENCY_SELECTION_LOCK: &str = "agency_selection";

/// Modal shown to other participants while a selection is in progress.
const SELECTION_MODAL: &str = "agency_selection";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agency {
    pub id: String,
    pub name: String,
}

/// Backend holding agencies and per-user selections.
#[async_trait]
pub trait AgencyDirectory: Send + Sync {
    async fn has_access(&self, user_id: &str, agency_id: &str) -> anyhow::Result<bool>;

    async fn fetch_agency(&self, agency_id: &str) -> anyhow::Result<Option<Agency>>;

    async fn persist_selection(&self, user_id: &str, agency: &Agency) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum AgencySelectionError {
    #[error("another tab is selecting an agency, try again ({attempts} attempts)")]
    Busy { attempts: u32 },
    #[error("no access to agency '{0}'")]
    AccessDenied(String),
    #[error("agency '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub struct AgencySelector {
    coordinator: Arc<TabCoordinator>,
    directory: Arc<dyn AgencyDirectory>,
    lock_timeout: Duration,
    retry: RetryPolicy,
    current: RwLock<Option<Agency>>,
}

impl AgencySelector {
    pub fn new(coordinator: Arc<TabCoordinator>, directory: Arc<dyn AgencyDirectory>) -> Self {
        let cfg = &coordinator.config().agency;
        let lock_timeout = Duration::from_millis(cfg.lock_timeout_ms);
        let retry = RetryPolicy::fixed(cfg.retry_attempts, Duration::from_millis(cfg.retry_delay_ms));
        Self {
            coordinator,
            directory,
            lock_timeout,
            retry,
            current: RwLock::new(None),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Agency most recently selected by this participant.
    pub fn current(&self) -> Option<Agency> {
        self.current.read().clone()
    }

    pub async fn select(&self, user_id: &str, agency_id: &str) -> Result<Agency, AgencySelectionError> {
        let guard = match self
            .coordinator
            .acquire_with_retry(AGENCY_SELECTION_LOCK, self.lock_timeout, &self.retry)
            .await
        {
            Ok(guard) => guard,
            Err(CoordinationError::AcquireTimeout { attempts, .. }) => {
                tracing::info!(tab_id = %self.coordinator.tab_id(), attempts, "Agency selection busy elsewhere");
                return Err(AgencySelectionError::Busy { attempts });
            }
            Err(e) => return Err(AgencySelectionError::Backend(e.into())),
        };

        self.coordinator.broadcast_modal_state(SELECTION_MODAL, true);
        let result = self.run_selection(user_id, agency_id).await;
        self.coordinator.broadcast_modal_state(SELECTION_MODAL, false);
        guard.release();

        if let Ok(agency) = &result {
            tracing::info!(tab_id = %self.coordinator.tab_id(), agency_id = %agency.id, "Agency selected");
            *self.current.write() = Some(agency.clone());
        }
        result
    }

    async fn run_selection(&self, user_id: &str, agency_id: &str) -> Result<Agency, AgencySelectionError> {
        if !self.directory.has_access(user_id, agency_id).await? {
            return Err(AgencySelectionError::AccessDenied(agency_id.to_string()));
        }
        let agency = self
            .directory
            .fetch_agency(agency_id)
            .await?
            .ok_or_else(|| AgencySelectionError::NotFound(agency_id.to_string()))?;
        self.directory.persist_selection(user_id, &agency).await?;
        Ok(agency)
    }
}
