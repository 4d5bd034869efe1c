//! Authentication state shared between participants.
//!
//! Only the master refreshes tokens; everyone else follows along through
//! `AUTH_STATE_CHANGE` broadcasts and the persisted session record.

pub mod session;

pub use session::{AuthSession, IdentityProvider, RefreshOutcome, SessionRefresher};
