//! Master election and named advisory mutexes for participants that share
//! one key-value store.
//!
//! Each participant (a browser tab, a worker task, a process on the same
//! host) runs a [`sync::TabCoordinator`] over a common [`storage::SharedStore`]
//! and [`sync::BroadcastHub`]. The coordinator elects a single master through
//! heartbeated records and hands out expiring locks; the [`auth`] and
//! [`agency`] modules are consumers built on top of it.

pub mod agency;
pub mod auth;
pub mod clock;
pub mod config;
pub mod retry;
pub mod storage;
pub mod sync;

pub use config::Config;
pub use sync::TabCoordinator;
