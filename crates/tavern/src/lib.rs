//! Tavern: real-time world synchronization for shared tabletop sessions
//!
//! A [`SyncClient`] keeps one logical connection to an authoritative server
//! alive, schedules outbound traffic and reconciles optimistic local edits
//! with the server's answers. The [`server`] module holds a small in-memory
//! authority used by the `tavern-server` binary and by tests.

pub mod client;
mod engine;
pub mod server;

pub use client::{MessageSubscription, SyncClient};
pub use tavern_network::{ConnectionEvent, ConnectionState, TerminalFailure};
pub use tavern_state::{
    AssetState, Character, DependencyEvent, NewSprite, Resolution, RollbackReason, Sprite,
    SyncStatus, World, WorldEvent,
};

use tavern_network::{LifecycleConfig, SchedulerConfig};
use tavern_state::{ReconcilerConfig, StateError};
use thiserror::Error;

/// Everything a [`SyncClient`] needs to run
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name announced in `hello`
    pub user: String,
    pub lifecycle: LifecycleConfig,
    pub scheduler: SchedulerConfig,
    pub reconciler: ReconcilerConfig,
    /// Buffer size of every broadcast subscription
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            user: "player".to_string(),
            lifecycle: LifecycleConfig::default(),
            scheduler: SchedulerConfig::default(),
            reconciler: ReconcilerConfig::default(),
            event_capacity: 256,
        }
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Sync engine is no longer running")]
    EngineGone,

    #[error("Not connected; call connect() before making changes")]
    Offline,

    #[error(transparent)]
    State(#[from] StateError),
}
