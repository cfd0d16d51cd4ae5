//! Local world state for Tavern
//!
//! Holds the client's view of the shared world and keeps it consistent with
//! the authority: speculative inserts, versioned character edits with a
//! single conflict retry, and asset-dependency deferral.

pub mod assets;
pub mod reconciler;
pub mod world;

pub use assets::{AssetDependencies, DependencyEvent};
pub use reconciler::{
    NewSprite, Notification, Reconciler, ReconcilerConfig, Resolution, RollbackReason,
};
pub use world::{AssetState, Character, Sprite, SyncStatus, World, WorldEvent};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Unknown {kind}: {id}")]
    UnknownEntity { kind: &'static str, id: String },

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error(transparent)]
    Protocol(#[from] tavern_protocol::ProtocolError),
}

impl StateError {
    pub(crate) fn unknown_sprite(id: &str) -> Self {
        StateError::UnknownEntity {
            kind: "sprite",
            id: id.to_string(),
        }
    }

    pub(crate) fn unknown_character(id: &str) -> Self {
        StateError::UnknownEntity {
            kind: "character",
            id: id.to_string(),
        }
    }
}
