//! Message catalog shared by client and server
//!
//! Every envelope names one of these types. Unknown names survive decoding as
//! [`MessageType::Unknown`] so that schema skew between peers is never fatal.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// How the outbound scheduler treats a message type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryClass {
    /// Sent immediately, or queued verbatim until the link is viable
    Critical,
    /// Coalesced into `batch` envelopes
    Batched,
    /// Handled by the lifecycle manager itself, never scheduled
    Control,
}

macro_rules! message_catalog {
    ($( $(#[$meta:meta])* $variant:ident => $wire:literal, $class:ident; )*) => {
        /// Message types known to this protocol version
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $( $(#[$meta])* $variant, )*
            /// A type name this build does not recognise
            Unknown(String),
        }

        impl MessageType {
            /// Wire name of this type
            pub fn as_str(&self) -> &str {
                match self {
                    $( MessageType::$variant => $wire, )*
                    MessageType::Unknown(name) => name,
                }
            }

            /// Map a wire name onto the catalog
            pub fn parse(name: &str) -> Self {
                match name {
                    $( $wire => MessageType::$variant, )*
                    other => MessageType::Unknown(other.to_string()),
                }
            }

            /// Delivery class used by the outbound scheduler
            pub fn class(&self) -> DeliveryClass {
                match self {
                    $( MessageType::$variant => DeliveryClass::$class, )*
                    MessageType::Unknown(_) => DeliveryClass::Batched,
                }
            }

            /// Every known type, in catalog order
            pub fn all() -> Vec<MessageType> {
                vec![$( MessageType::$variant, )*]
            }
        }
    };
}

message_catalog! {
    // Connection
    Hello => "hello", Control;
    Welcome => "welcome", Control;
    Ping => "ping", Control;
    Pong => "pong", Control;
    Batch => "batch", Control;
    Error => "error", Batched;

    // Tables
    TableListRequest => "table_list_request", Critical;
    TableList => "table_list", Batched;
    TableRequest => "table_request", Critical;
    TableData => "table_data", Batched;
    TableCreate => "table_create", Critical;
    TableCreated => "table_created", Batched;
    TableDelete => "table_delete", Critical;
    TableDeleted => "table_deleted", Batched;

    // Sprites
    SpriteListRequest => "sprite_list_request", Critical;
    SpriteList => "sprite_list", Batched;
    SpriteCreate => "sprite_create", Critical;
    SpriteCreated => "sprite_created", Batched;
    SpriteCreateFailed => "sprite_create_failed", Batched;
    SpriteUpdate => "sprite_update", Batched;
    SpriteMove => "sprite_move", Batched;
    SpriteDelete => "sprite_delete", Critical;
    SpriteDeleted => "sprite_deleted", Batched;

    // Characters
    CharacterListRequest => "character_list_request", Critical;
    CharacterList => "character_list", Batched;
    CharacterSave => "character_save", Critical;
    CharacterSaved => "character_saved", Batched;
    CharacterLoad => "character_load", Critical;
    CharacterData => "character_data", Batched;
    CharacterUpdate => "character_update", Critical;
    CharacterUpdateResponse => "character_update_response", Batched;
    CharacterDelete => "character_delete", Critical;
    CharacterDeleted => "character_deleted", Batched;

    // Assets
    AssetUploadRequest => "asset_upload_request", Critical;
    AssetUploadConfirm => "asset_upload_confirm", Critical;
    AssetUploaded => "asset_uploaded", Batched;
    AssetDownloadRequest => "asset_download_request", Batched;
    AssetData => "asset_data", Batched;

    // Players
    PlayerJoined => "player_joined", Batched;
    PlayerLeft => "player_left", Batched;
    PlayerKick => "player_kick", Critical;
    PlayerBan => "player_ban", Critical;
    PlayerKicked => "player_kicked", Batched;

    // High-frequency, loss tolerant
    CursorMove => "cursor_move", Batched;
    ChatMessage => "chat_message", Batched;
}

impl MessageType {
    /// Whether delivery of this type must not wait for a batch window
    pub fn is_critical(&self) -> bool {
        self.class() == DeliveryClass::Critical
    }

    /// Whether this type is part of the catalog
    pub fn is_known(&self) -> bool {
        !matches!(self, MessageType::Unknown(_))
    }

    /// Priority assigned to envelopes of this type unless overridden
    pub fn default_priority(&self) -> Priority {
        match self {
            MessageType::SpriteMove | MessageType::CursorMove => Priority::LOW,
            t if t.class() == DeliveryClass::Control => Priority::HIGH,
            t if t.is_critical() => Priority::CRITICAL,
            _ => Priority::NORMAL,
        }
    }

    /// Payload field naming the entity this type is about
    pub fn entity_field(&self) -> &'static str {
        let name = self.as_str();
        if name.starts_with("sprite_") {
            "sprite_id"
        } else if name.starts_with("character_") {
            "character_id"
        } else if name.starts_with("table_") {
            "table_id"
        } else if name.starts_with("asset_") {
            "asset_id"
        } else if name.starts_with("player_") {
            "user"
        } else {
            "id"
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(MessageType::parse(&name))
    }
}

/// Envelope priority; larger is more urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOW: Priority = Priority(0);
    pub const NORMAL: Priority = Priority(1);
    pub const HIGH: Priority = Priority(2);
    pub const CRITICAL: Priority = Priority(3);

    /// Envelopes at or above this priority bypass batching
    pub fn is_critical(self) -> bool {
        self >= Priority::CRITICAL
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::NORMAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_round_trip() {
        for kind in MessageType::all() {
            assert_eq!(MessageType::parse(kind.as_str()), kind);
        }
    }

    #[test]
    fn test_unknown_type_is_preserved() {
        let kind = MessageType::parse("dice_roll");
        assert_eq!(kind, MessageType::Unknown("dice_roll".to_string()));
        assert!(!kind.is_known());
        assert_eq!(kind.as_str(), "dice_roll");
    }

    #[test]
    fn test_critical_set() {
        assert!(MessageType::SpriteCreate.is_critical());
        assert!(MessageType::SpriteDelete.is_critical());
        assert!(MessageType::PlayerKick.is_critical());
        assert!(MessageType::TableCreate.is_critical());
        assert!(MessageType::CharacterSave.is_critical());
        assert!(MessageType::CharacterLoad.is_critical());
        assert!(!MessageType::SpriteMove.is_critical());
        assert!(!MessageType::CursorMove.is_critical());
        assert_eq!(MessageType::Ping.class(), DeliveryClass::Control);
    }

    #[test]
    fn test_default_priority() {
        assert_eq!(MessageType::SpriteMove.default_priority(), Priority::LOW);
        assert_eq!(MessageType::SpriteCreate.default_priority(), Priority::CRITICAL);
        assert_eq!(MessageType::ChatMessage.default_priority(), Priority::NORMAL);
        assert!(Priority::CRITICAL.is_critical());
        assert!(!Priority::HIGH.is_critical());
    }

    #[test]
    fn test_entity_field() {
        assert_eq!(MessageType::SpriteMove.entity_field(), "sprite_id");
        assert_eq!(MessageType::CharacterUpdate.entity_field(), "character_id");
        assert_eq!(MessageType::AssetUploaded.entity_field(), "asset_id");
        assert_eq!(MessageType::CursorMove.entity_field(), "id");
    }
}
