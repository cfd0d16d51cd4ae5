//! The client's view of the shared world

use crate::StateError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tavern_protocol::Payload;

/// Whether an entity's referenced asset can be used yet
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AssetState {
    #[default]
    Ready,
    /// Waiting for the upload of this asset to be confirmed
    AwaitingAsset(String),
    /// The asset never arrived; no further action is taken
    Stalled(String),
}

/// Sync status of a versioned entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Edited locally, not yet sent
    #[default]
    Local,
    Syncing,
    Synced,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sprite {
    #[serde(rename = "sprite_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub table_id: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,
    /// Everything else the authority attached
    #[serde(flatten)]
    pub properties: Payload,
    #[serde(skip)]
    pub asset_state: AssetState,
    /// Present locally but not yet confirmed by the authority
    #[serde(skip)]
    pub optimistic: bool,
}

impl Sprite {
    /// Decode a sprite from an envelope payload or list entry
    pub fn from_payload(payload: &Payload) -> Result<Self, StateError> {
        let mut sprite: Sprite = serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| StateError::InvalidPayload {
                kind: "sprite".to_string(),
                reason: e.to_string(),
            })?;
        // Envelope bookkeeping is not part of the sprite
        sprite.properties.remove("correlation_id");
        Ok(sprite)
    }

    /// Merge property changes, including position
    pub fn apply(&mut self, changes: &Payload) {
        for (name, value) in changes {
            match name.as_str() {
                "sprite_id" | "id" | "correlation_id" => {}
                "x" => self.x = value.as_f64().unwrap_or(self.x),
                "y" => self.y = value.as_f64().unwrap_or(self.y),
                "table_id" => {
                    if let Some(table) = value.as_str() {
                        self.table_id = table.to_string();
                    }
                }
                "asset_id" => self.asset_id = value.as_str().map(str::to_string),
                _ => {
                    self.properties.insert(name.clone(), value.clone());
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    #[serde(rename = "character_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub data: Payload,
    #[serde(skip)]
    pub sync_status: SyncStatus,
}

impl Character {
    pub fn from_payload(payload: &Payload) -> Result<Self, StateError> {
        let mut character: Character = serde_json::from_value(Value::Object(payload.clone()))
            .map_err(|e| StateError::InvalidPayload {
                kind: "character".to_string(),
                reason: e.to_string(),
            })?;
        character.sync_status = SyncStatus::Synced;
        Ok(character)
    }

    /// Overlay field changes onto the character data
    pub fn apply(&mut self, changes: &Payload) {
        for (name, value) in changes {
            self.data.insert(name.clone(), value.clone());
        }
    }
}

/// Notifications for rendering and UI collaborators
#[derive(Debug, Clone, PartialEq)]
pub enum WorldEvent {
    SpriteAdded(Sprite),
    SpriteUpdated(Sprite),
    SpriteRemoved { id: String },
    CharacterUpdated(Character),
    CharacterRemoved { id: String },
}

#[derive(Debug, Clone, Default)]
pub struct World {
    sprites: BTreeMap<String, Sprite>,
    characters: BTreeMap<String, Character>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sprite(&self, id: &str) -> Option<&Sprite> {
        self.sprites.get(id)
    }

    pub fn sprite_mut(&mut self, id: &str) -> Option<&mut Sprite> {
        self.sprites.get_mut(id)
    }

    pub fn sprites(&self) -> impl Iterator<Item = &Sprite> {
        self.sprites.values()
    }

    pub fn sprites_on<'a>(&'a self, table_id: &'a str) -> impl Iterator<Item = &'a Sprite> {
        self.sprites.values().filter(move |s| s.table_id == table_id)
    }

    /// Insert or replace a sprite, returning the matching notification
    pub fn upsert_sprite(&mut self, sprite: Sprite) -> WorldEvent {
        let event = if self.sprites.contains_key(&sprite.id) {
            WorldEvent::SpriteUpdated(sprite.clone())
        } else {
            WorldEvent::SpriteAdded(sprite.clone())
        };
        self.sprites.insert(sprite.id.clone(), sprite);
        event
    }

    pub fn remove_sprite(&mut self, id: &str) -> Option<Sprite> {
        self.sprites.remove(id)
    }

    pub fn character(&self, id: &str) -> Option<&Character> {
        self.characters.get(id)
    }

    pub fn character_mut(&mut self, id: &str) -> Option<&mut Character> {
        self.characters.get_mut(id)
    }

    pub fn characters(&self) -> impl Iterator<Item = &Character> {
        self.characters.values()
    }

    pub fn upsert_character(&mut self, character: Character) -> WorldEvent {
        let event = WorldEvent::CharacterUpdated(character.clone());
        self.characters.insert(character.id.clone(), character);
        event
    }

    pub fn remove_character(&mut self, id: &str) -> Option<Character> {
        self.characters.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_sprite_from_payload() {
        let sprite = Sprite::from_payload(&payload(json!({
            "sprite_id": "s1",
            "table_id": "t1",
            "x": 3.5,
            "y": 4,
            "asset_id": "asset_77",
            "layer": "tokens",
            "correlation_id": "opt_1",
        })))
        .unwrap();

        assert_eq!(sprite.id, "s1");
        assert_eq!(sprite.y, 4.0);
        assert_eq!(sprite.asset_id.as_deref(), Some("asset_77"));
        assert_eq!(sprite.properties.get("layer"), Some(&json!("tokens")));
        assert!(!sprite.properties.contains_key("correlation_id"));
        assert_eq!(sprite.asset_state, AssetState::Ready);
    }

    #[test]
    fn test_sprite_without_id_is_invalid() {
        assert!(Sprite::from_payload(&payload(json!({ "x": 1 }))).is_err());
    }

    #[test]
    fn test_upsert_reports_add_then_update() {
        let mut world = World::new();
        let sprite = Sprite::from_payload(&payload(json!({ "sprite_id": "s1" }))).unwrap();

        assert!(matches!(world.upsert_sprite(sprite.clone()), WorldEvent::SpriteAdded(_)));
        assert!(matches!(world.upsert_sprite(sprite), WorldEvent::SpriteUpdated(_)));
        assert_eq!(world.sprites().count(), 1);
    }

    #[test]
    fn test_sprite_apply_moves_and_merges() {
        let mut sprite = Sprite::from_payload(&payload(json!({ "sprite_id": "s1" }))).unwrap();
        sprite.apply(&payload(json!({ "x": 10, "y": 20.5, "rotation": 90, "sprite_id": "other" })));

        assert_eq!((sprite.x, sprite.y), (10.0, 20.5));
        assert_eq!(sprite.id, "s1");
        assert_eq!(sprite.properties.get("rotation"), Some(&json!(90)));
    }

    #[test]
    fn test_character_from_payload_is_synced() {
        let character = Character::from_payload(&payload(json!({
            "character_id": "char-1",
            "version": 5,
            "data": { "hp": 8 },
        })))
        .unwrap();
        assert_eq!(character.version, 5);
        assert_eq!(character.sync_status, SyncStatus::Synced);
        assert_eq!(character.data.get("hp"), Some(&json!(8)));
    }
}
