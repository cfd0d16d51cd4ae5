use serde_json::{json, Value};
use tavern_protocol::{Envelope, MessageType, Payload};

/// JSON object literal as a payload map
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("payload must be a JSON object, got {other}"),
    }
}

pub fn sprite_created(correlation_id: &str, sprite_id: &str, table_id: &str) -> Envelope {
    Envelope::from_json(
        MessageType::SpriteCreated,
        json!({
            "correlation_id": correlation_id,
            "sprite_id": sprite_id,
            "table_id": table_id,
            "x": 0.0,
            "y": 0.0,
        }),
    )
}

pub fn character_data(id: &str, version: u64, data: Value) -> Envelope {
    Envelope::from_json(
        MessageType::CharacterData,
        json!({ "character_id": id, "version": version, "data": data }),
    )
}

pub fn update_conflict(correlation_id: &str, id: &str, current_version: u64) -> Envelope {
    Envelope::from_json(
        MessageType::CharacterUpdateResponse,
        json!({
            "correlation_id": correlation_id,
            "character_id": id,
            "success": false,
            "conflict": true,
            "current_version": current_version,
        }),
    )
}

pub fn update_accepted(correlation_id: &str, id: &str, version: u64) -> Envelope {
    Envelope::from_json(
        MessageType::CharacterUpdateResponse,
        json!({
            "correlation_id": correlation_id,
            "character_id": id,
            "success": true,
            "version": version,
        }),
    )
}
