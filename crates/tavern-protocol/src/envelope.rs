//! The message envelope: the only unit of communication on the wire

use crate::message::{MessageType, Priority};
use crate::{ProtocolError, PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Structured payload carried by an envelope
pub type Payload = Map<String, Value>;

/// `{ type, data, priority, version }`
///
/// Fields are private; an envelope never changes after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default)]
    data: Payload,
    #[serde(default)]
    priority: Priority,
    #[serde(default = "default_version")]
    version: String,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl Envelope {
    /// Create an envelope with the type's default priority
    pub fn new(kind: MessageType, data: Payload) -> Self {
        let priority = kind.default_priority();
        Self {
            kind,
            data,
            priority,
            version: default_version(),
        }
    }

    /// Create an envelope from any JSON value
    ///
    /// Objects become the payload directly; anything else is stored under `value`.
    pub fn from_json(kind: MessageType, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(kind, data)
    }

    /// Same envelope with an explicit priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn kind(&self) -> &MessageType {
        &self.kind
    }

    pub fn data(&self) -> &Payload {
        &self.data
    }

    pub fn into_data(self) -> Payload {
        self.data
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Critical by type, or raised to critical priority by the sender
    pub fn is_critical(&self) -> bool {
        self.kind.is_critical() || self.priority.is_critical()
    }

    /// String field of the payload
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }

    /// Unsigned integer field of the payload
    pub fn u64_field(&self, name: &str) -> Option<u64> {
        self.data.get(name).and_then(Value::as_u64)
    }

    /// Boolean field of the payload
    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.data.get(name).and_then(Value::as_bool)
    }

    /// String field that must be present
    pub fn require_str(&self, name: &'static str) -> Result<&str, ProtocolError> {
        self.str_field(name).ok_or_else(|| ProtocolError::MissingField {
            kind: self.kind.to_string(),
            field: name,
        })
    }

    /// Wrap an ordered list of envelopes into one `batch` envelope
    pub fn batch(messages: Vec<Envelope>) -> Result<Envelope, ProtocolError> {
        let messages = messages
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Envelope::from_json(
            MessageType::Batch,
            json!({ "messages": messages }),
        ))
    }

    /// Number of sub-messages if this is a batch
    pub fn batch_len(&self) -> Option<usize> {
        if self.kind != MessageType::Batch {
            return None;
        }
        self.data
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::len)
    }

    /// Expand a batch into its sub-messages; any other envelope yields itself
    ///
    /// Sub-messages that fail to decode are logged and skipped.
    pub fn flatten(self) -> Vec<Envelope> {
        if self.kind != MessageType::Batch {
            return vec![self];
        }
        let Some(Value::Array(items)) = self.data.get("messages") else {
            warn!("Batch envelope without a messages array");
            return Vec::new();
        };
        items
            .iter()
            .filter_map(|item| match serde_json::from_value::<Envelope>(item.clone()) {
                Ok(envelope) => Some(envelope),
                Err(e) => {
                    warn!("Dropping malformed batch entry: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Liveness probe
    pub fn ping(seq: u64, sent_at: u64) -> Envelope {
        Envelope::from_json(MessageType::Ping, json!({ "seq": seq, "sent_at": sent_at }))
    }

    /// Reply to a liveness probe, echoing its sequence and timestamp
    pub fn pong_for(ping: &Envelope) -> Envelope {
        Envelope::from_json(
            MessageType::Pong,
            json!({
                "seq": ping.u64_field("seq").unwrap_or(0),
                "sent_at": ping.u64_field("sent_at").unwrap_or(0),
            }),
        )
    }

    /// Error report, optionally tied to a correlation id
    pub fn error(message: impl Into<String>, correlation_id: Option<&str>) -> Envelope {
        let mut data = Map::new();
        data.insert("message".to_string(), Value::String(message.into()));
        if let Some(id) = correlation_id {
            data.insert("correlation_id".to_string(), Value::String(id.to_string()));
        }
        Envelope::new(MessageType::Error, data)
    }
}

/// Current wall clock in microseconds since the epoch
pub fn timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}
