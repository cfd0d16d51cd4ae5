//! Per-entity change suppression for outbound updates

use std::collections::HashMap;
use tavern_protocol::{Envelope, MessageType, Payload};
use tracing::trace;

/// Remembers the last value sent for every field of every entity
#[derive(Debug, Default)]
pub struct DeltaCache {
    sent: HashMap<(MessageType, String), Payload>,
}

impl DeltaCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fields that differ from what was last sent for `id`
    ///
    /// Returns `None` when nothing changed. The cache is updated with the
    /// returned fields.
    pub fn diff(&mut self, kind: &MessageType, id: &str, fields: Payload) -> Option<Payload> {
        let last = self.sent.entry((kind.clone(), id.to_string())).or_default();
        let changed: Payload = fields
            .into_iter()
            .filter(|(name, value)| last.get(name) != Some(value))
            .collect();

        if changed.is_empty() {
            trace!("Suppressed redundant {} for {}", kind, id);
            return None;
        }
        for (name, value) in &changed {
            last.insert(name.clone(), value.clone());
        }
        Some(changed)
    }

    /// Build the outbound envelope for a delta, if any field changed
    pub fn envelope(&mut self, kind: MessageType, id: &str, fields: Payload) -> Option<Envelope> {
        let mut data = self.diff(&kind, id, fields)?;
        data.insert(kind.entity_field().to_string(), id.into());
        Some(Envelope::new(kind, data))
    }

    /// Drop everything remembered about an entity
    pub fn forget(&mut self, id: &str) {
        self.sent.retain(|(_, entity), _| entity != id);
    }

    pub fn clear(&mut self) {
        self.sent.clear();
    }
}
