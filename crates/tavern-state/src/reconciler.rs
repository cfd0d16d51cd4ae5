//! Optimistic reconciliation
//!
//! Local mutations are applied to the [`World`] immediately and tracked by
//! correlation id until the authority answers. Each tracked operation runs a
//! small state machine:
//!
//! ```text
//! Applied --confirmed--> (resolved)
//!    |  \--rejected / timeout--> (rolled back)
//!    |
//!    +--conflict--> AwaitingRefetch --entity fetched--> Applied (retried)
//!                        \--timeout--> (rolled back)
//! ```
//!
//! The first terminal event wins. Its correlation id is remembered so that a
//! late confirmation or rejection for the same operation is a no-op.

use crate::assets::{AssetDependencies, DependencyEvent};
use crate::world::{AssetState, Character, Sprite, SyncStatus, World, WorldEvent};
use crate::StateError;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tavern_protocol::{Envelope, MessageType, Payload};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Reconciliation timing and bookkeeping limits
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How long an operation may wait for the authority
    pub op_timeout: Duration,
    /// How long an entity may wait for its asset before it is reported stalled
    pub asset_stall_after: Duration,
    /// Resolved correlation ids remembered for late-event suppression
    pub resolved_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(10),
            asset_stall_after: Duration::from_secs(60),
            resolved_capacity: 1024,
        }
    }
}

/// A sprite the local user wants to place
#[derive(Debug, Clone, Default)]
pub struct NewSprite {
    pub table_id: String,
    pub x: f64,
    pub y: f64,
    pub asset_id: Option<String>,
    pub properties: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackReason {
    /// The authority refused the operation
    Rejected(String),
    /// No answer within the operation timeout
    TimedOut,
    /// The automatic retry conflicted again
    Conflict { current_version: u64 },
    /// The conflicting entity could not be re-fetched
    RefetchFailed(String),
}

/// Outcome notifications for tracked operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Confirmed {
        correlation_id: String,
        entity_id: String,
    },
    /// A conflict was resolved by re-fetching; the edit was resent
    Retrying {
        correlation_id: String,
        entity_id: String,
        basis_version: u64,
    },
    RolledBack {
        correlation_id: String,
        entity_id: String,
        reason: RollbackReason,
    },
}

/// Everything the reconciler announces, in the order it happened
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    World(WorldEvent),
    Resolution(Resolution),
    Dependency(DependencyEvent),
}

#[derive(Debug)]
enum Operation {
    CreateSprite {
        temp_id: String,
        deleted_locally: bool,
    },
    UpdateCharacter {
        character_id: String,
        changes: Payload,
        /// Last authoritative state, restored on rollback
        snapshot: Option<Character>,
        retried: bool,
    },
    SaveCharacter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Applied,
    AwaitingRefetch { current_version: u64 },
}

#[derive(Debug)]
struct PendingOp {
    operation: Operation,
    phase: Phase,
    applied_at: Instant,
    deadline: Instant,
}

impl PendingOp {
    fn entity_id(&self, correlation_id: &str) -> String {
        match &self.operation {
            Operation::CreateSprite { temp_id, .. } => temp_id.clone(),
            Operation::UpdateCharacter { character_id, .. } => character_id.clone(),
            Operation::SaveCharacter => correlation_id.to_string(),
        }
    }
}

/// Bounded memory of finished correlation ids
#[derive(Debug)]
struct ResolvedSet {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl ResolvedSet {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    fn insert(&mut self, id: String) {
        if self.ids.insert(id.clone()) {
            self.order.push_back(id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn remove(&mut self, id: &str) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.order.retain(|held| held != id);
        true
    }
}

pub struct Reconciler {
    config: ReconcilerConfig,
    world: World,
    assets: AssetDependencies,
    ops: HashMap<String, PendingOp>,
    resolved: ResolvedSet,
    /// Rolled back requests the authority may still apply
    withdrawn: ResolvedSet,
    next_id: u64,
    notifications: Vec<Notification>,
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            assets: AssetDependencies::new(config.asset_stall_after),
            resolved: ResolvedSet::new(config.resolved_capacity),
            withdrawn: ResolvedSet::new(config.resolved_capacity),
            config,
            world: World::new(),
            ops: HashMap::new(),
            next_id: 1,
            notifications: Vec::new(),
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn assets(&self) -> &AssetDependencies {
        &self.assets
    }

    /// Operations still waiting for the authority
    pub fn pending_ops(&self) -> usize {
        self.ops.len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.ops.contains_key(correlation_id)
    }

    pub fn is_resolved(&self, correlation_id: &str) -> bool {
        self.resolved.contains(correlation_id)
    }

    /// Take the notifications recorded since the last call
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// Place a sprite locally under a temporary id and ask the authority for it
    ///
    /// Returns the temporary id (also the correlation id) and the envelope to send.
    pub fn create_sprite(&mut self, now: Instant, new: NewSprite) -> (String, Vec<Envelope>) {
        let temp_id = self.next_correlation_id("opt");

        let mut data = new.properties.clone();
        data.insert("correlation_id".into(), json!(temp_id));
        data.insert("table_id".into(), json!(new.table_id));
        data.insert("x".into(), json!(new.x));
        data.insert("y".into(), json!(new.y));
        if let Some(asset_id) = &new.asset_id {
            data.insert("asset_id".into(), json!(asset_id));
        }

        let mut sprite = Sprite {
            id: temp_id.clone(),
            table_id: new.table_id,
            x: new.x,
            y: new.y,
            asset_id: new.asset_id,
            properties: new.properties,
            asset_state: AssetState::Ready,
            optimistic: true,
        };
        if let Some(asset_id) = sprite.asset_id.clone() {
            if self.assets.register(&asset_id, &temp_id, now) {
                sprite.asset_state = AssetState::AwaitingAsset(asset_id.clone());
                self.notify(DependencyEvent::Deferred {
                    asset_id,
                    entity_id: temp_id.clone(),
                });
            }
        }

        debug!("Optimistic sprite {} on table {}", temp_id, sprite.table_id);
        let event = self.world.upsert_sprite(sprite);
        self.notify(event);
        self.track(
            now,
            temp_id.clone(),
            Operation::CreateSprite {
                temp_id: temp_id.clone(),
                deleted_locally: false,
            },
        );

        (temp_id, vec![Envelope::new(MessageType::SpriteCreate, data)])
    }

    /// Move a sprite locally
    ///
    /// Returns the fields to send, or `None` while the sprite is still
    /// unconfirmed (its final position goes out with the confirmation).
    pub fn move_sprite(&mut self, id: &str, x: f64, y: f64) -> Result<Option<Payload>, StateError> {
        let mut changes = Payload::new();
        changes.insert("x".into(), json!(x));
        changes.insert("y".into(), json!(y));
        self.update_sprite(id, changes)
    }

    /// Change sprite properties locally; same contract as [`Self::move_sprite`]
    pub fn update_sprite(
        &mut self,
        id: &str,
        changes: Payload,
    ) -> Result<Option<Payload>, StateError> {
        let sprite = self
            .world
            .sprite_mut(id)
            .ok_or_else(|| StateError::unknown_sprite(id))?;
        sprite.apply(&changes);
        let optimistic = sprite.optimistic;
        let event = WorldEvent::SpriteUpdated(sprite.clone());
        self.notify(event);

        Ok(if optimistic { None } else { Some(changes) })
    }

    /// Remove a sprite locally
    ///
    /// Deleting an unconfirmed sprite sends nothing now; the authoritative
    /// sprite is deleted as soon as its confirmation arrives.
    pub fn delete_sprite(&mut self, id: &str) -> Result<Vec<Envelope>, StateError> {
        let sprite = self
            .world
            .remove_sprite(id)
            .ok_or_else(|| StateError::unknown_sprite(id))?;
        self.assets.remove_entity(id);
        self.notify(WorldEvent::SpriteRemoved { id: id.to_string() });

        if sprite.optimistic {
            if let Some(PendingOp {
                operation: Operation::CreateSprite { deleted_locally, .. },
                ..
            }) = self.ops.get_mut(id)
            {
                *deleted_locally = true;
            }
            return Ok(Vec::new());
        }
        Ok(vec![Envelope::from_json(
            MessageType::SpriteDelete,
            json!({ "sprite_id": id }),
        )])
    }

    /// Apply a character edit locally and send it against a basis version
    ///
    /// The basis is `version` if given, otherwise the locally known version.
    pub fn update_character(
        &mut self,
        now: Instant,
        id: &str,
        changes: Payload,
        version: Option<u64>,
    ) -> Result<(String, Vec<Envelope>), StateError> {
        let character = self
            .world
            .character_mut(id)
            .ok_or_else(|| StateError::unknown_character(id))?;
        let snapshot = character.clone();
        let basis = version.unwrap_or(character.version);

        character.apply(&changes);
        character.sync_status = SyncStatus::Syncing;
        let event = WorldEvent::CharacterUpdated(character.clone());
        self.notify(event);

        let correlation_id = self.next_correlation_id("upd");
        let envelope = character_update(id, basis, &changes, &correlation_id);
        self.track(
            now,
            correlation_id.clone(),
            Operation::UpdateCharacter {
                character_id: id.to_string(),
                changes,
                snapshot: Some(snapshot),
                retried: false,
            },
        );
        Ok((correlation_id, vec![envelope]))
    }

    /// Ask the authority to create a character; it is added once saved
    pub fn create_character(&mut self, now: Instant, data: Payload) -> (String, Vec<Envelope>) {
        let correlation_id = self.next_correlation_id("save");
        let envelope = Envelope::from_json(
            MessageType::CharacterSave,
            json!({ "correlation_id": correlation_id, "data": data }),
        );
        self.track(now, correlation_id.clone(), Operation::SaveCharacter);
        (correlation_id, vec![envelope])
    }

    pub fn delete_character(&mut self, id: &str) -> Result<Vec<Envelope>, StateError> {
        self.world
            .remove_character(id)
            .ok_or_else(|| StateError::unknown_character(id))?;
        self.notify(WorldEvent::CharacterRemoved { id: id.to_string() });
        Ok(vec![Envelope::from_json(
            MessageType::CharacterDelete,
            json!({ "character_id": id }),
        )])
    }

    /// Apply an envelope from the authority; returns envelopes to send in reply
    pub fn handle_inbound(&mut self, now: Instant, envelope: &Envelope) -> Vec<Envelope> {
        let result = match envelope.kind() {
            MessageType::SpriteCreated => self.on_sprite_created(envelope),
            MessageType::SpriteCreateFailed | MessageType::Error => {
                self.on_rejected(envelope);
                Ok(Vec::new())
            }
            MessageType::SpriteList => self.on_sprite_list(now, envelope),
            MessageType::SpriteMove | MessageType::SpriteUpdate => {
                self.on_sprite_changed(envelope)
            }
            MessageType::SpriteDeleted => self.on_sprite_deleted(envelope),
            MessageType::CharacterUpdateResponse => self.on_update_response(now, envelope),
            MessageType::CharacterData => self.on_character_data(now, envelope),
            MessageType::CharacterList => self.on_character_list(envelope),
            MessageType::CharacterSaved => self.on_character_saved(envelope),
            MessageType::CharacterDeleted => self.on_character_deleted(envelope),
            MessageType::AssetUploaded => Ok(self.on_asset_confirmed(envelope, true)),
            MessageType::AssetData => Ok(self.on_asset_confirmed(envelope, false)),
            _ => Ok(Vec::new()),
        };

        result.unwrap_or_else(|e| {
            warn!("Ignoring {} from server: {}", envelope.kind(), e);
            Vec::new()
        })
    }

    /// Fire expired operation timeouts and asset stalls
    pub fn poll(&mut self, now: Instant) {
        let mut expired: Vec<(Instant, String)> = self
            .ops
            .iter()
            .filter(|(_, op)| now >= op.deadline)
            .map(|(id, op)| (op.deadline, id.clone()))
            .collect();
        expired.sort();

        for (_, correlation_id) in expired {
            let Some(op) = self.ops.remove(&correlation_id) else {
                continue;
            };
            let reason = match op.phase {
                Phase::AwaitingRefetch { .. } => {
                    RollbackReason::RefetchFailed("no response to character_load".to_string())
                }
                Phase::Applied => RollbackReason::TimedOut,
            };
            warn!(
                "Operation {} unanswered after {:?}",
                correlation_id,
                now.saturating_duration_since(op.applied_at)
            );
            self.roll_back(correlation_id, op, reason);
        }

        for (asset_id, entities) in self.assets.poll(now) {
            for entity_id in &entities {
                if let Some(sprite) = self.world.sprite_mut(entity_id) {
                    sprite.asset_state = AssetState::Stalled(asset_id.clone());
                    let event = WorldEvent::SpriteUpdated(sprite.clone());
                    self.notify(event);
                }
            }
            self.notify(DependencyEvent::Stalled { asset_id, entities });
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let ops = self.ops.values().map(|op| op.deadline).min();
        match (ops, self.assets.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Roll back every pending operation (the session ended for good)
    pub fn abandon_all(&mut self, reason: &str) {
        let mut ids: Vec<String> = self.ops.keys().cloned().collect();
        ids.sort();
        for correlation_id in ids {
            if let Some(op) = self.ops.remove(&correlation_id) {
                self.roll_back(correlation_id, op, RollbackReason::Rejected(reason.to_string()));
            }
        }
    }

    fn on_sprite_created(&mut self, envelope: &Envelope) -> Result<Vec<Envelope>, StateError> {
        let correlation_id = envelope.str_field("correlation_id");
        if let Some(cid) = correlation_id {
            if self.withdrawn.remove(cid) {
                let server_id = envelope.str_field("sprite_id").or_else(|| envelope.str_field("id"));
                if let Some(server_id) = server_id {
                    info!("{} was rolled back but applied late, deleting {}", cid, server_id);
                    return Ok(vec![Envelope::from_json(
                        MessageType::SpriteDelete,
                        json!({ "sprite_id": server_id }),
                    )]);
                }
            }
            if self.resolved.contains(cid) {
                debug!("Late confirmation for {} ignored", cid);
                return Ok(Vec::new());
            }
            if let Some(op) = self.ops.remove(cid) {
                return self.confirm_sprite(cid.to_string(), op, envelope);
            }
        }

        let sprite = Sprite::from_payload(envelope.data())?;
        if self.world.sprite(&sprite.id).is_none() {
            let sprite = self.with_asset_state(sprite);
            let event = self.world.upsert_sprite(sprite);
            self.notify(event);
        }
        Ok(Vec::new())
    }

    fn confirm_sprite(
        &mut self,
        correlation_id: String,
        op: PendingOp,
        envelope: &Envelope,
    ) -> Result<Vec<Envelope>, StateError> {
        let Operation::CreateSprite {
            temp_id,
            deleted_locally,
        } = &op.operation
        else {
            warn!("{} is not a sprite creation", correlation_id);
            self.ops.insert(correlation_id, op);
            return Ok(Vec::new());
        };
        let temp_id = temp_id.clone();
        let deleted_locally = *deleted_locally;

        let mut sprite = match Sprite::from_payload(envelope.data()) {
            Ok(sprite) => sprite,
            Err(e) => {
                self.roll_back(correlation_id, op, RollbackReason::Rejected(e.to_string()));
                return Ok(Vec::new());
            }
        };
        let server_id = sprite.id.clone();
        let mut outbound = Vec::new();

        if deleted_locally {
            info!("Sprite {} was deleted before confirmation, deleting {}", temp_id, server_id);
            outbound.push(Envelope::from_json(
                MessageType::SpriteDelete,
                json!({ "sprite_id": server_id }),
            ));
        } else {
            let local = self.world.remove_sprite(&temp_id);
            self.notify(WorldEvent::SpriteRemoved { id: temp_id.clone() });

            if let Some(local) = local {
                if local.x != sprite.x || local.y != sprite.y {
                    sprite.x = local.x;
                    sprite.y = local.y;
                    outbound.push(Envelope::from_json(
                        MessageType::SpriteMove,
                        json!({ "sprite_id": server_id, "x": local.x, "y": local.y }),
                    ));
                }
                sprite.asset_state = local.asset_state;
            }
            self.assets.rekey(&temp_id, &server_id);
            sprite.optimistic = false;
            let event = self.world.upsert_sprite(sprite);
            self.notify(event);
        }

        debug!("Sprite {} confirmed as {}", temp_id, server_id);
        self.finish(
            correlation_id.clone(),
            Resolution::Confirmed {
                correlation_id,
                entity_id: server_id,
            },
        );
        Ok(outbound)
    }

    fn on_rejected(&mut self, envelope: &Envelope) {
        let message = envelope
            .str_field("error")
            .or_else(|| envelope.str_field("message"))
            .unwrap_or("rejected by server")
            .to_string();
        let Some(cid) = envelope.str_field("correlation_id") else {
            warn!("Server error: {}", message);
            return;
        };
        match self.ops.remove(cid) {
            Some(op) => self.roll_back(cid.to_string(), op, RollbackReason::Rejected(message)),
            None => debug!("Rejection for unknown or resolved {}: {}", cid, message),
        }
    }

    fn on_sprite_list(
        &mut self,
        now: Instant,
        envelope: &Envelope,
    ) -> Result<Vec<Envelope>, StateError> {
        let entries = envelope
            .data()
            .get("sprites")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut listed = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Value::Object(map) => match Sprite::from_payload(&map) {
                    Ok(sprite) => listed.push(sprite),
                    Err(e) => warn!("Skipping sprite list entry: {}", e),
                },
                other => warn!("Skipping sprite list entry: {}", other),
            }
        }

        if let Some(table_id) = envelope.str_field("table_id") {
            let keep: HashSet<&str> = listed.iter().map(|s| s.id.as_str()).collect();
            let gone: Vec<String> = self
                .world
                .sprites_on(table_id)
                .filter(|s| !s.optimistic && !keep.contains(s.id.as_str()))
                .map(|s| s.id.clone())
                .collect();
            for id in gone {
                self.world.remove_sprite(&id);
                self.assets.remove_entity(&id);
                self.notify(WorldEvent::SpriteRemoved { id });
            }
        }

        for mut sprite in listed {
            match self.world.sprite(&sprite.id) {
                Some(existing) => sprite.asset_state = existing.asset_state.clone(),
                None => {
                    if let Some(asset_id) = sprite.asset_id.clone() {
                        if self.assets.is_waiting(&asset_id) {
                            self.assets.register(&asset_id, &sprite.id, now);
                            sprite.asset_state = AssetState::AwaitingAsset(asset_id);
                        }
                    }
                }
            }
            let event = self.world.upsert_sprite(sprite);
            self.notify(event);
        }
        Ok(Vec::new())
    }

    fn on_sprite_changed(&mut self, envelope: &Envelope) -> Result<Vec<Envelope>, StateError> {
        let id = envelope.require_str("sprite_id")?;
        match self.world.sprite_mut(id) {
            Some(sprite) => {
                sprite.apply(envelope.data());
                let event = WorldEvent::SpriteUpdated(sprite.clone());
                self.notify(event);
            }
            None => trace!("{} for unknown sprite {}", envelope.kind(), id),
        }
        Ok(Vec::new())
    }

    fn on_sprite_deleted(&mut self, envelope: &Envelope) -> Result<Vec<Envelope>, StateError> {
        let id = envelope.require_str("sprite_id")?;
        if self.world.remove_sprite(id).is_some() {
            self.assets.remove_entity(id);
            self.notify(WorldEvent::SpriteRemoved { id: id.to_string() });
        }
        Ok(Vec::new())
    }

    fn on_update_response(
        &mut self,
        now: Instant,
        envelope: &Envelope,
    ) -> Result<Vec<Envelope>, StateError> {
        let cid = envelope.require_str("correlation_id")?.to_string();
        if self.withdrawn.remove(&cid) && envelope.bool_field("success").unwrap_or(false) {
            if let Some(character_id) = envelope.str_field("character_id") {
                info!("{} was rolled back but applied late, reloading {}", cid, character_id);
                return Ok(vec![Envelope::from_json(
                    MessageType::CharacterLoad,
                    json!({ "character_id": character_id }),
                )]);
            }
        }
        if self.resolved.contains(&cid) {
            debug!("Late update response for {} ignored", cid);
            return Ok(Vec::new());
        }
        let Some(mut op) = self.ops.remove(&cid) else {
            debug!("Update response for unknown {}", cid);
            return Ok(Vec::new());
        };
        let Operation::UpdateCharacter {
            character_id,
            retried,
            ..
        } = &op.operation
        else {
            self.ops.insert(cid, op);
            return Ok(Vec::new());
        };
        let character_id = character_id.clone();
        let retried = *retried;

        if op.phase != Phase::Applied {
            // Only the response to the edit in flight counts
            self.ops.insert(cid, op);
            return Ok(Vec::new());
        }

        if envelope.bool_field("success").unwrap_or(false) {
            if let Some(character) = self.world.character_mut(&character_id) {
                character.version = envelope
                    .u64_field("version")
                    .unwrap_or(character.version + 1);
                character.sync_status = SyncStatus::Synced;
                let event = WorldEvent::CharacterUpdated(character.clone());
                self.notify(event);
            }
            self.finish(
                cid.clone(),
                Resolution::Confirmed {
                    correlation_id: cid,
                    entity_id: character_id,
                },
            );
            return Ok(Vec::new());
        }

        if !envelope.bool_field("conflict").unwrap_or(false) {
            let message = envelope
                .str_field("error")
                .unwrap_or("update rejected")
                .to_string();
            self.roll_back(cid, op, RollbackReason::Rejected(message));
            return Ok(Vec::new());
        }

        let Some(current_version) = envelope.u64_field("current_version") else {
            self.roll_back(
                cid,
                op,
                RollbackReason::Rejected("conflict without current_version".to_string()),
            );
            return Ok(Vec::new());
        };

        if retried {
            warn!("Retry of {} conflicted again at version {}", cid, current_version);
            self.roll_back(cid, op, RollbackReason::Conflict { current_version });
            return Ok(Vec::new());
        }

        info!(
            "Version conflict on {} (server at {}), re-fetching",
            character_id, current_version
        );
        if let Some(character) = self.world.character_mut(&character_id) {
            character.sync_status = SyncStatus::Error;
            let event = WorldEvent::CharacterUpdated(character.clone());
            self.notify(event);
        }
        op.phase = Phase::AwaitingRefetch { current_version };
        op.deadline = now + self.config.op_timeout;
        self.ops.insert(cid.clone(), op);

        Ok(vec![Envelope::from_json(
            MessageType::CharacterLoad,
            json!({ "character_id": character_id, "correlation_id": cid }),
        )])
    }

    fn on_character_data(
        &mut self,
        now: Instant,
        envelope: &Envelope,
    ) -> Result<Vec<Envelope>, StateError> {
        let fetched = Character::from_payload(envelope.data())?;

        let refetch = envelope
            .str_field("correlation_id")
            .filter(|cid| self.ops.contains_key(*cid))
            .map(str::to_string)
            .or_else(|| self.awaiting_refetch(&fetched.id));

        if let Some(cid) = refetch {
            if let Some(envelope) = self.retry_update(now, &cid, fetched.clone()) {
                return Ok(vec![envelope]);
            }
        }

        self.adopt_character(fetched);
        Ok(Vec::new())
    }

    /// Reapply a conflicted edit over the fetched entity
    fn retry_update(&mut self, now: Instant, cid: &str, fetched: Character) -> Option<Envelope> {
        let timeout = self.config.op_timeout;
        let op = self.ops.get_mut(cid)?;
        let Phase::AwaitingRefetch { current_version } = op.phase else {
            return None;
        };
        let Operation::UpdateCharacter {
            character_id,
            changes,
            snapshot,
            retried,
        } = &mut op.operation
        else {
            return None;
        };
        if *character_id != fetched.id {
            return None;
        }

        *snapshot = Some(fetched.clone());
        *retried = true;
        op.phase = Phase::Applied;
        op.deadline = now + timeout;

        let mut character = fetched;
        character.apply(changes);
        character.sync_status = SyncStatus::Syncing;
        let envelope = character_update(character_id, current_version, changes, cid);
        let resolution = Resolution::Retrying {
            correlation_id: cid.to_string(),
            entity_id: character_id.clone(),
            basis_version: current_version,
        };

        debug!("Retrying {} against version {}", cid, current_version);
        let event = self.world.upsert_character(character);
        self.notify(event);
        self.notify(resolution);
        Some(envelope)
    }

    fn adopt_character(&mut self, mut fetched: Character) {
        // Keep edits in flight visible on top of the authoritative data
        let pending = self.ops.values_mut().find_map(|op| match &mut op.operation {
            Operation::UpdateCharacter {
                character_id,
                changes,
                snapshot,
                ..
            } if *character_id == fetched.id => Some((changes, snapshot)),
            _ => None,
        });
        if let Some((changes, snapshot)) = pending {
            *snapshot = Some(fetched.clone());
            fetched.apply(changes);
            fetched.sync_status = SyncStatus::Syncing;
        }
        let event = self.world.upsert_character(fetched);
        self.notify(event);
    }

    fn on_character_list(&mut self, envelope: &Envelope) -> Result<Vec<Envelope>, StateError> {
        let entries = envelope
            .data()
            .get("characters")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut listed = Vec::with_capacity(entries.len());
        for entry in entries {
            if let Value::Object(map) = entry {
                match Character::from_payload(&map) {
                    Ok(character) => listed.push(character),
                    Err(e) => warn!("Skipping character list entry: {}", e),
                }
            }
        }

        let keep: HashSet<&str> = listed.iter().map(|c| c.id.as_str()).collect();
        let busy = self.busy_characters();
        let gone: Vec<String> = self
            .world
            .characters()
            .filter(|c| !keep.contains(c.id.as_str()) && !busy.contains(&c.id))
            .map(|c| c.id.clone())
            .collect();
        for id in gone {
            self.world.remove_character(&id);
            self.notify(WorldEvent::CharacterRemoved { id });
        }
        for character in listed {
            self.adopt_character(character);
        }
        Ok(Vec::new())
    }

    fn on_character_saved(&mut self, envelope: &Envelope) -> Result<Vec<Envelope>, StateError> {
        let character = Character::from_payload(envelope.data())?;
        let id = character.id.clone();
        let event = self.world.upsert_character(character);
        self.notify(event);

        if let Some(cid) = envelope.str_field("correlation_id") {
            if let Some(op) = self.ops.remove(cid) {
                if matches!(op.operation, Operation::SaveCharacter) {
                    self.finish(
                        cid.to_string(),
                        Resolution::Confirmed {
                            correlation_id: cid.to_string(),
                            entity_id: id,
                        },
                    );
                } else {
                    self.ops.insert(cid.to_string(), op);
                }
            }
        }
        Ok(Vec::new())
    }

    fn on_character_deleted(&mut self, envelope: &Envelope) -> Result<Vec<Envelope>, StateError> {
        let id = envelope.require_str("character_id")?.to_string();
        let orphaned: Vec<String> = self
            .ops
            .iter()
            .filter(|(_, op)| {
                matches!(&op.operation, Operation::UpdateCharacter { character_id, .. } if *character_id == id)
            })
            .map(|(cid, _)| cid.clone())
            .collect();
        for cid in orphaned {
            if let Some(mut op) = self.ops.remove(&cid) {
                if let Operation::UpdateCharacter { snapshot, .. } = &mut op.operation {
                    *snapshot = None;
                }
                self.roll_back(cid, op, RollbackReason::Rejected("character deleted".to_string()));
            }
        }
        if self.world.remove_character(&id).is_some() {
            self.notify(WorldEvent::CharacterRemoved { id });
        }
        Ok(Vec::new())
    }

    fn on_asset_confirmed(&mut self, envelope: &Envelope, request_download: bool) -> Vec<Envelope> {
        let Some(asset_id) = envelope.str_field("asset_id") else {
            warn!("{} without asset_id", envelope.kind());
            return Vec::new();
        };
        let entities = self.assets.release(asset_id);
        if entities.is_empty() {
            return Vec::new();
        }

        info!("Asset {} confirmed, releasing {} entities", asset_id, entities.len());
        for entity_id in &entities {
            if let Some(sprite) = self.world.sprite_mut(entity_id) {
                sprite.asset_state = AssetState::Ready;
                let event = WorldEvent::SpriteUpdated(sprite.clone());
                self.notify(event);
            }
        }
        self.notify(DependencyEvent::Released {
            asset_id: asset_id.to_string(),
            entities,
        });

        if request_download {
            vec![Envelope::from_json(
                MessageType::AssetDownloadRequest,
                json!({ "asset_id": asset_id }),
            )]
        } else {
            Vec::new()
        }
    }

    fn roll_back(&mut self, correlation_id: String, op: PendingOp, reason: RollbackReason) {
        let entity_id = op.entity_id(&correlation_id);
        warn!("Rolling back {} ({:?})", correlation_id, reason);
        if !matches!(op.operation, Operation::SaveCharacter) {
            self.withdrawn.insert(correlation_id.clone());
        }

        match op.operation {
            Operation::CreateSprite { temp_id, .. } => {
                self.assets.remove_entity(&temp_id);
                if self.world.remove_sprite(&temp_id).is_some() {
                    self.notify(WorldEvent::SpriteRemoved { id: temp_id });
                }
            }
            Operation::UpdateCharacter {
                character_id,
                snapshot,
                ..
            } => {
                let restored = snapshot.or_else(|| self.world.character(&character_id).cloned());
                if let Some(mut character) = restored {
                    character.sync_status = SyncStatus::Error;
                    let event = self.world.upsert_character(character);
                    self.notify(event);
                }
            }
            Operation::SaveCharacter => {}
        }

        self.finish(
            correlation_id.clone(),
            Resolution::RolledBack {
                correlation_id,
                entity_id,
                reason,
            },
        );
    }

    fn finish(&mut self, correlation_id: String, resolution: Resolution) {
        self.resolved.insert(correlation_id);
        self.notify(resolution);
    }

    fn track(&mut self, now: Instant, correlation_id: String, operation: Operation) {
        self.ops.insert(
            correlation_id,
            PendingOp {
                operation,
                phase: Phase::Applied,
                applied_at: now,
                deadline: now + self.config.op_timeout,
            },
        );
    }

    fn awaiting_refetch(&self, character: &str) -> Option<String> {
        self.ops.iter().find_map(|(cid, op)| match (&op.operation, op.phase) {
            (
                Operation::UpdateCharacter { character_id, .. },
                Phase::AwaitingRefetch { .. },
            ) if character_id == character => Some(cid.clone()),
            _ => None,
        })
    }

    fn busy_characters(&self) -> HashSet<String> {
        self.ops
            .values()
            .filter_map(|op| match &op.operation {
                Operation::UpdateCharacter { character_id, .. } => Some(character_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn with_asset_state(&self, mut sprite: Sprite) -> Sprite {
        if let Some(asset_id) = &sprite.asset_id {
            if self.assets.is_waiting(asset_id) {
                sprite.asset_state = AssetState::AwaitingAsset(asset_id.clone());
            }
        }
        sprite
    }

    fn next_correlation_id(&mut self, prefix: &str) -> String {
        let id = format!("{}_{}", prefix, self.next_id);
        self.next_id += 1;
        id
    }

    fn notify(&mut self, notification: impl Into<Notification>) {
        self.notifications.push(notification.into());
    }
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

impl From<WorldEvent> for Notification {
    fn from(event: WorldEvent) -> Self {
        Notification::World(event)
    }
}

impl From<Resolution> for Notification {
    fn from(resolution: Resolution) -> Self {
        Notification::Resolution(resolution)
    }
}

impl From<DependencyEvent> for Notification {
    fn from(event: DependencyEvent) -> Self {
        Notification::Dependency(event)
    }
}

fn character_update(id: &str, basis: u64, changes: &Payload, correlation_id: &str) -> Envelope {
    Envelope::from_json(
        MessageType::CharacterUpdate,
        json!({
            "character_id": id,
            "version": basis,
            "updates": changes,
            "correlation_id": correlation_id,
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn payload(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn new_sprite(asset: Option<&str>) -> NewSprite {
        NewSprite {
            table_id: "t1".to_string(),
            x: 1.0,
            y: 2.0,
            asset_id: asset.map(str::to_string),
            properties: Payload::new(),
        }
    }

    fn sprite_created(cid: &str, id: &str) -> Envelope {
        Envelope::from_json(
            MessageType::SpriteCreated,
            json!({ "correlation_id": cid, "sprite_id": id, "table_id": "t1", "x": 1.0, "y": 2.0 }),
        )
    }

    fn resolutions(reconciler: &mut Reconciler) -> Vec<Resolution> {
        reconciler
            .drain_notifications()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Resolution(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_create_sprite_applies_immediately() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();

        let (temp_id, out) = reconciler.create_sprite(now, new_sprite(None));
        assert_eq!(temp_id, "opt_1");
        assert_eq!(out[0].kind(), &MessageType::SpriteCreate);
        assert_eq!(out[0].str_field("correlation_id"), Some("opt_1"));

        let sprite = reconciler.world().sprite("opt_1").unwrap();
        assert!(sprite.optimistic);
        assert!(matches!(
            reconciler.drain_notifications().as_slice(),
            [Notification::World(WorldEvent::SpriteAdded(_))]
        ));
        assert_eq!(reconciler.next_deadline(), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn test_confirmation_removes_temp_before_adding_authoritative() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();
        let (temp_id, _) = reconciler.create_sprite(now, new_sprite(None));
        reconciler.drain_notifications();

        let out = reconciler.handle_inbound(now, &sprite_created(&temp_id, "s-100"));
        assert!(out.is_empty());

        let notifications = reconciler.drain_notifications();
        assert_eq!(
            notifications[0],
            Notification::World(WorldEvent::SpriteRemoved { id: temp_id.clone() })
        );
        assert!(matches!(
            &notifications[1],
            Notification::World(WorldEvent::SpriteAdded(s)) if s.id == "s-100" && !s.optimistic
        ));
        assert_eq!(
            notifications[2],
            Notification::Resolution(Resolution::Confirmed {
                correlation_id: temp_id.clone(),
                entity_id: "s-100".to_string(),
            })
        );
        assert!(reconciler.world().sprite(&temp_id).is_none());
        assert_eq!(reconciler.next_deadline(), None);
    }

    #[test]
    fn test_exactly_one_terminal_outcome() {
        let mut reconciler = Reconciler::default();
        let t0 = Instant::now();
        let (temp_id, _) = reconciler.create_sprite(t0, new_sprite(None));

        reconciler.poll(t0 + Duration::from_secs(10));
        assert_eq!(
            resolutions(&mut reconciler),
            vec![Resolution::RolledBack {
                correlation_id: temp_id.clone(),
                entity_id: temp_id.clone(),
                reason: RollbackReason::TimedOut,
            }]
        );
        assert!(reconciler.world().sprite(&temp_id).is_none());

        // A late confirmation is a no-op
        reconciler.handle_inbound(t0 + Duration::from_secs(11), &sprite_created(&temp_id, "s-1"));
        assert!(reconciler.drain_notifications().is_empty());
        assert!(reconciler.world().sprite("s-1").is_none());
        assert!(reconciler.is_resolved(&temp_id));
    }

    #[test]
    fn test_rejection_rolls_back() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();
        let (temp_id, _) = reconciler.create_sprite(now, new_sprite(None));

        let failed = Envelope::from_json(
            MessageType::SpriteCreateFailed,
            json!({ "correlation_id": temp_id, "error": "table locked" }),
        );
        reconciler.handle_inbound(now, &failed);
        let resolved = resolutions(&mut reconciler);
        assert!(matches!(
            resolved.as_slice(),
            [Resolution::RolledBack { reason: RollbackReason::Rejected(msg), .. }] if msg == "table locked"
        ));

        // Confirmation after rejection changes nothing
        reconciler.handle_inbound(now, &sprite_created(&temp_id, "s-2"));
        assert!(reconciler.world().sprite("s-2").is_none());
    }

    #[test]
    fn test_delete_before_confirmation_deletes_authoritative_sprite() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();
        let (temp_id, _) = reconciler.create_sprite(now, new_sprite(None));

        assert!(reconciler.delete_sprite(&temp_id).unwrap().is_empty());
        let out = reconciler.handle_inbound(now, &sprite_created(&temp_id, "s-7"));

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), &MessageType::SpriteDelete);
        assert_eq!(out[0].str_field("sprite_id"), Some("s-7"));
        assert!(reconciler.world().sprite("s-7").is_none());
        assert_eq!(reconciler.pending_ops(), 0);
    }

    #[test]
    fn test_creation_applied_after_timeout_is_deleted() {
        let mut reconciler = Reconciler::default();
        let t0 = Instant::now();
        let (temp_id, _) = reconciler.create_sprite(t0, new_sprite(None));

        reconciler.poll(t0 + Duration::from_secs(10));
        assert!(matches!(
            resolutions(&mut reconciler).as_slice(),
            [Resolution::RolledBack { reason: RollbackReason::TimedOut, .. }]
        ));

        let out = reconciler.handle_inbound(t0 + Duration::from_secs(12), &sprite_created(&temp_id, "s-8"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), &MessageType::SpriteDelete);
        assert_eq!(out[0].str_field("sprite_id"), Some("s-8"));
        assert!(reconciler.world().sprite("s-8").is_none());
        assert!(resolutions(&mut reconciler).is_empty());

        // A duplicate confirmation does not delete twice
        let again = reconciler.handle_inbound(t0 + Duration::from_secs(13), &sprite_created(&temp_id, "s-8"));
        assert!(again.is_empty());
    }

    #[test]
    fn test_move_while_unconfirmed_is_sent_with_confirmation() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();
        let (temp_id, _) = reconciler.create_sprite(now, new_sprite(None));

        assert_eq!(reconciler.move_sprite(&temp_id, 9.0, 9.0).unwrap(), None);
        let out = reconciler.handle_inbound(now, &sprite_created(&temp_id, "s-3"));

        assert_eq!(out[0].kind(), &MessageType::SpriteMove);
        assert_eq!(reconciler.world().sprite("s-3").unwrap().x, 9.0);
        assert!(reconciler.move_sprite("s-3", 4.0, 4.0).unwrap().is_some());
    }

    #[test]
    fn test_unknown_sprite_is_an_error() {
        let mut reconciler = Reconciler::default();
        assert!(matches!(
            reconciler.move_sprite("nope", 0.0, 0.0),
            Err(StateError::UnknownEntity { kind: "sprite", .. })
        ));
        assert!(reconciler.delete_sprite("nope").is_err());
    }

    fn seed_character(reconciler: &mut Reconciler, version: u64, hp: i64) {
        let data = Envelope::from_json(
            MessageType::CharacterData,
            json!({ "character_id": "char-1", "version": version, "data": { "hp": hp } }),
        );
        reconciler.handle_inbound(Instant::now(), &data);
        reconciler.drain_notifications();
    }

    #[test]
    fn test_conflict_refetch_and_retry_with_server_version() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();
        seed_character(&mut reconciler, 3, 12);

        let (cid, out) = reconciler
            .update_character(now, "char-1", payload(json!({ "hp": 10 })), Some(3))
            .unwrap();
        assert_eq!(out[0].u64_field("version"), Some(3));

        let conflict = Envelope::from_json(
            MessageType::CharacterUpdateResponse,
            json!({ "character_id": "char-1", "correlation_id": cid, "success": false,
                    "conflict": true, "current_version": 5 }),
        );
        let out = reconciler.handle_inbound(now, &conflict);
        assert_eq!(out[0].kind(), &MessageType::CharacterLoad);
        assert_eq!(
            reconciler.world().character("char-1").unwrap().sync_status,
            SyncStatus::Error
        );

        let fetched = Envelope::from_json(
            MessageType::CharacterData,
            json!({ "character_id": "char-1", "correlation_id": cid, "version": 5, "data": { "hp": 8 } }),
        );
        let out = reconciler.handle_inbound(now, &fetched);
        assert_eq!(out[0].kind(), &MessageType::CharacterUpdate);
        assert_eq!(out[0].u64_field("version"), Some(5));
        assert_eq!(
            reconciler.world().character("char-1").unwrap().sync_status,
            SyncStatus::Syncing
        );

        let accepted = Envelope::from_json(
            MessageType::CharacterUpdateResponse,
            json!({ "character_id": "char-1", "correlation_id": cid, "success": true, "version": 6 }),
        );
        reconciler.handle_inbound(now, &accepted);

        let character = reconciler.world().character("char-1").unwrap();
        assert_eq!(character.version, 6);
        assert_eq!(character.data.get("hp"), Some(&json!(10)));
        assert_eq!(character.sync_status, SyncStatus::Synced);

        let resolved = resolutions(&mut reconciler);
        assert_eq!(
            resolved,
            vec![
                Resolution::Retrying {
                    correlation_id: cid.clone(),
                    entity_id: "char-1".to_string(),
                    basis_version: 5,
                },
                Resolution::Confirmed {
                    correlation_id: cid,
                    entity_id: "char-1".to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_second_conflict_rolls_back() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();
        seed_character(&mut reconciler, 3, 12);
        let (cid, _) = reconciler
            .update_character(now, "char-1", payload(json!({ "hp": 10 })), None)
            .unwrap();

        let conflict = |version: u64| {
            Envelope::from_json(
                MessageType::CharacterUpdateResponse,
                json!({ "correlation_id": cid, "conflict": true, "current_version": version }),
            )
        };
        reconciler.handle_inbound(now, &conflict(5));
        reconciler.handle_inbound(
            now,
            &Envelope::from_json(
                MessageType::CharacterData,
                json!({ "character_id": "char-1", "version": 5, "data": { "hp": 8 } }),
            ),
        );
        let out = reconciler.handle_inbound(now, &conflict(7));
        assert!(out.is_empty());

        let character = reconciler.world().character("char-1").unwrap();
        assert_eq!(character.sync_status, SyncStatus::Error);
        assert_eq!(character.data.get("hp"), Some(&json!(8)));
        assert_eq!(character.version, 5);
        assert!(resolutions(&mut reconciler).contains(&Resolution::RolledBack {
            correlation_id: cid,
            entity_id: "char-1".to_string(),
            reason: RollbackReason::Conflict { current_version: 7 },
        }));
    }

    #[test]
    fn test_update_applied_after_timeout_reloads_character() {
        let mut reconciler = Reconciler::default();
        let t0 = Instant::now();
        seed_character(&mut reconciler, 3, 12);
        let (cid, _) = reconciler
            .update_character(t0, "char-1", payload(json!({ "hp": 10 })), None)
            .unwrap();

        reconciler.poll(t0 + Duration::from_secs(10));
        assert_eq!(reconciler.world().character("char-1").unwrap().data.get("hp"), Some(&json!(12)));

        let out = reconciler.handle_inbound(
            t0 + Duration::from_secs(11),
            &Envelope::from_json(
                MessageType::CharacterUpdateResponse,
                json!({ "correlation_id": cid, "success": true, "character_id": "char-1", "version": 4 }),
            ),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), &MessageType::CharacterLoad);
        assert_eq!(out[0].str_field("character_id"), Some("char-1"));
    }

    #[test]
    fn test_refetch_timeout_surfaces_error() {
        let mut reconciler = Reconciler::default();
        let t0 = Instant::now();
        seed_character(&mut reconciler, 3, 12);
        let (cid, _) = reconciler
            .update_character(t0, "char-1", payload(json!({ "hp": 10 })), None)
            .unwrap();

        let t1 = t0 + Duration::from_secs(2);
        reconciler.handle_inbound(
            t1,
            &Envelope::from_json(
                MessageType::CharacterUpdateResponse,
                json!({ "correlation_id": cid, "conflict": true, "current_version": 5 }),
            ),
        );
        assert_eq!(reconciler.next_deadline(), Some(t1 + Duration::from_secs(10)));

        reconciler.poll(t1 + Duration::from_secs(10));
        let character = reconciler.world().character("char-1").unwrap();
        assert_eq!(character.sync_status, SyncStatus::Error);
        assert_eq!(character.data.get("hp"), Some(&json!(12)));
        assert!(matches!(
            resolutions(&mut reconciler).as_slice(),
            [Resolution::RolledBack { reason: RollbackReason::RefetchFailed(_), .. }]
        ));
    }

    #[test]
    fn test_unconfirmed_asset_stalls_without_duplication() {
        let mut reconciler = Reconciler::default();
        let t0 = Instant::now();

        let (temp_id, _) = reconciler.create_sprite(t0, new_sprite(Some("asset_77")));
        assert!(matches!(
            reconciler.drain_notifications().as_slice(),
            [
                Notification::Dependency(DependencyEvent::Deferred { .. }),
                Notification::World(WorldEvent::SpriteAdded(_)),
            ]
        ));

        let mut created = sprite_created(&temp_id, "s-55");
        created = Envelope::from_json(MessageType::SpriteCreated, {
            let mut data = created.into_data();
            data.insert("asset_id".into(), json!("asset_77"));
            Value::Object(data)
        });
        reconciler.handle_inbound(t0 + Duration::from_secs(1), &created);
        reconciler.drain_notifications();

        reconciler.poll(t0 + Duration::from_secs(60));
        let notifications = reconciler.drain_notifications();
        assert!(notifications.contains(&Notification::Dependency(DependencyEvent::Stalled {
            asset_id: "asset_77".to_string(),
            entities: vec!["s-55".to_string()],
        })));

        // Much later: still exactly one sprite, still stalled, no repeat events
        reconciler.poll(t0 + Duration::from_secs(3600));
        assert!(reconciler.drain_notifications().is_empty());
        let sprites: Vec<&Sprite> = reconciler.world().sprites().collect();
        assert_eq!(sprites.len(), 1);
        assert_eq!(sprites[0].asset_state, AssetState::Stalled("asset_77".to_string()));
    }

    #[test]
    fn test_asset_confirmation_releases_dependents_once() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();
        reconciler.create_sprite(now, new_sprite(Some("a1")));
        reconciler.create_sprite(now, new_sprite(Some("a1")));
        reconciler.drain_notifications();

        let uploaded =
            Envelope::from_json(MessageType::AssetUploaded, json!({ "asset_id": "a1" }));
        let out = reconciler.handle_inbound(now, &uploaded);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind(), &MessageType::AssetDownloadRequest);
        assert!(reconciler.world().sprites().all(|s| s.asset_state == AssetState::Ready));
        assert!(reconciler.drain_notifications().contains(&Notification::Dependency(
            DependencyEvent::Released {
                asset_id: "a1".to_string(),
                entities: vec!["opt_1".to_string(), "opt_2".to_string()],
            }
        )));

        assert!(reconciler.handle_inbound(now, &uploaded).is_empty());
    }

    #[test]
    fn test_sprite_list_replaces_table_but_keeps_optimistic() {
        let mut reconciler = Reconciler::default();
        let now = Instant::now();
        reconciler.handle_inbound(now, &sprite_created("", "old"));
        let (temp_id, _) = reconciler.create_sprite(now, new_sprite(None));

        let list = Envelope::from_json(
            MessageType::SpriteList,
            json!({ "table_id": "t1", "sprites": [ { "sprite_id": "s1", "table_id": "t1" } ] }),
        );
        reconciler.handle_inbound(now, &list);

        let mut ids: Vec<&str> = reconciler.world().sprites().map(|s| s.id.as_str()).collect();
        ids.sort();
        assert_eq!(ids, vec![temp_id.as_str(), "s1"]);
    }
}
