//! The sync engine task
//!
//! One tokio task owns the lifecycle manager, the outbound scheduler, the
//! delta cache, the reconciler and the live link. Everything that touches
//! them arrives as an event on one of four sources: a caller command, the
//! result of a connect attempt, a frame or close from the link, or the
//! nearest timer deadline. After every event the engine publishes whatever
//! its components recorded to the subscription hub.

use crate::{ClientConfig, ClientError};
use serde_json::json;
use std::sync::Arc;
use tavern_network::{
    ConnectionEvent, ConnectionManager, ConnectionState, Connector, DeltaCache, LifecycleAction,
    Link, LinkEvent, NetworkError, OutboundScheduler,
};
use tavern_protocol::close::CLOSE_GOING_AWAY;
use tavern_protocol::{CloseReason, Envelope, MessageType, Payload, PROTOCOL_VERSION};
use tavern_state::{
    DependencyEvent, NewSprite, Notification, Reconciler, Resolution, World, WorldEvent,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

/// Requests from [`crate::SyncClient`] handles
pub(crate) enum Command {
    Connect,
    Disconnect,
    Send(Envelope),
    SendDelta {
        kind: MessageType,
        id: String,
        fields: Payload,
    },
    CreateSprite {
        new: NewSprite,
        reply: Reply<String>,
    },
    MoveSprite {
        id: String,
        x: f64,
        y: f64,
        reply: Reply<()>,
    },
    UpdateSprite {
        id: String,
        changes: Payload,
        reply: Reply<()>,
    },
    DeleteSprite {
        id: String,
        reply: Reply<()>,
    },
    CreateCharacter {
        data: Payload,
        reply: Reply<String>,
    },
    UpdateCharacter {
        id: String,
        changes: Payload,
        version: Option<u64>,
        reply: Reply<String>,
    },
    DeleteCharacter {
        id: String,
        reply: Reply<()>,
    },
    Snapshot(oneshot::Sender<World>),
    IsConnected(oneshot::Sender<bool>),
    Shutdown,
}

/// Fan-out side of every subscription
pub(crate) struct Hub {
    pub(crate) state: watch::Sender<ConnectionState>,
    pub(crate) connection: broadcast::Sender<ConnectionEvent>,
    pub(crate) messages: broadcast::Sender<Envelope>,
    pub(crate) resolutions: broadcast::Sender<Resolution>,
    pub(crate) dependencies: broadcast::Sender<DependencyEvent>,
    pub(crate) world: broadcast::Sender<WorldEvent>,
}

impl Hub {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            connection: broadcast::channel(capacity).0,
            messages: broadcast::channel(capacity).0,
            resolutions: broadcast::channel(capacity).0,
            dependencies: broadcast::channel(capacity).0,
            world: broadcast::channel(capacity).0,
        }
    }
}

type Attempt = (u64, Result<Link, NetworkError>);

pub(crate) struct Engine<C> {
    connector: Arc<C>,
    user: String,
    hub: Arc<Hub>,
    lifecycle: ConnectionManager,
    scheduler: OutboundScheduler,
    delta: DeltaCache,
    reconciler: Reconciler,
    link: Option<Link>,
    connecting: Option<JoinHandle<()>>,
    /// Bumped whenever a connect attempt is started or abandoned
    generation: u64,
    attempts_tx: mpsc::UnboundedSender<Attempt>,
    attempts_rx: mpsc::UnboundedReceiver<Attempt>,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl<C: Connector> Engine<C> {
    pub(crate) fn new(
        connector: Arc<C>,
        config: ClientConfig,
        hub: Arc<Hub>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (attempts_tx, attempts_rx) = mpsc::unbounded_channel();
        Self {
            connector,
            user: config.user,
            hub,
            lifecycle: ConnectionManager::new(config.lifecycle),
            scheduler: OutboundScheduler::new(config.scheduler),
            delta: DeltaCache::new(),
            reconciler: Reconciler::new(config.reconciler),
            link: None,
            connecting: None,
            generation: 0,
            attempts_tx,
            attempts_rx,
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Sync engine started for {}", self.user);
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some((generation, result)) = self.attempts_rx.recv() => {
                    self.on_attempt(generation, result);
                }
                event = recv_link(&mut self.link) => self.on_link_event(event),
                _ = sleep_until(deadline) => {}
            }
            self.tick(Instant::now());
            self.publish();
        }

        let actions = self.lifecycle.disconnect();
        self.apply_actions(actions);
        if let Some(link) = self.link.take() {
            link.close(CloseReason::new(CLOSE_GOING_AWAY, "client shutting down"));
        }
        self.publish();
        debug!("Sync engine stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.lifecycle.next_deadline(),
            self.scheduler.next_deadline(),
            self.reconciler.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn can_send(&self) -> bool {
        self.lifecycle.can_send() && self.link.as_ref().is_some_and(Link::is_open)
    }

    fn tick(&mut self, now: Instant) {
        let actions = self.lifecycle.poll(now);
        self.apply_actions(actions);

        let ready = self.scheduler.poll(now, self.can_send());
        self.transmit(ready);

        self.reconciler.poll(now);
    }

    fn on_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Connect => {
                let actions = self.lifecycle.connect(now);
                self.apply_actions(actions);
            }
            Command::Disconnect => {
                let actions = self.lifecycle.disconnect();
                self.apply_actions(actions);
            }
            Command::Send(envelope) => self.submit(now, envelope),
            Command::SendDelta { kind, id, fields } => {
                if let Some(envelope) = self.delta.envelope(kind, &id, fields) {
                    self.submit(now, envelope);
                }
            }
            Command::CreateSprite { new, reply } => {
                let _ = reply.send(self.create_sprite(now, new));
            }
            Command::MoveSprite { id, x, y, reply } => {
                let _ = reply.send(self.move_sprite(now, &id, x, y));
            }
            Command::UpdateSprite { id, changes, reply } => {
                let _ = reply.send(self.update_sprite(now, &id, changes));
            }
            Command::DeleteSprite { id, reply } => {
                let _ = reply.send(self.delete_sprite(now, &id));
            }
            Command::CreateCharacter { data, reply } => {
                let _ = reply.send(self.create_character(now, data));
            }
            Command::UpdateCharacter {
                id,
                changes,
                version,
                reply,
            } => {
                let _ = reply.send(self.update_character(now, &id, changes, version));
            }
            Command::DeleteCharacter { id, reply } => {
                let _ = reply.send(self.delete_character(now, &id));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.reconciler.world().clone());
            }
            Command::IsConnected(reply) => {
                let link_open = self.link.as_ref().is_some_and(Link::is_open);
                let _ = reply.send(self.lifecycle.is_connected(link_open));
            }
            // Handled by the run loop
            Command::Shutdown => {}
        }
    }

    /// Local edits need a session that is up or on its way back
    fn ensure_online(&self) -> Result<(), ClientError> {
        match self.lifecycle.state() {
            ConnectionState::Disconnected | ConnectionState::Failed(_) => Err(ClientError::Offline),
            _ => Ok(()),
        }
    }

    fn create_sprite(&mut self, now: Instant, new: NewSprite) -> Result<String, ClientError> {
        self.ensure_online()?;
        let (temp_id, outbound) = self.reconciler.create_sprite(now, new);
        self.submit_all(now, outbound);
        Ok(temp_id)
    }

    fn move_sprite(&mut self, now: Instant, id: &str, x: f64, y: f64) -> Result<(), ClientError> {
        self.ensure_online()?;
        if let Some(changes) = self.reconciler.move_sprite(id, x, y)? {
            if let Some(envelope) = self.delta.envelope(MessageType::SpriteMove, id, changes) {
                self.submit(now, envelope);
            }
        }
        Ok(())
    }

    fn update_sprite(&mut self, now: Instant, id: &str, changes: Payload) -> Result<(), ClientError> {
        self.ensure_online()?;
        if let Some(changes) = self.reconciler.update_sprite(id, changes)? {
            if let Some(envelope) = self.delta.envelope(MessageType::SpriteUpdate, id, changes) {
                self.submit(now, envelope);
            }
        }
        Ok(())
    }

    fn delete_sprite(&mut self, now: Instant, id: &str) -> Result<(), ClientError> {
        self.ensure_online()?;
        let outbound = self.reconciler.delete_sprite(id)?;
        self.delta.forget(id);
        self.submit_all(now, outbound);
        Ok(())
    }

    fn create_character(&mut self, now: Instant, data: Payload) -> Result<String, ClientError> {
        self.ensure_online()?;
        let (correlation_id, outbound) = self.reconciler.create_character(now, data);
        self.submit_all(now, outbound);
        Ok(correlation_id)
    }

    fn update_character(
        &mut self,
        now: Instant,
        id: &str,
        changes: Payload,
        version: Option<u64>,
    ) -> Result<String, ClientError> {
        self.ensure_online()?;
        let (correlation_id, outbound) =
            self.reconciler.update_character(now, id, changes, version)?;
        self.submit_all(now, outbound);
        Ok(correlation_id)
    }

    fn delete_character(&mut self, now: Instant, id: &str) -> Result<(), ClientError> {
        self.ensure_online()?;
        let outbound = self.reconciler.delete_character(id)?;
        self.submit_all(now, outbound);
        Ok(())
    }

    fn apply_actions(&mut self, actions: Vec<LifecycleAction>) {
        for action in actions {
            match action {
                LifecycleAction::OpenLink => self.open_link(),
                LifecycleAction::DropLink(reason) => self.drop_link(reason),
                LifecycleAction::SendPing(ping) => match &self.link {
                    Some(link) => {
                        if let Err(e) = link.send(ping) {
                            debug!("Probe not sent: {}", e);
                        }
                    }
                    None => trace!("Probe due without a link"),
                },
                LifecycleAction::FlushQueues => {
                    let pending = self.scheduler.on_connected();
                    if !pending.is_empty() {
                        info!("Flushing {} queued envelopes", pending.len());
                    }
                    self.transmit(pending);
                }
            }
        }
    }

    fn open_link(&mut self) {
        if let Some(task) = self.connecting.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            link.close(CloseReason::new(CLOSE_GOING_AWAY, "reconnecting"));
        }

        self.generation += 1;
        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let attempts = self.attempts_tx.clone();
        self.connecting = Some(tokio::spawn(async move {
            let result = connector.connect().await;
            let _ = attempts.send((generation, result));
        }));
    }

    fn drop_link(&mut self, reason: CloseReason) {
        if let Some(task) = self.connecting.take() {
            debug!("Abandoning connect attempt");
            task.abort();
        }
        self.generation += 1;
        if let Some(link) = self.link.take() {
            debug!("Closing link to {}: {}", link.peer(), reason);
            link.close(reason);
        }
    }

    fn on_attempt(&mut self, generation: u64, result: Result<Link, NetworkError>) {
        if generation != self.generation {
            trace!("Discarding stale connect attempt {}", generation);
            if let Ok(link) = result {
                link.close(CloseReason::normal());
            }
            return;
        }
        self.connecting = None;

        let now = Instant::now();
        match result {
            Ok(link) => {
                if !self.lifecycle.on_link_opened(now) {
                    link.close(CloseReason::normal());
                    return;
                }
                let hello = Envelope::from_json(
                    MessageType::Hello,
                    json!({
                        "user": self.user,
                        "version": PROTOCOL_VERSION,
                        "session_id": self.lifecycle.session_id(),
                    }),
                );
                if let Err(e) = link.send(hello) {
                    // The close event follows on the link itself
                    warn!("Failed to send hello: {}", e);
                }
                debug!("Link to {} open, hello sent", link.peer());
                self.link = Some(link);
            }
            Err(e) => {
                let actions = self.lifecycle.on_connect_failed(now, &e.to_string());
                self.apply_actions(actions);
            }
        }
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        let now = Instant::now();
        match event {
            LinkEvent::Frame(envelope) => {
                for envelope in envelope.flatten() {
                    self.on_inbound(now, envelope);
                }
            }
            LinkEvent::Closed(reason) => {
                self.link = None;
                let actions = self.lifecycle.on_closed(now, reason);
                self.apply_actions(actions);
            }
        }
    }

    fn on_inbound(&mut self, now: Instant, envelope: Envelope) {
        trace!("Received {}", envelope.kind());
        match envelope.kind() {
            MessageType::Unknown(name) => {
                warn!("Dropping message of unknown type {}", name);
                return;
            }
            MessageType::Welcome => {
                let actions = self.lifecycle.on_handshake(now, &envelope);
                self.apply_actions(actions);
            }
            MessageType::Pong => {
                if self.lifecycle.on_pong(now, &envelope) {
                    trace!(
                        "Probe answered in {:?}",
                        self.lifecycle.heartbeat().last_rtt()
                    );
                }
            }
            MessageType::Ping => {
                if let Some(link) = &self.link {
                    let _ = link.send(Envelope::pong_for(&envelope));
                }
            }
            MessageType::SpriteMove | MessageType::SpriteUpdate => {
                // Someone else moved it; our last sent state no longer describes it
                let id = envelope
                    .str_field("sprite_id")
                    .or_else(|| envelope.str_field("id"));
                if let Some(id) = id {
                    self.delta.forget(id);
                }
                let replies = self.reconciler.handle_inbound(now, &envelope);
                self.submit_all(now, replies);
            }
            _ => {
                let replies = self.reconciler.handle_inbound(now, &envelope);
                self.submit_all(now, replies);
            }
        }
        let _ = self.hub.messages.send(envelope);
    }

    fn submit(&mut self, now: Instant, envelope: Envelope) {
        let ready = self.scheduler.submit(envelope, now, self.can_send());
        self.transmit(ready);
    }

    fn submit_all(&mut self, now: Instant, envelopes: Vec<Envelope>) {
        for envelope in envelopes {
            self.submit(now, envelope);
        }
    }

    /// Hand envelopes to the link; whatever it refuses goes back to the scheduler
    fn transmit(&mut self, envelopes: Vec<Envelope>) {
        if envelopes.is_empty() {
            return;
        }
        let Some(link) = &self.link else {
            self.scheduler.requeue_front(envelopes);
            return;
        };

        let mut pending = envelopes.into_iter();
        while let Some(envelope) = pending.next() {
            trace!("Sending {}", envelope.kind());
            if let Err(e) = link.send(envelope.clone()) {
                warn!("Link refused {}: {}", envelope.kind(), e);
                let mut unsent = vec![envelope];
                unsent.extend(pending);
                self.scheduler.requeue_front(unsent);
                return;
            }
        }
    }

    fn publish(&mut self) {
        for event in self.lifecycle.drain_events() {
            let _ = self.hub.connection.send(event);
        }

        let state = self.lifecycle.state().clone();
        let changed = self.hub.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        if changed {
            debug!("Connection state is now {:?}", state);
            if let ConnectionState::Failed(failure) = &state {
                error!("Connection failed for good: {}", failure);
                self.reconciler.abandon_all(&failure.to_string());
                self.scheduler.clear();
                self.delta.clear();
            }
        }

        for notification in self.reconciler.drain_notifications() {
            match notification {
                Notification::World(event) => {
                    if let WorldEvent::SpriteRemoved { id } = &event {
                        self.delta.forget(id);
                    }
                    let _ = self.hub.world.send(event);
                }
                Notification::Resolution(resolution) => {
                    if let Resolution::RolledBack { correlation_id, .. } = &resolution {
                        self.scheduler.retract(correlation_id);
                    }
                    let _ = self.hub.resolutions.send(resolution);
                }
                Notification::Dependency(event) => {
                    let _ = self.hub.dependencies.send(event);
                }
            }
        }
    }
}

async fn recv_link(link: &mut Option<Link>) -> LinkEvent {
    match link {
        Some(link) => link.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
