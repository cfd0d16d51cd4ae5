//! Tavern client: the [`SyncClient`] handle and the `tavern` command line

use crate::engine::{Command, Engine, Hub};
use crate::{ClientConfig, ClientError};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tavern_network::{
    ConnectionEvent, ConnectionState, Connector, LifecycleConfig, QuicConnector,
    QuicTransportConfig,
};
use tavern_protocol::{CodecConfig, CompressionAlgorithm, Envelope, MessageType, Payload};
use tavern_state::{DependencyEvent, NewSprite, Resolution, World, WorldEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{error, info, warn};

/// Cloneable handle to a running sync engine
///
/// Every clone talks to the same engine task. The engine stops when
/// [`SyncClient::shutdown`] is called or the last handle is dropped.
#[derive(Clone)]
pub struct SyncClient {
    commands: mpsc::UnboundedSender<Command>,
    hub: Arc<Hub>,
}

impl SyncClient {
    /// Start an engine on the current tokio runtime
    ///
    /// The engine starts disconnected; call [`Self::connect`] to open the session.
    pub fn spawn<C: Connector>(connector: C, config: ClientConfig) -> Self {
        let hub = Arc::new(Hub::new(config.event_capacity));
        let (commands, rx) = mpsc::unbounded_channel();
        let engine = Engine::new(Arc::new(connector), config, Arc::clone(&hub), rx);
        tokio::spawn(engine.run());
        Self { commands, hub }
    }

    fn command(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::EngineGone)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.command(build(tx))?;
        rx.await.map_err(|_| ClientError::EngineGone)
    }

    /// Open the session, or skip the remaining backoff while reconnecting
    pub fn connect(&self) -> Result<(), ClientError> {
        self.command(Command::Connect)
    }

    /// Close the session and cancel every pending reconnection
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.command(Command::Disconnect)
    }

    /// Schedule an arbitrary envelope
    pub fn send(&self, envelope: Envelope) -> Result<(), ClientError> {
        self.command(Command::Send(envelope))
    }

    /// Send only the fields of `id` that changed since they were last sent
    pub fn send_delta(
        &self,
        kind: MessageType,
        id: impl Into<String>,
        fields: Payload,
    ) -> Result<(), ClientError> {
        self.command(Command::SendDelta {
            kind,
            id: id.into(),
            fields,
        })
    }

    pub fn request_sprite_list(&self, table_id: &str) -> Result<(), ClientError> {
        self.send(Envelope::from_json(
            MessageType::SpriteListRequest,
            json!({ "table_id": table_id }),
        ))
    }

    /// Place a sprite optimistically; returns its temporary id
    pub async fn create_sprite(&self, new: NewSprite) -> Result<String, ClientError> {
        self.request(|reply| Command::CreateSprite { new, reply })
            .await?
    }

    pub async fn move_sprite(&self, id: &str, x: f64, y: f64) -> Result<(), ClientError> {
        let id = id.to_string();
        self.request(|reply| Command::MoveSprite { id, x, y, reply })
            .await?
    }

    pub async fn update_sprite(&self, id: &str, changes: Payload) -> Result<(), ClientError> {
        let id = id.to_string();
        self.request(|reply| Command::UpdateSprite { id, changes, reply })
            .await?
    }

    pub async fn delete_sprite(&self, id: &str) -> Result<(), ClientError> {
        let id = id.to_string();
        self.request(|reply| Command::DeleteSprite { id, reply })
            .await?
    }

    pub fn request_character_list(&self) -> Result<(), ClientError> {
        self.send(Envelope::from_json(MessageType::CharacterListRequest, json!({})))
    }

    pub fn load_character(&self, id: &str) -> Result<(), ClientError> {
        self.send(Envelope::from_json(
            MessageType::CharacterLoad,
            json!({ "character_id": id }),
        ))
    }

    /// Ask the server to store a new character; returns the correlation id
    pub async fn create_character(&self, data: Payload) -> Result<String, ClientError> {
        self.request(|reply| Command::CreateCharacter { data, reply })
            .await?
    }

    /// Edit a character optimistically against `version` (or the known version)
    ///
    /// Returns the correlation id under which the outcome is reported.
    pub async fn update_character(
        &self,
        id: &str,
        changes: Payload,
        version: Option<u64>,
    ) -> Result<String, ClientError> {
        let id = id.to_string();
        self.request(|reply| Command::UpdateCharacter {
            id,
            changes,
            version,
            reply,
        })
        .await?
    }

    pub async fn delete_character(&self, id: &str) -> Result<(), ClientError> {
        let id = id.to_string();
        self.request(|reply| Command::DeleteCharacter { id, reply })
            .await?
    }

    pub fn request_table_list(&self) -> Result<(), ClientError> {
        self.send(Envelope::from_json(MessageType::TableListRequest, json!({})))
    }

    pub fn request_table(&self, table_id: &str) -> Result<(), ClientError> {
        self.send(Envelope::from_json(
            MessageType::TableRequest,
            json!({ "table_id": table_id }),
        ))
    }

    pub fn create_table(&self, name: &str, mut properties: Payload) -> Result<(), ClientError> {
        properties.insert("name".to_string(), json!(name));
        self.send(Envelope::new(MessageType::TableCreate, properties))
    }

    pub fn delete_table(&self, table_id: &str) -> Result<(), ClientError> {
        self.send(Envelope::from_json(
            MessageType::TableDelete,
            json!({ "table_id": table_id }),
        ))
    }

    /// Tell the server an asset upload finished
    pub fn confirm_asset_upload(&self, asset_id: &str) -> Result<(), ClientError> {
        self.send(Envelope::from_json(
            MessageType::AssetUploadConfirm,
            json!({ "asset_id": asset_id }),
        ))
    }

    pub fn kick_player(&self, user: &str, reason: &str) -> Result<(), ClientError> {
        self.send(Envelope::from_json(
            MessageType::PlayerKick,
            json!({ "user": user, "reason": reason }),
        ))
    }

    pub fn ban_player(&self, user: &str, reason: &str) -> Result<(), ClientError> {
        self.send(Envelope::from_json(
            MessageType::PlayerBan,
            json!({ "user": user, "reason": reason }),
        ))
    }

    /// Connected, live, and the link is open
    pub async fn is_connected(&self) -> bool {
        self.request(Command::IsConnected).await.unwrap_or(false)
    }

    /// Last published connection state
    pub fn state(&self) -> ConnectionState {
        self.hub.state.borrow().clone()
    }

    /// Copy of the local world
    pub async fn world(&self) -> Result<World, ClientError> {
        self.request(Command::Snapshot).await
    }

    /// Stop the engine; every handle becomes inert
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.hub.state.subscribe()
    }

    pub fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.hub.connection.subscribe()
    }

    /// Inbound envelopes of one type, batches already unwrapped
    pub fn messages(&self, kind: MessageType) -> MessageSubscription {
        MessageSubscription {
            kind,
            rx: self.hub.messages.subscribe(),
        }
    }

    pub fn resolutions(&self) -> broadcast::Receiver<Resolution> {
        self.hub.resolutions.subscribe()
    }

    pub fn dependency_events(&self) -> broadcast::Receiver<DependencyEvent> {
        self.hub.dependencies.subscribe()
    }

    pub fn world_events(&self) -> broadcast::Receiver<WorldEvent> {
        self.hub.world.subscribe()
    }
}

/// Inbound envelopes filtered to a single message type
pub struct MessageSubscription {
    kind: MessageType,
    rx: broadcast::Receiver<Envelope>,
}

impl MessageSubscription {
    pub fn kind(&self) -> &MessageType {
        &self.kind
    }

    /// Next matching envelope
    pub async fn recv(&mut self) -> Result<Envelope, broadcast::error::RecvError> {
        loop {
            let envelope = self.rx.recv().await?;
            if envelope.kind() == &self.kind {
                return Ok(envelope);
            }
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Tavern client - shared tabletop sync client")]
struct Args {
    /// Server address (host:port)
    #[arg(default_value = "127.0.0.1:7420")]
    server: String,

    /// Name the server expects in the TLS handshake
    #[arg(long, default_value = "localhost")]
    server_name: String,

    /// User name announced to the server
    #[arg(short, long, default_value = "player")]
    user: String,

    /// Seconds between liveness probes
    #[arg(long, default_value = "30")]
    heartbeat: u64,

    /// Compress large outbound frames
    #[arg(long, value_enum)]
    compression: Option<CompressionAlgorithm>,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

pub async fn run() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level {
        LogLevel::Trace => tracing::Level::TRACE,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Error => tracing::Level::ERROR,
    };
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(io::stderr)
        .init();

    let server_addr = tokio::net::lookup_host(&args.server)
        .await
        .with_context(|| format!("Failed to resolve {}", args.server))?
        .next()
        .with_context(|| format!("No address for {}", args.server))?;
    let transport_config = QuicTransportConfig {
        codec: CodecConfig {
            compression: args.compression,
            ..Default::default()
        },
        ..Default::default()
    };
    let connector = QuicConnector::new(server_addr, args.server_name.clone(), transport_config)
        .context("Failed to create QUIC endpoint")?;

    let config = ClientConfig {
        user: args.user.clone(),
        lifecycle: LifecycleConfig {
            heartbeat_interval: Duration::from_secs(args.heartbeat.max(1)),
            ..Default::default()
        },
        ..Default::default()
    };
    let client = SyncClient::spawn(connector, config);
    let mut connection = client.connection_events();
    let mut world = client.world_events();
    let mut resolutions = client.resolutions();
    client.connect()?;
    info!("Connecting to {} as {}", server_addr, args.user);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                if !run_command(&client, line.trim()).await {
                    break;
                }
            }
            Ok(event) = connection.recv() => {
                info!("Connection: {:?}", event);
                if let ConnectionState::Failed(failure) = client.state() {
                    error!("Giving up: {}", failure);
                    break;
                }
            }
            Ok(event) = world.recv() => describe_world_event(&event),
            Ok(resolution) = resolutions.recv() => info!("Resolved: {:?}", resolution),
        }
    }

    client.shutdown();
    Ok(())
}

/// Execute one stdin command; returns false to quit
async fn run_command(client: &SyncClient, line: &str) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    let result = match words.as_slice() {
        [] => Ok(()),
        ["quit"] | ["exit"] => return false,
        ["sprites", table] => client.request_sprite_list(table),
        ["chars"] => client.request_character_list(),
        ["create", table, x, y, rest @ ..] => match (x.parse(), y.parse()) {
            (Ok(x), Ok(y)) => {
                let new = NewSprite {
                    table_id: table.to_string(),
                    x,
                    y,
                    asset_id: rest.first().map(|a| a.to_string()),
                    ..Default::default()
                };
                client.create_sprite(new).await.map(|id| info!("Placed {}", id))
            }
            _ => {
                warn!("Coordinates must be numbers");
                Ok(())
            }
        },
        ["move", id, x, y] => match (x.parse(), y.parse()) {
            (Ok(x), Ok(y)) => client.move_sprite(id, x, y).await,
            _ => {
                warn!("Coordinates must be numbers");
                Ok(())
            }
        },
        _ => {
            warn!("Unknown command: {}", line);
            Ok(())
        }
    };
    if let Err(e) = result {
        warn!("{}", e);
    }
    true
}

fn describe_world_event(event: &WorldEvent) {
    match event {
        WorldEvent::SpriteAdded(sprite) | WorldEvent::SpriteUpdated(sprite) => info!(
            "Sprite {} on {} at ({}, {}) {:?}",
            sprite.id, sprite.table_id, sprite.x, sprite.y, sprite.asset_state
        ),
        WorldEvent::SpriteRemoved { id } => info!("Sprite {} removed", id),
        WorldEvent::CharacterUpdated(character) => info!(
            "Character {} v{} ({:?})",
            character.id, character.version, character.sync_status
        ),
        WorldEvent::CharacterRemoved { id } => info!("Character {} removed", id),
    }
}
