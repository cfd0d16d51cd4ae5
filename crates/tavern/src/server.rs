//! Tavern server: a small in-memory authority
//!
//! Owns the canonical sprites, characters, tables and confirmed assets,
//! assigns ids, versions character edits and relays world changes to every
//! other session. Sessions arrive as [`Link`]s, so the same authority serves
//! QUIC clients and in-process test clients.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tavern_network::{
    memory_pair, Connector, Link, LinkEvent, NetworkError, QuicTransportConfig, ServerTransport,
};
use tavern_protocol::close::CLOSE_PROTOCOL_MISMATCH;
use tavern_protocol::{
    CloseReason, CodecConfig, CompressionAlgorithm, Envelope, MessageType, Payload,
};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// How long a new link may stay silent before `hello`
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);

/// Work pushed to a session by other sessions
enum Outbound {
    Frame(Envelope),
    Close(CloseReason),
}

struct Session {
    user: String,
    outbox: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug, Clone)]
struct StoredCharacter {
    version: u64,
    data: Payload,
}

impl StoredCharacter {
    fn to_json(&self, id: &str) -> Value {
        json!({ "character_id": id, "version": self.version, "data": self.data })
    }
}

#[derive(Default)]
struct AuthorityState {
    sessions: HashMap<String, Session>,
    banned: HashSet<String>,
    next_id: u64,
    sprites: BTreeMap<String, Payload>,
    characters: BTreeMap<String, StoredCharacter>,
    tables: BTreeMap<String, Payload>,
    assets: HashSet<String>,
}

impl AuthorityState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_{}", prefix, self.next_id)
    }

    /// Queue an envelope for every session except `except`
    fn broadcast(&self, except: Option<&str>, envelope: &Envelope) {
        for (id, session) in &self.sessions {
            if Some(id.as_str()) != except {
                let _ = session.outbox.send(Outbound::Frame(envelope.clone()));
            }
        }
    }

    /// Close every session of `user` as access denied; returns how many
    fn expel(&self, user: &str, reason: &str) -> usize {
        let mut count = 0;
        for session in self.sessions.values().filter(|s| s.user == user) {
            let _ = session
                .outbox
                .send(Outbound::Close(CloseReason::access_denied(reason)));
            count += 1;
        }
        count
    }
}

/// What one inbound envelope produced
#[derive(Default)]
struct Outcome {
    /// Back to the sender
    reply: Vec<Envelope>,
    /// To every other session
    others: Vec<Envelope>,
}

impl Outcome {
    fn reply(envelope: Envelope) -> Self {
        Self {
            reply: vec![envelope],
            others: Vec::new(),
        }
    }

    fn everyone(envelope: Envelope) -> Self {
        Self {
            reply: vec![envelope.clone()],
            others: vec![envelope],
        }
    }

    fn others(envelope: Envelope) -> Self {
        Self {
            reply: Vec::new(),
            others: vec![envelope],
        }
    }
}

/// The canonical world shared by every session
#[derive(Default)]
pub struct Authority {
    state: Mutex<AuthorityState>,
}

impl Authority {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of sessions past the handshake
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Store a character directly, bypassing any session
    pub async fn insert_character(&self, id: &str, version: u64, data: Payload) {
        self.state
            .lock()
            .await
            .characters
            .insert(id.to_string(), StoredCharacter { version, data });
    }

    /// Current version of a stored character
    pub async fn character_version(&self, id: &str) -> Option<u64> {
        self.state.lock().await.characters.get(id).map(|c| c.version)
    }

    pub async fn sprite_count(&self) -> usize {
        self.state.lock().await.sprites.len()
    }

    /// Run one session until its link closes
    pub async fn serve(self: Arc<Self>, mut link: Link) -> Result<()> {
        let hello = match timeout(HELLO_TIMEOUT, link.recv()).await {
            Ok(LinkEvent::Frame(envelope)) if envelope.kind() == &MessageType::Hello => envelope,
            Ok(LinkEvent::Frame(envelope)) => {
                link.close(CloseReason::new(CLOSE_PROTOCOL_MISMATCH, "expected hello"));
                bail!("First message was {}, not hello", envelope.kind());
            }
            Ok(LinkEvent::Closed(reason)) => {
                debug!("Link closed before hello: {}", reason);
                return Ok(());
            }
            Err(_) => {
                link.close(CloseReason::new(CLOSE_PROTOCOL_MISMATCH, "no hello"));
                bail!("No hello within {:?}", HELLO_TIMEOUT);
            }
        };
        let user = hello.str_field("user").unwrap_or("anonymous").to_string();

        let (outbox, mut inbox) = mpsc::unbounded_channel();
        let session_id = {
            let mut state = self.state.lock().await;
            if state.banned.contains(&user) {
                info!("Refusing banned user {}", user);
                link.close(CloseReason::access_denied("banned"));
                return Ok(());
            }
            let session_id = format!("session_{:016x}", rand::thread_rng().gen::<u64>());
            state.sessions.insert(
                session_id.clone(),
                Session {
                    user: user.clone(),
                    outbox,
                },
            );
            state.broadcast(
                Some(&session_id),
                &Envelope::from_json(MessageType::PlayerJoined, json!({ "user": user })),
            );
            session_id
        };
        info!("{} joined as {}", user, session_id);

        let result = self
            .session_loop(&mut link, &session_id, &user, &mut inbox)
            .await;

        let mut state = self.state.lock().await;
        state.sessions.remove(&session_id);
        state.broadcast(
            None,
            &Envelope::from_json(MessageType::PlayerLeft, json!({ "user": user })),
        );
        info!("{} left ({})", user, session_id);
        result
    }

    async fn session_loop(
        &self,
        link: &mut Link,
        session_id: &str,
        user: &str,
        inbox: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> Result<()> {
        link.send(Envelope::from_json(
            MessageType::Welcome,
            json!({ "session_id": session_id, "user": user }),
        ))?;

        loop {
            tokio::select! {
                event = link.recv() => match event {
                    LinkEvent::Frame(envelope) => {
                        for envelope in envelope.flatten() {
                            let outcome = self.handle(session_id, user, envelope).await;
                            for reply in outcome.reply {
                                link.send(reply)?;
                            }
                        }
                    }
                    LinkEvent::Closed(reason) => {
                        debug!("Session {} closed: {}", session_id, reason);
                        return Ok(());
                    }
                },
                Some(outbound) = inbox.recv() => match outbound {
                    Outbound::Frame(envelope) => link.send(envelope)?,
                    Outbound::Close(reason) => {
                        info!("Closing session {}: {}", session_id, reason);
                        link.close(reason);
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn handle(&self, session_id: &str, user: &str, envelope: Envelope) -> Outcome {
        let kind = envelope.kind().clone();
        let mut state = self.state.lock().await;
        let outcome = match &kind {
            MessageType::Ping => Outcome::reply(Envelope::pong_for(&envelope)),
            MessageType::Pong | MessageType::Hello => Outcome::default(),
            MessageType::SpriteCreate => create_sprite(&mut state, &envelope),
            MessageType::SpriteListRequest => list_sprites(&state, &envelope),
            MessageType::SpriteMove | MessageType::SpriteUpdate => {
                update_sprite(&mut state, envelope)
            }
            MessageType::SpriteDelete => delete_sprite(&mut state, &envelope),
            MessageType::CharacterListRequest => list_characters(&state),
            MessageType::CharacterSave => save_character(&mut state, &envelope),
            MessageType::CharacterLoad => load_character(&state, &envelope),
            MessageType::CharacterUpdate => update_character(&mut state, &envelope),
            MessageType::CharacterDelete => delete_character(&mut state, &envelope),
            MessageType::TableListRequest => list_tables(&state),
            MessageType::TableRequest => get_table(&state, &envelope),
            MessageType::TableCreate => create_table(&mut state, envelope),
            MessageType::TableDelete => delete_table(&mut state, &envelope),
            MessageType::AssetUploadRequest => {
                debug!("{} announced an upload", user);
                Outcome::default()
            }
            MessageType::AssetUploadConfirm => confirm_asset(&mut state, &envelope),
            MessageType::AssetDownloadRequest => download_asset(&state, &envelope),
            MessageType::PlayerKick | MessageType::PlayerBan => {
                expel_player(&mut state, &envelope, user)
            }
            MessageType::ChatMessage | MessageType::CursorMove => {
                let mut data = envelope.into_data();
                data.insert("user".to_string(), json!(user));
                Outcome::others(Envelope::new(kind.clone(), data))
            }
            other => {
                warn!("Unsupported {} from {}", other, session_id);
                Outcome::reply(Envelope::error(
                    format!("unsupported message type {}", other),
                    envelope.str_field("correlation_id"),
                ))
            }
        };

        for envelope in &outcome.others {
            state.broadcast(Some(session_id), envelope);
        }
        outcome
    }
}

fn error_for(envelope: &Envelope, message: impl Into<String>) -> Outcome {
    Outcome::reply(Envelope::error(message, envelope.str_field("correlation_id")))
}

fn create_sprite(state: &mut AuthorityState, envelope: &Envelope) -> Outcome {
    let correlation_id = envelope.str_field("correlation_id");
    if envelope.str_field("table_id").map_or(true, str::is_empty) {
        return Outcome::reply(Envelope::from_json(
            MessageType::SpriteCreateFailed,
            json!({ "correlation_id": correlation_id, "error": "sprite needs a table" }),
        ));
    }

    let sprite_id = state.next_id("sprite");
    let mut sprite = envelope.data().clone();
    sprite.remove("correlation_id");
    sprite.insert("sprite_id".to_string(), json!(sprite_id));
    state.sprites.insert(sprite_id.clone(), sprite.clone());
    debug!("Created {}", sprite_id);

    let announced = Envelope::new(MessageType::SpriteCreated, sprite.clone());
    if let Some(cid) = correlation_id {
        sprite.insert("correlation_id".to_string(), json!(cid));
    }
    Outcome {
        reply: vec![Envelope::new(MessageType::SpriteCreated, sprite)],
        others: vec![announced],
    }
}

fn list_sprites(state: &AuthorityState, envelope: &Envelope) -> Outcome {
    let table_id = envelope.str_field("table_id");
    let sprites: Vec<&Payload> = state
        .sprites
        .values()
        .filter(|s| table_id.is_none() || s.get("table_id").and_then(Value::as_str) == table_id)
        .collect();
    let mut data = Payload::new();
    if let Some(table_id) = table_id {
        data.insert("table_id".to_string(), json!(table_id));
    }
    data.insert("sprites".to_string(), json!(sprites));
    Outcome::reply(Envelope::new(MessageType::SpriteList, data))
}

fn update_sprite(state: &mut AuthorityState, envelope: Envelope) -> Outcome {
    let Some(id) = envelope.str_field("sprite_id") else {
        return error_for(&envelope, "missing sprite_id");
    };
    let Some(sprite) = state.sprites.get_mut(id) else {
        let message = format!("unknown sprite {}", id);
        return error_for(&envelope, message);
    };
    for (name, value) in envelope.data() {
        if name != "correlation_id" {
            sprite.insert(name.clone(), value.clone());
        }
    }
    Outcome::others(envelope)
}

fn delete_sprite(state: &mut AuthorityState, envelope: &Envelope) -> Outcome {
    let Some(id) = envelope.str_field("sprite_id") else {
        return error_for(envelope, "missing sprite_id");
    };
    if state.sprites.remove(id).is_none() {
        return error_for(envelope, format!("unknown sprite {}", id));
    }
    Outcome::everyone(Envelope::from_json(
        MessageType::SpriteDeleted,
        json!({ "sprite_id": id }),
    ))
}

fn list_characters(state: &AuthorityState) -> Outcome {
    let characters: Vec<Value> = state
        .characters
        .iter()
        .map(|(id, character)| character.to_json(id))
        .collect();
    Outcome::reply(Envelope::from_json(
        MessageType::CharacterList,
        json!({ "characters": characters }),
    ))
}

fn save_character(state: &mut AuthorityState, envelope: &Envelope) -> Outcome {
    let data = match envelope.data().get("data") {
        Some(Value::Object(data)) => data.clone(),
        _ => Payload::new(),
    };
    let id = state.next_id("char");
    let character = StoredCharacter { version: 1, data };
    let announced = Envelope::from_json(MessageType::CharacterSaved, character.to_json(&id));

    let mut reply = character.to_json(&id);
    if let Some(cid) = envelope.str_field("correlation_id") {
        reply["correlation_id"] = json!(cid);
    }
    state.characters.insert(id, character);
    Outcome {
        reply: vec![Envelope::from_json(MessageType::CharacterSaved, reply)],
        others: vec![announced],
    }
}

fn load_character(state: &AuthorityState, envelope: &Envelope) -> Outcome {
    let Some(id) = envelope.str_field("character_id") else {
        return error_for(envelope, "missing character_id");
    };
    let Some(character) = state.characters.get(id) else {
        return error_for(envelope, format!("unknown character {}", id));
    };
    let mut data = character.to_json(id);
    if let Some(cid) = envelope.str_field("correlation_id") {
        data["correlation_id"] = json!(cid);
    }
    Outcome::reply(Envelope::from_json(MessageType::CharacterData, data))
}

fn update_character(state: &mut AuthorityState, envelope: &Envelope) -> Outcome {
    let correlation_id = envelope.str_field("correlation_id");
    let Some(id) = envelope.str_field("character_id") else {
        return error_for(envelope, "missing character_id");
    };
    let Some(character) = state.characters.get_mut(id) else {
        return Outcome::reply(Envelope::from_json(
            MessageType::CharacterUpdateResponse,
            json!({
                "correlation_id": correlation_id,
                "character_id": id,
                "success": false,
                "error": "unknown character",
            }),
        ));
    };

    if let Some(basis) = envelope.u64_field("version") {
        if basis != character.version {
            debug!(
                "Update of {} against v{} conflicts with v{}",
                id, basis, character.version
            );
            return Outcome::reply(Envelope::from_json(
                MessageType::CharacterUpdateResponse,
                json!({
                    "correlation_id": correlation_id,
                    "character_id": id,
                    "success": false,
                    "conflict": true,
                    "current_version": character.version,
                }),
            ));
        }
    }

    if let Some(Value::Object(updates)) = envelope.data().get("updates") {
        for (name, value) in updates {
            character.data.insert(name.clone(), value.clone());
        }
    }
    character.version += 1;

    Outcome {
        reply: vec![Envelope::from_json(
            MessageType::CharacterUpdateResponse,
            json!({
                "correlation_id": correlation_id,
                "character_id": id,
                "success": true,
                "version": character.version,
            }),
        )],
        others: vec![Envelope::from_json(
            MessageType::CharacterData,
            character.to_json(id),
        )],
    }
}

fn delete_character(state: &mut AuthorityState, envelope: &Envelope) -> Outcome {
    let Some(id) = envelope.str_field("character_id") else {
        return error_for(envelope, "missing character_id");
    };
    if state.characters.remove(id).is_none() {
        return error_for(envelope, format!("unknown character {}", id));
    }
    Outcome::everyone(Envelope::from_json(
        MessageType::CharacterDeleted,
        json!({ "character_id": id }),
    ))
}

fn list_tables(state: &AuthorityState) -> Outcome {
    let tables: Vec<&Payload> = state.tables.values().collect();
    Outcome::reply(Envelope::from_json(
        MessageType::TableList,
        json!({ "tables": tables }),
    ))
}

fn get_table(state: &AuthorityState, envelope: &Envelope) -> Outcome {
    let Some(id) = envelope.str_field("table_id") else {
        return error_for(envelope, "missing table_id");
    };
    match state.tables.get(id) {
        Some(table) => Outcome::reply(Envelope::new(MessageType::TableData, table.clone())),
        None => error_for(envelope, format!("unknown table {}", id)),
    }
}

fn create_table(state: &mut AuthorityState, envelope: Envelope) -> Outcome {
    let id = state.next_id("table");
    let mut table = envelope.into_data();
    table.remove("correlation_id");
    table.insert("table_id".to_string(), json!(id));
    state.tables.insert(id.clone(), table.clone());
    info!("Created table {}", id);
    Outcome::everyone(Envelope::new(MessageType::TableCreated, table))
}

fn delete_table(state: &mut AuthorityState, envelope: &Envelope) -> Outcome {
    let Some(id) = envelope.str_field("table_id") else {
        return error_for(envelope, "missing table_id");
    };
    if state.tables.remove(id).is_none() {
        return error_for(envelope, format!("unknown table {}", id));
    }

    let orphans: Vec<String> = state
        .sprites
        .iter()
        .filter(|(_, s)| s.get("table_id").and_then(Value::as_str) == Some(id))
        .map(|(sprite_id, _)| sprite_id.clone())
        .collect();
    let mut outcome = Outcome::default();
    for sprite_id in orphans {
        state.sprites.remove(&sprite_id);
        let deleted = Envelope::from_json(
            MessageType::SpriteDeleted,
            json!({ "sprite_id": sprite_id }),
        );
        outcome.reply.push(deleted.clone());
        outcome.others.push(deleted);
    }
    let deleted = Envelope::from_json(MessageType::TableDeleted, json!({ "table_id": id }));
    outcome.reply.push(deleted.clone());
    outcome.others.push(deleted);
    outcome
}

fn confirm_asset(state: &mut AuthorityState, envelope: &Envelope) -> Outcome {
    let Some(id) = envelope.str_field("asset_id") else {
        return error_for(envelope, "missing asset_id");
    };
    state.assets.insert(id.to_string());
    info!("Asset {} is available", id);
    Outcome::everyone(Envelope::from_json(
        MessageType::AssetUploaded,
        json!({ "asset_id": id }),
    ))
}

fn download_asset(state: &AuthorityState, envelope: &Envelope) -> Outcome {
    let Some(id) = envelope.str_field("asset_id") else {
        return error_for(envelope, "missing asset_id");
    };
    if !state.assets.contains(id) {
        return error_for(envelope, format!("unknown asset {}", id));
    }
    Outcome::reply(Envelope::from_json(
        MessageType::AssetData,
        json!({ "asset_id": id, "url": format!("/assets/{}", id) }),
    ))
}

fn expel_player(state: &mut AuthorityState, envelope: &Envelope, by: &str) -> Outcome {
    let Some(target) = envelope.str_field("user") else {
        return error_for(envelope, "missing user");
    };
    let ban = envelope.kind() == &MessageType::PlayerBan;
    let reason = if ban { "banned" } else { "kicked" };
    if ban {
        state.banned.insert(target.to_string());
    }
    let closed = state.expel(target, reason);
    info!("{} {} {} ({} sessions closed)", by, reason, target, closed);

    Outcome::everyone(Envelope::from_json(
        MessageType::PlayerKicked,
        json!({
            "user": target,
            "by": by,
            "reason": envelope.str_field("reason").unwrap_or(reason),
            "banned": ban,
        }),
    ))
}

/// Connects straight to an in-process [`Authority`]
#[derive(Clone)]
pub struct InProcessConnector {
    authority: Arc<Authority>,
}

impl InProcessConnector {
    pub fn new(authority: Arc<Authority>) -> Self {
        Self { authority }
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(&self) -> Result<Link, NetworkError> {
        let (client, server) = memory_pair("client", "authority");
        let authority = Arc::clone(&self.authority);
        tokio::spawn(async move {
            if let Err(e) = authority.serve(server).await {
                warn!("Session ended with error: {:#}", e);
            }
        });
        Ok(client)
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
#[command(author, version, about = "Tavern server - authoritative tabletop session host")]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:7420")]
    bind: SocketAddr,

    /// QUIC keep-alive interval in seconds
    #[arg(long, default_value = "5")]
    keep_alive: u64,

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
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let transport_config = QuicTransportConfig {
        keep_alive_interval: Duration::from_secs(args.keep_alive),
        max_idle_timeout: Duration::from_secs(args.keep_alive.max(1) * 12),
        codec: CodecConfig {
            compression: args.compression,
            ..Default::default()
        },
        ..Default::default()
    };
    let transport = ServerTransport::new(args.bind, transport_config)
        .with_context(|| format!("Failed to bind {}", args.bind))?;
    info!("Tavern server listening on {}", transport.local_addr()?);

    let authority = Authority::new();
    loop {
        match transport.accept().await {
            Ok(incoming) => {
                let remote = incoming.remote_address();
                info!("Connection from {}", remote);
                let authority = Arc::clone(&authority);
                tokio::spawn(async move {
                    let link = match incoming.establish().await {
                        Ok(link) => link,
                        Err(e) => {
                            warn!("Handshake with {} failed: {}", remote, e);
                            return;
                        }
                    };
                    if let Err(e) = authority.serve(link).await {
                        warn!("Session from {} failed: {:#}", remote, e);
                    }
                });
            }
            Err(NetworkError::EndpointClosed) => {
                error!("Server endpoint closed");
                return Ok(());
            }
            Err(e) => warn!("Failed to accept connection: {}", e),
        }
    }
}
