//! Scripted stand-in for the authority
//!
//! [`MockConnector`] hands every link it opens to the test as a [`ServerEnd`],
//! so the test plays the server frame by frame.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tavern_network::{Connector, Link, LinkCommand, LinkEvent, NetworkError};
use tavern_protocol::{CloseReason, Envelope, MessageType};
use tokio::sync::mpsc;

struct Shared {
    accepted: mpsc::UnboundedSender<ServerEnd>,
    refuse: AtomicBool,
    hang: AtomicBool,
    attempts: AtomicU32,
}

#[derive(Clone)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

impl MockConnector {
    /// Connector plus the stream of server ends it opens
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerEnd>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Self {
            shared: Arc::new(Shared {
                accepted,
                refuse: AtomicBool::new(false),
                hang: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
            }),
        };
        (connector, rx)
    }

    /// Fail every connect attempt until cleared
    pub fn set_refuse(&self, refuse: bool) {
        self.shared.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Never complete connect attempts until cleared
    pub fn set_hang(&self, hang: bool) {
        self.shared.hang.store(hang, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Link, NetworkError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        if self.shared.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(NetworkError::ConnectionFailed("connection refused".to_string()));
        }

        let (link, peer) = Link::channel("mock-server");
        let end = ServerEnd {
            commands: peer.commands,
            events: peer.events,
            answer_pings: true,
        };
        self.shared
            .accepted
            .send(end)
            .map_err(|_| NetworkError::ConnectionFailed("test dropped the server".to_string()))?;
        Ok(link)
    }
}

/// The server side of one mock link
pub struct ServerEnd {
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
    answer_pings: bool,
}

impl ServerEnd {
    /// Stop answering liveness probes automatically
    pub fn ignore_pings(&mut self) {
        self.answer_pings = false;
    }

    /// Next envelope the client sent; probes are answered and skipped unless
    /// [`Self::ignore_pings`] was called
    pub async fn recv(&mut self) -> Result<Envelope> {
        loop {
            match self.commands.recv().await {
                Some(LinkCommand::Send(envelope)) => {
                    if self.answer_pings && envelope.kind() == &MessageType::Ping {
                        self.send(Envelope::pong_for(&envelope));
                        continue;
                    }
                    return Ok(envelope);
                }
                Some(LinkCommand::Close(reason)) => bail!("client closed the link: {reason}"),
                None => bail!("client dropped the link"),
            }
        }
    }

    /// Next envelope, which must be of `kind`
    pub async fn expect(&mut self, kind: MessageType) -> Result<Envelope> {
        let envelope = self.recv().await?;
        if envelope.kind() != &kind {
            bail!("expected {kind}, got {}", envelope.kind());
        }
        Ok(envelope)
    }

    /// Expect `hello` and answer with `welcome`
    pub async fn accept_hello(&mut self) -> Result<Envelope> {
        let hello = self.expect(MessageType::Hello).await?;
        self.send(Envelope::from_json(
            MessageType::Welcome,
            json!({ "session_id": "mock-session", "user": hello.str_field("user") }),
        ));
        Ok(hello)
    }

    /// Wait until the client closes the link; `None` if it was simply dropped
    pub async fn closed(&mut self) -> Option<CloseReason> {
        while let Some(command) = self.commands.recv().await {
            if let LinkCommand::Close(reason) = command {
                return Some(reason);
            }
        }
        None
    }

    /// Deliver an envelope to the client
    pub fn send(&self, envelope: Envelope) {
        let _ = self.events.send(LinkEvent::Frame(envelope));
    }

    /// Close the link from the server side
    pub fn close(&self, reason: CloseReason) {
        let _ = self.events.send(LinkEvent::Closed(reason));
    }
}
