//! A live link: one open transport session carrying envelopes
//!
//! Transports pump frames between the wire and a pair of channels, so the
//! engine only ever sees cancel-safe channel operations.

use crate::NetworkError;
use async_trait::async_trait;
use tavern_protocol::{CloseReason, Envelope};
use tokio::sync::mpsc;

/// Something the local side asks the transport to do
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    Send(Envelope),
    Close(CloseReason),
}

/// Something the transport reports about the remote side
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Frame(Envelope),
    Closed(CloseReason),
}

/// Local end of a link
#[derive(Debug)]
pub struct Link {
    commands: mpsc::UnboundedSender<LinkCommand>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    peer: String,
}

/// Transport end of a link
#[derive(Debug)]
pub struct LinkPeer {
    pub commands: mpsc::UnboundedReceiver<LinkCommand>,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

impl Link {
    /// Create a connected `Link` / `LinkPeer` pair
    pub fn channel(peer: impl Into<String>) -> (Link, LinkPeer) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Link {
                commands: command_tx,
                events: event_rx,
                peer: peer.into(),
            },
            LinkPeer {
                commands: command_rx,
                events: event_tx,
            },
        )
    }

    /// Queue an envelope for transmission
    pub fn send(&self, envelope: Envelope) -> Result<(), NetworkError> {
        self.commands
            .send(LinkCommand::Send(envelope))
            .map_err(|_| NetworkError::Closed(CloseReason::abnormal("link is gone")))
    }

    /// Ask the transport to close with the given reason
    pub fn close(&self, reason: CloseReason) {
        let _ = self.commands.send(LinkCommand::Close(reason));
    }

    /// Next event from the remote side
    ///
    /// A transport that vanished without a close frame reads as an abnormal close.
    pub async fn recv(&mut self) -> LinkEvent {
        self.events
            .recv()
            .await
            .unwrap_or_else(|| LinkEvent::Closed(CloseReason::abnormal("transport ended")))
    }

    /// Transport-level openness
    pub fn is_open(&self) -> bool {
        !self.commands.is_closed()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl LinkPeer {
    /// Deliver a frame to the local side
    pub fn deliver(&self, envelope: Envelope) -> bool {
        self.events.send(LinkEvent::Frame(envelope)).is_ok()
    }

    /// Report closure to the local side
    pub fn closed(&self, reason: CloseReason) {
        let _ = self.events.send(LinkEvent::Closed(reason));
    }
}

/// Two links wired back to back, for in-process sessions
///
/// A close on either side is delivered to the other as `Closed`. Dropping one
/// side reads as an abnormal close on the other.
pub fn memory_pair(a: &str, b: &str) -> (Link, Link) {
    let (left, left_peer) = Link::channel(b);
    let (right, right_peer) = Link::channel(a);
    tokio::spawn(cross(left_peer.commands, right_peer.events));
    tokio::spawn(cross(right_peer.commands, left_peer.events));
    (left, right)
}

async fn cross(
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    while let Some(command) = commands.recv().await {
        let event = match command {
            LinkCommand::Send(envelope) => LinkEvent::Frame(envelope),
            LinkCommand::Close(reason) => {
                let _ = events.send(LinkEvent::Closed(reason));
                return;
            }
        };
        if events.send(event).is_err() {
            return;
        }
    }
}

/// Opens links to the authority
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a transport session; the handshake runs over the returned link
    async fn connect(&self) -> Result<Link, NetworkError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tavern_protocol::MessageType;

    #[tokio::test]
    async fn test_link_round_trip() {
        let (mut link, mut peer) = Link::channel("test");

        link.send(Envelope::ping(1, 1)).unwrap();
        match peer.commands.recv().await {
            Some(LinkCommand::Send(env)) => assert_eq!(env.kind(), &MessageType::Ping),
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(peer.deliver(Envelope::pong_for(&Envelope::ping(1, 1))));
        match link.recv().await {
            LinkEvent::Frame(env) => assert_eq!(env.kind(), &MessageType::Pong),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_peer_reads_as_abnormal_close() {
        let (mut link, peer) = Link::channel("test");
        drop(peer);

        assert!(!link.is_open());
        assert!(link.send(Envelope::ping(1, 1)).is_err());
        match link.recv().await {
            LinkEvent::Closed(reason) => assert!(!reason.is_clean()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_memory_pair_delivers_and_closes() {
        let (client, mut server) = memory_pair("client", "server");
        assert_eq!(client.peer(), "server");

        client.send(Envelope::ping(2, 2)).unwrap();
        assert!(matches!(server.recv().await, LinkEvent::Frame(_)));

        client.close(CloseReason::normal());
        assert_eq!(server.recv().await, LinkEvent::Closed(CloseReason::normal()));
    }
}
