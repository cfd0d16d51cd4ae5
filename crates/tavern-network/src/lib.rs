//! Network layer for Tavern
//!
//! Provides the QUIC transport, the connection lifecycle manager (handshake,
//! heartbeat liveness, backoff reconnection) and the outbound scheduler
//! (critical queue, batching, delta suppression).

pub mod backoff;
pub mod delta;
pub mod heartbeat;
pub mod lifecycle;
pub mod link;
pub mod scheduler;
pub mod transport;

pub use backoff::BackoffConfig;
pub use delta::DeltaCache;
pub use heartbeat::{Heartbeat, HeartbeatPoll, Probe};
pub use lifecycle::{
    ConnectionEvent, ConnectionManager, ConnectionState, LifecycleAction, LifecycleConfig,
    TerminalFailure,
};
pub use link::{memory_pair, Connector, Link, LinkCommand, LinkEvent, LinkPeer};
pub use scheduler::{OutboundScheduler, SchedulerConfig};
pub use transport::{IncomingSession, QuicConnector, QuicTransportConfig, ServerTransport};

use tavern_protocol::{CloseReason, ProtocolError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Link closed: {0}")]
    Closed(CloseReason),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Endpoint closed")]
    EndpointClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
