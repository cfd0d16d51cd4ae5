//! Wire protocol for Tavern
//!
//! Defines the message envelope shared by client and server, the fixed
//! message catalog, close conditions, and the length-prefixed frame codec.

pub mod close;
pub mod codec;
pub mod compress;
pub mod envelope;
pub mod message;

pub use close::CloseReason;
pub use codec::{CodecConfig, FramedCodec};
pub use compress::{CompressionAlgorithm, Compressor};
pub use envelope::{Envelope, Payload};
pub use message::{MessageType, Priority};

use thiserror::Error;

/// Protocol version carried in every envelope
pub const PROTOCOL_VERSION: &str = "1.0";

/// Largest frame either side will accept
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Missing field `{field}` in {kind} payload")]
    MissingField { kind: String, field: &'static str },
}
