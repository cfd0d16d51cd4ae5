//! Frame encoder/decoder for envelope streams
//!
//! Frame layout: 4-byte big-endian length, 1 flag byte, body. The flag is `0`
//! for plain JSON or the [`CompressionAlgorithm`] flag of a compressed body.
//! The length covers flag and body.

use crate::compress::{CompressionAlgorithm, Compressor};
use crate::envelope::Envelope;
use crate::{ProtocolError, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, BytesMut};

const FLAG_PLAIN: u8 = 0;
const HEADER_LEN: usize = 4;

/// Codec settings
#[derive(Debug, Clone)]
pub struct CodecConfig {
    /// Algorithm for large frames (`None` disables compression)
    pub compression: Option<CompressionAlgorithm>,
    /// Bodies at least this large are compressed
    pub compression_threshold: usize,
    /// Largest accepted frame
    pub max_frame_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression: Some(CompressionAlgorithm::Lz4),
            compression_threshold: 4 * 1024,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

/// Length-prefixed envelope codec
#[derive(Debug, Clone, Default)]
pub struct FramedCodec {
    config: CodecConfig,
}

impl FramedCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    /// Encode an envelope with length prefix
    pub fn encode(&self, envelope: &Envelope, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let json = serde_json::to_vec(envelope)?;

        let (flag, body) = match self.config.compression {
            Some(algorithm) if json.len() >= self.config.compression_threshold => {
                let packed = Compressor::new(algorithm).compress(&json)?;
                (algorithm.flag(), packed)
            }
            _ => (FLAG_PLAIN, json),
        };

        let frame_len = body.len() + 1;
        if frame_len > self.config.max_frame_size {
            return Err(ProtocolError::FrameTooLarge(frame_len));
        }

        buf.reserve(HEADER_LEN + frame_len);
        buf.put_u32(frame_len as u32);
        buf.put_u8(flag);
        buf.extend_from_slice(&body);

        Ok(())
    }

    /// Decode an envelope from buffer
    ///
    /// Returns `Some(envelope)` if a complete frame is available, `None` if
    /// more data is needed.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Envelope>, ProtocolError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek at length without consuming
        let mut length_bytes = [0u8; HEADER_LEN];
        length_bytes.copy_from_slice(&buf[..HEADER_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length == 0 {
            return Err(ProtocolError::MalformedFrame("empty frame".to_string()));
        }
        if length > self.config.max_frame_size {
            return Err(ProtocolError::FrameTooLarge(length));
        }
        if buf.len() < HEADER_LEN + length {
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let frame = buf.split_to(length);
        let flag = frame[0];
        let body = &frame[1..];

        let envelope = if flag == FLAG_PLAIN {
            serde_json::from_slice(body)?
        } else {
            let algorithm = CompressionAlgorithm::from_flag(flag).ok_or_else(|| {
                ProtocolError::MalformedFrame(format!("unknown frame flag {flag}"))
            })?;
            let json = Compressor::decompress(algorithm, body, self.config.max_frame_size)?;
            serde_json::from_slice(&json)?
        };

        Ok(Some(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::json;

    #[test]
    fn test_framed_codec() {
        let codec = FramedCodec::default();
        let first = Envelope::from_json(MessageType::SpriteMove, json!({ "sprite_id": "a", "x": 1 }));
        let second = Envelope::ping(1, 2000);

        let mut buf = BytesMut::new();
        codec.encode(&first, &mut buf).unwrap();
        codec.encode(&second, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(second));

        // Buffer should be empty
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_partial_frame_waits_for_more_data() {
        let codec = FramedCodec::default();
        let mut full = BytesMut::new();
        codec.encode(&Envelope::ping(3, 3), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        assert_eq!(partial.len(), full.len() - 1);
    }

    #[test]
    fn test_large_frames_are_compressed() {
        let codec = FramedCodec::new(CodecConfig {
            compression: Some(CompressionAlgorithm::Zstd),
            compression_threshold: 64,
            ..Default::default()
        });
        let names: Vec<String> = (0..200).map(|i| format!("goblin-{i}")).collect();
        let env = Envelope::from_json(MessageType::SpriteList, json!({ "sprites": names }));

        let mut buf = BytesMut::new();
        codec.encode(&env, &mut buf).unwrap();
        assert_eq!(buf[4], CompressionAlgorithm::Zstd.flag());
        assert!(buf.len() < serde_json::to_vec(&env).unwrap().len());

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(env));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let codec = FramedCodec::new(CodecConfig {
            max_frame_size: 16,
            compression: None,
            ..Default::default()
        });
        let mut buf = BytesMut::new();
        buf.put_u32(1024);
        buf.put_u8(0);
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::FrameTooLarge(1024))));

        let env = Envelope::from_json(MessageType::ChatMessage, json!({ "text": "a long enough message" }));
        assert!(codec.encode(&env, &mut BytesMut::new()).is_err());
    }

    #[test]
    fn test_unknown_flag_is_malformed() {
        let codec = FramedCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.put_u8(9);
        buf.extend_from_slice(b"{}");
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::MalformedFrame(_))));
    }
}
