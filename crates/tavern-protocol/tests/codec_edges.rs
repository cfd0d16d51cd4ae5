use bytes::BytesMut;
use serde_json::json;
use tavern_protocol::{
    CodecConfig, CompressionAlgorithm, Compressor, Envelope, FramedCodec, MessageType, ProtocolError,
};

#[test]
fn byte_by_byte_delivery_decodes_once_complete() {
    let codec = FramedCodec::default();
    let env = Envelope::from_json(
        MessageType::CharacterUpdate,
        json!({ "character_id": "char-1", "version": 3, "updates": { "hp": 10 } }),
    );
    let mut full = BytesMut::new();
    codec.encode(&env, &mut full).expect("encode");

    let mut buf = BytesMut::new();
    for (i, byte) in full.iter().enumerate() {
        buf.extend_from_slice(&[*byte]);
        let decoded = codec.decode(&mut buf).expect("decode ok");
        if i + 1 < full.len() {
            assert!(decoded.is_none(), "frame incomplete at byte {i}");
        } else {
            assert_eq!(decoded, Some(env.clone()));
        }
    }
    assert!(buf.is_empty());
}

#[test]
fn batch_survives_compression() {
    let codec = FramedCodec::new(CodecConfig {
        compression: Some(CompressionAlgorithm::Lz4),
        compression_threshold: 0,
        ..Default::default()
    });
    let moves: Vec<Envelope> = (0..40)
        .map(|x| Envelope::from_json(MessageType::SpriteMove, json!({ "sprite_id": "s1", "x": x })))
        .collect();
    let batch = Envelope::batch(moves.clone()).expect("batch");

    let mut buf = BytesMut::new();
    codec.encode(&batch, &mut buf).expect("encode");
    let decoded = codec.decode(&mut buf).expect("decode").expect("complete");

    assert_eq!(decoded.flatten(), moves);
}

#[test]
fn invalid_json_body_is_an_error() {
    let codec = FramedCodec::default();
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&6u32.to_be_bytes());
    buf.extend_from_slice(&[0]);
    buf.extend_from_slice(b"{nope");

    assert!(codec.decode(&mut buf).is_err());
}

#[test]
fn compressed_frame_may_not_expand_past_the_frame_limit() {
    let codec = FramedCodec::new(CodecConfig {
        max_frame_size: 16 * 1024,
        ..Default::default()
    });
    // A few hundred bytes on the wire, a megabyte once inflated
    let note = "x".repeat(1024 * 1024);
    let json = serde_json::to_vec(&json!({ "type": "chat_message", "data": { "text": note } }))
        .expect("json");

    for algo in [CompressionAlgorithm::Zstd, CompressionAlgorithm::Lz4] {
        let packed = Compressor::new(algo).compress(&json).expect("compress");
        assert!(packed.len() < 16 * 1024);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(packed.len() as u32 + 1).to_be_bytes());
        buf.extend_from_slice(&[algo.flag()]);
        buf.extend_from_slice(&packed);

        assert!(
            matches!(codec.decode(&mut buf), Err(ProtocolError::FrameTooLarge(_))),
            "{algo:?} frame inflated past the limit"
        );
    }
}
