use super::*;
use crate::bitfield::Bitfield;
use crate::message::{DecodeContext, ExtensionRegistry, Handshake, Message};
use crate::peer::{ConnectionId, Peer, PeerId};
use crate::settings::EncryptionTypes;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;

fn peer() -> Peer {
    Peer::new("10.0.0.1:6881".parse::<SocketAddr>().unwrap())
}

fn rc4_keys(send: &[u8], receive: &[u8]) -> Negotiated {
    Negotiated {
        kind: EncryptionTypes::RC4_FULL,
        encryptor: Encryptor::Rc4(Box::new(Rc4::with_discard(send, 1024))),
        decryptor: Encryptor::Rc4(Box::new(Rc4::with_discard(receive, 1024))),
        initial: Bytes::new(),
    }
}

fn duplex_pair(encrypted: bool) -> ((PeerReader, PeerWriter), (PeerReader, PeerWriter)) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_keys, b_keys) = if encrypted {
        (rc4_keys(b"a to b", b"b to a"), rc4_keys(b"b to a", b"a to b"))
    } else {
        (Negotiated::plain_text(), Negotiated::plain_text())
    };
    (
        transport::split(Box::new(a), a_keys),
        transport::split(Box::new(b), b_keys),
    )
}

/// Runs both ends of message stream encryption over an in-memory pipe.
async fn stream_encryption(
    info_hash: [u8; 20],
    initiator: EncryptionTypes,
    known: Vec<[u8; 20]>,
    responder: EncryptionTypes,
) -> (
    Result<(BoxedStream, Negotiated), PeerError>,
    Result<(BoxedStream, Negotiated), PeerError>,
) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let outgoing = tokio::spawn(StreamEncryptionNegotiator.negotiate(
        Box::new(a),
        NegotiationRole::Outgoing { info_hash },
        initiator,
    ));
    let incoming = StreamEncryptionNegotiator
        .negotiate(
            Box::new(b),
            NegotiationRole::Incoming { info_hashes: known },
            responder,
        )
        .await;
    (outgoing.await.unwrap(), incoming)
}

#[test]
fn test_rc4_known_vectors() {
    let cases: [(&[u8], &[u8], &[u8]); 3] = [
        (b"Key", b"Plaintext", &[0xBB, 0xF3, 0x16, 0xE8, 0xD9, 0x40, 0xAF, 0x0A, 0xD3]),
        (b"Wiki", b"pedia", &[0x10, 0x21, 0xBF, 0x04, 0x20]),
        (
            b"Secret",
            b"Attack at dawn",
            &[0x45, 0xA0, 0x1F, 0x64, 0x5F, 0xC3, 0x5B, 0x38, 0x35, 0x52, 0x54, 0x4B, 0x9B, 0xF5],
        ),
    ];
    for (key, plain, cipher) in cases {
        let mut data = plain.to_vec();
        Rc4::new(key).apply(&mut data);
        assert_eq!(data, cipher);
    }
}

#[test]
fn test_rc4_discard_matches_skipped_keystream() {
    let mut skipped = Rc4::new(b"key");
    skipped.apply(&mut [0u8; 1024]);
    let mut a = [0u8; 32];
    skipped.apply(&mut a);

    let mut b = [0u8; 32];
    Rc4::with_discard(b"key", 1024).apply(&mut b);
    assert_eq!(a, b);
}

#[test]
fn test_check_negotiated_strikes_disallowed_method() {
    let engine = EncryptionTypes::PLAIN_TEXT | EncryptionTypes::RC4_HEADER;
    let mut peer_allowed = EncryptionTypes::ALL;

    assert!(check_negotiated(engine, &mut peer_allowed, EncryptionTypes::PLAIN_TEXT).is_ok());
    assert_eq!(peer_allowed, EncryptionTypes::ALL);

    let err = check_negotiated(engine, &mut peer_allowed, EncryptionTypes::RC4_FULL).unwrap_err();
    assert!(matches!(err, PeerError::Encryption(_)));
    assert!(!peer_allowed.contains(EncryptionTypes::RC4_FULL));
    assert!(peer_allowed.contains(EncryptionTypes::RC4_HEADER));
}

#[tokio::test]
async fn test_plain_text_negotiator() {
    let (a, _b) = tokio::io::duplex(64);
    let result = PlainTextNegotiator
        .negotiate(
            Box::new(a),
            NegotiationRole::Outgoing { info_hash: [1; 20] },
            EncryptionTypes::ALL,
        )
        .await;
    assert!(matches!(result, Ok((_, ref n)) if n.kind == EncryptionTypes::PLAIN_TEXT));

    let (a, _b) = tokio::io::duplex(64);
    let result = PlainTextNegotiator
        .negotiate(
            Box::new(a),
            NegotiationRole::Incoming { info_hashes: Vec::new() },
            EncryptionTypes::RC4_FULL,
        )
        .await;
    assert!(matches!(result, Err(PeerError::EncryptionDisabled)));
}

#[test]
fn test_key_exchange_agrees() {
    let a = mse::KeyPair::generate();
    let b = mse::KeyPair::generate();
    assert_ne!(a.public, b.public);
    assert_eq!(a.shared_secret(&b.public), b.shared_secret(&a.public));
}

#[tokio::test]
async fn test_stream_encryption_full() {
    let info_hash = [7u8; 20];
    let (outgoing, incoming) = stream_encryption(
        info_hash,
        EncryptionTypes::ALL,
        vec![[1; 20], info_hash],
        EncryptionTypes::ALL,
    )
    .await;
    let (a, a_keys) = outgoing.unwrap();
    let (b, b_keys) = incoming.unwrap();
    assert_eq!(a_keys.kind, EncryptionTypes::RC4_FULL);
    assert_eq!(b_keys.kind, EncryptionTypes::RC4_FULL);
    assert!(b_keys.initial.is_empty());

    let (mut a_reader, mut a_writer) = transport::split(a, a_keys);
    let (mut b_reader, mut b_writer) = transport::split(b, b_keys);
    let registry = ExtensionRegistry::default();
    let ctx = DecodeContext::new(Some(4), &registry);

    let handshake = Handshake::new(info_hash, PeerId::generate());
    a_writer.write_handshake(&handshake).await.unwrap();
    assert_eq!(b_reader.read_handshake().await.unwrap(), handshake);
    b_writer.write_message(&Message::Have { piece: 3 }).await.unwrap();
    assert_eq!(a_reader.read_message(&ctx).await.unwrap(), Message::Have { piece: 3 });
}

#[tokio::test]
async fn test_stream_encryption_header_only() {
    let info_hash = [7u8; 20];
    let (outgoing, incoming) = stream_encryption(
        info_hash,
        EncryptionTypes::RC4_HEADER,
        vec![info_hash],
        EncryptionTypes::ALL,
    )
    .await;
    let (a, a_keys) = outgoing.unwrap();
    let (b, b_keys) = incoming.unwrap();
    assert_eq!(a_keys.kind, EncryptionTypes::RC4_HEADER);
    assert_eq!(b_keys.kind, EncryptionTypes::RC4_HEADER);
    assert!(a_keys.encryptor.is_plain_text());

    let (_a_reader, mut a_writer) = transport::split(a, a_keys);
    let (mut b_reader, _b_writer) = transport::split(b, b_keys);
    let handshake = Handshake::new(info_hash, PeerId::generate());
    a_writer.write_handshake(&handshake).await.unwrap();
    assert_eq!(b_reader.read_handshake().await.unwrap(), handshake);
}

#[tokio::test]
async fn test_incoming_plain_text_is_detected() {
    let info_hash = [7u8; 20];
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (outgoing, negotiated) = StreamEncryptionNegotiator
        .negotiate(
            Box::new(a),
            NegotiationRole::Outgoing { info_hash },
            EncryptionTypes::PLAIN_TEXT,
        )
        .await
        .unwrap();
    assert_eq!(negotiated.kind, EncryptionTypes::PLAIN_TEXT);
    let (_reader, mut writer) = transport::split(outgoing, negotiated);
    let handshake = Handshake::new(info_hash, PeerId::generate());
    writer.write_handshake(&handshake).await.unwrap();

    let (incoming, negotiated) = StreamEncryptionNegotiator
        .negotiate(
            Box::new(b),
            NegotiationRole::Incoming { info_hashes: vec![info_hash] },
            EncryptionTypes::ALL,
        )
        .await
        .unwrap();
    assert_eq!(negotiated.kind, EncryptionTypes::PLAIN_TEXT);
    assert_eq!(negotiated.initial.len(), 20);
    let (mut reader, _writer) = transport::split(incoming, negotiated);
    assert_eq!(reader.read_handshake().await.unwrap(), handshake);
}

#[tokio::test]
async fn test_incoming_plain_text_rejected_when_encryption_required() {
    let (mut a, b) = tokio::io::duplex(1024);
    a.write_all(&Handshake::new([7; 20], PeerId::generate()).encode())
        .await
        .unwrap();
    let result = StreamEncryptionNegotiator
        .negotiate(
            Box::new(b),
            NegotiationRole::Incoming { info_hashes: vec![[7; 20]] },
            EncryptionTypes::RC4_FULL,
        )
        .await;
    assert!(matches!(result, Err(PeerError::EncryptionDisabled)));
}

#[tokio::test]
async fn test_stream_encryption_unknown_info_hash() {
    let (outgoing, incoming) = stream_encryption(
        [7; 20],
        EncryptionTypes::ALL,
        vec![[1; 20], [2; 20]],
        EncryptionTypes::ALL,
    )
    .await;
    assert!(matches!(incoming, Err(PeerError::UnknownTorrent)));
    assert!(outgoing.is_err());
}

#[tokio::test]
async fn test_stream_encryption_without_common_method() {
    let (outgoing, incoming) = stream_encryption(
        [7; 20],
        EncryptionTypes::RC4_FULL,
        vec![[7; 20]],
        EncryptionTypes::RC4_HEADER | EncryptionTypes::PLAIN_TEXT,
    )
    .await;
    assert!(matches!(incoming, Err(PeerError::Encryption(_))));
    assert!(outgoing.is_err());
}

#[tokio::test]
async fn test_handshake_and_messages_over_duplex() {
    for encrypted in [false, true] {
        let ((mut a_reader, mut a_writer), (mut b_reader, mut b_writer)) = duplex_pair(encrypted);
        let registry = ExtensionRegistry::default();
        let ctx = DecodeContext::new(Some(12), &registry);

        let handshake = Handshake::new([7u8; 20], PeerId::generate()).with_fast_peer(true);
        a_writer.write_handshake(&handshake).await.unwrap();
        assert_eq!(b_reader.read_handshake().await.unwrap(), handshake);

        let mut bits = Bitfield::new(12);
        bits.set(3, true);
        let messages = vec![
            Message::Bitfield(bits),
            Message::KeepAlive,
            Message::Piece {
                index: 1,
                begin: 0,
                data: Bytes::from(vec![9u8; 16384]),
            },
            Message::Have { piece: 11 },
        ];
        for message in &messages {
            let written = b_writer.write_message(message).await.unwrap();
            assert_eq!(written, message.byte_len());
        }
        for message in &messages {
            assert_eq!(&a_reader.read_message(&ctx).await.unwrap(), message);
        }
    }
}

#[tokio::test]
async fn test_oversized_frame_rejected() {
    let (mut raw, b) = tokio::io::duplex(1024);
    let (reader, _writer) = transport::split(Box::new(b), Negotiated::plain_text());
    let mut reader = reader.with_max_frame(100);

    raw.write_all(&1000u32.to_be_bytes()).await.unwrap();
    assert!(matches!(
        reader.read_frame().await,
        Err(PeerError::Protocol(_))
    ));
}

#[tokio::test]
async fn test_closed_stream_mid_frame() {
    let (mut raw, b) = tokio::io::duplex(1024);
    let (mut reader, _writer) = transport::split(Box::new(b), Negotiated::plain_text());

    raw.write_all(&[0, 0, 0, 5, 4, 0]).await.unwrap();
    drop(raw);
    assert!(matches!(
        reader.read_frame().await,
        Err(PeerError::ConnectionClosed)
    ));
}

#[test]
fn test_error_transience() {
    assert!(PeerError::ConnectionClosed.is_transient());
    assert!(PeerError::Timeout.is_transient());
    assert!(!PeerError::InfoHashMismatch.is_transient());
    assert!(!PeerError::SelfConnection.is_transient());
    assert!(!PeerError::Banned.is_transient());
    assert_eq!(PeerError::InfoHashMismatch.to_string(), "info hash mismatch");
}

#[test]
fn test_new_connection_state() {
    let out = PeerConnection::outgoing(ConnectionId(1), 0, peer());
    assert_eq!(out.state, ConnectionState::Connecting);
    assert!(out.am_choking && out.is_choking);
    assert!(!out.can_request());

    let inbound = PeerConnection::incoming(ConnectionId(2), peer());
    assert_eq!(inbound.state, ConnectionState::EncryptionNegotiation);
    assert_eq!(inbound.torrent, None);
}

#[test]
fn test_queued_replies() {
    let mut conn = PeerConnection::outgoing(ConnectionId(1), 0, peer());
    conn.enqueue(Message::Unchoke);
    conn.queue.push_back(Outgoing::PieceReply { index: 1, begin: 0, length: 16384 });
    conn.queue.push_back(Outgoing::PieceReply { index: 1, begin: 16384, length: 16384 });

    assert!(conn.has_queued_reply(1, 0, 16384));
    assert!(conn.remove_queued_reply(1, 0, 16384));
    assert!(!conn.remove_queued_reply(1, 0, 16384));

    let dropped = conn.clear_queued_replies();
    assert_eq!(dropped, vec![(1, 16384, 16384)]);
    assert_eq!(conn.queue.len(), 1);
}

#[test]
fn test_request_gating() {
    let mut conn = PeerConnection::outgoing(ConnectionId(1), 0, peer());
    conn.state = ConnectionState::HandshakeReceived;
    conn.am_interested = true;
    assert!(!conn.can_request());

    conn.supports_fast_peer = true;
    conn.allowed_fast.push(4);
    assert!(conn.can_request());

    conn.allowed_fast.clear();
    conn.is_choking = false;
    assert!(conn.can_request());

    conn.pending_requests = 10;
    conn.set_max_pending(4);
    assert_eq!(conn.request_capacity(), 0);
    conn.set_max_pending(100_000);
    assert_eq!(conn.max_pending, crate::constants::MAX_PENDING_REQUESTS);
}
