use super::engine::{Engine, HalfOpenGuard, IoEvent};
use super::*;
use crate::bitfield::Bitfield;
use crate::connection::{
    BoxFuture, BoxedStream, ConnectionState, Connector, Outgoing, PeerConnection,
};
use crate::constants::{MAX_CLEANUPS, MAX_HASH_FAILS};
use crate::message::Message;
use crate::picker::PiecePicker;
use crate::peer::{ConnectionId, Peer};
use crate::settings::{EncryptionTypes, EngineSettings, TorrentSettings};
use crate::storage::{MemoryWriter, PieceWriter, StorageError};
use crate::torrent::{Mode, TorrentFile, TorrentInfo};
use sha1::{Digest, Sha1};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::timeout;

const PIECE_LENGTH: u32 = 65536;
const SIZE: usize = 40000;

/// Never finishes connecting, so attempts stay half-open.
struct PendingConnector;

impl Connector for PendingConnector {
    fn connect(&self, _addr: SocketAddr) -> BoxFuture<'static, io::Result<BoxedStream>> {
        Box::pin(std::future::pending())
    }
}

/// Storage that fails every read and write.
#[derive(Debug, Default)]
struct FailingWriter;

fn unplugged() -> StorageError {
    StorageError::Io(io::Error::other("disk unplugged"))
}

impl PieceWriter for FailingWriter {
    fn exists(&self, _file: &TorrentFile) -> Result<bool, StorageError> {
        Ok(true)
    }

    fn read(&self, _file: &TorrentFile, _offset: u64, _buf: &mut [u8]) -> Result<(), StorageError> {
        Err(unplugged())
    }

    fn write(&self, _file: &TorrentFile, _offset: u64, _data: &[u8]) -> Result<(), StorageError> {
        Err(unplugged())
    }

    fn flush(&self, _file: &TorrentFile) -> Result<(), StorageError> {
        Ok(())
    }

    fn close(&self, _file: &TorrentFile) -> Result<(), StorageError> {
        Ok(())
    }

    fn move_to(&self, _file: &TorrentFile, _new_path: &Path) -> Result<(), StorageError> {
        Ok(())
    }
}

fn addr(host: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, host], 6881))
}

fn content() -> Vec<u8> {
    (0..SIZE).map(|i| (i % 251) as u8).collect()
}

fn info_for(info_hash: [u8; 20], data: &[u8]) -> TorrentInfo {
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&Sha1::digest(data));
    TorrentInfo::new(
        info_hash,
        "single",
        PIECE_LENGTH,
        [(PathBuf::from("single.dat"), data.len() as u64)],
        vec![hash],
    )
}

fn info(info_hash: [u8; 20]) -> TorrentInfo {
    info_for(info_hash, &content())
}

fn engine_with(builder: ManagerBuilder) -> (Engine, ManagerHandle) {
    builder.build()
}

fn engine() -> (Engine, ManagerHandle) {
    engine_with(ManagerBuilder::new(EngineSettings::default()))
}

fn add(engine: &mut Engine, info_hash: [u8; 20], settings: TorrentSettings) -> usize {
    engine
        .add_torrent(info(info_hash), settings, Arc::new(MemoryWriter::new()), None)
        .unwrap()
}

/// Inserts a connection that already completed its handshake.
fn connected(engine: &mut Engine, id: u64, torrent: usize, peer: Peer) -> ConnectionId {
    let id = ConnectionId(id);
    let addr = peer.addr;
    let mut conn = PeerConnection::outgoing(id, torrent, peer);
    conn.state = ConnectionState::HandshakeReceived;
    engine.torrents[torrent].peers.active.push(addr);
    engine.torrents[torrent].peers.connected.push(id);
    engine.connections.insert(id, conn);
    id
}

async fn wait_for(
    events: &mut broadcast::Receiver<EngineEvent>,
    mut matches: impl FnMut(&EngineEvent) -> bool,
) -> EngineEvent {
    timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[test]
fn test_half_open_guard() {
    let counter = Arc::new(AtomicUsize::new(0));
    let first = HalfOpenGuard::new(&counter);
    let second = HalfOpenGuard::new(&counter);
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    drop(first);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    drop(second);
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn test_add_torrent_errors() {
    let (mut engine, _handle) = engine();
    add(&mut engine, [1; 20], TorrentSettings::default());

    let duplicate = engine.add_torrent(
        info([1; 20]),
        TorrentSettings::default(),
        Arc::new(MemoryWriter::new()),
        None,
    );
    assert!(matches!(duplicate, Err(ManagerError::DuplicateTorrent)));

    let mut inconsistent = info([2; 20]);
    inconsistent.piece_hashes.push([0; 20]);
    let result = engine.add_torrent(
        inconsistent,
        TorrentSettings::default(),
        Arc::new(MemoryWriter::new()),
        None,
    );
    assert!(matches!(result, Err(ManagerError::InvalidTorrent(_))));

    let result = engine.add_torrent(
        info([3; 20]),
        TorrentSettings::default(),
        Arc::new(MemoryWriter::new()),
        Some(Bitfield::new(4)),
    );
    assert!(matches!(result, Err(ManagerError::InvalidTorrent(_))));
    assert_eq!(engine.torrents.len(), 1);
}

#[test]
fn test_add_complete_torrent_seeds() {
    let (mut engine, _handle) = engine();
    let index = engine
        .add_torrent(
            info([1; 20]),
            TorrentSettings::default(),
            Arc::new(MemoryWriter::new()),
            Some(Bitfield::full(1)),
        )
        .unwrap();
    assert_eq!(engine.torrents[index].mode, Mode::Seeding);
}

#[test]
fn test_cleanup_is_idempotent() {
    let (mut engine, handle) = engine();
    let t = add(&mut engine, [1; 20], TorrentSettings::default());
    let id = connected(&mut engine, 1, t, Peer::new(addr(1)));
    let mut events = handle.subscribe();

    engine.cleanup(id, "connection closed");
    engine.cleanup(id, "connection closed");

    assert!(engine.connections.is_empty());
    let peers = &engine.torrents[t].peers;
    assert!(peers.active.is_empty());
    assert!(peers.connected.is_empty());
    assert_eq!(peers.available.len(), 1);
    assert_eq!(peers.available[0].cleaned_up_count, 1);

    match events.try_recv() {
        Ok(EngineEvent::PeerDisconnected { id: gone, reason, .. }) => {
            assert_eq!(gone, id);
            assert_eq!(reason, "connection closed");
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert!(events.try_recv().is_err());
}

#[test]
fn test_cleanup_stops_requeue_after_max_cleanups() {
    let (mut engine, _handle) = engine();
    let t = add(&mut engine, [1; 20], TorrentSettings::default());
    let mut peer = Peer::new(addr(1));
    peer.cleaned_up_count = MAX_CLEANUPS - 1;
    let id = connected(&mut engine, 1, t, peer);

    engine.cleanup(id, "connection closed");
    assert!(engine.torrents[t].peers.available.is_empty());
    assert!(engine.torrents[t].peers.busy.is_empty());
}

#[test]
fn test_cleanup_before_handshake_marks_peer_busy() {
    let (mut engine, _handle) = engine();
    let t = add(&mut engine, [1; 20], TorrentSettings::default());
    let id = ConnectionId(1);
    engine.torrents[t].peers.connecting.push(addr(1));
    engine
        .connections
        .insert(id, PeerConnection::outgoing(id, t, Peer::new(addr(1))));

    engine.cleanup(id, "timeout");
    let peers = &engine.torrents[t].peers;
    assert!(peers.connecting.is_empty());
    assert!(peers.available.is_empty());
    assert_eq!(peers.busy.len(), 1);
    assert_eq!(peers.busy[0].failed_connection_attempts, 1);
}

#[test]
fn test_cleanup_does_not_requeue_unreconnectable_or_incoming() {
    let (mut engine, _handle) = engine();
    let t = add(&mut engine, [1; 20], TorrentSettings::default());

    let id = connected(&mut engine, 1, t, Peer::new(addr(1)));
    engine.connections.get_mut(&id).unwrap().can_reconnect = false;
    engine.cleanup(id, "protocol error: bad message");

    let id = ConnectionId(2);
    let mut conn = PeerConnection::incoming(id, Peer::new(addr(2)));
    conn.torrent = Some(t);
    conn.state = ConnectionState::HandshakeReceived;
    engine.connections.insert(id, conn);
    engine.cleanup(id, "connection closed");

    let peers = &engine.torrents[t].peers;
    assert!(peers.available.is_empty());
    assert!(peers.busy.is_empty());
}

#[test]
fn test_cleanup_releases_upload_slot() {
    let (mut engine, _handle) = engine();
    let t = add(&mut engine, [1; 20], TorrentSettings::default());
    let id = connected(&mut engine, 1, t, Peer::new(addr(1)));
    engine.connections.get_mut(&id).unwrap().am_choking = false;
    engine.torrents[t].uploading_to = 1;

    engine.cleanup(id, "connection closed");
    assert_eq!(engine.torrents[t].uploading_to, 0);
}

#[tokio::test]
async fn test_connect_respects_half_open_cap() {
    let settings = EngineSettings {
        max_half_open_connections: 2,
        ..EngineSettings::default()
    };
    let (mut engine, _handle) =
        engine_with(ManagerBuilder::new(settings).connector(PendingConnector));
    let t = add(&mut engine, [1; 20], TorrentSettings::default());
    engine.torrents[t]
        .peers
        .add_peers((1..=5).map(|host| Peer::new(addr(host))));

    engine.try_connect();
    assert_eq!(engine.half_open.load(Ordering::SeqCst), 2);
    assert_eq!(engine.connections.len(), 2);
    assert_eq!(engine.torrents[t].peers.connecting.len(), 2);
    assert_eq!(engine.torrents[t].peers.available.len(), 3);
    assert!(engine.connections.values().all(|c| c.peer.last_connection_attempt.is_some()));

    engine.try_connect();
    assert_eq!(engine.connections.len(), 2);
}

#[tokio::test]
async fn test_connect_respects_global_cap() {
    let settings = EngineSettings {
        max_connections: 1,
        ..EngineSettings::default()
    };
    let (mut engine, _handle) =
        engine_with(ManagerBuilder::new(settings).connector(PendingConnector));
    let t = add(&mut engine, [1; 20], TorrentSettings::default());
    engine.torrents[t]
        .peers
        .add_peers((1..=3).map(|host| Peer::new(addr(host))));

    engine.try_connect();
    assert_eq!(engine.connections.len(), 1);
}

#[tokio::test]
async fn test_connect_respects_torrent_cap() {
    let (mut engine, _handle) =
        engine_with(ManagerBuilder::new(EngineSettings::default()).connector(PendingConnector));
    let settings = TorrentSettings {
        max_connections: 1,
        ..TorrentSettings::default()
    };
    let t = add(&mut engine, [1; 20], settings);
    engine.torrents[t]
        .peers
        .add_peers((1..=3).map(|host| Peer::new(addr(host))));

    engine.try_connect();
    assert_eq!(engine.torrents[t].peers.connecting.len(), 1);
    assert_eq!(engine.torrents[t].peers.available.len(), 2);
}

#[tokio::test]
async fn test_connect_round_robins_torrents() {
    let settings = EngineSettings {
        max_half_open_connections: 4,
        ..EngineSettings::default()
    };
    let (mut engine, _handle) =
        engine_with(ManagerBuilder::new(settings).connector(PendingConnector));
    let first = add(&mut engine, [1; 20], TorrentSettings::default());
    let second = add(&mut engine, [2; 20], TorrentSettings::default());
    engine.torrents[first]
        .peers
        .add_peers((1..=4).map(|host| Peer::new(addr(host))));
    engine.torrents[second]
        .peers
        .add_peers((11..=14).map(|host| Peer::new(addr(host))));

    engine.try_connect();
    assert_eq!(engine.torrents[first].peers.connecting.len(), 2);
    assert_eq!(engine.torrents[second].peers.connecting.len(), 2);
}

#[tokio::test]
async fn test_connect_skips_banned_and_seeders_while_seeding() {
    let builder = ManagerBuilder::new(EngineSettings::default())
        .connector(PendingConnector)
        .ban_filter(|peer| peer.addr == SocketAddr::from(([10, 0, 0, 1], 6881)));
    let (mut engine, _handle) = engine_with(builder);
    let t = engine
        .add_torrent(
            info([1; 20]),
            TorrentSettings::default(),
            Arc::new(MemoryWriter::new()),
            Some(Bitfield::full(1)),
        )
        .unwrap();
    let mut seeder = Peer::new(addr(2));
    seeder.is_seeder = true;
    engine.torrents[t]
        .peers
        .add_peers([Peer::new(addr(1)), seeder, Peer::new(addr(3))]);

    engine.try_connect();
    let peers = &mut engine.torrents[t].peers;
    assert_eq!(peers.connecting, vec![addr(3)]);
    assert!(peers.banned.contains(&addr(1).ip()));
    assert_eq!(peers.available.len(), 1);
    assert_eq!(peers.add_peers([Peer::new(addr(1))]), 0);
}

#[tokio::test]
async fn test_stopped_torrent_makes_no_connections() {
    let (mut engine, _handle) =
        engine_with(ManagerBuilder::new(EngineSettings::default()).connector(PendingConnector));
    let t = add(&mut engine, [1; 20], TorrentSettings::default());
    engine.torrents[t].mode = Mode::Stopped;
    engine.torrents[t].peers.add_peers([Peer::new(addr(1))]);

    engine.try_connect();
    assert!(engine.connections.is_empty());
}

#[tokio::test]
async fn test_connection_failure_is_reported() {
    let network = LoopbackNetwork::new();
    let handle = ManagerBuilder::new(EngineSettings::default())
        .connector(network.connector(addr(1)))
        .spawn();
    let info_hash = [1; 20];
    handle
        .add_torrent(
            info(info_hash),
            TorrentSettings::default(),
            Arc::new(MemoryWriter::new()),
            None,
        )
        .await
        .unwrap();
    let mut events = handle.subscribe();

    assert_eq!(handle.add_peers(info_hash, [addr(9)]).await.unwrap(), 1);
    let event = wait_for(&mut events, |e| matches!(e, EngineEvent::ConnectionFailed { .. })).await;
    assert!(matches!(event, EngineEvent::ConnectionFailed { addr: a, .. } if a == addr(9)));

    let status = handle.status(info_hash).await.unwrap();
    assert_eq!(status.available_peers, 0);
    assert_eq!(status.connected, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_self_connection_is_dropped() {
    let network = LoopbackNetwork::new();
    let handle = ManagerBuilder::new(EngineSettings::default())
        .connector(network.connector(addr(1)))
        .spawn();
    network.register(addr(1), handle.clone());

    let info_hash = [1; 20];
    handle
        .add_torrent(
            info(info_hash),
            TorrentSettings::default(),
            Arc::new(MemoryWriter::new()),
            None,
        )
        .await
        .unwrap();
    let mut events = handle.subscribe();
    handle.add_peers(info_hash, [addr(1)]).await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, EngineEvent::PeerDisconnected { reason, .. } if reason == "connected to ourselves")
    })
    .await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handle_commands() {
    let handle = ManagerBuilder::new(EngineSettings::default())
        .connector(PendingConnector)
        .spawn();
    let info_hash = [1; 20];
    let mut events = handle.subscribe();

    handle
        .add_torrent(
            info(info_hash),
            TorrentSettings::default(),
            Arc::new(MemoryWriter::new()),
            None,
        )
        .await
        .unwrap();
    let event = wait_for(&mut events, |e| matches!(e, EngineEvent::ModeChanged { .. })).await;
    assert_eq!(
        event,
        EngineEvent::ModeChanged {
            info_hash,
            mode: Mode::Downloading
        }
    );

    assert!(matches!(
        handle.status([9; 20]).await,
        Err(ManagerError::UnknownTorrent)
    ));
    assert!(matches!(
        handle.set_file_priority(info_hash, 3, crate::torrent::Priority::High).await,
        Err(ManagerError::InvalidFile(3))
    ));
    handle
        .set_file_priority(info_hash, 0, crate::torrent::Priority::High)
        .await
        .unwrap();

    handle.add_peers(info_hash, [addr(2)]).await.unwrap();
    handle.stop_torrent(info_hash).await.unwrap();
    let status = handle.status(info_hash).await.unwrap();
    assert_eq!(status.mode, Mode::Stopped);
    assert_eq!(status.connected, 0);
    assert_eq!(status.piece_count, 1);

    handle.start_torrent(info_hash).await.unwrap();
    assert_eq!(handle.status(info_hash).await.unwrap().mode, Mode::Downloading);

    handle.shutdown().await.unwrap();
    assert!(matches!(
        handle.status(info_hash).await,
        Err(ManagerError::Closed)
    ));
}

#[tokio::test]
async fn test_download_from_seeder() {
    let settings = EngineSettings {
        tick_interval: Duration::from_millis(50),
        ..EngineSettings::default()
    };
    let network = LoopbackNetwork::new();
    let seeder = ManagerBuilder::new(settings.clone())
        .connector(network.connector(addr(1)))
        .spawn();
    let leecher = ManagerBuilder::new(settings)
        .connector(network.connector(addr(2)))
        .spawn();
    network.register(addr(1), seeder.clone());
    network.register(addr(2), leecher.clone());

    let data = content();
    let info_hash = [5; 20];
    let source = Arc::new(MemoryWriter::new());
    source.insert("single.dat", data.clone());
    seeder
        .add_torrent(
            info_for(info_hash, &data),
            TorrentSettings::default(),
            source,
            Some(Bitfield::full(1)),
        )
        .await
        .unwrap();

    let target = Arc::new(MemoryWriter::new());
    leecher
        .add_torrent(
            info_for(info_hash, &data),
            TorrentSettings::default(),
            target.clone(),
            None,
        )
        .await
        .unwrap();

    let mut events = leecher.subscribe();
    leecher.add_peers(info_hash, [addr(1)]).await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, EngineEvent::ModeChanged { mode: Mode::Seeding, .. })
    })
    .await;

    let status = leecher.status(info_hash).await.unwrap();
    assert_eq!(status.pieces_have, 1);
    assert_eq!(status.active_requests, 0);
    assert_eq!(target.contents(Path::new("single.dat")), Some(data));

    leecher.shutdown().await.unwrap();
    seeder.shutdown().await.unwrap();
}

fn queued_messages(engine: &Engine, id: ConnectionId) -> Vec<Message> {
    engine.connections[&id]
        .queue
        .iter()
        .filter_map(|item| match item {
            Outgoing::Message(message) => Some(message.clone()),
            _ => None,
        })
        .collect()
}

/// Two loopback managers sharing `data`: one seeding it from `source`, the
/// other downloading into `target`.
async fn swarm(
    seeder_settings: TorrentSettings,
    source: Arc<dyn PieceWriter>,
    target: Arc<dyn PieceWriter>,
) -> (ManagerHandle, ManagerHandle, [u8; 20]) {
    let settings = EngineSettings {
        tick_interval: Duration::from_millis(50),
        ..EngineSettings::default()
    };
    let network = LoopbackNetwork::new();
    let seeder = ManagerBuilder::new(settings.clone())
        .connector(network.connector(addr(1)))
        .spawn();
    let leecher = ManagerBuilder::new(settings)
        .connector(network.connector(addr(2)))
        .spawn();
    network.register(addr(1), seeder.clone());
    network.register(addr(2), leecher.clone());

    let data = content();
    let info_hash = [5; 20];
    seeder
        .add_torrent(
            info_for(info_hash, &data),
            seeder_settings,
            source,
            Some(Bitfield::full(1)),
        )
        .await
        .unwrap();
    leecher
        .add_torrent(
            info_for(info_hash, &data),
            TorrentSettings::default(),
            target,
            None,
        )
        .await
        .unwrap();
    (seeder, leecher, info_hash)
}

fn is_error_mode(event: &EngineEvent) -> bool {
    matches!(
        event,
        EngineEvent::ModeChanged { mode: Mode::Error(reason), .. } if reason.contains("disk unplugged")
    )
}

#[tokio::test]
async fn test_read_failure_while_serving_enters_error_mode() {
    let (seeder, leecher, info_hash) = swarm(
        TorrentSettings::default(),
        Arc::new(FailingWriter),
        Arc::new(MemoryWriter::new()),
    )
    .await;
    let mut events = seeder.subscribe();
    leecher.add_peers(info_hash, [addr(1)]).await.unwrap();

    wait_for(&mut events, is_error_mode).await;
    let status = seeder.status(info_hash).await.unwrap();
    assert!(matches!(status.mode, Mode::Error(_)));
    assert_eq!(status.connected, 0);

    // The error mode is sticky.
    seeder.start_torrent(info_hash).await.unwrap();
    assert!(matches!(seeder.status(info_hash).await.unwrap().mode, Mode::Error(_)));

    leecher.shutdown().await.unwrap();
    seeder.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_write_failure_after_hash_enters_error_mode() {
    let source = Arc::new(MemoryWriter::new());
    source.insert("single.dat", content());
    let (seeder, leecher, info_hash) =
        swarm(TorrentSettings::default(), source, Arc::new(FailingWriter)).await;
    let mut events = leecher.subscribe();
    leecher.add_peers(info_hash, [addr(1)]).await.unwrap();

    wait_for(&mut events, is_error_mode).await;
    let status = leecher.status(info_hash).await.unwrap();
    assert_eq!(status.pieces_have, 0);
    assert_eq!(status.active_requests, 0);

    leecher.shutdown().await.unwrap();
    seeder.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timed_out_requests_are_cancelled_and_picked_again() {
    let settings = EngineSettings {
        request_timeout: Duration::ZERO,
        ..EngineSettings::default()
    };
    let (mut engine, _handle) = engine_with(ManagerBuilder::new(settings));
    let t = add(&mut engine, [1; 20], TorrentSettings::default());
    let id = connected(&mut engine, 1, t, Peer::new(addr(1)));
    let conn = engine.connections.get_mut(&id).unwrap();
    conn.bitfield = Bitfield::full(1);
    conn.am_interested = true;
    conn.is_choking = false;

    engine.tick();
    let requests = queued_messages(&engine, id);
    assert_eq!(requests.len(), 3);
    assert!(requests.iter().all(|m| matches!(m, Message::Request { .. })));
    assert_eq!(engine.connections[&id].pending_requests, 3);

    engine.connections.get_mut(&id).unwrap().queue.clear();
    engine.tick();
    let messages = queued_messages(&engine, id);
    let cancels: Vec<_> = messages
        .iter()
        .filter(|m| matches!(m, Message::Cancel { .. }))
        .collect();
    assert_eq!(cancels.len(), 3);
    assert!(messages.contains(&Message::Cancel {
        index: 0,
        begin: 0,
        length: 16384
    }));
    // The same blocks go straight back out.
    let repicked = messages
        .iter()
        .filter(|m| matches!(m, Message::Request { .. }))
        .count();
    assert_eq!(repicked, 3);
    assert_eq!(engine.connections[&id].pending_requests, 3);
    assert_eq!(engine.torrents[t].picker.current_request_count(), 3);
}

#[tokio::test]
async fn test_inactive_peer_is_closed_on_tick() {
    let settings = EngineSettings {
        inactivity_timeout: Duration::from_secs(5),
        ..EngineSettings::default()
    };
    let (mut engine, handle) =
        engine_with(ManagerBuilder::new(settings).connector(PendingConnector));
    let single = TorrentSettings {
        max_connections: 1,
        ..TorrentSettings::default()
    };
    let t = add(&mut engine, [1; 20], single);
    let quiet = connected(&mut engine, 1, t, Peer::new(addr(1)));
    let chatty = connected(&mut engine, 2, t, Peer::new(addr(2)));
    let Some(long_ago) = Instant::now().checked_sub(Duration::from_secs(10)) else {
        return;
    };
    engine.connections.get_mut(&quiet).unwrap().last_message_received = long_ago;
    let mut events = handle.subscribe();

    engine.tick();
    assert!(!engine.connections.contains_key(&quiet));
    assert!(engine.connections.contains_key(&chatty));
    match events.try_recv() {
        Ok(EngineEvent::PeerDisconnected { id, reason, .. }) => {
            assert_eq!(id, quiet);
            assert_eq!(reason, "timeout");
        }
        other => panic!("unexpected event {:?}", other),
    }
    // A timeout is worth another attempt later.
    assert_eq!(engine.torrents[t].peers.available.len(), 1);
    assert_eq!(engine.torrents[t].peers.available[0].addr, addr(1));
}

#[tokio::test]
async fn test_failed_negotiation_retries_without_encryption() {
    let network = LoopbackNetwork::new();
    let plain_only = EngineSettings {
        allowed_encryption: EncryptionTypes::PLAIN_TEXT,
        ..EngineSettings::default()
    };
    let seeder = ManagerBuilder::new(plain_only)
        .connector(network.connector(addr(1)))
        .spawn();
    network.register(addr(1), seeder.clone());
    let (engine, leecher) = ManagerBuilder::new(EngineSettings::default())
        .connector(network.connector(addr(2)))
        .build();
    let task = tokio::spawn(engine.run());

    let data = content();
    let info_hash = [5; 20];
    for handle in [&seeder, &leecher] {
        handle
            .add_torrent(
                info_for(info_hash, &data),
                TorrentSettings::default(),
                Arc::new(MemoryWriter::new()),
                None,
            )
            .await
            .unwrap();
    }
    let mut events = leecher.subscribe();
    leecher.add_peers(info_hash, [addr(1)]).await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, EngineEvent::PeerDisconnected { addr: a, .. } if *a == addr(1))
    })
    .await;
    leecher.shutdown().await.unwrap();
    let engine = task.await.unwrap();

    let peers = &engine.torrents[0].peers;
    assert!(peers.available.is_empty());
    assert_eq!(peers.busy.len(), 1);
    let peer = &peers.busy[0];
    assert_eq!(peer.failed_connection_attempts, 1);
    assert_eq!(peer.encryption, EncryptionTypes::PLAIN_TEXT);
    seeder.shutdown().await.unwrap();
}

#[test]
fn test_repeated_hash_failures_ban_peer() {
    let (mut engine, handle) = engine();
    let t = add(&mut engine, [1; 20], TorrentSettings::default());
    let mut peer = Peer::new(addr(1));
    peer.repeated_hash_fails = MAX_HASH_FAILS - 1;
    let id = connected(&mut engine, 1, t, peer);
    let honest = connected(&mut engine, 2, t, Peer::new(addr(2)));
    let mut events = handle.subscribe();

    engine.handle_io(IoEvent::PieceHashed {
        torrent: t,
        index: 0,
        contributors: vec![id, honest],
        result: Ok(false),
    });

    assert!(!engine.connections.contains_key(&id));
    assert_eq!(engine.connections[&honest].peer.repeated_hash_fails, 1);
    let peers = &mut engine.torrents[t].peers;
    assert!(peers.is_banned(&addr(1)));
    assert!(!peers.is_banned(&addr(2)));
    assert!(peers.available.is_empty());
    assert_eq!(peers.add_peers([Peer::new(addr(1))]), 0);

    let event = events.try_recv().unwrap();
    assert!(matches!(event, EngineEvent::PieceHashed { passed: false, .. }));
    match events.try_recv() {
        Ok(EngineEvent::PeerDisconnected { id: gone, reason, .. }) => {
            assert_eq!(gone, id);
            assert_eq!(reason, "sent too many corrupt pieces");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_verified_piece_leaves_allowed_fast_set() {
    let (mut engine, _handle) = engine();
    let t = add(&mut engine, [1; 20], TorrentSettings::default());
    let id = connected(&mut engine, 1, t, Peer::new(addr(1)));
    engine.connections.get_mut(&id).unwrap().allowed_fast = vec![0];

    engine.handle_io(IoEvent::PieceHashed {
        torrent: t,
        index: 0,
        contributors: vec![id],
        result: Ok(true),
    });

    assert!(engine.connections[&id].allowed_fast.is_empty());
    assert!(queued_messages(&engine, id).contains(&Message::Have { piece: 0 }));
    assert_eq!(engine.torrents[t].mode, Mode::Seeding);
}

#[tokio::test]
async fn test_hash_check_finds_existing_data() {
    let handle = ManagerBuilder::new(EngineSettings::default())
        .connector(PendingConnector)
        .spawn();
    let info_hash = [1; 20];
    let writer = Arc::new(MemoryWriter::new());
    writer.insert("single.dat", content());
    handle
        .add_torrent(info(info_hash), TorrentSettings::default(), writer, None)
        .await
        .unwrap();

    assert!(matches!(
        handle.hash_check(info_hash, true).await,
        Err(ManagerError::NotStopped)
    ));
    handle.stop_torrent(info_hash).await.unwrap();
    let mut events = handle.subscribe();
    handle.hash_check(info_hash, true).await.unwrap();

    assert_eq!(
        wait_for(&mut events, |e| matches!(e, EngineEvent::ModeChanged { .. })).await,
        EngineEvent::ModeChanged {
            info_hash,
            mode: Mode::Hashing
        }
    );
    assert_eq!(
        wait_for(&mut events, |e| matches!(e, EngineEvent::PieceHashed { .. })).await,
        EngineEvent::PieceHashed {
            info_hash,
            index: 0,
            passed: true
        }
    );
    wait_for(&mut events, |e| {
        matches!(e, EngineEvent::ModeChanged { mode: Mode::Seeding, .. })
    })
    .await;
    assert_eq!(handle.status(info_hash).await.unwrap().pieces_have, 1);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hash_check_without_auto_start_stops() {
    let handle = ManagerBuilder::new(EngineSettings::default())
        .connector(PendingConnector)
        .spawn();
    let info_hash = [1; 20];
    handle
        .add_torrent(
            info(info_hash),
            TorrentSettings::default(),
            Arc::new(MemoryWriter::new()),
            Some(Bitfield::full(1)),
        )
        .await
        .unwrap();
    handle.stop_torrent(info_hash).await.unwrap();
    let mut events = handle.subscribe();
    handle.hash_check(info_hash, false).await.unwrap();

    let event = wait_for(&mut events, |e| matches!(e, EngineEvent::PieceHashed { .. })).await;
    assert!(matches!(event, EngineEvent::PieceHashed { passed: false, .. }));
    wait_for(&mut events, |e| {
        matches!(e, EngineEvent::ModeChanged { mode: Mode::Stopped, .. })
    })
    .await;
    let status = handle.status(info_hash).await.unwrap();
    assert_eq!(status.mode, Mode::Stopped);
    assert_eq!(status.pieces_have, 0);
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hash_check_storage_failure_enters_error_mode() {
    let handle = ManagerBuilder::new(EngineSettings::default())
        .connector(PendingConnector)
        .spawn();
    let info_hash = [1; 20];
    handle
        .add_torrent(
            info(info_hash),
            TorrentSettings::default(),
            Arc::new(FailingWriter),
            None,
        )
        .await
        .unwrap();
    handle.stop_torrent(info_hash).await.unwrap();
    let mut events = handle.subscribe();
    handle.hash_check(info_hash, true).await.unwrap();

    wait_for(&mut events, is_error_mode).await;
    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_initial_seeding_finishes_once_every_piece_is_out() {
    let (mut engine, handle) =
        engine_with(ManagerBuilder::new(EngineSettings::default()).connector(PendingConnector));
    let settings = TorrentSettings {
        initial_seeding: true,
        ..TorrentSettings::default()
    };
    let t = engine
        .add_torrent(
            info([1; 20]),
            settings,
            Arc::new(MemoryWriter::new()),
            Some(Bitfield::full(1)),
        )
        .unwrap();
    assert_eq!(engine.torrents[t].mode, Mode::InitialSeeding);

    let leaving = connected(&mut engine, 1, t, Peer::new(addr(1)));
    engine.connections.get_mut(&leaving).unwrap().offered = vec![0];
    let staying = connected(&mut engine, 2, t, Peer::new(addr(2)));
    engine.connections.get_mut(&staying).unwrap().bitfield = Bitfield::new(1);
    let seed = engine.torrents[t].initial_seed.as_mut().unwrap();
    assert_eq!(seed.next_offer(&Bitfield::new(1), &[]), Some(0));
    engine.cleanup(leaving, "connection closed");
    assert_eq!(engine.torrents[t].initial_seed.as_ref().unwrap().revealed(0), 0);

    engine.tick();
    assert_eq!(engine.torrents[t].mode, Mode::InitialSeeding);

    engine
        .torrents[t]
        .initial_seed
        .as_mut()
        .unwrap()
        .record(&Bitfield::full(1));
    let mut events = handle.subscribe();
    engine.tick();
    assert_eq!(engine.torrents[t].mode, Mode::Seeding);
    assert!(engine.torrents[t].initial_seed.is_none());
    assert!(queued_messages(&engine, staying).contains(&Message::Have { piece: 0 }));
    let event = wait_for(&mut events, |e| matches!(e, EngineEvent::ModeChanged { .. })).await;
    assert!(matches!(event, EngineEvent::ModeChanged { mode: Mode::Seeding, .. }));
}

#[tokio::test]
async fn test_download_from_initial_seeder() {
    let source = Arc::new(MemoryWriter::new());
    source.insert("single.dat", content());
    let settings = TorrentSettings {
        initial_seeding: true,
        ..TorrentSettings::default()
    };
    let target = Arc::new(MemoryWriter::new());
    let (seeder, leecher, info_hash) = swarm(settings, source, target.clone()).await;
    assert_eq!(
        seeder.status(info_hash).await.unwrap().mode,
        Mode::InitialSeeding
    );
    let mut events = leecher.subscribe();
    leecher.add_peers(info_hash, [addr(1)]).await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, EngineEvent::ModeChanged { mode: Mode::Seeding, .. })
    })
    .await;
    assert_eq!(target.contents(Path::new("single.dat")), Some(content()));

    leecher.shutdown().await.unwrap();
    seeder.shutdown().await.unwrap();
}
