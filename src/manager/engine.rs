use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::error::ManagerError;
use super::event::{EngineEvent, TorrentStatus};
use super::handle::{BanFilter, Command, ManagerBuilder};
use crate::bandwidth::RateLimiter;
use crate::bitfield::Bitfield;
use crate::connection::{
    check_negotiated, split, BoxedStream, ConnectionState, Connector, EncryptionNegotiator,
    NegotiationRole, Negotiated, Outgoing, PeerConnection, PeerError, PeerReader, PeerWriter,
};
use crate::constants::{
    ADVERTISED_REQQ, ALLOWED_FAST_SET_SIZE, BUSY_RETRY_INTERVAL, HANDSHAKE_TIMEOUT,
    MAX_CLEANUPS, MAX_FAILED_CONNECTION_ATTEMPTS, MAX_HASH_FAILS,
};
use crate::message::{
    DecodeContext, ExtendedHandshake, ExtensionMessage, ExtensionRegistry, Handshake, Message,
    HANDSHAKE_ID,
};
use crate::peer::{generate_allowed_fast_set, ConnectionId, Peer, PeerId};
use crate::picker::{PeerSnapshot, PiecePicker};
use crate::settings::{EncryptionTypes, EngineSettings, TorrentSettings};
use crate::storage::{self, PieceWriter, StorageError};
use crate::torrent::{
    handle_message, reveal_pieces, unchoke_decisions, update_interest, verify_piece, ChokeCandidate,
    HashCheck, HashJob, InitialSeed, Mode, ModeEvent, Priority, Torrent, TorrentInfo,
};

/// Completions of work running off the main task.
pub(crate) enum IoEvent {
    Connected {
        id: ConnectionId,
        result: io::Result<BoxedStream>,
    },
    Negotiated {
        id: ConnectionId,
        result: Result<(BoxedStream, Negotiated), PeerError>,
    },
    HandshakeReceived {
        id: ConnectionId,
        reader: PeerReader,
        writer: PeerWriter,
        result: Result<Handshake, PeerError>,
    },
    MessageReceived {
        id: ConnectionId,
        reader: PeerReader,
        result: Result<Message, PeerError>,
    },
    MessageSent {
        id: ConnectionId,
        writer: PeerWriter,
        result: Result<usize, PeerError>,
    },
    BlockRead {
        id: ConnectionId,
        index: u32,
        begin: u32,
        result: Result<Bytes, StorageError>,
    },
    PieceHashed {
        torrent: usize,
        index: u32,
        contributors: Vec<ConnectionId>,
        result: Result<bool, StorageError>,
    },
    PieceChecked {
        torrent: usize,
        generation: u64,
        index: u32,
        result: Result<bool, StorageError>,
    },
    CheckFinished {
        torrent: usize,
        generation: u64,
    },
}

enum Frame {
    Handshake(Handshake),
    Message(Message),
}

impl Frame {
    fn byte_len(&self) -> usize {
        match self {
            Frame::Handshake(handshake) => handshake.byte_len(),
            Frame::Message(message) => message.byte_len(),
        }
    }
}

/// Counts an outbound attempt as half-open for as long as it lives.
#[derive(Debug)]
pub(crate) struct HalfOpenGuard(Arc<AtomicUsize>);

impl HalfOpenGuard {
    pub(crate) fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for HalfOpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn handshake_for(settings: &EngineSettings, peer_id: PeerId, info_hash: [u8; 20]) -> Handshake {
    Handshake::new(info_hash, peer_id)
        .with_fast_peer(settings.supports_fast_peer)
        .with_extensions(settings.supports_extensions)
}

fn extended_handshake(settings: &EngineSettings, registry: &ExtensionRegistry) -> ExtendedHandshake {
    ExtendedHandshake {
        extensions: registry.handshake_map(),
        port: Some(settings.listen_port),
        reqq: Some(ADVERTISED_REQQ),
        client: Some(settings.client_version.clone()),
        metadata_size: None,
    }
}

/// The connection manager task.
///
/// All torrent and connection state lives here and is only touched from
/// [`Engine::run`]. Network and disk work runs on spawned tasks that own
/// what they need and report back through an [`IoEvent`].
pub(crate) struct Engine {
    pub(crate) settings: EngineSettings,
    peer_id: PeerId,
    registry: Arc<ExtensionRegistry>,
    connector: Arc<dyn Connector>,
    negotiator: Arc<dyn EncryptionNegotiator>,
    ban_filter: Option<BanFilter>,
    pub(crate) torrents: Vec<Torrent>,
    pub(crate) connections: HashMap<ConnectionId, PeerConnection>,
    next_id: u64,
    /// Round-robin position for outbound attempts.
    next_torrent: usize,
    next_check: u64,
    pub(crate) half_open: Arc<AtomicUsize>,
    events: broadcast::Sender<EngineEvent>,
    io_tx: mpsc::UnboundedSender<IoEvent>,
    io_rx: mpsc::UnboundedReceiver<IoEvent>,
    commands: mpsc::Receiver<Command>,
}

impl Engine {
    pub(crate) fn new(
        builder: ManagerBuilder,
        peer_id: PeerId,
        commands: mpsc::Receiver<Command>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let (io_tx, io_rx) = mpsc::unbounded_channel();
        Self {
            settings: builder.settings,
            peer_id,
            registry: Arc::new(builder.registry),
            connector: builder.connector,
            negotiator: builder.negotiator,
            ban_filter: builder.ban_filter,
            torrents: Vec::new(),
            connections: HashMap::new(),
            next_id: 1,
            next_torrent: 0,
            next_check: 0,
            half_open: Arc::new(AtomicUsize::new(0)),
            events,
            io_tx,
            io_rx,
            commands,
        }
    }

    /// Runs until shut down, then hands the engine back.
    pub(crate) async fn run(mut self) -> Self {
        let mut tick = interval(self.settings.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("connection manager started with peer id {}", self.peer_id);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(event) = self.io_rx.recv() => self.handle_io(event),
                _ = tick.tick() => self.tick(),
            }
        }
        info!("connection manager stopped");
        self
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn next_connection_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        id
    }

    fn is_banned(&self, peer: &Peer) -> bool {
        self.ban_filter.as_ref().is_some_and(|filter| filter(peer))
    }

    fn find_torrent(&self, info_hash: &[u8; 20]) -> Result<usize, ManagerError> {
        self.torrents
            .iter()
            .position(|t| t.info_hash() == *info_hash)
            .ok_or(ManagerError::UnknownTorrent)
    }

    fn torrent_connections(&self, torrent: usize) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.torrent == Some(torrent))
            .map(|c| c.id)
            .collect()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::AddTorrent {
                info,
                settings,
                writer,
                have,
                reply,
            } => {
                let result = self.add_torrent(info, settings, writer, have).map(|_| ());
                let _ = reply.send(result);
            }
            Command::AddPeers {
                info_hash,
                peers,
                reply,
            } => {
                let result = self.find_torrent(&info_hash).map(|t| {
                    self.torrents[t]
                        .peers
                        .add_peers(peers.into_iter().map(Peer::new))
                });
                let _ = reply.send(result);
            }
            Command::Accept { stream, addr } => self.accept(stream, addr),
            Command::SetFilePriority {
                info_hash,
                file,
                priority,
                reply,
            } => {
                let _ = reply.send(self.set_file_priority(&info_hash, file, priority));
            }
            Command::StartTorrent { info_hash, reply } => {
                let _ = reply.send(self.start_torrent(&info_hash));
            }
            Command::StopTorrent { info_hash, reply } => {
                let _ = reply.send(self.stop_torrent(&info_hash));
            }
            Command::HashCheck {
                info_hash,
                auto_start,
                reply,
            } => {
                let _ = reply.send(self.hash_check(&info_hash, auto_start));
            }
            Command::Status { info_hash, reply } => {
                let _ = reply.send(self.status(&info_hash));
            }
            Command::Shutdown { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
        self.try_connect();
    }

    pub(crate) fn add_torrent(
        &mut self,
        info: TorrentInfo,
        settings: TorrentSettings,
        writer: Arc<dyn PieceWriter>,
        have: Option<Bitfield>,
    ) -> Result<usize, ManagerError> {
        if !info.is_consistent() {
            return Err(ManagerError::InvalidTorrent(
                "piece hashes do not cover the content".to_string(),
            ));
        }
        if have.as_ref().is_some_and(|bits| bits.len() != info.piece_count()) {
            return Err(ManagerError::InvalidTorrent(
                "bitfield length does not match the piece count".to_string(),
            ));
        }
        if self.find_torrent(&info.info_hash).is_ok() {
            return Err(ManagerError::DuplicateTorrent);
        }

        let mut torrent = Torrent::new(info, settings, writer, have, self.settings.request_timeout);
        let start = torrent.start_event();
        torrent.transition(start);
        info!(
            "added torrent {} ({} of {} pieces), {}",
            torrent.info.name,
            torrent.bitfield.true_count(),
            torrent.piece_count(),
            torrent.mode
        );
        self.emit(EngineEvent::ModeChanged {
            info_hash: torrent.info_hash(),
            mode: torrent.mode.clone(),
        });
        self.torrents.push(torrent);
        Ok(self.torrents.len() - 1)
    }

    fn set_file_priority(
        &mut self,
        info_hash: &[u8; 20],
        file: usize,
        priority: Priority,
    ) -> Result<(), ManagerError> {
        let t = self.find_torrent(info_hash)?;
        let torrent = &mut self.torrents[t];
        if !torrent.picker.set_priority(file, priority) {
            return Err(ManagerError::InvalidFile(file));
        }
        for conn in self
            .connections
            .values_mut()
            .filter(|c| c.torrent == Some(t) && c.is_connected())
        {
            update_interest(torrent, conn);
        }
        self.pump_torrent(t);
        Ok(())
    }

    fn start_torrent(&mut self, info_hash: &[u8; 20]) -> Result<(), ManagerError> {
        let t = self.find_torrent(info_hash)?;
        let torrent = &mut self.torrents[t];
        if let Some(check) = torrent.check.as_mut() {
            check.auto_start = true;
            return Ok(());
        }
        let start = torrent.start_event();
        if torrent.transition(start) {
            let mode = torrent.mode.clone();
            let info_hash = torrent.info_hash();
            self.emit(EngineEvent::ModeChanged { info_hash, mode });
        }
        Ok(())
    }

    fn stop_torrent(&mut self, info_hash: &[u8; 20]) -> Result<(), ManagerError> {
        let t = self.find_torrent(info_hash)?;
        let torrent = &mut self.torrents[t];
        if let Some(check) = torrent.check.take() {
            check.cancel.store(true, Ordering::Release);
        }
        if !torrent.transition(ModeEvent::Stop) {
            return Ok(());
        }
        torrent.reset_transfers();
        let mode = torrent.mode.clone();
        self.emit(EngineEvent::ModeChanged {
            info_hash: *info_hash,
            mode,
        });
        for id in self.torrent_connections(t) {
            self.cleanup(id, "torrent stopped");
        }
        Ok(())
    }

    /// Starts a background check of every piece on storage.
    fn hash_check(&mut self, info_hash: &[u8; 20], auto_start: bool) -> Result<(), ManagerError> {
        let t = self.find_torrent(info_hash)?;
        let torrent = &mut self.torrents[t];
        if torrent.mode != Mode::Stopped {
            return Err(ManagerError::NotStopped);
        }

        let generation = self.next_check;
        self.next_check += 1;
        let cancel = Arc::new(AtomicBool::new(false));
        torrent.transition(ModeEvent::Check);
        torrent.reset_transfers();
        torrent.bitfield.set_all(false);
        torrent.check = Some(HashCheck {
            generation,
            cancel: Arc::clone(&cancel),
            auto_start,
        });
        info!(
            "checking {} pieces of {}",
            torrent.piece_count(),
            torrent.info.name
        );

        let info = Arc::clone(&torrent.info);
        let writer = Arc::clone(&torrent.writer);
        let tx = self.io_tx.clone();
        tokio::task::spawn_blocking(move || {
            for index in 0..info.piece_count() as u32 {
                if cancel.load(Ordering::Acquire) {
                    return;
                }
                let result = verify_piece(&info, writer.as_ref(), index);
                let failed = result.is_err();
                let _ = tx.send(IoEvent::PieceChecked {
                    torrent: t,
                    generation,
                    index,
                    result,
                });
                if failed {
                    return;
                }
            }
            let _ = tx.send(IoEvent::CheckFinished {
                torrent: t,
                generation,
            });
        });

        self.emit(EngineEvent::ModeChanged {
            info_hash: *info_hash,
            mode: Mode::Hashing,
        });
        Ok(())
    }

    fn status(&self, info_hash: &[u8; 20]) -> Result<TorrentStatus, ManagerError> {
        let torrent = &self.torrents[self.find_torrent(info_hash)?];
        Ok(TorrentStatus {
            info_hash: *info_hash,
            mode: torrent.mode.clone(),
            pieces_have: torrent.bitfield.true_count(),
            piece_count: torrent.piece_count(),
            connected: torrent.peers.connected.len(),
            available_peers: torrent.peers.available.len(),
            active_requests: torrent.picker.current_request_count(),
            uploading_to: torrent.uploading_to,
        })
    }

    fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        debug!("shutting down {} connections", ids.len());
        for id in ids {
            self.close(id, "engine shutting down");
        }
    }

    // ------------------------------------------------------------------
    // Outbound connections
    // ------------------------------------------------------------------

    fn can_open_connection(&self) -> bool {
        self.connections.len() < self.settings.max_connections
            && self.half_open.load(Ordering::Acquire) < self.settings.max_half_open_connections
    }

    /// Starts outbound attempts while under the global caps, one torrent at
    /// a time, resuming after the torrent served last.
    pub(crate) fn try_connect(&mut self) {
        let count = self.torrents.len();
        if count == 0 {
            return;
        }

        loop {
            let mut progressed = false;
            for _ in 0..count {
                if !self.can_open_connection() {
                    return;
                }
                let index = self.next_torrent % count;
                self.next_torrent = (index + 1) % count;
                progressed |= self.connect_one(index);
            }
            if !progressed {
                return;
            }
        }
    }

    fn connect_one(&mut self, index: usize) -> bool {
        let allowed = self.settings.allowed_encryption;
        let ban_filter = self.ban_filter.as_ref();
        let torrent = &mut self.torrents[index];
        if !torrent.mode.can_accept_connections()
            || torrent.open_connections() >= torrent.settings.max_connections
        {
            return false;
        }

        if let Some(filter) = ban_filter {
            let rejected: Vec<IpAddr> = torrent
                .peers
                .available
                .iter()
                .filter(|peer| filter(peer))
                .map(|peer| peer.addr.ip())
                .collect();
            for ip in rejected {
                debug!(%ip, "peer rejected by ban filter");
                torrent.peers.ban(ip);
            }
        }

        let mode = &torrent.mode;
        let Some(mut peer) = torrent.peers.take_candidate(|peer| {
            mode.should_connect(peer) && !(peer.encryption & allowed).is_empty()
        }) else {
            return false;
        };

        let addr = peer.addr;
        peer.last_connection_attempt = Some(Instant::now());
        torrent.peers.connecting.push(addr);

        let id = self.next_connection_id();
        let guard = HalfOpenGuard::new(&self.half_open);
        let connect = self.connector.connect(addr);
        let tx = self.io_tx.clone();
        let task = tokio::spawn(async move {
            let result = connect.await;
            drop(guard);
            let _ = tx.send(IoEvent::Connected { id, result });
        });

        let mut conn = PeerConnection::outgoing(id, index, peer);
        conn.track_task(task.abort_handle());
        self.connections.insert(id, conn);
        debug!(%id, %addr, "connecting");
        true
    }

    fn connect_failed(&mut self, id: ConnectionId, error: PeerError) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        conn.abort_tasks();
        conn.peer.failed_connection_attempts += 1;
        let addr = conn.peer.addr;
        debug!(%id, %addr, %error, "connection attempt failed");

        let Some(torrent) = conn.torrent.and_then(|t| self.torrents.get_mut(t)) else {
            return;
        };
        torrent.peers.remove_connecting(&addr);
        torrent.peers.busy.push(conn.peer);
        let info_hash = torrent.info_hash();
        self.emit(EngineEvent::ConnectionFailed {
            info_hash,
            addr,
            reason: error.to_string(),
        });
    }

    fn accept(&mut self, stream: BoxedStream, addr: SocketAddr) {
        if self.connections.len() >= self.settings.max_connections {
            debug!(%addr, "rejecting inbound connection: too many connections");
            return;
        }
        let peer = Peer::new(addr);
        if self.is_banned(&peer) {
            debug!(%addr, "rejecting inbound connection from banned peer");
            return;
        }

        let id = self.next_connection_id();
        self.connections
            .insert(id, PeerConnection::incoming(id, peer));
        debug!(%id, %addr, "accepted inbound connection");
        self.spawn_negotiation(id, stream);
    }

    // ------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------

    pub(crate) fn handle_io(&mut self, event: IoEvent) {
        match event {
            IoEvent::Connected { id, result } => self.on_connected(id, result),
            IoEvent::Negotiated { id, result } => self.on_negotiated(id, result),
            IoEvent::HandshakeReceived {
                id,
                reader,
                writer,
                result,
            } => self.on_handshake(id, reader, writer, result),
            IoEvent::MessageReceived { id, reader, result } => self.on_message(id, reader, result),
            IoEvent::MessageSent { id, writer, result } => self.on_sent(id, writer, result),
            IoEvent::BlockRead {
                id,
                index,
                begin,
                result,
            } => self.on_block_read(id, index, begin, result),
            IoEvent::PieceHashed {
                torrent,
                index,
                contributors,
                result,
            } => self.on_piece_hashed(torrent, index, contributors, result),
            IoEvent::PieceChecked {
                torrent,
                generation,
                index,
                result,
            } => self.on_piece_checked(torrent, generation, index, result),
            IoEvent::CheckFinished {
                torrent,
                generation,
            } => self.on_check_finished(torrent, generation),
        }
        self.try_connect();
    }

    fn on_connected(&mut self, id: ConnectionId, result: io::Result<BoxedStream>) {
        let stream = match result {
            Ok(stream) => stream,
            Err(error) => {
                self.connect_failed(id, error.into());
                return;
            }
        };

        let total = self.connections.len();
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let Some(torrent) = conn.torrent.and_then(|t| self.torrents.get_mut(t)) else {
            return;
        };
        let addr = conn.peer.addr;
        torrent.peers.remove_connecting(&addr);

        // Inbound connections may have used up the room meanwhile.
        if total > self.settings.max_connections
            || torrent.peers.active.len() >= torrent.settings.max_connections
        {
            self.fail(id, PeerError::TooManyConnections);
            return;
        }
        torrent.peers.active.push(addr);
        debug!(%id, %addr, "transport connected");
        self.spawn_negotiation(id, stream);
    }

    fn spawn_negotiation(&mut self, id: ConnectionId, stream: BoxedStream) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.state = ConnectionState::EncryptionNegotiation;

        let allowed = self.settings.allowed_encryption & conn.peer.encryption;
        let role = if conn.is_incoming {
            NegotiationRole::Incoming {
                info_hashes: self
                    .torrents
                    .iter()
                    .filter(|t| t.mode.can_accept_connections())
                    .map(Torrent::info_hash)
                    .collect(),
            }
        } else {
            let Some(torrent) = conn.torrent.and_then(|t| self.torrents.get(t)) else {
                return;
            };
            NegotiationRole::Outgoing {
                info_hash: torrent.info_hash(),
            }
        };
        let negotiator = Arc::clone(&self.negotiator);
        let tx = self.io_tx.clone();
        let task = tokio::spawn(async move {
            let result = timeout(HANDSHAKE_TIMEOUT, negotiator.negotiate(stream, role, allowed))
            .await
            .unwrap_or_else(|_| Err(PeerError::Timeout));
            let _ = tx.send(IoEvent::Negotiated { id, result });
        });
        conn.track_task(task.abort_handle());
    }

    fn on_negotiated(
        &mut self,
        id: ConnectionId,
        result: Result<(BoxedStream, Negotiated), PeerError>,
    ) {
        let (stream, negotiated) = match result {
            Ok(negotiated) => negotiated,
            Err(error) => {
                // Retry in plain text next time.
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.peer
                        .encryption
                        .remove(EncryptionTypes::RC4_FULL | EncryptionTypes::RC4_HEADER);
                }
                self.fail(id, error);
                return;
            }
        };

        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if let Err(error) = check_negotiated(
            self.settings.allowed_encryption,
            &mut conn.peer.encryption,
            negotiated.kind,
        ) {
            self.fail(id, error);
            return;
        }
        conn.encryption = negotiated.kind;

        // Outbound connections speak first; inbound ones wait to learn the
        // torrent from the remote handshake.
        let ours = if conn.is_incoming {
            None
        } else {
            let Some(torrent) = conn.torrent.and_then(|t| self.torrents.get(t)) else {
                return;
            };
            conn.state = ConnectionState::HandshakeSent;
            Some(handshake_for(&self.settings, self.peer_id, torrent.info_hash()))
        };

        let (mut reader, mut writer) = split(stream, negotiated);
        let tx = self.io_tx.clone();
        let task = tokio::spawn(async move {
            let exchange = async {
                if let Some(handshake) = &ours {
                    writer.write_handshake(handshake).await?;
                }
                reader.read_handshake().await
            };
            let result = timeout(HANDSHAKE_TIMEOUT, exchange)
                .await
                .unwrap_or_else(|_| Err(PeerError::Timeout));
            let _ = tx.send(IoEvent::HandshakeReceived {
                id,
                reader,
                writer,
                result,
            });
        });
        conn.track_task(task.abort_handle());
    }

    fn on_handshake(
        &mut self,
        id: ConnectionId,
        reader: PeerReader,
        writer: PeerWriter,
        result: Result<Handshake, PeerError>,
    ) {
        let handshake = match result {
            Ok(handshake) => handshake,
            Err(error) => {
                self.fail(id, error);
                return;
            }
        };
        match self.validate_handshake(id, &handshake) {
            Ok(index) => self.peer_connected(id, index, handshake, reader, writer),
            Err(error) => self.fail(id, error),
        }
    }

    /// Checks a remote handshake and returns the torrent it is for.
    fn validate_handshake(&self, id: ConnectionId, handshake: &Handshake) -> Result<usize, PeerError> {
        let Some(conn) = self.connections.get(&id) else {
            return Err(PeerError::ConnectionClosed);
        };
        if handshake.peer_id == self.peer_id {
            return Err(PeerError::SelfConnection);
        }

        let index = match conn.torrent {
            Some(index) => {
                if self.torrents[index].info_hash() != handshake.info_hash {
                    return Err(PeerError::InfoHashMismatch);
                }
                index
            }
            None => self
                .torrents
                .iter()
                .position(|t| {
                    t.info_hash() == handshake.info_hash && t.mode.can_accept_connections()
                })
                .ok_or(PeerError::UnknownTorrent)?,
        };

        let torrent = &self.torrents[index];
        if torrent.peers.is_banned(&conn.peer.addr) {
            return Err(PeerError::Banned);
        }
        if conn.is_incoming && torrent.peers.active.len() >= torrent.settings.max_connections {
            return Err(PeerError::TooManyConnections);
        }
        let duplicate = self.connections.values().any(|other| {
            other.id != id
                && other.torrent == Some(index)
                && other.is_connected()
                && other.peer.peer_id == Some(handshake.peer_id)
        });
        if duplicate {
            return Err(PeerError::Protocol("already connected to this peer".to_string()));
        }
        Ok(index)
    }

    fn peer_connected(
        &mut self,
        id: ConnectionId,
        index: usize,
        handshake: Handshake,
        reader: PeerReader,
        writer: PeerWriter,
    ) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let torrent = &mut self.torrents[index];
        let addr = conn.peer.addr;

        conn.torrent = Some(index);
        conn.reader = Some(reader);
        conn.writer = Some(writer);
        conn.state = ConnectionState::HandshakeReceived;
        conn.peer.peer_id = Some(handshake.peer_id);
        conn.peer.failed_connection_attempts = 0;
        conn.supports_fast_peer = self.settings.supports_fast_peer && handshake.supports_fast_peer();
        conn.supports_extensions =
            self.settings.supports_extensions && handshake.supports_extensions();
        conn.bitfield = Bitfield::new(torrent.piece_count());
        conn.last_message_received = Instant::now();

        if conn.is_incoming {
            torrent.peers.active.push(addr);
            conn.enqueue_front(Outgoing::Handshake(handshake_for(
                &self.settings,
                self.peer_id,
                torrent.info_hash(),
            )));
        }
        torrent.peers.connected.push(id);

        // Availability must be the first message after the handshake.
        let initial_seeding = torrent.mode == Mode::InitialSeeding;
        if initial_seeding {
            // Pieces are revealed one at a time instead.
            if conn.supports_fast_peer {
                conn.enqueue(Message::HaveNone);
            }
        } else if conn.supports_fast_peer {
            conn.enqueue(if torrent.is_complete() {
                Message::HaveAll
            } else if torrent.bitfield.all_false() {
                Message::HaveNone
            } else {
                Message::Bitfield(torrent.bitfield.clone())
            });
        } else if !torrent.bitfield.all_false() {
            conn.enqueue(Message::Bitfield(torrent.bitfield.clone()));
        }

        if conn.supports_extensions {
            conn.enqueue(Message::Extended {
                id: HANDSHAKE_ID,
                message: ExtensionMessage::Handshake(extended_handshake(
                    &self.settings,
                    &self.registry,
                )),
            });
        }

        if initial_seeding {
            reveal_pieces(torrent, conn);
        } else if conn.supports_fast_peer && !torrent.bitfield.all_false() {
            let allowed = generate_allowed_fast_set(
                &torrent.info_hash(),
                addr.ip(),
                torrent.piece_count() as u32,
                ALLOWED_FAST_SET_SIZE,
            );
            for piece in allowed {
                if torrent.bitfield.get(piece as usize) {
                    conn.am_allowed_fast.push(piece);
                    conn.enqueue(Message::AllowedFast { piece });
                }
            }
        }

        debug!(
            %id,
            %addr,
            fast = conn.supports_fast_peer,
            extensions = conn.supports_extensions,
            "peer connected"
        );
        let info_hash = torrent.info_hash();
        self.emit(EngineEvent::PeerConnected {
            info_hash,
            addr,
            id,
        });
        self.spawn_receive(id);
        self.send_next(id);
    }

    /// Marks errors that make a peer not worth retrying, then cleans up.
    fn fail(&mut self, id: ConnectionId, error: PeerError) {
        if let Some(conn) = self.connections.get_mut(&id) {
            if !error.is_transient() {
                conn.can_reconnect = false;
            }
        }
        self.cleanup(id, &error.to_string());
    }

    /// Cleans up without ever requeueing the peer.
    fn close(&mut self, id: ConnectionId, reason: &str) {
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.can_reconnect = false;
        }
        self.cleanup(id, reason);
    }

    /// Tears a connection down. A connection that is already gone is left
    /// alone, so repeated calls are harmless.
    ///
    /// A reconnectable outbound peer goes back to the available list if it
    /// got past the handshake, or to the busy list to be retried later if it
    /// did not.
    pub(crate) fn cleanup(&mut self, id: ConnectionId, reason: &str) {
        let Some(mut conn) = self.connections.remove(&id) else {
            return;
        };
        let was_connected = conn.is_connected();
        conn.state = ConnectionState::Cleanup;
        conn.abort_tasks();

        let addr = conn.peer.addr;
        debug!(%id, %addr, reason, "connection cleaned up");

        let info_hash = match conn.torrent.and_then(|t| self.torrents.get_mut(t)) {
            Some(torrent) => {
                torrent.picker.cancel_requests(id);
                torrent.peers.remove_connecting(&addr);
                torrent.peers.remove_active(&addr);
                torrent.peers.remove_connected(id);
                if !conn.am_choking {
                    torrent.uploading_to = torrent.uploading_to.saturating_sub(1);
                }
                if let Some(seed) = torrent.initial_seed.as_mut() {
                    seed.release(&conn.offered);
                }

                if !conn.is_incoming && conn.can_reconnect && !torrent.peers.is_banned(&addr) {
                    let mut peer = conn.peer;
                    if was_connected {
                        peer.cleaned_up_count += 1;
                        if peer.cleaned_up_count < MAX_CLEANUPS {
                            torrent.peers.requeue(peer);
                        }
                    } else {
                        peer.failed_connection_attempts += 1;
                        torrent.peers.busy.push(peer);
                    }
                }
                Some(torrent.info_hash())
            }
            None => None,
        };

        self.emit(EngineEvent::PeerDisconnected {
            info_hash,
            addr,
            id,
            reason: reason.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Steady state
    // ------------------------------------------------------------------

    fn spawn_receive(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let Some(torrent) = conn.torrent.and_then(|t| self.torrents.get(t)) else {
            return;
        };
        let Some(mut reader) = conn.reader.take() else {
            return;
        };

        let piece_count = torrent.piece_count();
        let download = Arc::clone(&torrent.limits.download);
        let registry = Arc::clone(&self.registry);
        let tx = self.io_tx.clone();
        let task = tokio::spawn(async move {
            let ctx = DecodeContext::new(Some(piece_count), &registry);
            let result = reader.read_message(&ctx).await;
            if let Ok(Message::Piece { data, .. }) = &result {
                download.wait(data.len()).await;
            }
            let _ = tx.send(IoEvent::MessageReceived { id, reader, result });
        });
        conn.track_task(task.abort_handle());
    }

    fn on_message(
        &mut self,
        id: ConnectionId,
        reader: PeerReader,
        result: Result<Message, PeerError>,
    ) {
        let message = match result {
            Ok(message) => message,
            Err(error) => {
                self.fail(id, error);
                return;
            }
        };

        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.reader = Some(reader);
        conn.last_message_received = Instant::now();
        let Some(index) = conn.torrent else {
            return;
        };
        trace!(%id, kind = ?message.id(), "message received");

        match handle_message(&mut self.torrents[index], conn, message) {
            Ok(Some(job)) => self.spawn_hash(index, job),
            Ok(None) => {}
            Err(error) => {
                self.fail(id, error);
                return;
            }
        }

        self.request_pieces(id);
        self.spawn_receive(id);
        self.send_next(id);
    }

    /// Fills the peer's request pipeline from the picker.
    fn request_pieces(&mut self, id: ConnectionId) {
        let Some(index) = self.connections.get(&id).and_then(|c| c.torrent) else {
            return;
        };
        let others: Vec<PeerSnapshot> = self
            .connections
            .values()
            .filter(|c| c.id != id && c.torrent == Some(index) && c.is_connected())
            .map(PeerConnection::snapshot)
            .collect();

        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let torrent = &mut self.torrents[index];
        if !torrent.mode.is_downloading() || !conn.can_request() {
            return;
        }

        let available = torrent.wanted_from(&conn.bitfield);
        let end = torrent.piece_count();
        loop {
            let capacity = conn.request_capacity();
            if capacity == 0 {
                break;
            }
            let requests = torrent.picker.pick_piece(
                &mut conn.picker_peer(),
                &available,
                &others,
                capacity,
                0,
                end,
            );
            if requests.is_empty() {
                break;
            }
            for request in requests {
                conn.pending_requests += 1;
                conn.enqueue(request.into());
            }
        }
    }

    /// Starts the next queued write unless one is already in flight.
    fn send_next(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        if conn.is_sending || conn.writer.is_none() {
            return;
        }
        let Some(item) = conn.queue.pop_front() else {
            return;
        };

        let frame = match item {
            Outgoing::Handshake(handshake) => Frame::Handshake(handshake),
            Outgoing::Message(message) => Frame::Message(message),
            Outgoing::PieceReply {
                index,
                begin,
                length,
            } => {
                let Some(torrent) = conn.torrent.and_then(|t| self.torrents.get(t)) else {
                    return;
                };
                // The block is read off the main task; the send slot stays
                // taken until it is written.
                conn.is_sending = true;
                let info = Arc::clone(&torrent.info);
                let writer = Arc::clone(&torrent.writer);
                let tx = self.io_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let mut data = vec![0u8; length as usize];
                    let offset = info.piece_offset(index) + u64::from(begin);
                    let result = storage::read_block(writer.as_ref(), &info.files, offset, &mut data)
                        .map(|()| Bytes::from(data));
                    let _ = tx.send(IoEvent::BlockRead {
                        id,
                        index,
                        begin,
                        result,
                    });
                });
                return;
            }
        };
        self.spawn_write(id, frame, None);
    }

    fn spawn_write(&mut self, id: ConnectionId, frame: Frame, limiter: Option<Arc<RateLimiter>>) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        let Some(mut writer) = conn.writer.take() else {
            return;
        };
        conn.is_sending = true;

        let tx = self.io_tx.clone();
        let task = tokio::spawn(async move {
            if let Some(limiter) = limiter {
                limiter.wait(frame.byte_len()).await;
            }
            let result = match &frame {
                Frame::Handshake(handshake) => writer
                    .write_handshake(handshake)
                    .await
                    .map(|()| handshake.byte_len()),
                Frame::Message(message) => writer.write_message(message).await,
            };
            let _ = tx.send(IoEvent::MessageSent { id, writer, result });
        });
        conn.track_task(task.abort_handle());
    }

    fn on_sent(&mut self, id: ConnectionId, writer: PeerWriter, result: Result<usize, PeerError>) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.is_sending = false;
        match result {
            Ok(_) => {
                conn.writer = Some(writer);
                conn.last_message_sent = Instant::now();
            }
            Err(error) => {
                self.fail(id, error);
                return;
            }
        }
        self.send_next(id);
    }

    fn on_block_read(
        &mut self,
        id: ConnectionId,
        index: u32,
        begin: u32,
        result: Result<Bytes, StorageError>,
    ) {
        let data = match result {
            Ok(data) => data,
            Err(error) => {
                if let Some(t) = self.connections.get(&id).and_then(|c| c.torrent) {
                    self.fail_torrent(t, error);
                }
                return;
            }
        };

        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.is_sending = false;
        let Some(torrent) = conn.torrent.and_then(|t| self.torrents.get(t)) else {
            return;
        };
        if conn.am_choking && !conn.am_allowed_fast.contains(&index) {
            trace!(%id, index, begin, "peer choked while its block was read");
            self.send_next(id);
            return;
        }

        conn.bytes_uploaded += data.len() as u64;
        let upload = Arc::clone(&torrent.limits.upload);
        self.spawn_write(
            id,
            Frame::Message(Message::Piece { index, begin, data }),
            Some(upload),
        );
    }

    // ------------------------------------------------------------------
    // Pieces
    // ------------------------------------------------------------------

    fn spawn_hash(&mut self, torrent: usize, job: HashJob) {
        let index = job.index;
        let contributors = job.contributors.clone();
        let tx = self.io_tx.clone();
        tokio::task::spawn_blocking(move || {
            let result = job.run();
            let _ = tx.send(IoEvent::PieceHashed {
                torrent,
                index,
                contributors,
                result,
            });
        });
    }

    fn on_piece_hashed(
        &mut self,
        t: usize,
        index: u32,
        contributors: Vec<ConnectionId>,
        result: Result<bool, StorageError>,
    ) {
        let passed = match result {
            Ok(passed) => passed,
            Err(error) => {
                self.fail_torrent(t, error);
                return;
            }
        };
        let Some(torrent) = self.torrents.get_mut(t) else {
            return;
        };
        torrent.piece_hashed(index, passed);
        let mut banned = Vec::new();
        for id in &contributors {
            let Some(conn) = self.connections.get_mut(id) else {
                continue;
            };
            conn.peer.hashed_piece(passed);
            if conn.peer.repeated_hash_fails >= MAX_HASH_FAILS {
                let ip = conn.peer.addr.ip();
                warn!(%id, %ip, "banning peer after repeated hash failures");
                torrent.peers.ban(ip);
                banned.push(*id);
            }
        }

        let info_hash = torrent.info_hash();
        if passed {
            trace!(index, "piece passed hash check");
        } else {
            debug!(index, ?contributors, "piece failed hash check");
        }
        self.emit(EngineEvent::PieceHashed {
            info_hash,
            index,
            passed,
        });
        for id in banned {
            self.close(id, "sent too many corrupt pieces");
        }
        if !passed {
            return;
        }

        let Some(torrent) = self.torrents.get_mut(t) else {
            return;
        };
        let completed = torrent.is_complete() && torrent.transition(ModeEvent::Completed);
        if completed {
            info!("torrent {} complete", torrent.info.name);
            let _ = self.events.send(EngineEvent::ModeChanged {
                info_hash,
                mode: torrent.mode.clone(),
            });
        }

        let mut seeders = Vec::new();
        for conn in self
            .connections
            .values_mut()
            .filter(|c| c.torrent == Some(t) && c.is_connected())
        {
            conn.allowed_fast.retain(|&piece| piece != index);
            conn.enqueue(Message::Have { piece: index });
            update_interest(torrent, conn);
            if completed && conn.peer.is_seeder {
                seeders.push(conn.id);
            }
        }
        for id in seeders {
            self.close(id, "both sides are seeding");
        }
        self.pump_torrent(t);
    }

    fn on_piece_checked(
        &mut self,
        t: usize,
        generation: u64,
        index: u32,
        result: Result<bool, StorageError>,
    ) {
        let Some(torrent) = self.torrents.get_mut(t) else {
            return;
        };
        if torrent.check.as_ref().map(|check| check.generation) != Some(generation) {
            return;
        }
        let passed = match result {
            Ok(passed) => passed,
            Err(error) => {
                torrent.check = None;
                self.fail_torrent(t, error);
                return;
            }
        };
        torrent.bitfield.set(index as usize, passed);
        let info_hash = torrent.info_hash();
        self.emit(EngineEvent::PieceHashed {
            info_hash,
            index,
            passed,
        });
    }

    fn on_check_finished(&mut self, t: usize, generation: u64) {
        let Some(torrent) = self.torrents.get_mut(t) else {
            return;
        };
        if torrent.check.as_ref().map(|check| check.generation) != Some(generation) {
            return;
        }
        let Some(check) = torrent.check.take() else {
            return;
        };

        torrent.reset_picker();
        info!(
            "checked {}: {} of {} pieces present",
            torrent.info.name,
            torrent.bitfield.true_count(),
            torrent.piece_count()
        );
        let next = if check.auto_start {
            torrent.start_event()
        } else {
            ModeEvent::Stop
        };
        if torrent.transition(next) {
            let info_hash = torrent.info_hash();
            let mode = torrent.mode.clone();
            self.emit(EngineEvent::ModeChanged { info_hash, mode });
        }
    }

    /// Every piece has reached some peer, so the rest of our bitfield is
    /// announced and the torrent seeds normally.
    fn finish_initial_seeding(&mut self, t: usize) {
        let Some(torrent) = self.torrents.get_mut(t) else {
            return;
        };
        if !torrent.transition(ModeEvent::Completed) {
            return;
        }
        info!("initial seeding of {} finished", torrent.info.name);
        for conn in self
            .connections
            .values_mut()
            .filter(|c| c.torrent == Some(t) && c.is_connected())
        {
            let offered = std::mem::take(&mut conn.offered);
            for piece in 0..torrent.piece_count() as u32 {
                if !conn.bitfield.get(piece as usize) && !offered.contains(&piece) {
                    conn.enqueue(Message::Have { piece });
                }
            }
        }
        let info_hash = torrent.info_hash();
        let mode = torrent.mode.clone();
        self.emit(EngineEvent::ModeChanged { info_hash, mode });
    }

    /// Moves a torrent into the error mode after a storage failure and drops
    /// its connections.
    fn fail_torrent(&mut self, t: usize, error: StorageError) {
        let Some(torrent) = self.torrents.get_mut(t) else {
            return;
        };
        warn!("storage failure in torrent {}: {}", torrent.info.name, error);
        if let Some(check) = torrent.check.take() {
            check.cancel.store(true, Ordering::Release);
        }
        let changed = torrent.transition(ModeEvent::Failed(error.to_string()));
        torrent.reset_transfers();
        if changed {
            let info_hash = torrent.info_hash();
            let mode = torrent.mode.clone();
            self.emit(EngineEvent::ModeChanged { info_hash, mode });
        }
        for id in self.torrent_connections(t) {
            self.close(id, "torrent entered error mode");
        }
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    fn pump_torrent(&mut self, t: usize) {
        for id in self.torrent_connections(t) {
            self.request_pieces(id);
            self.send_next(id);
        }
    }

    fn run_choker(&mut self, t: usize) {
        let Some(torrent) = self.torrents.get_mut(t) else {
            return;
        };
        if !torrent.mode.can_accept_connections() {
            return;
        }

        let candidates: Vec<ChokeCandidate> = self
            .connections
            .values()
            .filter(|c| c.torrent == Some(t) && c.is_connected())
            .map(|c| ChokeCandidate {
                id: c.id,
                interested: c.is_interested,
                am_choking: c.am_choking,
                downloaded: c.bytes_downloaded,
                uploaded: c.bytes_uploaded,
            })
            .collect();
        let seeding = torrent.mode.is_seeding();

        for (id, unchoke) in unchoke_decisions(&candidates, torrent.settings.upload_slots, seeding) {
            let Some(conn) = self.connections.get_mut(&id) else {
                continue;
            };
            conn.am_choking = !unchoke;
            if unchoke {
                torrent.uploading_to += 1;
                conn.enqueue(Message::Unchoke);
                continue;
            }

            torrent.uploading_to = torrent.uploading_to.saturating_sub(1);
            conn.enqueue(Message::Choke);
            for (index, begin, length) in conn.clear_queued_replies() {
                if conn.supports_fast_peer {
                    conn.enqueue(Message::Reject {
                        index,
                        begin,
                        length,
                    });
                }
            }
        }
    }

    pub(crate) fn tick(&mut self) {
        let now = Instant::now();

        for t in 0..self.torrents.len() {
            let torrent = &mut self.torrents[t];
            for block in torrent.picker.cancel_timed_out_requests(now) {
                let Some(conn) = block
                    .requested_by()
                    .and_then(|by| self.connections.get_mut(&by))
                else {
                    continue;
                };
                trace!(id = %conn.id, index = block.piece_index(), "request timed out");
                conn.pending_requests = conn.pending_requests.saturating_sub(1);
                conn.enqueue(Message::Cancel {
                    index: block.piece_index(),
                    begin: block.start_offset(),
                    length: block.requested_length(),
                });
            }
            torrent
                .peers
                .retry_busy(now, BUSY_RETRY_INTERVAL, MAX_FAILED_CONNECTION_ATTEMPTS);
            if torrent
                .initial_seed
                .as_ref()
                .is_some_and(InitialSeed::is_complete)
            {
                self.finish_initial_seeding(t);
            }
            self.run_choker(t);
        }

        let mut idle = Vec::new();
        for conn in self.connections.values_mut().filter(|c| c.is_connected()) {
            if now.duration_since(conn.last_message_received) >= self.settings.inactivity_timeout {
                idle.push(conn.id);
            } else if now.duration_since(conn.last_message_sent) >= self.settings.keepalive_interval
                && conn.queue.is_empty()
            {
                conn.enqueue(Message::KeepAlive);
            }
        }
        for id in idle {
            self.fail(id, PeerError::Timeout);
        }

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.request_pieces(id);
            self.send_next(id);
        }
        self.try_connect();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("peer_id", &self.peer_id)
            .field("torrents", &self.torrents.len())
            .field("connections", &self.connections.len())
            .field("half_open", &self.half_open.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
