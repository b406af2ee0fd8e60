use std::net::SocketAddr;

use crate::peer::ConnectionId;
use crate::torrent::Mode;

/// Notifications broadcast to every [`subscribe`](super::ManagerHandle::subscribe) receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A handshake completed and the connection is usable.
    PeerConnected {
        info_hash: [u8; 20],
        addr: SocketAddr,
        id: ConnectionId,
    },
    /// A connection was cleaned up. Inbound connections that never got as
    /// far as naming a torrent carry no info hash.
    PeerDisconnected {
        info_hash: Option<[u8; 20]>,
        addr: SocketAddr,
        id: ConnectionId,
        reason: String,
    },
    /// An outbound attempt failed before a transport was established.
    ConnectionFailed {
        info_hash: [u8; 20],
        addr: SocketAddr,
        reason: String,
    },
    PieceHashed {
        info_hash: [u8; 20],
        index: u32,
        passed: bool,
    },
    ModeChanged {
        info_hash: [u8; 20],
        mode: Mode,
    },
}

/// A point-in-time view of one torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentStatus {
    pub info_hash: [u8; 20],
    pub mode: Mode,
    pub pieces_have: usize,
    pub piece_count: usize,
    /// Connections past the handshake.
    pub connected: usize,
    pub available_peers: usize,
    /// Blocks requested and not yet received.
    pub active_requests: usize,
    pub uploading_to: usize,
}
