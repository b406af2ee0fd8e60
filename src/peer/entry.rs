use std::net::SocketAddr;
use std::time::Instant;

use super::compact;
use super::peer_id::PeerId;
use crate::settings::EncryptionTypes;

/// A swarm member we know about, connected or not.
///
/// The identity survives reconnects; per-connection state lives in
/// [`PeerConnection`](crate::connection::PeerConnection) instead.
#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: SocketAddr,
    /// Learned from the handshake; unknown for peers found via PEX or trackers.
    pub peer_id: Option<PeerId>,
    /// Encryption methods still worth trying with this peer.
    pub encryption: EncryptionTypes,
    pub is_seeder: bool,
    pub failed_connection_attempts: u32,
    pub cleaned_up_count: u32,
    pub total_hash_fails: u32,
    pub repeated_hash_fails: u32,
    pub last_connection_attempt: Option<Instant>,
}

impl Peer {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            peer_id: None,
            encryption: EncryptionTypes::ALL,
            is_seeder: false,
            failed_connection_attempts: 0,
            cleaned_up_count: 0,
            total_hash_fails: 0,
            repeated_hash_fails: 0,
            last_connection_attempt: None,
        }
    }

    pub fn with_peer_id(mut self, peer_id: PeerId) -> Self {
        self.peer_id = Some(peer_id);
        self
    }

    /// Records the outcome of hashing a piece this peer contributed to.
    ///
    /// A success walks the repeated-failure count back by one, so a peer that
    /// sent one bad piece is trusted again after a good one.
    pub fn hashed_piece(&mut self, succeeded: bool) {
        if succeeded {
            self.repeated_hash_fails = self.repeated_hash_fails.saturating_sub(1);
        } else {
            self.repeated_hash_fails += 1;
            self.total_hash_fails += 1;
        }
    }

    /// 6-byte compact form, `None` for IPv6 peers.
    pub fn to_compact(&self) -> Option<[u8; 6]> {
        compact::encode_v4(self.addr)
    }

    /// Parses a compact peer list, ignoring a trailing partial entry.
    pub fn from_compact(data: &[u8]) -> Vec<Peer> {
        compact::decode_v4(data).into_iter().map(Peer::new).collect()
    }
}

/// Two peers are the same when their ids match. Without an id on both
/// sides only the host counts, since the port a peer is listed under rarely
/// matches the one it connects from.
impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        match (&self.peer_id, &other.peer_id) {
            (Some(a), Some(b)) => a == b,
            _ => self.addr.ip() == other.addr.ip(),
        }
    }
}

impl Eq for Peer {}
