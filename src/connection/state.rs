use std::collections::VecDeque;
use std::time::Instant;

use tokio::task::AbortHandle;

use super::transport::{PeerReader, PeerWriter};
use crate::bitfield::Bitfield;
use crate::constants::{DEFAULT_MAX_PENDING_REQUESTS, MAX_PENDING_REQUESTS};
use crate::message::{Handshake, Message, RemoteExtensions};
use crate::peer::{ConnectionId, Peer};
use crate::picker::{PeerSnapshot, PickerPeer};
use crate::settings::EncryptionTypes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Outbound transport connect in flight.
    Connecting,
    EncryptionNegotiation,
    /// Our handshake is out and we are waiting for theirs. Inbound
    /// connections skip this; they answer once the remote handshake checks
    /// out.
    HandshakeSent,
    /// Handshakes exchanged; messages flow both ways.
    HandshakeReceived,
    Cleanup,
}

/// Something waiting in a connection's send queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    Handshake(Handshake),
    Message(Message),
    /// A block the peer asked for. The data is read from storage only when
    /// the reply reaches the front of the queue.
    PieceReply { index: u32, begin: u32, length: u32 },
}

/// One live connection to a peer.
///
/// Owned by the connection manager. The reader and writer are `None` while a
/// receive or send task has them.
#[derive(Debug)]
pub struct PeerConnection {
    pub id: ConnectionId,
    /// Index of the owning torrent; unknown for inbound connections until
    /// the handshake names it.
    pub torrent: Option<usize>,
    pub peer: Peer,
    pub state: ConnectionState,
    pub is_incoming: bool,
    pub encryption: EncryptionTypes,

    pub(crate) reader: Option<PeerReader>,
    pub(crate) writer: Option<PeerWriter>,
    pub queue: VecDeque<Outgoing>,
    pub is_sending: bool,

    pub am_choking: bool,
    pub am_interested: bool,
    /// The remote is choking us.
    pub is_choking: bool,
    /// The remote wants something from us.
    pub is_interested: bool,

    /// Pieces the remote has.
    pub bitfield: Bitfield,
    pub supports_fast_peer: bool,
    pub supports_extensions: bool,
    pub remote_extensions: RemoteExtensions,
    /// Pieces the remote lets us request while choked.
    pub allowed_fast: Vec<u32>,
    pub suggested: Vec<u32>,
    /// Pieces we let the remote request while we choke it.
    pub am_allowed_fast: Vec<u32>,
    /// Pieces revealed to the remote while initial seeding.
    pub offered: Vec<u32>,

    /// Requests sent and not yet answered.
    pub pending_requests: usize,
    /// Most requests we keep outstanding with this peer.
    pub max_pending: usize,

    pub connected_at: Instant,
    pub last_message_received: Instant,
    pub last_message_sent: Instant,
    pub bytes_downloaded: u64,
    pub bytes_uploaded: u64,

    /// Whether cleanup may put the peer back in the available list.
    pub can_reconnect: bool,
    pub(crate) tasks: Vec<AbortHandle>,
}

impl PeerConnection {
    fn new(id: ConnectionId, torrent: Option<usize>, peer: Peer, is_incoming: bool) -> Self {
        let now = Instant::now();
        Self {
            id,
            torrent,
            peer,
            state: if is_incoming {
                ConnectionState::EncryptionNegotiation
            } else {
                ConnectionState::Connecting
            },
            is_incoming,
            encryption: EncryptionTypes::NONE,
            reader: None,
            writer: None,
            queue: VecDeque::new(),
            is_sending: false,
            am_choking: true,
            am_interested: false,
            is_choking: true,
            is_interested: false,
            bitfield: Bitfield::new(0),
            supports_fast_peer: false,
            supports_extensions: false,
            remote_extensions: RemoteExtensions::default(),
            allowed_fast: Vec::new(),
            suggested: Vec::new(),
            am_allowed_fast: Vec::new(),
            offered: Vec::new(),
            pending_requests: 0,
            max_pending: DEFAULT_MAX_PENDING_REQUESTS,
            connected_at: now,
            last_message_received: now,
            last_message_sent: now,
            bytes_downloaded: 0,
            bytes_uploaded: 0,
            can_reconnect: true,
            tasks: Vec::new(),
        }
    }

    pub fn outgoing(id: ConnectionId, torrent: usize, peer: Peer) -> Self {
        Self::new(id, Some(torrent), peer, false)
    }

    pub fn incoming(id: ConnectionId, peer: Peer) -> Self {
        Self::new(id, None, peer, true)
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::HandshakeReceived
    }

    pub fn enqueue(&mut self, message: Message) {
        self.queue.push_back(Outgoing::Message(message));
    }

    /// Queues a message ahead of everything else.
    pub fn enqueue_front(&mut self, item: Outgoing) {
        self.queue.push_front(item);
    }

    pub fn has_queued_reply(&self, index: u32, begin: u32, length: u32) -> bool {
        self.queue
            .contains(&Outgoing::PieceReply { index, begin, length })
    }

    /// Drops a queued block reply. Returns whether one was queued.
    pub fn remove_queued_reply(&mut self, index: u32, begin: u32, length: u32) -> bool {
        let before = self.queue.len();
        self.queue
            .retain(|item| *item != Outgoing::PieceReply { index, begin, length });
        self.queue.len() != before
    }

    /// Drops every queued block reply, as a choke implies.
    pub fn clear_queued_replies(&mut self) -> Vec<(u32, u32, u32)> {
        let mut dropped = Vec::new();
        self.queue.retain(|item| match item {
            Outgoing::PieceReply {
                index,
                begin,
                length,
            } => {
                dropped.push((*index, *begin, *length));
                false
            }
            _ => true,
        });
        dropped
    }

    /// Whether a request could be answered at all right now.
    pub fn can_request(&self) -> bool {
        self.is_connected()
            && self.am_interested
            && (!self.is_choking || (self.supports_fast_peer && !self.allowed_fast.is_empty()))
    }

    pub fn request_capacity(&self) -> usize {
        self.max_pending.saturating_sub(self.pending_requests)
    }

    /// Applies the `reqq` from an extended handshake.
    pub fn set_max_pending(&mut self, reqq: u32) {
        self.max_pending = (reqq as usize).clamp(1, MAX_PENDING_REQUESTS);
    }

    pub fn picker_peer(&mut self) -> PickerPeer<'_> {
        PickerPeer {
            id: self.id,
            is_choking: self.is_choking,
            supports_fast_peer: self.supports_fast_peer,
            repeated_hash_fails: self.peer.repeated_hash_fails,
            allowed_fast: &self.allowed_fast,
            suggested: &mut self.suggested,
        }
    }

    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id,
            repeated_hash_fails: self.peer.repeated_hash_fails,
        }
    }

    pub(crate) fn track_task(&mut self, handle: AbortHandle) {
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(handle);
    }

    /// Stops every I/O task and drops both stream halves.
    pub(crate) fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.reader = None;
        self.writer = None;
    }
}
