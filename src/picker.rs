//! Piece and block request scheduling.
//!
//! A picker tracks every block request in flight and decides what to ask a
//! given peer for next. [`StandardPicker`] implements the selection algorithm;
//! [`PriorityPicker`] wraps any picker and restricts it to files by priority.
//!
//! Pickers are not synchronised. The connection manager owns them and calls
//! in from its single task.

mod block;
mod priority;
mod standard;

use std::time::Instant;

use crate::bitfield::Bitfield;
use crate::peer::ConnectionId;
use crate::torrent::TorrentFile;

pub use block::{Block, BlockRequest, Piece};
pub use priority::PriorityPicker;
pub use standard::StandardPicker;

/// The requesting side of a pick.
///
/// The suggested list is borrowed mutably because a pick consumes the index
/// it starts. Allowed-fast indices stay until their piece is verified.
#[derive(Debug)]
pub struct PickerPeer<'a> {
    pub id: ConnectionId,
    /// Whether the remote is choking us.
    pub is_choking: bool,
    pub supports_fast_peer: bool,
    pub repeated_hash_fails: u32,
    pub allowed_fast: &'a [u32],
    pub suggested: &'a mut Vec<u32>,
}

/// What the picker may know about the other connections of the torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub id: ConnectionId,
    pub repeated_hash_fails: u32,
}

pub trait PiecePicker: Send {
    /// Replaces all request state with `requests`.
    fn initialise(&mut self, bitfield: &Bitfield, files: &[TorrentFile], requests: Vec<Piece>);

    /// Picks up to `count` blocks in pieces `start..end` that `available`
    /// marks as wanted from `peer`. An empty result means nothing to request.
    fn pick_piece(
        &mut self,
        peer: &mut PickerPeer<'_>,
        available: &Bitfield,
        other_peers: &[PeerSnapshot],
        count: usize,
        start: usize,
        end: usize,
    ) -> Vec<BlockRequest>;

    fn is_interesting(&self, bitfield: &Bitfield) -> bool;

    fn cancel_request(&mut self, peer: ConnectionId, index: u32, begin: u32, length: u32);

    /// Cancels every outstanding request made from `peer`.
    fn cancel_requests(&mut self, peer: ConnectionId);

    /// Cancels requests older than the picker's timeout and returns the
    /// affected blocks as they were before cancelling.
    fn cancel_timed_out_requests(&mut self, now: Instant) -> Vec<Block>;

    /// Accepts a received block if `peer` requested it and it has not
    /// arrived before. The piece is handed back only when this was its last
    /// block, at which point it has left the active set.
    fn validate_piece(
        &mut self,
        peer: ConnectionId,
        index: u32,
        begin: u32,
        length: u32,
    ) -> (bool, Option<Piece>);

    /// Blocks requested and not yet received, over all peers.
    fn current_request_count(&self) -> usize;

    fn export_active_requests(&self) -> Vec<Piece>;

    /// Forgets every request.
    fn reset(&mut self);
}
