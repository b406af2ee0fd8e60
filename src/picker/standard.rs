use std::time::{Duration, Instant};

use tracing::trace;

use super::block::{Block, BlockRequest, Piece};
use super::{PeerSnapshot, PickerPeer, PiecePicker};
use crate::bitfield::Bitfield;
use crate::constants::BLOCK_SIZE;
use crate::peer::ConnectionId;
use crate::torrent::TorrentFile;

/// The baseline picker.
///
/// Active pieces are kept sorted by index. For each pick, in order:
///
/// 1. continue a piece this peer started;
/// 2. if the peer chokes us, start an allowed-fast piece or give up;
///    allowed-fast indices are left in place so the piece can be continued;
/// 3. for single-block picks, help finish any piece already in flight;
/// 4. start a suggested piece;
/// 5. start the longest run of wanted pieces in range;
/// 6. help finish any piece already in flight.
#[derive(Debug)]
pub struct StandardPicker {
    piece_length: u32,
    total_size: u64,
    request_timeout: Duration,
    requests: Vec<Piece>,
}

impl StandardPicker {
    pub fn new(piece_length: u32, total_size: u64, request_timeout: Duration) -> Self {
        Self {
            piece_length: piece_length.max(1),
            total_size,
            request_timeout,
            requests: Vec::new(),
        }
    }

    pub fn piece_count(&self) -> usize {
        self.total_size.div_ceil(u64::from(self.piece_length)) as usize
    }

    /// Length of piece `index`; only the last piece may be short.
    pub fn piece_size(&self, index: u32) -> u32 {
        let start = u64::from(index) * u64::from(self.piece_length);
        self.total_size
            .saturating_sub(start)
            .min(u64::from(self.piece_length)) as u32
    }

    fn position(&self, index: u32) -> Result<usize, usize> {
        self.requests.binary_search_by_key(&index, Piece::index)
    }

    fn is_requested(&self, index: u32) -> bool {
        self.position(index).is_ok()
    }

    /// Adds a fresh piece to the active set and returns it.
    fn start_piece(&mut self, index: u32) -> &mut Piece {
        let piece = Piece::new(index, self.piece_size(index));
        let at = match self.position(index) {
            Ok(at) => {
                self.requests[at] = piece;
                at
            }
            Err(at) => {
                self.requests.insert(at, piece);
                at
            }
        };
        &mut self.requests[at]
    }

    fn continue_existing_request(&mut self, peer: ConnectionId, now: Instant) -> Option<BlockRequest> {
        self.requests
            .iter_mut()
            .filter(|piece| !piece.all_blocks_requested() && piece.owner() == Some(peer))
            .find_map(|piece| {
                piece
                    .blocks_mut()
                    .iter_mut()
                    .find(|b| !b.requested() && !b.received())
                    .map(|b| b.request(peer, now))
            })
    }

    fn continue_any_existing(
        &mut self,
        peer: &PickerPeer<'_>,
        available: &Bitfield,
        other_peers: &[PeerSnapshot],
        now: Instant,
    ) -> Option<BlockRequest> {
        if peer.repeated_hash_fails != 0 {
            return None;
        }

        let dodgy = |owner: Option<ConnectionId>| {
            owner.is_some_and(|id| {
                other_peers
                    .iter()
                    .any(|p| p.id == id && p.repeated_hash_fails != 0)
            })
        };

        self.requests
            .iter_mut()
            .filter(|piece| {
                !piece.all_blocks_requested()
                    && !piece.all_blocks_received()
                    && available.get(piece.index() as usize)
                    && !dodgy(piece.owner())
            })
            .find_map(|piece| {
                piece
                    .blocks_mut()
                    .iter_mut()
                    .find(|b| !b.requested() && !b.received())
                    .map(|b| b.request(peer.id, now))
            })
    }

    /// Position of the first piece in `list` the peer has and nobody
    /// requested.
    fn find_in_list(&self, available: &Bitfield, list: &[u32]) -> Option<usize> {
        list.iter().position(|&index| {
            (index as usize) < available.len()
                && available.get(index as usize)
                && !self.is_requested(index)
        })
    }

    fn request_first_block(&mut self, peer: ConnectionId, index: u32, now: Instant) -> Option<BlockRequest> {
        let piece = self.start_piece(index);
        piece.blocks_mut().first_mut().map(|b| b.request(peer, now))
    }

    fn get_standard_request(
        &mut self,
        peer: ConnectionId,
        available: &Bitfield,
        start: usize,
        end: usize,
        count: usize,
        now: Instant,
    ) -> Vec<BlockRequest> {
        let wanted_bytes = count as u64 * u64::from(BLOCK_SIZE);
        let pieces_needed = wanted_bytes.div_ceil(u64::from(self.piece_length)).max(1) as usize;

        let Some((run_start, run_len)) = self.find_run(available, start, end, pieces_needed) else {
            return Vec::new();
        };

        let mut requests = Vec::with_capacity(count);
        for index in run_start..run_start + run_len.min(pieces_needed) {
            if requests.len() >= count {
                break;
            }
            let piece = self.start_piece(index as u32);
            for block in piece.blocks_mut() {
                if requests.len() >= count {
                    break;
                }
                requests.push(block.request(peer, now));
            }
        }
        requests
    }

    /// Finds a run of wanted, unrequested pieces in `start..end`. The first
    /// run of at least `needed` pieces wins; otherwise the longest one.
    fn find_run(
        &self,
        available: &Bitfield,
        start: usize,
        end: usize,
        needed: usize,
    ) -> Option<(usize, usize)> {
        let end = end.min(available.len());
        let mut largest: Option<(usize, usize)> = None;
        let mut from = start;

        while let Some(run_start) = available.first_true(from, end) {
            let mut run_end = available.first_false(run_start, end).unwrap_or(end);
            if let Some(requested) =
                (run_start..run_end).find(|&i| self.is_requested(i as u32))
            {
                run_end = requested;
            }

            let len = run_end - run_start;
            if len >= needed {
                return Some((run_start, len));
            }
            if len > largest.map_or(0, |(_, l)| l) {
                largest = Some((run_start, len));
            }
            from = run_end.max(run_start + 1);
        }
        largest
    }

    fn cancel_where(&mut self, mut predicate: impl FnMut(&Block) -> bool) -> Vec<Block> {
        let mut cancelled = Vec::new();
        for piece in &mut self.requests {
            for block in piece.blocks_mut() {
                if block.requested() && !block.received() && predicate(block) {
                    cancelled.push(block.clone());
                    block.cancel();
                }
            }
        }
        self.requests.retain(|piece| !piece.no_blocks_requested());
        cancelled
    }
}

impl PiecePicker for StandardPicker {
    fn initialise(&mut self, bitfield: &Bitfield, _files: &[TorrentFile], mut requests: Vec<Piece>) {
        requests.retain(|piece| (piece.index() as usize) < bitfield.len());
        requests.sort_by_key(Piece::index);
        requests.dedup_by_key(|piece| piece.index());
        self.requests = requests;
    }

    fn pick_piece(
        &mut self,
        peer: &mut PickerPeer<'_>,
        available: &Bitfield,
        other_peers: &[PeerSnapshot],
        count: usize,
        start: usize,
        end: usize,
    ) -> Vec<BlockRequest> {
        let now = Instant::now();

        if let Some(request) = self.continue_existing_request(peer.id, now) {
            return vec![request];
        }

        if peer.is_choking {
            if !peer.supports_fast_peer {
                return Vec::new();
            }
            let Some(position) = self.find_in_list(available, peer.allowed_fast) else {
                return Vec::new();
            };
            return self
                .request_first_block(peer.id, peer.allowed_fast[position], now)
                .into_iter()
                .collect();
        }

        if count == 1 {
            if let Some(request) = self.continue_any_existing(peer, available, other_peers, now) {
                return vec![request];
            }
        }

        if peer.supports_fast_peer {
            if let Some(position) = self.find_in_list(available, peer.suggested) {
                let index = peer.suggested.remove(position);
                if let Some(request) = self.request_first_block(peer.id, index, now) {
                    return vec![request];
                }
            }
        }

        let requests = self.get_standard_request(peer.id, available, start, end, count, now);
        if !requests.is_empty() {
            return requests;
        }

        self.continue_any_existing(peer, available, other_peers, now)
            .into_iter()
            .collect()
    }

    fn is_interesting(&self, bitfield: &Bitfield) -> bool {
        !bitfield.all_false()
    }

    fn cancel_request(&mut self, peer: ConnectionId, index: u32, begin: u32, length: u32) {
        self.cancel_where(|b| {
            b.requested_by() == Some(peer)
                && b.piece_index() == index
                && b.start_offset() == begin
                && b.requested_length() == length
        });
    }

    fn cancel_requests(&mut self, peer: ConnectionId) {
        self.cancel_where(|b| b.requested_by() == Some(peer));
    }

    fn cancel_timed_out_requests(&mut self, now: Instant) -> Vec<Block> {
        let timeout = self.request_timeout;
        self.cancel_where(|b| b.is_timed_out(now, timeout))
    }

    fn validate_piece(
        &mut self,
        peer: ConnectionId,
        index: u32,
        begin: u32,
        length: u32,
    ) -> (bool, Option<Piece>) {
        let Ok(position) = self.position(index) else {
            trace!(%peer, index, "no active request for piece");
            return (false, None);
        };

        let piece = &mut self.requests[position];
        let Some(block) = piece
            .blocks_mut()
            .iter_mut()
            .find(|b| b.start_offset() == begin && b.requested_length() == length)
        else {
            trace!(%peer, index, begin, length, "no matching block");
            return (false, None);
        };

        if !block.requested() || block.received() || block.requested_by() != Some(peer) {
            trace!(%peer, index, begin, "unrequested or duplicate block");
            return (false, None);
        }

        block.receive();
        if piece.all_blocks_received() {
            return (true, Some(self.requests.remove(position)));
        }
        (true, None)
    }

    fn current_request_count(&self) -> usize {
        self.requests
            .iter()
            .map(|piece| piece.total_requested() - piece.total_received())
            .sum()
    }

    fn export_active_requests(&self) -> Vec<Piece> {
        self.requests.clone()
    }

    fn reset(&mut self) {
        self.requests.clear();
    }
}
