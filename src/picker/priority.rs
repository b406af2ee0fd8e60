use std::time::Instant;

use super::block::{Block, BlockRequest, Piece};
use super::{PeerSnapshot, PickerPeer, PiecePicker};
use crate::bitfield::Bitfield;
use crate::peer::ConnectionId;
use crate::torrent::{Priority, TorrentFile};

/// Restricts an inner picker to the pieces of files worth downloading.
///
/// Each priority tier gets a mask covering its files' pieces, in file list
/// order. A pick runs the inner picker once per tier, highest tier first,
/// until one returns something. `DoNotDownload` files get no tier at all.
#[derive(Debug)]
pub struct PriorityPicker<P> {
    inner: P,
    files: Vec<TorrentFile>,
    piece_count: usize,
    tiers: Vec<(Priority, Bitfield)>,
}

impl<P: PiecePicker> PriorityPicker<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            files: Vec::new(),
            piece_count: 0,
            tiers: Vec::new(),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn files(&self) -> &[TorrentFile] {
        &self.files
    }

    /// Changes one file's priority. Returns false if `file` is out of range.
    pub fn set_priority(&mut self, file: usize, priority: Priority) -> bool {
        let Some(entry) = self.files.get_mut(file) else {
            return false;
        };
        entry.priority = priority;
        self.rebuild_tiers();
        true
    }

    fn rebuild_tiers(&mut self) {
        self.tiers.clear();
        for priority in Priority::DOWNLOAD_ORDER {
            let mut mask = Bitfield::new(self.piece_count);
            for file in self.files.iter().filter(|f| f.priority == priority) {
                mask.set_range(file.start_piece as usize, file.end_piece as usize, true);
            }
            if !mask.all_false() {
                self.tiers.push((priority, mask));
            }
        }
    }

    /// The single priority every file shares, if any. A picker without
    /// files behaves as if everything were `Normal`.
    fn uniform_priority(&self) -> Option<Priority> {
        let Some(first) = self.files.first().map(|f| f.priority) else {
            return Some(Priority::Normal);
        };
        self.files
            .iter()
            .all(|f| f.priority == first)
            .then_some(first)
    }
}

impl<P: PiecePicker> PiecePicker for PriorityPicker<P> {
    fn initialise(&mut self, bitfield: &Bitfield, files: &[TorrentFile], requests: Vec<Piece>) {
        self.files = files.to_vec();
        self.piece_count = bitfield.len();
        self.rebuild_tiers();
        self.inner.initialise(bitfield, files, requests);
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
        if available.all_false() {
            return Vec::new();
        }

        match self.uniform_priority() {
            Some(Priority::DoNotDownload) => return Vec::new(),
            Some(_) => {
                return self
                    .inner
                    .pick_piece(peer, available, other_peers, count, start, end)
            }
            None => {}
        }

        for (_, mask) in &self.tiers {
            let mut candidates = available.clone();
            candidates.and(mask);
            if candidates.all_false() {
                continue;
            }
            let requests = self
                .inner
                .pick_piece(peer, &candidates, other_peers, count, start, end);
            if !requests.is_empty() {
                return requests;
            }
        }
        Vec::new()
    }

    fn is_interesting(&self, bitfield: &Bitfield) -> bool {
        match self.uniform_priority() {
            Some(Priority::DoNotDownload) => return false,
            Some(_) => return self.inner.is_interesting(bitfield),
            None => {}
        }

        self.tiers.iter().any(|(_, mask)| {
            let mut candidates = bitfield.clone();
            candidates.and(mask);
            !candidates.all_false() && self.inner.is_interesting(&candidates)
        })
    }

    fn cancel_request(&mut self, peer: ConnectionId, index: u32, begin: u32, length: u32) {
        self.inner.cancel_request(peer, index, begin, length)
    }

    fn cancel_requests(&mut self, peer: ConnectionId) {
        self.inner.cancel_requests(peer)
    }

    fn cancel_timed_out_requests(&mut self, now: Instant) -> Vec<Block> {
        self.inner.cancel_timed_out_requests(now)
    }

    fn validate_piece(
        &mut self,
        peer: ConnectionId,
        index: u32,
        begin: u32,
        length: u32,
    ) -> (bool, Option<Piece>) {
        self.inner.validate_piece(peer, index, begin, length)
    }

    fn current_request_count(&self) -> usize {
        self.inner.current_request_count()
    }

    fn export_active_requests(&self) -> Vec<Piece> {
        self.inner.export_active_requests()
    }

    fn reset(&mut self) {
        self.inner.reset()
    }
}
