use std::time::{Duration, Instant};

use crate::constants::BLOCK_SIZE;
use crate::message::Message;
use crate::peer::ConnectionId;

/// One sub-piece transfer.
///
/// A block moves from unrequested to requested when a Request is issued and to
/// received when the matching Piece arrives. Cancelling clears the request
/// without touching `received`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    piece_index: u32,
    start_offset: u32,
    requested_length: u32,
    requested_by: Option<ConnectionId>,
    requested: bool,
    received: bool,
    requested_at: Option<Instant>,
}

impl Block {
    fn new(piece_index: u32, start_offset: u32, requested_length: u32) -> Self {
        Self {
            piece_index,
            start_offset,
            requested_length,
            requested_by: None,
            requested: false,
            received: false,
            requested_at: None,
        }
    }

    pub fn piece_index(&self) -> u32 {
        self.piece_index
    }

    pub fn start_offset(&self) -> u32 {
        self.start_offset
    }

    pub fn requested_length(&self) -> u32 {
        self.requested_length
    }

    /// The connection this block was last requested from.
    pub fn requested_by(&self) -> Option<ConnectionId> {
        self.requested_by
    }

    pub fn requested(&self) -> bool {
        self.requested
    }

    pub fn received(&self) -> bool {
        self.received
    }

    pub fn requested_at(&self) -> Option<Instant> {
        self.requested_at
    }

    pub(crate) fn request(&mut self, by: ConnectionId, now: Instant) -> BlockRequest {
        self.requested = true;
        self.requested_by = Some(by);
        self.requested_at = Some(now);
        BlockRequest::from(&*self)
    }

    pub(crate) fn cancel(&mut self) {
        self.requested = false;
        self.requested_at = None;
    }

    pub(crate) fn receive(&mut self) {
        self.received = true;
    }

    pub(crate) fn is_timed_out(&self, now: Instant, timeout: Duration) -> bool {
        self.requested
            && !self.received
            && self
                .requested_at
                .is_some_and(|at| now.saturating_duration_since(at) >= timeout)
    }
}

/// A piece that has at least one block requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    index: u32,
    blocks: Vec<Block>,
}

impl Piece {
    /// Splits a piece of `length` bytes into blocks; the last one is
    /// truncated to fit.
    pub fn new(index: u32, length: u32) -> Self {
        let count = length.div_ceil(BLOCK_SIZE);
        let blocks = (0..count)
            .map(|i| {
                let start = i * BLOCK_SIZE;
                Block::new(index, start, BLOCK_SIZE.min(length - start))
            })
            .collect();
        Self { index, blocks }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub(crate) fn blocks_mut(&mut self) -> &mut [Block] {
        &mut self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Total bytes covered by the blocks.
    pub fn length(&self) -> u32 {
        self.blocks.iter().map(|b| b.requested_length).sum()
    }

    pub fn total_requested(&self) -> usize {
        self.blocks.iter().filter(|b| b.requested).count()
    }

    pub fn total_received(&self) -> usize {
        self.blocks.iter().filter(|b| b.received).count()
    }

    pub fn all_blocks_requested(&self) -> bool {
        self.blocks.iter().all(|b| b.requested)
    }

    pub fn all_blocks_received(&self) -> bool {
        self.blocks.iter().all(|b| b.received)
    }

    pub fn no_blocks_requested(&self) -> bool {
        !self.blocks.iter().any(|b| b.requested)
    }

    /// The connection that started this piece.
    pub fn owner(&self) -> Option<ConnectionId> {
        self.blocks.first().and_then(|b| b.requested_by)
    }
}

/// A block request as it goes out on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRequest {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl From<&Block> for BlockRequest {
    fn from(block: &Block) -> Self {
        Self {
            index: block.piece_index,
            begin: block.start_offset,
            length: block.requested_length,
        }
    }
}

impl From<BlockRequest> for Message {
    fn from(request: BlockRequest) -> Self {
        Message::Request {
            index: request.index,
            begin: request.begin,
            length: request.length,
        }
    }
}
