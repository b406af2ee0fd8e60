//! Per-torrent state and message handling.
//!
//! A [`Torrent`] owns everything the connection manager needs to serve one
//! swarm: our bitfield, the piece picker, the peer lists, the storage writer
//! and the current [`Mode`]. Messages from a peer are interpreted by
//! [`handle_message`], which only mutates the torrent and the connection it
//! was given. Anything that needs I/O is handed back to the caller.

mod choker;
mod file;
mod handler;
mod initial_seed;
mod mode;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};

use crate::bandwidth::TransferLimits;
use crate::bitfield::Bitfield;
use crate::peer::{ConnectionId, PeerLists};
use crate::picker::{PiecePicker, PriorityPicker, StandardPicker};
use crate::settings::TorrentSettings;
use crate::storage::{self, PieceWriter, StorageError};

pub use choker::{unchoke_decisions, ChokeCandidate};
pub use file::{Priority, TorrentFile};
pub use handler::handle_message;
pub(crate) use handler::{reveal_pieces, update_interest};
pub use initial_seed::InitialSeed;
pub use mode::{Mode, ModeEvent};

/// The parts of a torrent's metadata the engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    pub info_hash: [u8; 20],
    pub name: String,
    pub piece_length: u32,
    pub total_size: u64,
    pub piece_hashes: Vec<[u8; 20]>,
    pub files: Vec<TorrentFile>,
}

impl TorrentInfo {
    pub fn new(
        info_hash: [u8; 20],
        name: impl Into<String>,
        piece_length: u32,
        files: impl IntoIterator<Item = (PathBuf, u64)>,
        piece_hashes: Vec<[u8; 20]>,
    ) -> Self {
        let files = TorrentFile::layout(piece_length, files);
        let total_size = files.iter().map(|f| f.length).sum();
        Self {
            info_hash,
            name: name.into(),
            piece_length,
            total_size,
            piece_hashes,
            files,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Whether the piece hashes cover the content exactly.
    pub fn is_consistent(&self) -> bool {
        self.piece_length > 0
            && self.total_size.div_ceil(u64::from(self.piece_length)) == self.piece_count() as u64
    }

    pub fn piece_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.piece_length)
    }

    /// Length of piece `index`; only the last piece may be short.
    pub fn piece_size(&self, index: u32) -> u32 {
        self.total_size
            .saturating_sub(self.piece_offset(index))
            .min(u64::from(self.piece_length)) as u32
    }
}

/// A piece whose blocks are still arriving.
#[derive(Debug)]
struct PartialPiece {
    data: Vec<u8>,
    contributors: Vec<ConnectionId>,
}

/// A fully received piece, ready to be verified and written out.
pub struct HashJob {
    pub index: u32,
    pub contributors: Vec<ConnectionId>,
    data: Vec<u8>,
    expected: [u8; 20],
    offset: u64,
    info: Arc<TorrentInfo>,
    writer: Arc<dyn PieceWriter>,
}

impl HashJob {
    /// Checks the SHA-1 and, on a match, writes the piece. Returns whether
    /// the hash matched. Blocking.
    pub fn run(self) -> Result<bool, StorageError> {
        if Sha1::digest(&self.data)[..] != self.expected[..] {
            return Ok(false);
        }

        storage::write_block(self.writer.as_ref(), &self.info.files, self.offset, &self.data)?;
        let end = self.offset + self.data.len() as u64;
        for file in &self.info.files {
            let range = file.byte_range();
            if range.start < end && self.offset < range.end {
                self.writer.flush(file)?;
            }
        }
        Ok(true)
    }
}

/// Reads piece `index` back from storage and checks its SHA-1. A piece
/// touching a file that does not exist yet simply fails. Blocking.
pub fn verify_piece(
    info: &TorrentInfo,
    writer: &dyn PieceWriter,
    index: u32,
) -> Result<bool, StorageError> {
    let Some(expected) = info.piece_hashes.get(index as usize) else {
        return Ok(false);
    };
    let offset = info.piece_offset(index);
    let size = info.piece_size(index) as usize;
    let end = offset + size as u64;
    for file in &info.files {
        let range = file.byte_range();
        if range.start < end && offset < range.end && !writer.exists(file)? {
            return Ok(false);
        }
    }

    let mut data = vec![0u8; size];
    match storage::read_block(writer, &info.files, offset, &mut data) {
        Ok(()) => {}
        // A file shorter than its final size is missing this piece.
        Err(StorageError::OutOfBounds { .. }) => return Ok(false),
        Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Ok(false)
        }
        Err(e) => return Err(e),
    }
    Ok(Sha1::digest(&data)[..] == expected[..])
}

/// A hash check running in the background.
#[derive(Debug)]
pub struct HashCheck {
    /// Distinguishes results of this run from an earlier, cancelled one.
    pub generation: u64,
    pub cancel: Arc<AtomicBool>,
    /// Start the torrent once every piece has been checked.
    pub auto_start: bool,
}

impl std::fmt::Debug for HashJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashJob")
            .field("index", &self.index)
            .field("len", &self.data.len())
            .field("contributors", &self.contributors)
            .finish_non_exhaustive()
    }
}

pub struct Torrent {
    pub info: Arc<TorrentInfo>,
    pub settings: TorrentSettings,
    pub mode: Mode,
    /// Pieces we have and verified.
    pub bitfield: Bitfield,
    /// Pieces fully received and waiting for their hash check.
    pub hashing: Bitfield,
    pub picker: PriorityPicker<StandardPicker>,
    pub peers: PeerLists,
    pub writer: Arc<dyn PieceWriter>,
    pub limits: TransferLimits,
    /// Peers we currently unchoke.
    pub uploading_to: usize,
    /// Present while in [`Mode::InitialSeeding`].
    pub initial_seed: Option<InitialSeed>,
    pub check: Option<HashCheck>,
    partial: HashMap<u32, PartialPiece>,
}

impl Torrent {
    pub fn new(
        info: TorrentInfo,
        settings: TorrentSettings,
        writer: Arc<dyn PieceWriter>,
        have: Option<Bitfield>,
        request_timeout: Duration,
    ) -> Self {
        let piece_count = info.piece_count();
        let bitfield = have
            .filter(|bits| bits.len() == piece_count)
            .unwrap_or_else(|| Bitfield::new(piece_count));

        let mut picker = PriorityPicker::new(StandardPicker::new(
            info.piece_length,
            info.total_size,
            request_timeout,
        ));
        picker.initialise(&bitfield, &info.files, Vec::new());

        let limits = TransferLimits::new(settings.max_upload_rate, settings.max_download_rate);
        Self {
            info: Arc::new(info),
            settings,
            mode: Mode::Stopped,
            hashing: Bitfield::new(piece_count),
            bitfield,
            picker,
            peers: PeerLists::default(),
            writer,
            limits,
            uploading_to: 0,
            initial_seed: None,
            check: None,
            partial: HashMap::new(),
        }
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info.info_hash
    }

    pub fn piece_count(&self) -> usize {
        self.info.piece_count()
    }

    pub fn is_complete(&self) -> bool {
        self.bitfield.all_true()
    }

    /// Connections opened or being opened for this torrent.
    pub fn open_connections(&self) -> usize {
        self.peers.connecting.len() + self.peers.active.len()
    }

    /// Applies `event` to the mode and returns whether it changed.
    pub fn transition(&mut self, event: ModeEvent) -> bool {
        let next = self.mode.transition(event);
        if next == self.mode {
            return false;
        }
        self.mode = next;
        self.initial_seed = (self.mode == Mode::InitialSeeding)
            .then(|| InitialSeed::new(self.piece_count()));
        true
    }

    /// The event that starts this torrent with its current data.
    pub fn start_event(&self) -> ModeEvent {
        ModeEvent::Start {
            complete: self.is_complete(),
            initial_seeding: self.settings.initial_seeding,
        }
    }

    /// Rebuilds the picker after the bitfield changed wholesale.
    pub fn reset_picker(&mut self) {
        self.picker
            .initialise(&self.bitfield, &self.info.files, Vec::new());
    }

    /// Pieces `remote` has that we still need and are not verifying.
    pub fn wanted_from(&self, remote: &Bitfield) -> Bitfield {
        let mut wanted = remote.clone();
        if wanted.len() != self.bitfield.len() {
            return Bitfield::new(self.bitfield.len());
        }
        wanted.and_not(&self.bitfield).and_not(&self.hashing);
        wanted
    }

    pub fn is_interesting(&self, remote: &Bitfield) -> bool {
        self.mode == Mode::Downloading && self.picker.is_interesting(&self.wanted_from(remote))
    }

    /// Whether we can answer a request for this block.
    pub fn can_serve(&self, index: u32, begin: u32, length: u32) -> bool {
        (index as usize) < self.piece_count()
            && self.bitfield.get(index as usize)
            && length > 0
            && length <= crate::constants::MAX_REQUEST_LENGTH
            && begin
                .checked_add(length)
                .is_some_and(|end| end <= self.info.piece_size(index))
    }

    /// Stores a block the picker accepted. Once every block of the piece is
    /// in, the piece is handed back for verification.
    pub(crate) fn store_block(
        &mut self,
        from: ConnectionId,
        index: u32,
        begin: u32,
        data: &[u8],
        complete: bool,
    ) -> Option<HashJob> {
        let size = self.info.piece_size(index) as usize;
        let partial = self.partial.entry(index).or_insert_with(|| PartialPiece {
            data: vec![0; size],
            contributors: Vec::new(),
        });

        let start = begin as usize;
        let end = (start + data.len()).min(partial.data.len());
        partial.data[start..end].copy_from_slice(&data[..end - start]);
        if !partial.contributors.contains(&from) {
            partial.contributors.push(from);
        }

        if !complete {
            return None;
        }
        let expected = self.info.piece_hashes.get(index as usize).copied()?;
        let partial = self.partial.remove(&index)?;
        self.hashing.set(index as usize, true);
        Some(HashJob {
            index,
            contributors: partial.contributors,
            data: partial.data,
            expected,
            offset: self.info.piece_offset(index),
            info: Arc::clone(&self.info),
            writer: Arc::clone(&self.writer),
        })
    }

    /// Records a hash result. A passing piece joins our bitfield; a failing
    /// one becomes pickable again.
    pub fn piece_hashed(&mut self, index: u32, passed: bool) {
        self.hashing.set(index as usize, false);
        if passed {
            self.bitfield.set(index as usize, true);
        }
    }

    /// Forgets request and partial piece state, as on stop or error.
    pub fn reset_transfers(&mut self) {
        self.picker.reset();
        self.partial.clear();
        self.hashing.set_all(false);
        self.uploading_to = 0;
    }
}

impl std::fmt::Debug for Torrent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Torrent")
            .field("name", &self.info.name)
            .field("mode", &self.mode)
            .field("have", &self.bitfield.true_count())
            .field("pieces", &self.piece_count())
            .finish_non_exhaustive()
    }
}
