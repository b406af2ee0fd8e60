//! Piece data storage.
//!
//! The engine never touches disk directly. It goes through a [`PieceWriter`],
//! a small capability keyed by [`TorrentFile`](crate::torrent::TorrentFile)
//! and an offset within that file. [`read_block`] and [`write_block`] map a
//! torrent-global offset onto the files it spans.
//!
//! Writers are synchronous; the connection manager calls them from a
//! blocking worker and reports completion back to its main loop. Any error
//! returned here moves the owning torrent into its error mode.
//!
//! # Security
//!
//! [`FileWriter`] rejects file paths containing `..`, a root or a prefix, so a
//! torrent cannot write outside its download directory.

mod error;
mod io;
mod writer;

pub use error::StorageError;
pub use io::{read_block, write_block};
pub use writer::{FileWriter, MemoryWriter, PieceWriter};
