//! peerwire - A BitTorrent peer-wire engine
//!
//! This library implements the peer side of a BitTorrent client: the wire
//! codec, piece selection and a connection manager that keeps a swarm of
//! peers busy for any number of torrents. Trackers, DHT and metainfo parsing
//! are left to the caller, who feeds in [`TorrentInfo`] and peer addresses.
//!
//! # Modules
//!
//! - [`message`] - BEP-3/6/10 message codec and handshake
//! - [`picker`] - Block request scheduling with file priorities
//! - [`connection`] - Per-peer transport, encryption negotiation and state
//! - [`torrent`] - Per-torrent state, message handling and choking
//! - [`manager`] - The connection manager task and its handle
//! - [`peer`] - Peer identities, peer lists and the allowed fast set
//! - [`storage`] - Piece data storage
//! - [`bandwidth`] - Upload and download rate limiting
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use peerwire::{EngineSettings, FileWriter, ManagerBuilder, TorrentInfo, TorrentSettings};
//!
//! # async fn example(info: TorrentInfo) -> Result<(), Box<dyn std::error::Error>> {
//! let handle = ManagerBuilder::new(EngineSettings::default()).spawn();
//! let info_hash = info.info_hash;
//! let writer = Arc::new(FileWriter::new("downloads"));
//! handle.add_torrent(info, TorrentSettings::default(), writer, None).await?;
//! handle.add_peers(info_hash, ["192.0.2.1:6881".parse()?]).await?;
//! # Ok(())
//! # }
//! ```

pub mod bandwidth;
pub mod bitfield;
pub mod connection;
pub mod constants;
pub mod manager;
pub mod message;
pub mod peer;
pub mod picker;
pub mod settings;
pub mod storage;
pub mod torrent;

pub use bandwidth::{RateLimiter, TransferLimits};
pub use bitfield::Bitfield;
pub use connection::{
    AsyncStream, BoxedStream, Connector, EncryptionNegotiator, NegotiationRole, Negotiated,
    PeerError, PlainTextNegotiator, StreamEncryptionNegotiator, TcpConnector,
};
pub use manager::{
    BanFilter, EngineEvent, Listener, LoopbackConnector, LoopbackNetwork, ManagerBuilder,
    ManagerError, ManagerHandle, TorrentStatus,
};
pub use message::{
    DecodeContext, ExtendedHandshake, ExtensionMessage, ExtensionRegistry, Handshake, Message,
    MessageError,
};
pub use peer::{ConnectionId, Peer, PeerId};
pub use picker::{BlockRequest, PiecePicker, PriorityPicker, StandardPicker};
pub use settings::{EncryptionTypes, EngineSettings, TorrentSettings};
pub use storage::{FileWriter, MemoryWriter, PieceWriter, StorageError};
pub use torrent::{Mode, Priority, TorrentFile, TorrentInfo};
