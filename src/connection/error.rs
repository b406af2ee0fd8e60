use thiserror::Error;

use crate::message::MessageError;

/// Why a connection failed.
///
/// The display string is what cleanup logs and reports as the disconnect
/// reason.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message: {0}")]
    Message(#[from] MessageError),

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("connected to ourselves")]
    SelfConnection,

    #[error("no active torrent for info hash")]
    UnknownTorrent,

    #[error("no allowed encryption method left")]
    EncryptionDisabled,

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("too many connections")]
    TooManyConnections,

    #[error("peer is banned")]
    Banned,
}

impl PeerError {
    /// Whether the peer is worth another attempt after this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PeerError::Io(_)
                | PeerError::Timeout
                | PeerError::ConnectionClosed
                | PeerError::TooManyConnections
                | PeerError::Encryption(_)
        )
    }
}
