use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("connection manager has shut down")]
    Closed,

    #[error("torrent already added")]
    DuplicateTorrent,

    #[error("unknown torrent")]
    UnknownTorrent,

    #[error("invalid torrent: {0}")]
    InvalidTorrent(String),

    #[error("torrent must be stopped first")]
    NotStopped,

    #[error("no file at index {0}")]
    InvalidFile(usize),
}
