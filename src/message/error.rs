use thiserror::Error;

/// Errors raised while encoding or decoding peer-wire messages.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The buffer ends before the declared frame does.
    #[error("truncated message: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// A fixed-size message declared the wrong payload length.
    #[error("length mismatch for message id {id}: declared {declared}, expected {expected}")]
    LengthMismatch {
        id: u8,
        declared: usize,
        expected: usize,
    },

    /// The top-level message id is not part of the protocol.
    #[error("unknown message id: {0}")]
    UnknownMessageId(u8),

    /// The destination buffer cannot hold the encoded message.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// The handshake has a bad protocol string or length.
    #[error("invalid handshake")]
    InvalidHandshake,

    /// An extension payload is not valid bencode.
    #[error("bencode error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// The payload is well formed but its contents make no sense.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}
