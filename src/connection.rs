//! Per-peer connection plumbing.
//!
//! A connection walks `Connecting -> EncryptionNegotiation -> HandshakeSent ->
//! HandshakeReceived -> Cleanup`. The I/O for each step runs on its own task
//! that owns the stream half it needs and hands it back with the result, so
//! at most one read and one write are in flight per peer. The connection
//! manager drives the transitions.

mod encryption;
mod error;
mod mse;
mod state;
mod transport;

pub use encryption::{
    check_negotiated, EncryptionNegotiator, Encryptor, NegotiationRole, Negotiated,
    PlainTextNegotiator, Rc4,
};
pub use error::PeerError;
pub use mse::{StreamEncryptionNegotiator, KEY_LEN, MAX_PADDING};
pub use state::{ConnectionState, Outgoing, PeerConnection};
pub use transport::{
    AsyncStream, BoxFuture, BoxedStream, Connector, PeerReader, PeerWriter, TcpConnector,
};
pub(crate) use transport::split;

#[cfg(test)]
mod tests;
