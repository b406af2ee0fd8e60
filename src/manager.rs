//! The connection manager.
//!
//! One task owns every torrent and connection. It opens outbound
//! connections within the global and per-torrent caps, takes inbound ones
//! from a [`Listener`] (or anything else that calls
//! [`ManagerHandle::accept`]), drives each connection through encryption
//! negotiation and the handshake, and then pumps messages between the peer
//! and its torrent. Callers talk to it through a [`ManagerHandle`] and
//! observe it through [`EngineEvent`]s.

mod engine;
mod error;
mod event;
mod handle;
mod listener;
mod loopback;

pub use error::ManagerError;
pub use event::{EngineEvent, TorrentStatus};
pub use handle::{BanFilter, ManagerBuilder, ManagerHandle};
pub use listener::Listener;
pub use loopback::{LoopbackConnector, LoopbackNetwork};

#[cfg(test)]
mod tests;
