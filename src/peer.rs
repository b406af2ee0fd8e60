//! Swarm members and their bookkeeping.
//!
//! A [`Peer`] is an identity that outlives any single connection; a
//! [`ConnectionId`] names one live connection to it. [`PeerLists`] tracks
//! which peers of a torrent are available, connecting, connected or busy.

mod compact;
mod entry;
mod fast;
mod lists;
mod peer_id;

pub use compact::{decode_v4 as decode_compact, encode_v4_list as encode_compact, COMPACT_V4_LEN};
pub use entry::Peer;
pub use fast::generate_allowed_fast_set;
pub use lists::PeerLists;
pub use peer_id::{ConnectionId, PeerId};

#[cfg(test)]
mod tests;
