use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use super::entry::Peer;
use super::peer_id::ConnectionId;

/// Where every known peer of one torrent currently sits.
#[derive(Debug, Default)]
pub struct PeerLists {
    /// Candidates for the next outbound attempt, front first.
    pub available: VecDeque<Peer>,
    /// Peers whose last connection attempt failed; retried later.
    pub busy: Vec<Peer>,
    /// Outbound attempts in flight.
    pub connecting: Vec<SocketAddr>,
    /// Addresses with a live transport, handshake done or not.
    pub active: Vec<SocketAddr>,
    /// Connections that completed the handshake.
    pub connected: Vec<ConnectionId>,
    pub banned: HashSet<IpAddr>,
}

impl PeerLists {
    /// Adds previously unknown, unbanned peers to the back of the available
    /// list. Returns how many were added.
    pub fn add_peers(&mut self, peers: impl IntoIterator<Item = Peer>) -> usize {
        let mut added = 0;
        for peer in peers {
            if self.is_banned(&peer.addr) || self.contains(&peer) {
                continue;
            }
            self.available.push_back(peer);
            added += 1;
        }
        added
    }

    /// Whether `peer` is already known, compared the way [`Peer`] equality
    /// does.
    pub fn contains(&self, peer: &Peer) -> bool {
        let ip = peer.addr.ip();
        self.available.iter().any(|p| p == peer)
            || self.busy.iter().any(|p| p == peer)
            || self.connecting.iter().any(|a| a.ip() == ip)
            || self.active.iter().any(|a| a.ip() == ip)
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.banned.contains(&addr.ip())
    }

    /// Removes and returns the first available peer accepted by `filter`.
    pub fn take_candidate(&mut self, filter: impl Fn(&Peer) -> bool) -> Option<Peer> {
        let index = self.available.iter().position(filter)?;
        self.available.remove(index)
    }

    /// Puts a reusable peer at the front so it is tried next.
    pub fn requeue(&mut self, peer: Peer) {
        self.available.push_front(peer);
    }

    pub fn ban(&mut self, ip: IpAddr) {
        self.banned.insert(ip);
        self.available.retain(|p| p.addr.ip() != ip);
        self.busy.retain(|p| p.addr.ip() != ip);
    }

    /// Moves busy peers whose last attempt is older than `retry_after` back to
    /// the available list; peers over `max_failures` are forgotten.
    pub fn retry_busy(&mut self, now: Instant, retry_after: Duration, max_failures: u32) {
        let busy = std::mem::take(&mut self.busy);
        for peer in busy {
            if peer.failed_connection_attempts >= max_failures {
                continue;
            }
            let ready = peer
                .last_connection_attempt
                .map_or(true, |at| now.duration_since(at) >= retry_after);
            if ready {
                self.available.push_back(peer);
            } else {
                self.busy.push(peer);
            }
        }
    }

    pub fn remove_connecting(&mut self, addr: &SocketAddr) {
        self.connecting.retain(|a| a != addr);
    }

    pub fn remove_active(&mut self, addr: &SocketAddr) {
        self.active.retain(|a| a != addr);
    }

    pub fn remove_connected(&mut self, id: ConnectionId) {
        self.connected.retain(|c| *c != id);
    }
}
