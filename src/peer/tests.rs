use super::*;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

fn addr(last: u8, port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), port)
}

#[test]
fn test_peer_id_generate() {
    let id1 = PeerId::generate();
    let id2 = PeerId::generate();
    assert_ne!(id1, id2);
    assert_eq!(id1.client_id(), Some("PW0100"));
}

#[test]
fn test_peer_id_from_bytes() {
    assert!(PeerId::from_bytes(b"12312312345645645678").is_some());
    assert!(PeerId::from_bytes(b"short").is_none());
}

#[test]
fn test_peer_equality_prefers_peer_id() {
    let id = PeerId(*b"12312312345645645678");
    let a = Peer::new(addr(1, 6881)).with_peer_id(id);
    let b = Peer::new(addr(2, 6881)).with_peer_id(id);
    assert_eq!(a, b);

    let c = Peer::new(addr(1, 6881)).with_peer_id(PeerId::generate());
    assert_ne!(a, c);
}

#[test]
fn test_peer_equality_falls_back_to_host() {
    let a = Peer::new(addr(1, 6881));
    let b = Peer::new(addr(1, 6881)).with_peer_id(PeerId::generate());
    assert_eq!(a, b);

    // Same host, different port.
    assert_eq!(a, Peer::new(addr(1, 51413)));
    assert_eq!(b, Peer::new(addr(1, 51413)));
    assert_ne!(a, Peer::new(addr(2, 6881)));
}

#[test]
fn test_hashed_piece_counts() {
    let mut peer = Peer::new(addr(1, 6881));
    peer.hashed_piece(false);
    peer.hashed_piece(false);
    assert_eq!(peer.repeated_hash_fails, 2);
    assert_eq!(peer.total_hash_fails, 2);

    peer.hashed_piece(true);
    assert_eq!(peer.repeated_hash_fails, 1);
    assert_eq!(peer.total_hash_fails, 2);

    peer.hashed_piece(true);
    peer.hashed_piece(true);
    assert_eq!(peer.repeated_hash_fails, 0);
}

#[test]
fn test_compact_roundtrip() {
    let peer = Peer::new(addr(7, 0x1AE1));
    let compact = peer.to_compact().unwrap();
    assert_eq!(compact, [10, 0, 0, 7, 0x1A, 0xE1]);

    let mut data = compact.to_vec();
    data.extend_from_slice(&[1, 2, 3]);
    let peers = Peer::from_compact(&data);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].addr, addr(7, 0x1AE1));
}

#[test]
fn test_encode_compact_skips_ipv6() {
    let v6: SocketAddr = "[::1]:6881".parse().unwrap();
    let list = encode_compact(&[addr(1, 1), v6, addr(2, 2)]);
    assert_eq!(list.len(), 12);
    assert_eq!(decode_compact(&list), vec![addr(1, 1), addr(2, 2)]);
}

#[test]
fn test_allowed_fast_set_is_deterministic() {
    let info_hash = [0xAA; 20];
    let ip = IpAddr::V4(Ipv4Addr::new(80, 4, 4, 200));
    let a = generate_allowed_fast_set(&info_hash, ip, 1313, 7);
    let b = generate_allowed_fast_set(&info_hash, IpAddr::V4(Ipv4Addr::new(80, 4, 4, 1)), 1313, 7);
    assert_eq!(a.len(), 7);
    assert_eq!(a, b);
    assert!(a.iter().all(|&i| i < 1313));
}

#[test]
fn test_allowed_fast_set_small_torrent() {
    let set = generate_allowed_fast_set(&[1; 20], IpAddr::V4(Ipv4Addr::LOCALHOST), 3, 10);
    assert_eq!(set.len(), 3);
    assert!(generate_allowed_fast_set(&[1; 20], IpAddr::V4(Ipv4Addr::LOCALHOST), 0, 10).is_empty());
}

#[test]
fn test_peer_lists_add_skips_known_and_banned() {
    let mut lists = PeerLists::default();
    assert_eq!(lists.add_peers(vec![Peer::new(addr(1, 1)), Peer::new(addr(2, 2))]), 2);
    assert_eq!(lists.add_peers(vec![Peer::new(addr(1, 1))]), 0);

    lists.ban(addr(3, 3).ip());
    assert_eq!(lists.add_peers(vec![Peer::new(addr(3, 3))]), 0);

    lists.connecting.push(addr(4, 4));
    assert_eq!(lists.add_peers(vec![Peer::new(addr(4, 4))]), 0);
    assert_eq!(lists.available.len(), 2);
}

#[test]
fn test_peer_lists_dedup_by_host() {
    let mut lists = PeerLists::default();
    assert_eq!(lists.add_peers(vec![Peer::new(addr(1, 6881)), Peer::new(addr(1, 51413))]), 1);

    lists.busy.push(Peer::new(addr(2, 6881)));
    lists.active.push(addr(3, 6881));
    let added = lists.add_peers(vec![
        Peer::new(addr(2, 7000)),
        Peer::new(addr(3, 7000)),
        Peer::new(addr(4, 7000)),
    ]);
    assert_eq!(added, 1);
    assert!(lists.contains(&Peer::new(addr(3, 1))));
    assert!(!lists.contains(&Peer::new(addr(5, 6881))));
}

#[test]
fn test_peer_lists_take_candidate_and_requeue() {
    let mut lists = PeerLists::default();
    let mut seeder = Peer::new(addr(1, 1));
    seeder.is_seeder = true;
    lists.add_peers(vec![seeder, Peer::new(addr(2, 2))]);

    let picked = lists.take_candidate(|p| !p.is_seeder).unwrap();
    assert_eq!(picked.addr, addr(2, 2));
    assert_eq!(lists.available.len(), 1);

    lists.requeue(picked);
    assert_eq!(lists.available.front().map(|p| p.addr), Some(addr(2, 2)));
}

#[test]
fn test_peer_lists_retry_busy() {
    let mut lists = PeerLists::default();
    let now = Instant::now();

    let mut fresh = Peer::new(addr(1, 1));
    fresh.last_connection_attempt = Some(now);
    fresh.failed_connection_attempts = 1;
    let mut stale = Peer::new(addr(2, 2));
    stale.failed_connection_attempts = 1;
    let mut hopeless = Peer::new(addr(3, 3));
    hopeless.failed_connection_attempts = 5;
    lists.busy = vec![fresh, stale, hopeless];

    lists.retry_busy(now + Duration::from_secs(1), Duration::from_secs(60), 5);
    assert_eq!(lists.busy.len(), 1);
    assert_eq!(lists.available.len(), 1);
    assert_eq!(lists.available[0].addr, addr(2, 2));
}
