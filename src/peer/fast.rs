use sha1::{Digest, Sha1};
use std::net::IpAddr;

/// Generates the allowed fast set for a peer (BEP-6).
///
/// The set is derived from the peer's masked IP address and the info hash, so
/// both sides of a connection compute the same indices.
pub fn generate_allowed_fast_set(
    info_hash: &[u8; 20],
    peer_ip: IpAddr,
    piece_count: u32,
    set_size: usize,
) -> Vec<u32> {
    if piece_count == 0 {
        return Vec::new();
    }
    let set_size = set_size.min(piece_count as usize);

    let masked = match peer_ip {
        IpAddr::V4(ip) => {
            let o = ip.octets();
            [o[0], o[1], o[2], 0]
        }
        IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
            Some(v4) => {
                let o = v4.octets();
                [o[0], o[1], o[2], 0]
            }
            None => {
                let o = ip.octets();
                [o[0], o[1], o[2], o[3]]
            }
        },
    };

    let mut seed = Vec::with_capacity(24);
    seed.extend_from_slice(&masked);
    seed.extend_from_slice(info_hash);

    let mut set = Vec::with_capacity(set_size);
    while set.len() < set_size {
        let hash = Sha1::digest(&seed);
        for chunk in hash.chunks_exact(4) {
            if set.len() >= set_size {
                break;
            }
            let index = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) % piece_count;
            if !set.contains(&index) {
                set.push(index);
            }
        }
        seed = hash.to_vec();
    }
    set
}
