use bytes::{BufMut, BytesMut};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

pub const COMPACT_V4_LEN: usize = 6;

pub fn encode_v4(addr: SocketAddr) -> Option<[u8; 6]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = [0u8; 6];
            out[..4].copy_from_slice(&v4.ip().octets());
            out[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(out)
        }
        SocketAddr::V6(_) => None,
    }
}

/// Packs every IPv4 address of `addrs`; IPv6 addresses are skipped.
pub fn encode_v4_list<'a>(addrs: impl IntoIterator<Item = &'a SocketAddr>) -> BytesMut {
    let mut buf = BytesMut::new();
    for addr in addrs {
        if let Some(entry) = encode_v4(*addr) {
            buf.put_slice(&entry);
        }
    }
    buf
}

pub fn decode_v4(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(COMPACT_V4_LEN)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddr::V4(SocketAddrV4::new(ip, port))
        })
        .collect()
}
