use bytes::{BufMut, Bytes, BytesMut};

use super::error::MessageError;
use crate::constants::{HANDSHAKE_LEN, PROTOCOL};
use crate::peer::PeerId;

const EXTENSION_BYTE: usize = 5;
const EXTENSION_BIT: u8 = 0x10;
const FAST_PEER_BYTE: usize = 7;
const FAST_PEER_BIT: u8 = 0x04;

/// The 68-byte opening message of every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        Self {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn with_fast_peer(mut self, enabled: bool) -> Self {
        set_flag(&mut self.reserved[FAST_PEER_BYTE], FAST_PEER_BIT, enabled);
        self
    }

    pub fn with_extensions(mut self, enabled: bool) -> Self {
        set_flag(&mut self.reserved[EXTENSION_BYTE], EXTENSION_BIT, enabled);
        self
    }

    /// BEP-6 fast peer extension.
    pub fn supports_fast_peer(&self) -> bool {
        self.reserved[FAST_PEER_BYTE] & FAST_PEER_BIT != 0
    }

    /// BEP-10 extension protocol.
    pub fn supports_extensions(&self) -> bool {
        self.reserved[EXTENSION_BYTE] & EXTENSION_BIT != 0
    }

    pub fn byte_len(&self) -> usize {
        HANDSHAKE_LEN
    }

    /// Writes the handshake at `offset`, leaving the rest of `buf` untouched.
    pub fn encode_into(&self, buf: &mut [u8], offset: usize) -> Result<usize, MessageError> {
        let available = buf.len().saturating_sub(offset);
        if available < HANDSHAKE_LEN {
            return Err(MessageError::BufferTooSmall {
                needed: HANDSHAKE_LEN,
                available,
            });
        }
        let mut dst = &mut buf[offset..offset + HANDSHAKE_LEN];
        dst.put_u8(PROTOCOL.len() as u8);
        dst.put_slice(PROTOCOL);
        dst.put_slice(&self.reserved);
        dst.put_slice(&self.info_hash);
        dst.put_slice(self.peer_id.as_bytes());
        Ok(HANDSHAKE_LEN)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL.len() as u8);
        buf.put_slice(PROTOCOL);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(MessageError::Truncated {
                needed: HANDSHAKE_LEN,
                available: data.len(),
            });
        }
        if data[0] as usize != PROTOCOL.len() || &data[1..20] != PROTOCOL {
            return Err(MessageError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let peer_id = PeerId::from_bytes(&data[48..68]).ok_or(MessageError::InvalidHandshake)?;

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

fn set_flag(byte: &mut u8, bit: u8, enabled: bool) {
    if enabled {
        *byte |= bit;
    } else {
        *byte &= !bit;
    }
}
