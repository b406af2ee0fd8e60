//! Extension protocol (BEP-10) sub-messages.
//!
//! Sub-message ids are negotiated per connection: each side advertises a
//! name-to-id table in its extended handshake. Incoming sub-messages carry the
//! id from *our* table ([`ExtensionRegistry`]); outgoing ones must use the id
//! the remote advertised ([`RemoteExtensions`]).

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use super::error::MessageError;
use crate::peer::{decode_compact, encode_compact, COMPACT_V4_LEN};

/// Sub-message id reserved for the extended handshake.
pub const HANDSHAKE_ID: u8 = 0;

pub const UT_PEX: &str = "ut_pex";
pub const LT_CHAT: &str = "LT_chat";
pub const UT_METADATA: &str = "ut_metadata";

const MAX_BENCODE_DEPTH: usize = 32;

/// Our side of the negotiation: which id each supported extension answers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionRegistry {
    entries: Vec<(String, u8)>,
}

impl ExtensionRegistry {
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Registers `name` under `id`, replacing any earlier mapping of either.
    pub fn register(&mut self, name: impl Into<String>, id: u8) {
        let name = name.into();
        self.entries.retain(|(n, i)| *n != name && *i != id);
        self.entries.push((name, id));
    }

    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }

    pub fn name_of(&self, id: u8) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, i)| *i == id)
            .map(|(n, _)| n.as_str())
    }

    /// The `m` dictionary for our extended handshake.
    pub fn handshake_map(&self) -> BTreeMap<String, i64> {
        self.entries
            .iter()
            .map(|(name, id)| (name.clone(), i64::from(*id)))
            .collect()
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(UT_PEX, 1);
        registry.register(LT_CHAT, 2);
        registry.register(UT_METADATA, 3);
        registry
    }
}

/// The remote side of the negotiation, learned from its extended handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteExtensions(BTreeMap<String, u8>);

impl RemoteExtensions {
    /// Applies an extended handshake. Later handshakes may add or disable
    /// (id 0) individual extensions.
    pub fn update(&mut self, handshake: &ExtendedHandshake) {
        for (name, id) in &handshake.extensions {
            match u8::try_from(*id) {
                Ok(0) | Err(_) => {
                    self.0.remove(name);
                }
                Ok(id) => {
                    self.0.insert(name.clone(), id);
                }
            }
        }
    }

    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.0.get(name).copied()
    }

    pub fn supports(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }
}

/// Payload of sub-message 0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedHandshake {
    #[serde(rename = "m", default)]
    pub extensions: BTreeMap<String, i64>,
    #[serde(rename = "p", default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reqq: Option<u32>,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_size: Option<u64>,
}

impl ExtendedHandshake {
    pub fn supports(&self, name: &str) -> bool {
        self.extensions.get(name).is_some_and(|id| *id > 0)
    }
}

/// Flags attached to each added PEX peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PexFlags(pub u8);

impl PexFlags {
    pub const PREFERS_ENCRYPTION: u8 = 0x01;
    pub const SEED: u8 = 0x02;
    pub const CONNECTABLE: u8 = 0x10;

    pub fn prefers_encryption(self) -> bool {
        self.0 & Self::PREFERS_ENCRYPTION != 0
    }

    pub fn is_seed(self) -> bool {
        self.0 & Self::SEED != 0
    }

    pub fn is_connectable(self) -> bool {
        self.0 & Self::CONNECTABLE != 0
    }
}

/// ut_pex: peers the sender connected to or dropped since its last message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerExchange {
    pub added: Vec<(SocketAddr, PexFlags)>,
    pub dropped: Vec<SocketAddr>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PexPayload {
    #[serde(default)]
    added: ByteBuf,
    #[serde(rename = "added.f", default)]
    added_flags: ByteBuf,
    #[serde(default)]
    dropped: ByteBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatPayload {
    msg: String,
}

/// ut_metadata (BEP-9) sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: u32 },
    Data { piece: u32, total_size: u64, data: Bytes },
    Reject { piece: u32 },
}

#[derive(Debug, Serialize, Deserialize)]
struct MetadataHeader {
    msg_type: u8,
    piece: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_size: Option<u64>,
}

const METADATA_REQUEST: u8 = 0;
const METADATA_DATA: u8 = 1;
const METADATA_REJECT: u8 = 2;

/// A decoded extension sub-message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionMessage {
    Handshake(ExtendedHandshake),
    PeerExchange(PeerExchange),
    Chat(String),
    Metadata(MetadataMessage),
    /// An id we never registered; the payload is kept as-is.
    Unknown(Bytes),
}

impl ExtensionMessage {
    /// Registry name of the sub-message, `None` for the handshake and
    /// unknown payloads.
    pub fn name(&self) -> Option<&'static str> {
        match self {
            ExtensionMessage::Handshake(_) | ExtensionMessage::Unknown(_) => None,
            ExtensionMessage::PeerExchange(_) => Some(UT_PEX),
            ExtensionMessage::Chat(_) => Some(LT_CHAT),
            ExtensionMessage::Metadata(_) => Some(UT_METADATA),
        }
    }

    /// Encodes the payload that follows the sub-message id byte.
    pub fn encode_payload(&self) -> Result<Vec<u8>, MessageError> {
        let payload = match self {
            ExtensionMessage::Handshake(handshake) => serde_bencode::to_bytes(handshake)?,
            ExtensionMessage::PeerExchange(pex) => {
                let added = encode_compact(pex.added.iter().map(|(addr, _)| addr));
                let added_flags = pex
                    .added
                    .iter()
                    .filter(|(addr, _)| addr.is_ipv4())
                    .map(|(_, flags)| flags.0)
                    .collect::<Vec<_>>();
                let dropped = encode_compact(&pex.dropped);
                serde_bencode::to_bytes(&PexPayload {
                    added: ByteBuf::from(added.to_vec()),
                    added_flags: ByteBuf::from(added_flags),
                    dropped: ByteBuf::from(dropped.to_vec()),
                })?
            }
            ExtensionMessage::Chat(msg) => {
                serde_bencode::to_bytes(&ChatPayload { msg: msg.clone() })?
            }
            ExtensionMessage::Metadata(metadata) => {
                let (header, data) = match metadata {
                    MetadataMessage::Request { piece } => (
                        MetadataHeader {
                            msg_type: METADATA_REQUEST,
                            piece: *piece,
                            total_size: None,
                        },
                        None,
                    ),
                    MetadataMessage::Data {
                        piece,
                        total_size,
                        data,
                    } => (
                        MetadataHeader {
                            msg_type: METADATA_DATA,
                            piece: *piece,
                            total_size: Some(*total_size),
                        },
                        Some(data),
                    ),
                    MetadataMessage::Reject { piece } => (
                        MetadataHeader {
                            msg_type: METADATA_REJECT,
                            piece: *piece,
                            total_size: None,
                        },
                        None,
                    ),
                };
                let mut payload = serde_bencode::to_bytes(&header)?;
                if let Some(data) = data {
                    payload.extend_from_slice(data);
                }
                payload
            }
            ExtensionMessage::Unknown(payload) => payload.to_vec(),
        };
        Ok(payload)
    }

    /// Length of [`encode_payload`](Self::encode_payload)'s output. Only
    /// the handshake and the metadata header are actually encoded to
    /// measure them.
    pub fn payload_len(&self) -> usize {
        match self {
            ExtensionMessage::Handshake(_) => self.encode_payload().map_or(0, |p| p.len()),
            ExtensionMessage::PeerExchange(pex) => {
                let v4 = |addr: &SocketAddr| addr.is_ipv4();
                let added = pex.added.iter().filter(|(addr, _)| v4(addr)).count();
                let dropped = pex.dropped.iter().filter(|addr| v4(addr)).count();
                2 + bencoded_str_len("added".len())
                    + bencoded_str_len(added * COMPACT_V4_LEN)
                    + bencoded_str_len("added.f".len())
                    + bencoded_str_len(added)
                    + bencoded_str_len("dropped".len())
                    + bencoded_str_len(dropped * COMPACT_V4_LEN)
            }
            ExtensionMessage::Chat(msg) => {
                2 + bencoded_str_len("msg".len()) + bencoded_str_len(msg.len())
            }
            ExtensionMessage::Metadata(metadata) => {
                let (msg_type, piece, total_size, data_len) = match metadata {
                    MetadataMessage::Request { piece } => (METADATA_REQUEST, *piece, None, 0),
                    MetadataMessage::Data {
                        piece,
                        total_size,
                        data,
                    } => (METADATA_DATA, *piece, Some(*total_size), data.len()),
                    MetadataMessage::Reject { piece } => (METADATA_REJECT, *piece, None, 0),
                };
                let header = MetadataHeader {
                    msg_type,
                    piece,
                    total_size,
                };
                serde_bencode::to_bytes(&header).map_or(0, |h| h.len()) + data_len
            }
            ExtensionMessage::Unknown(payload) => payload.len(),
        }
    }

    /// Decodes the payload of sub-message `id`, resolved against our registry.
    pub fn decode(id: u8, body: Bytes, registry: &ExtensionRegistry) -> Result<Self, MessageError> {
        if id == HANDSHAKE_ID {
            return Ok(ExtensionMessage::Handshake(serde_bencode::from_bytes(&body)?));
        }

        match registry.name_of(id) {
            Some(UT_PEX) => {
                let payload: PexPayload = serde_bencode::from_bytes(&body)?;
                let added = decode_compact(&payload.added)
                    .into_iter()
                    .enumerate()
                    .map(|(i, addr)| {
                        let flags = payload.added_flags.get(i).copied().unwrap_or(0);
                        (addr, PexFlags(flags))
                    })
                    .collect();
                Ok(ExtensionMessage::PeerExchange(PeerExchange {
                    added,
                    dropped: decode_compact(&payload.dropped),
                }))
            }
            Some(LT_CHAT) => {
                let payload: ChatPayload = serde_bencode::from_bytes(&body)?;
                Ok(ExtensionMessage::Chat(payload.msg))
            }
            Some(UT_METADATA) => {
                let dict_len = bencode_value_len(&body, 0).ok_or_else(|| {
                    MessageError::InvalidPayload("unterminated metadata dictionary".into())
                })?;
                let header: MetadataHeader = serde_bencode::from_bytes(&body[..dict_len])?;
                let message = match header.msg_type {
                    METADATA_REQUEST => MetadataMessage::Request {
                        piece: header.piece,
                    },
                    METADATA_DATA => MetadataMessage::Data {
                        piece: header.piece,
                        total_size: header.total_size.ok_or_else(|| {
                            MessageError::InvalidPayload("metadata data without total_size".into())
                        })?,
                        data: body.slice(dict_len..),
                    },
                    METADATA_REJECT => MetadataMessage::Reject {
                        piece: header.piece,
                    },
                    other => {
                        return Err(MessageError::InvalidPayload(format!(
                            "unknown metadata msg_type {}",
                            other
                        )))
                    }
                };
                Ok(ExtensionMessage::Metadata(message))
            }
            _ => Ok(ExtensionMessage::Unknown(body)),
        }
    }
}

/// Size of a bencoded byte string with a `len` byte body.
fn bencoded_str_len(len: usize) -> usize {
    len.to_string().len() + 1 + len
}

/// Length of the bencoded value at the start of `data`.
fn bencode_value_len(data: &[u8], depth: usize) -> Option<usize> {
    if depth > MAX_BENCODE_DEPTH {
        return None;
    }
    match *data.first()? {
        b'i' => data.iter().position(|&b| b == b'e').map(|p| p + 1),
        b'l' | b'd' => {
            let mut pos = 1;
            loop {
                if *data.get(pos)? == b'e' {
                    return Some(pos + 1);
                }
                pos += bencode_value_len(&data[pos..], depth + 1)?;
            }
        }
        b'0'..=b'9' => {
            let colon = data.iter().position(|&b| b == b':')?;
            let len: usize = std::str::from_utf8(&data[..colon]).ok()?.parse().ok()?;
            let end = colon.checked_add(1)?.checked_add(len)?;
            (end <= data.len()).then_some(end)
        }
        _ => None,
    }
}
