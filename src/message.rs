//! Peer wire message codec (BEP-3, BEP-6, BEP-10).
//!
//! Every message after the handshake is framed as
//! `length (u32, big-endian) | id (u8) | payload`, where a zero length is a
//! keep-alive. [`Message::encode_into`] writes straight into a caller-owned
//! buffer so block payloads are copied exactly once on the way out.
//!
//! Decoding is context dependent: the Bitfield length comes from the torrent's
//! piece count and extended sub-message ids are resolved against the
//! [`ExtensionRegistry`] in the [`DecodeContext`].

mod error;
mod extension;
mod handshake;

use bytes::{Buf, BufMut, Bytes};

use crate::bitfield::Bitfield;

pub use error::MessageError;
pub use extension::{
    ExtendedHandshake, ExtensionMessage, ExtensionRegistry, MetadataMessage, PeerExchange,
    PexFlags, RemoteExtensions, HANDSHAKE_ID, LT_CHAT, UT_METADATA, UT_PEX,
};
pub use handshake::Handshake;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    // Fast extension (BEP-6)
    Suggest = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // Extension protocol (BEP-10)
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            13 => Ok(MessageId::Suggest),
            14 => Ok(MessageId::HaveAll),
            15 => Ok(MessageId::HaveNone),
            16 => Ok(MessageId::Reject),
            17 => Ok(MessageId::AllowedFast),
            20 => Ok(MessageId::Extended),
            _ => Err(MessageError::UnknownMessageId(value)),
        }
    }
}

/// What the decoder needs to know about the connection a frame came from.
#[derive(Debug, Clone, Copy)]
pub struct DecodeContext<'a> {
    /// Piece count of the owning torrent; `None` sizes a Bitfield from its
    /// payload.
    pub piece_count: Option<usize>,
    pub extensions: &'a ExtensionRegistry,
}

impl<'a> DecodeContext<'a> {
    pub fn new(piece_count: Option<usize>, extensions: &'a ExtensionRegistry) -> Self {
        Self {
            piece_count,
            extensions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece: u32 },
    Bitfield(Bitfield),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    // Fast extension
    Suggest { piece: u32 },
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast { piece: u32 },
    /// `id` is the sub-message id as it appears on the wire.
    Extended { id: u8, message: ExtensionMessage },
}

impl Message {
    /// Addresses `message` with the id the remote peer advertised for it.
    ///
    /// Returns `None` when the remote does not support the extension.
    pub fn extended(remote: &RemoteExtensions, message: ExtensionMessage) -> Option<Self> {
        let id = match &message {
            ExtensionMessage::Handshake(_) => HANDSHAKE_ID,
            other => remote.id_of(other.name()?)?,
        };
        Some(Message::Extended { id, message })
    }

    pub fn id(&self) -> Option<MessageId> {
        let id = match self {
            Message::KeepAlive => return None,
            Message::Choke => MessageId::Choke,
            Message::Unchoke => MessageId::Unchoke,
            Message::Interested => MessageId::Interested,
            Message::NotInterested => MessageId::NotInterested,
            Message::Have { .. } => MessageId::Have,
            Message::Bitfield(_) => MessageId::Bitfield,
            Message::Request { .. } => MessageId::Request,
            Message::Piece { .. } => MessageId::Piece,
            Message::Cancel { .. } => MessageId::Cancel,
            Message::Port(_) => MessageId::Port,
            Message::Suggest { .. } => MessageId::Suggest,
            Message::HaveAll => MessageId::HaveAll,
            Message::HaveNone => MessageId::HaveNone,
            Message::Reject { .. } => MessageId::Reject,
            Message::AllowedFast { .. } => MessageId::AllowedFast,
            Message::Extended { .. } => MessageId::Extended,
        };
        Some(id)
    }

    /// Encoded size including the length prefix.
    pub fn byte_len(&self) -> usize {
        LENGTH_PREFIX
            + match self {
                Message::KeepAlive => 0,
                Message::Choke
                | Message::Unchoke
                | Message::Interested
                | Message::NotInterested
                | Message::HaveAll
                | Message::HaveNone => 1,
                Message::Have { .. } | Message::Suggest { .. } | Message::AllowedFast { .. } => 5,
                Message::Bitfield(bits) => 1 + bits.length_in_bytes(),
                Message::Request { .. } | Message::Cancel { .. } | Message::Reject { .. } => 13,
                Message::Piece { data, .. } => 9 + data.len(),
                Message::Port(_) => 3,
                Message::Extended { message, .. } => 2 + message.payload_len(),
            }
    }

    /// Writes the frame at `offset` and returns the number of bytes written.
    ///
    /// Nothing outside `offset..offset + written` is touched, and nothing at
    /// all is written when an error is returned.
    pub fn encode_into(&self, buf: &mut [u8], offset: usize) -> Result<usize, MessageError> {
        let extension_payload = match self {
            Message::Extended { message, .. } => Some(message.encode_payload()?),
            _ => None,
        };
        let len = match &extension_payload {
            Some(payload) => LENGTH_PREFIX + 2 + payload.len(),
            None => self.byte_len(),
        };

        let available = buf.len().saturating_sub(offset);
        if available < len {
            return Err(MessageError::BufferTooSmall {
                needed: len,
                available,
            });
        }

        let mut dst = &mut buf[offset..offset + len];
        dst.put_u32((len - LENGTH_PREFIX) as u32);
        if let Some(id) = self.id() {
            dst.put_u8(id as u8);
        }

        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested
            | Message::HaveAll
            | Message::HaveNone => {}
            Message::Have { piece }
            | Message::Suggest { piece }
            | Message::AllowedFast { piece } => dst.put_u32(*piece),
            Message::Bitfield(bits) => dst.put_slice(bits.as_bytes()),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            }
            | Message::Reject {
                index,
                begin,
                length,
            } => {
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_u32(*length);
            }
            Message::Piece { index, begin, data } => {
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_slice(data);
            }
            Message::Port(port) => dst.put_u16(*port),
            Message::Extended { id, .. } => {
                dst.put_u8(*id);
                if let Some(payload) = &extension_payload {
                    dst.put_slice(payload);
                }
            }
        }

        Ok(len)
    }

    pub fn encode(&self) -> Result<Bytes, MessageError> {
        let mut buf = vec![0u8; self.byte_len()];
        let written = self.encode_into(&mut buf, 0)?;
        buf.truncate(written);
        Ok(Bytes::from(buf))
    }

    /// Decodes the frame at the start of `buf`. Bytes past the frame are
    /// ignored.
    pub fn decode(buf: &Bytes, ctx: &DecodeContext<'_>) -> Result<Self, MessageError> {
        Self::decode_at(buf, 0, buf.len(), ctx)
    }

    /// Decodes the frame starting at `offset`, looking at no more than
    /// `count` bytes. The returned payloads share `buf`'s storage.
    pub fn decode_at(
        buf: &Bytes,
        offset: usize,
        count: usize,
        ctx: &DecodeContext<'_>,
    ) -> Result<Self, MessageError> {
        let end = offset.saturating_add(count);
        if end > buf.len() {
            return Err(MessageError::Truncated {
                needed: end,
                available: buf.len(),
            });
        }
        Self::decode_frame(&buf.slice(offset..end), ctx)
    }

    fn decode_frame(buf: &Bytes, ctx: &DecodeContext<'_>) -> Result<Self, MessageError> {
        if buf.len() < LENGTH_PREFIX {
            return Err(MessageError::Truncated {
                needed: LENGTH_PREFIX,
                available: buf.len(),
            });
        }
        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let frame_end = LENGTH_PREFIX + declared;
        if buf.len() < frame_end {
            return Err(MessageError::Truncated {
                needed: frame_end,
                available: buf.len(),
            });
        }
        if declared == 0 {
            return Ok(Message::KeepAlive);
        }

        let raw_id = buf[LENGTH_PREFIX];
        let id = MessageId::try_from(raw_id)?;
        let mut payload = buf.slice(LENGTH_PREFIX + 1..frame_end);
        let expect = |expected: usize| expect_len(raw_id, declared - 1, expected);

        let message = match id {
            MessageId::Choke => expect(0).map(|_| Message::Choke)?,
            MessageId::Unchoke => expect(0).map(|_| Message::Unchoke)?,
            MessageId::Interested => expect(0).map(|_| Message::Interested)?,
            MessageId::NotInterested => expect(0).map(|_| Message::NotInterested)?,
            MessageId::HaveAll => expect(0).map(|_| Message::HaveAll)?,
            MessageId::HaveNone => expect(0).map(|_| Message::HaveNone)?,
            MessageId::Have => {
                expect(4)?;
                Message::Have {
                    piece: payload.get_u32(),
                }
            }
            MessageId::Suggest => {
                expect(4)?;
                Message::Suggest {
                    piece: payload.get_u32(),
                }
            }
            MessageId::AllowedFast => {
                expect(4)?;
                Message::AllowedFast {
                    piece: payload.get_u32(),
                }
            }
            MessageId::Bitfield => {
                let piece_count = ctx.piece_count.unwrap_or(payload.len() * 8);
                Message::Bitfield(Bitfield::from_bytes(&payload, piece_count))
            }
            MessageId::Request | MessageId::Cancel | MessageId::Reject => {
                expect(12)?;
                let index = payload.get_u32();
                let begin = payload.get_u32();
                let length = payload.get_u32();
                match id {
                    MessageId::Request => Message::Request {
                        index,
                        begin,
                        length,
                    },
                    MessageId::Cancel => Message::Cancel {
                        index,
                        begin,
                        length,
                    },
                    _ => Message::Reject {
                        index,
                        begin,
                        length,
                    },
                }
            }
            MessageId::Piece => {
                if payload.len() < 8 {
                    return Err(MessageError::LengthMismatch {
                        id: raw_id,
                        declared: payload.len(),
                        expected: 8,
                    });
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: payload,
                }
            }
            MessageId::Port => {
                expect(2)?;
                Message::Port(payload.get_u16())
            }
            MessageId::Extended => {
                if payload.is_empty() {
                    return Err(MessageError::LengthMismatch {
                        id: raw_id,
                        declared: 0,
                        expected: 1,
                    });
                }
                let ext_id = payload.get_u8();
                let message = ExtensionMessage::decode(ext_id, payload, ctx.extensions)?;
                Message::Extended { id: ext_id, message }
            }
        };

        Ok(message)
    }
}

fn expect_len(id: u8, declared: usize, expected: usize) -> Result<(), MessageError> {
    if declared == expected {
        Ok(())
    } else {
        Err(MessageError::LengthMismatch {
            id,
            declared,
            expected,
        })
    }
}
