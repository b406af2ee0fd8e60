use std::fmt;

use bytes::Bytes;

use super::error::PeerError;
use super::transport::{BoxFuture, BoxedStream};
use crate::settings::EncryptionTypes;

/// RC4 keystream, as used by message stream encryption.
#[derive(Clone)]
pub struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    pub fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (i, v) in s.iter_mut().enumerate() {
            *v = i as u8;
        }
        if !key.is_empty() {
            let mut j = 0u8;
            for i in 0..256 {
                j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
                s.swap(i, j as usize);
            }
        }
        Self { s, i: 0, j: 0 }
    }

    /// A keystream with its first `discard` bytes thrown away. Stream
    /// encryption discards 1024.
    pub fn with_discard(key: &[u8], discard: usize) -> Self {
        let mut rc4 = Self::new(key);
        let mut scratch = vec![0u8; discard];
        rc4.apply(&mut scratch);
        rc4
    }

    /// Encrypts or decrypts `data` in place.
    pub fn apply(&mut self, data: &mut [u8]) {
        for byte in data {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let k = self.s[self.s[self.i as usize].wrapping_add(self.s[self.j as usize]) as usize];
            *byte ^= k;
        }
    }
}

impl fmt::Debug for Rc4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rc4")
    }
}

/// One direction of a connection's cipher.
#[derive(Debug, Clone, Default)]
pub enum Encryptor {
    #[default]
    PlainText,
    Rc4(Box<Rc4>),
}

impl Encryptor {
    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            Encryptor::PlainText => {}
            Encryptor::Rc4(rc4) => rc4.apply(data),
        }
    }

    pub fn is_plain_text(&self) -> bool {
        matches!(self, Encryptor::PlainText)
    }
}

/// Outcome of encryption negotiation.
#[derive(Debug)]
pub struct Negotiated {
    /// The single method both sides agreed on.
    pub kind: EncryptionTypes,
    pub encryptor: Encryptor,
    pub decryptor: Encryptor,
    /// Plaintext the negotiation already read past, to be consumed before
    /// anything else on the stream.
    pub initial: Bytes,
}

impl Negotiated {
    pub fn plain_text() -> Self {
        Self {
            kind: EncryptionTypes::PLAIN_TEXT,
            encryptor: Encryptor::PlainText,
            decryptor: Encryptor::PlainText,
            initial: Bytes::new(),
        }
    }
}

/// Which end of the connection we are, and what the shared secret may be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationRole {
    /// We dialled the peer for this torrent.
    Outgoing { info_hash: [u8; 20] },
    /// The peer dialled us; it may be after any of these torrents.
    Incoming { info_hashes: Vec<[u8; 20]> },
}

/// Picks a stream encryption method before the BitTorrent handshake.
///
/// `allowed` is the intersection of the engine's and the peer's allowed
/// sets. The stream is handed back together with the ciphers to use on it.
pub trait EncryptionNegotiator: Send + Sync {
    fn negotiate(
        &self,
        stream: BoxedStream,
        role: NegotiationRole,
        allowed: EncryptionTypes,
    ) -> BoxFuture<'static, Result<(BoxedStream, Negotiated), PeerError>>;
}

/// Accepts plaintext connections only.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainTextNegotiator;

impl EncryptionNegotiator for PlainTextNegotiator {
    fn negotiate(
        &self,
        stream: BoxedStream,
        _role: NegotiationRole,
        allowed: EncryptionTypes,
    ) -> BoxFuture<'static, Result<(BoxedStream, Negotiated), PeerError>> {
        Box::pin(async move {
            if allowed.contains(EncryptionTypes::PLAIN_TEXT) {
                Ok((stream, Negotiated::plain_text()))
            } else {
                Err(PeerError::EncryptionDisabled)
            }
        })
    }
}

/// Checks a negotiated method against what we allow.
///
/// A disallowed method is struck from the peer's set so the next attempt
/// only tries what remains.
pub fn check_negotiated(
    engine_allowed: EncryptionTypes,
    peer_allowed: &mut EncryptionTypes,
    kind: EncryptionTypes,
) -> Result<(), PeerError> {
    if (engine_allowed & *peer_allowed).contains(kind) {
        return Ok(());
    }
    peer_allowed.remove(kind);
    Err(PeerError::Encryption(format!(
        "negotiated {:?}, which is not allowed",
        kind
    )))
}
