//! Message stream encryption.
//!
//! A Diffie-Hellman exchange over the 768-bit MSE prime, followed by an RC4
//! header in which the initiator offers its methods and the responder picks
//! one. The torrent's info hash is the shared secret that ties the two
//! together, so a responder must know every info hash it is willing to
//! serve.
//!
//! An incoming stream that starts with a plain BitTorrent handshake is
//! accepted as plaintext when that is allowed; the bytes read to tell the two
//! apart are handed back as [`Negotiated::initial`].

use bytes::Bytes;
use num_bigint::BigUint;
use rand::Rng as _;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::encryption::{EncryptionNegotiator, Encryptor, NegotiationRole, Negotiated, Rc4};
use super::error::PeerError;
use super::transport::{BoxFuture, BoxedStream};
use crate::constants::PROTOCOL;
use crate::settings::EncryptionTypes;

const PRIME: [u8; KEY_LEN] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2,
    0x21, 0x68, 0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1,
    0x29, 0x02, 0x4E, 0x08, 0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6,
    0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A, 0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD,
    0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B, 0x30, 0x2B, 0x0A, 0x6D,
    0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51, 0xC2, 0x45,
    0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
    0xA6, 0x3A, 0x36, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00, 0x09, 0x05, 0x63,
];
const GENERATOR: u32 = 2;

/// Size of a public key and of the shared secret.
pub const KEY_LEN: usize = 96;

/// Longest random padding either side may send.
pub const MAX_PADDING: usize = 512;

/// Keystream bytes thrown away before the first use of an RC4 key.
const RC4_DISCARD: usize = 1024;

/// Verification constant; arrives encrypted and marks the end of padding.
const VC: [u8; 8] = [0; 8];

/// `crypto_provide` / `crypto_select` bits.
const CRYPTO_PLAIN: u32 = 0x01;
const CRYPTO_RC4: u32 = 0x02;

/// Encrypted header up to and including `len(PadC)`.
const HEADER_LEN: usize = VC.len() + 4 + 2;

fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Left-pads `value` to a full key. Values are reduced modulo the prime and
/// always fit.
fn to_key(value: &BigUint) -> [u8; KEY_LEN] {
    let bytes = value.to_bytes_be();
    let mut key = [0u8; KEY_LEN];
    let start = KEY_LEN.saturating_sub(bytes.len());
    key[start..].copy_from_slice(&bytes[bytes.len().saturating_sub(KEY_LEN)..]);
    key
}

fn padding() -> Vec<u8> {
    let mut rng = rand::rng();
    let mut pad = vec![0u8; rng.random_range(0..=MAX_PADDING)];
    rng.fill(&mut pad[..]);
    pad
}

/// One side's Diffie-Hellman key pair.
pub(crate) struct KeyPair {
    private: BigUint,
    pub(crate) public: [u8; KEY_LEN],
}

impl KeyPair {
    pub(crate) fn generate() -> Self {
        let mut secret = [0u8; 20];
        rand::rng().fill(&mut secret);
        let private = BigUint::from_bytes_be(&secret);
        let public = BigUint::from(GENERATOR).modpow(&private, &BigUint::from_bytes_be(&PRIME));
        Self {
            private,
            public: to_key(&public),
        }
    }

    pub(crate) fn shared_secret(&self, remote: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        let remote = BigUint::from_bytes_be(remote);
        to_key(&remote.modpow(&self.private, &BigUint::from_bytes_be(&PRIME)))
    }
}

/// `HASH('req2', SKEY) xor HASH('req3', S)`.
fn obfuscated_hash(info_hash: &[u8; 20], secret: &[u8]) -> [u8; 20] {
    let req2 = sha1(&[b"req2", info_hash]);
    let req3 = sha1(&[b"req3", secret]);
    let mut out = [0u8; 20];
    for (o, (a, b)) in out.iter_mut().zip(req2.iter().zip(req3.iter())) {
        *o = a ^ b;
    }
    out
}

/// The initiator encrypts with `keyA`, the responder with `keyB`.
fn stream_key(name: &[u8], secret: &[u8], info_hash: &[u8; 20]) -> Rc4 {
    Rc4::with_discard(&sha1(&[name, secret, info_hash]), RC4_DISCARD)
}

/// Methods we can offer inside the encrypted header.
fn crypto_bits(allowed: EncryptionTypes) -> u32 {
    let mut bits = 0;
    if allowed.contains(EncryptionTypes::RC4_FULL) {
        bits |= CRYPTO_RC4;
    }
    if allowed.contains(EncryptionTypes::RC4_HEADER) {
        bits |= CRYPTO_PLAIN;
    }
    bits
}

/// Reads until `marker` has gone past, allowing up to `max_skip` bytes of
/// padding in front of it. Reads one byte at a time so nothing after the
/// marker is consumed.
async fn synchronise(
    stream: &mut BoxedStream,
    marker: &[u8],
    max_skip: usize,
) -> Result<(), PeerError> {
    let mut window = vec![0u8; marker.len()];
    stream.read_exact(&mut window).await?;
    let mut skipped = 0;
    while window != marker {
        if skipped == max_skip {
            return Err(PeerError::Encryption(
                "synchronisation marker not found".to_string(),
            ));
        }
        window.rotate_left(1);
        let last = window.len() - 1;
        stream.read_exact(&mut window[last..]).await?;
        skipped += 1;
    }
    Ok(())
}

async fn read_decrypted(
    stream: &mut BoxedStream,
    decryptor: &mut Rc4,
    len: usize,
) -> Result<Vec<u8>, PeerError> {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    decryptor.apply(&mut buf);
    Ok(buf)
}

fn finish(select: u32, encryptor: Rc4, decryptor: Rc4, initial: Bytes) -> Negotiated {
    if select == CRYPTO_RC4 {
        Negotiated {
            kind: EncryptionTypes::RC4_FULL,
            encryptor: Encryptor::Rc4(Box::new(encryptor)),
            decryptor: Encryptor::Rc4(Box::new(decryptor)),
            initial,
        }
    } else {
        Negotiated {
            kind: EncryptionTypes::RC4_HEADER,
            encryptor: Encryptor::PlainText,
            decryptor: Encryptor::PlainText,
            initial,
        }
    }
}

/// Runs the initiator's side for `info_hash`.
///
/// When `allowed` has no RC4 method the stream is used as it is.
pub async fn initiate(
    mut stream: BoxedStream,
    info_hash: [u8; 20],
    allowed: EncryptionTypes,
) -> Result<(BoxedStream, Negotiated), PeerError> {
    let provide = crypto_bits(allowed);
    if provide == 0 {
        return if allowed.contains(EncryptionTypes::PLAIN_TEXT) {
            Ok((stream, Negotiated::plain_text()))
        } else {
            Err(PeerError::EncryptionDisabled)
        };
    }

    let keys = KeyPair::generate();
    let mut out = keys.public.to_vec();
    out.extend_from_slice(&padding());
    stream.write_all(&out).await?;
    stream.flush().await?;

    let mut remote = [0u8; KEY_LEN];
    stream.read_exact(&mut remote).await?;
    let secret = keys.shared_secret(&remote);
    let mut encryptor = stream_key(b"keyA", &secret, &info_hash);
    let mut decryptor = stream_key(b"keyB", &secret, &info_hash);

    let mut header = Vec::with_capacity(HEADER_LEN + 2);
    header.extend_from_slice(&VC);
    header.extend_from_slice(&provide.to_be_bytes());
    // No PadC and no initial payload; the handshake follows on its own.
    header.extend_from_slice(&0u16.to_be_bytes());
    header.extend_from_slice(&0u16.to_be_bytes());
    encryptor.apply(&mut header);

    let mut out = Vec::with_capacity(40 + header.len());
    out.extend_from_slice(&sha1(&[b"req1", &secret]));
    out.extend_from_slice(&obfuscated_hash(&info_hash, &secret));
    out.extend_from_slice(&header);
    stream.write_all(&out).await?;
    stream.flush().await?;

    let mut marker = VC;
    decryptor.apply(&mut marker);
    synchronise(&mut stream, &marker, MAX_PADDING).await?;

    let reply = read_decrypted(&mut stream, &mut decryptor, 6).await?;
    let select = u32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]);
    let pad_len = u16::from_be_bytes([reply[4], reply[5]]) as usize;
    if pad_len > MAX_PADDING {
        return Err(PeerError::Encryption(format!("padding of {} bytes", pad_len)));
    }
    read_decrypted(&mut stream, &mut decryptor, pad_len).await?;

    if select.count_ones() != 1 || provide & select == 0 {
        return Err(PeerError::Encryption(format!(
            "peer selected method {:#x}, offered {:#x}",
            select, provide
        )));
    }
    Ok((stream, finish(select, encryptor, decryptor, Bytes::new())))
}

/// Runs the responder's side, accepting any of `info_hashes` as the shared
/// secret.
pub async fn respond(
    mut stream: BoxedStream,
    info_hashes: &[[u8; 20]],
    allowed: EncryptionTypes,
) -> Result<(BoxedStream, Negotiated), PeerError> {
    let mut first = [0u8; 20];
    stream.read_exact(&mut first).await?;
    if first[0] as usize == PROTOCOL.len() && first[1..] == *PROTOCOL {
        if !allowed.contains(EncryptionTypes::PLAIN_TEXT) {
            return Err(PeerError::EncryptionDisabled);
        }
        let mut negotiated = Negotiated::plain_text();
        negotiated.initial = Bytes::copy_from_slice(&first);
        return Ok((stream, negotiated));
    }

    let ours = crypto_bits(allowed);
    if ours == 0 {
        return Err(PeerError::EncryptionDisabled);
    }

    let mut remote = [0u8; KEY_LEN];
    remote[..first.len()].copy_from_slice(&first);
    stream.read_exact(&mut remote[first.len()..]).await?;
    let keys = KeyPair::generate();
    let secret = keys.shared_secret(&remote);

    let mut out = keys.public.to_vec();
    out.extend_from_slice(&padding());
    stream.write_all(&out).await?;
    stream.flush().await?;

    synchronise(&mut stream, &sha1(&[b"req1", &secret]), MAX_PADDING).await?;
    let mut obfuscated = [0u8; 20];
    stream.read_exact(&mut obfuscated).await?;
    let info_hash = info_hashes
        .iter()
        .find(|hash| obfuscated_hash(hash, &secret) == obfuscated)
        .copied()
        .ok_or(PeerError::UnknownTorrent)?;
    let mut decryptor = stream_key(b"keyA", &secret, &info_hash);
    let mut encryptor = stream_key(b"keyB", &secret, &info_hash);

    let header = read_decrypted(&mut stream, &mut decryptor, HEADER_LEN).await?;
    if header[..VC.len()] != VC {
        return Err(PeerError::Encryption("bad verification constant".to_string()));
    }
    let provide = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    let pad_len = u16::from_be_bytes([header[12], header[13]]) as usize;
    if pad_len > MAX_PADDING {
        return Err(PeerError::Encryption(format!("padding of {} bytes", pad_len)));
    }
    read_decrypted(&mut stream, &mut decryptor, pad_len).await?;
    let ia_len = read_decrypted(&mut stream, &mut decryptor, 2).await?;
    let ia_len = u16::from_be_bytes([ia_len[0], ia_len[1]]) as usize;
    let initial = read_decrypted(&mut stream, &mut decryptor, ia_len).await?;

    let common = provide & ours;
    let select = if common & CRYPTO_RC4 != 0 {
        CRYPTO_RC4
    } else if common & CRYPTO_PLAIN != 0 {
        CRYPTO_PLAIN
    } else {
        return Err(PeerError::Encryption(format!(
            "peer offered {:#x}, we allow {:#x}",
            provide, ours
        )));
    };

    let mut reply = Vec::with_capacity(HEADER_LEN);
    reply.extend_from_slice(&VC);
    reply.extend_from_slice(&select.to_be_bytes());
    reply.extend_from_slice(&0u16.to_be_bytes());
    encryptor.apply(&mut reply);
    stream.write_all(&reply).await?;
    stream.flush().await?;

    Ok((stream, finish(select, encryptor, decryptor, Bytes::from(initial))))
}

/// Negotiates message stream encryption, falling back to plaintext where
/// both the settings and the remote allow it.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamEncryptionNegotiator;

impl EncryptionNegotiator for StreamEncryptionNegotiator {
    fn negotiate(
        &self,
        stream: BoxedStream,
        role: NegotiationRole,
        allowed: EncryptionTypes,
    ) -> BoxFuture<'static, Result<(BoxedStream, Negotiated), PeerError>> {
        Box::pin(async move {
            match role {
                NegotiationRole::Outgoing { info_hash } => {
                    initiate(stream, info_hash, allowed).await
                }
                NegotiationRole::Incoming { info_hashes } => {
                    respond(stream, &info_hashes, allowed).await
                }
            }
        })
    }
}
