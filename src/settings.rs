//! Engine and per-torrent configuration.

use std::fmt;
use std::ops::{BitAnd, BitOr};
use std::time::Duration;

use crate::constants::{
    CLIENT_VERSION, DEFAULT_UPLOAD_SLOTS, INACTIVITY_TIMEOUT, KEEPALIVE_INTERVAL,
    MAX_CONNECTIONS_PER_TORRENT, MAX_GLOBAL_CONNECTIONS, MAX_HALF_OPEN, REQUEST_TIMEOUT,
    TICK_INTERVAL,
};

/// Set of stream encryption methods.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncryptionTypes(u8);

impl EncryptionTypes {
    pub const NONE: Self = Self(0);
    pub const PLAIN_TEXT: Self = Self(0x01);
    /// RC4 over the handshake only, plaintext afterwards.
    pub const RC4_HEADER: Self = Self(0x02);
    pub const RC4_FULL: Self = Self(0x04);
    pub const ALL: Self = Self(0x07);

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for EncryptionTypes {
    fn default() -> Self {
        Self::ALL
    }
}

impl BitOr for EncryptionTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitAnd for EncryptionTypes {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Debug for EncryptionTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::PLAIN_TEXT) {
            names.push("PlainText");
        }
        if self.contains(Self::RC4_HEADER) {
            names.push("RC4Header");
        }
        if self.contains(Self::RC4_FULL) {
            names.push("RC4Full");
        }
        if names.is_empty() {
            names.push("None");
        }
        write!(f, "EncryptionTypes({})", names.join("|"))
    }
}

/// Process-wide settings shared by every torrent.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_connections: usize,
    pub max_half_open_connections: usize,
    pub allowed_encryption: EncryptionTypes,
    /// Port advertised in the extended handshake.
    pub listen_port: u16,
    pub supports_fast_peer: bool,
    pub supports_extensions: bool,
    pub request_timeout: Duration,
    pub inactivity_timeout: Duration,
    pub keepalive_interval: Duration,
    pub tick_interval: Duration,
    pub client_version: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_connections: MAX_GLOBAL_CONNECTIONS,
            max_half_open_connections: MAX_HALF_OPEN,
            allowed_encryption: EncryptionTypes::ALL,
            listen_port: 6881,
            supports_fast_peer: true,
            supports_extensions: true,
            request_timeout: REQUEST_TIMEOUT,
            inactivity_timeout: INACTIVITY_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            tick_interval: TICK_INTERVAL,
            client_version: CLIENT_VERSION.to_string(),
        }
    }
}

/// Settings that apply to a single torrent.
#[derive(Debug, Clone)]
pub struct TorrentSettings {
    pub max_connections: usize,
    pub upload_slots: usize,
    /// Bytes per second, 0 for unlimited.
    pub max_upload_rate: u64,
    /// Bytes per second, 0 for unlimited.
    pub max_download_rate: u64,
    /// Reveal pieces one peer at a time when starting with complete data.
    pub initial_seeding: bool,
}

impl Default for TorrentSettings {
    fn default() -> Self {
        Self {
            max_connections: MAX_CONNECTIONS_PER_TORRENT,
            upload_slots: DEFAULT_UPLOAD_SLOTS,
            max_upload_rate: 0,
            max_download_rate: 0,
            initial_seeding: false,
        }
    }
}
