//! Engine-wide tuning constants.
//!
//! Values here are defaults; anything a caller may reasonably want to change is
//! also exposed through [`EngineSettings`](crate::EngineSettings) or
//! [`TorrentSettings`](crate::TorrentSettings).

use std::time::Duration;

// ============================================================================
// Wire protocol
// ============================================================================

/// Protocol string sent in every handshake.
pub const PROTOCOL: &[u8] = b"BitTorrent protocol";

/// Fixed size of an unobfuscated handshake.
pub const HANDSHAKE_LEN: usize = 68;

/// Largest frame accepted from a peer (length prefix excluded).
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Standard block size (16KB)
pub const BLOCK_SIZE: u32 = 16 * 1024;

/// Maximum request length a peer may ask us for (BEP 3 recommends 128KB).
pub const MAX_REQUEST_LENGTH: u32 = 128 * 1024;

/// Client prefix used when generating peer ids.
pub const PEER_ID_PREFIX: &[u8; 8] = b"-PW0100-";

/// Version string advertised in the extended handshake.
pub const CLIENT_VERSION: &str = "peerwire 0.1.0";

// ============================================================================
// Connection limits
// ============================================================================

/// Global connection limit across every torrent.
pub const MAX_GLOBAL_CONNECTIONS: usize = 200;

/// Maximum connection attempts in flight at once.
pub const MAX_HALF_OPEN: usize = 8;

/// Per-torrent connection limit.
pub const MAX_CONNECTIONS_PER_TORRENT: usize = 60;

/// Peers we keep unchoked for uploads.
pub const DEFAULT_UPLOAD_SLOTS: usize = 4;

/// A peer that has been cleaned up this many times is not re-queued.
pub const MAX_CLEANUPS: u32 = 5;

/// Failed connection attempts after which a busy peer is dropped.
pub const MAX_FAILED_CONNECTION_ATTEMPTS: u32 = 5;

/// Corrupt pieces a peer may contribute to before its address is banned.
pub const MAX_HASH_FAILS: u32 = 3;

// ============================================================================
// Requests
// ============================================================================

/// Outstanding block requests per peer before the peer tells us its `reqq`.
pub const DEFAULT_MAX_PENDING_REQUESTS: usize = 16;

/// Upper bound on outstanding requests per peer, whatever `reqq` says.
pub const MAX_PENDING_REQUESTS: usize = 250;

/// The `reqq` we advertise in our extended handshake.
pub const ADVERTISED_REQQ: u32 = 250;

/// Number of allowed fast pieces offered to fast-peer capable peers (BEP-6).
pub const ALLOWED_FAST_SET_SIZE: usize = 10;

/// Pieces revealed to each peer at once while initial seeding.
pub const INITIAL_SEED_OFFERS: usize = 2;

// ============================================================================
// Timeouts
// ============================================================================

/// TCP connection timeout.
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Time allowed for encryption negotiation plus the handshake exchange.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A block request older than this is cancelled and re-picked.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A peer that sends nothing for this long is closed.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(180);

/// Write timeout for a single frame.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Intervals
// ============================================================================

/// Keep-alive sent after this much outbound silence.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(90);

/// Period of the main loop's housekeeping tick.
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Busy peers become eligible for another attempt after this long.
pub const BUSY_RETRY_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Channels
// ============================================================================

/// Capacity of the manager command channel.
pub const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the engine event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;
