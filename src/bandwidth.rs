//! Transfer rate limiting.
//!
//! Each torrent owns a [`TransferLimits`] pair. Connection writers take
//! upload tokens before sending a block; readers take download tokens before
//! handing a received frame to the manager.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

/// A token bucket rate limiter.
///
/// Tokens are bytes. The bucket holds up to two seconds worth of tokens to
/// allow bursts. A rate of zero disables limiting.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    semaphore: Semaphore,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    tokens_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn new(bytes_per_sec: u64) -> Self {
        let max_tokens = (bytes_per_sec * 2) as f64;
        Self {
            tokens: max_tokens,
            max_tokens,
            tokens_per_sec: bytes_per_sec as f64,
            last_update: Instant::now(),
        }
    }

    fn is_unlimited(&self) -> bool {
        self.tokens_per_sec == 0.0
    }

    fn take(&mut self, bytes: usize, now: Instant) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }

        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.last_update = now;
        self.tokens = (self.tokens + elapsed * self.tokens_per_sec).min(self.max_tokens);

        let bytes = bytes as f64;
        if self.tokens >= bytes {
            self.tokens -= bytes;
            Duration::ZERO
        } else {
            let needed = bytes - self.tokens;
            self.tokens = 0.0;
            Duration::from_secs_f64(needed / self.tokens_per_sec)
        }
    }
}

impl RateLimiter {
    /// Creates a limiter for `bytes_per_sec`; 0 means unlimited.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bucket: Mutex::new(TokenBucket::new(bytes_per_sec)),
            semaphore: Semaphore::new(1),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn set_rate(&self, bytes_per_sec: u64) {
        let mut bucket = self.bucket.lock();
        bucket.tokens_per_sec = bytes_per_sec as f64;
        bucket.max_tokens = (bytes_per_sec * 2) as f64;
        bucket.tokens = bucket.tokens.min(bucket.max_tokens);
    }

    pub fn rate(&self) -> u64 {
        self.bucket.lock().tokens_per_sec as u64
    }

    /// Takes `bytes` tokens and returns how long the caller must wait before
    /// using them.
    pub async fn acquire(&self, bytes: usize) -> Duration {
        // The semaphore is never closed; an error only means no ordering.
        let _permit = self.semaphore.acquire().await.ok();
        self.bucket.lock().take(bytes, Instant::now())
    }

    /// Takes `bytes` tokens, sleeping until they are available.
    pub async fn wait(&self, bytes: usize) {
        let delay = self.acquire(bytes).await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Upload and download limiters of one torrent.
#[derive(Debug, Clone)]
pub struct TransferLimits {
    pub upload: Arc<RateLimiter>,
    pub download: Arc<RateLimiter>,
}

impl TransferLimits {
    /// Limits in bytes per second; 0 means unlimited.
    pub fn new(upload: u64, download: u64) -> Self {
        Self {
            upload: Arc::new(RateLimiter::new(upload)),
            download: Arc::new(RateLimiter::new(download)),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, 0)
    }
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self::unlimited()
    }
}
