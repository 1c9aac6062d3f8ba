//! Bandwidth throttling for sync transfers.
//!
//! One token bucket is shared by every worker of a sync invocation; a
//! [`ThrottledReader`] consumes tokens in small chunks in front of the
//! delegate stream so the aggregate rate stays smooth across workers.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::fs::backend::ObjectReader;
use crate::fs::error::StorageError;
use async_trait::async_trait;

/// Chunk quantum for rate-limited reads.
pub const RATE_LIMIT_CHUNK: usize = 64 * 1024;

/// Bandwidth limit configuration. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthLimit {
    pub bytes_per_second: u64,
}

impl BandwidthLimit {
    pub fn new(bytes_per_second: u64) -> Self {
        Self { bytes_per_second }
    }

    pub fn unlimited() -> Self {
        Self {
            bytes_per_second: 0,
        }
    }

    pub fn is_limited(&self) -> bool {
        self.bytes_per_second > 0
    }

    pub fn display(&self) -> String {
        if !self.is_limited() {
            return "unlimited".to_string();
        }
        let bps = self.bytes_per_second;
        if bps >= 1_000_000_000 {
            format!("{:.1} GB/s", bps as f64 / 1_000_000_000.0)
        } else if bps >= 1_000_000 {
            format!("{:.1} MB/s", bps as f64 / 1_000_000.0)
        } else if bps >= 1_000 {
            format!("{:.1} KB/s", bps as f64 / 1_000.0)
        } else {
            format!("{} B/s", bps)
        }
    }
}

impl Default for BandwidthLimit {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with burst capacity of one second of traffic.
///
/// The lock is only held for bookkeeping; sleeps happen outside it so
/// other workers can refill and drain concurrently.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    max_tokens: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: u64) -> Self {
        let rate = rate_bytes_per_sec.max(1) as f64;
        Self {
            rate,
            max_tokens: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Shared bucket for a limit, or `None` when unlimited.
    pub fn from_limit(limit: BandwidthLimit) -> Option<Arc<TokenBucket>> {
        limit
            .is_limited()
            .then(|| Arc::new(TokenBucket::new(limit.bytes_per_second)))
    }

    /// Largest request `wait` can satisfy in one piece.
    pub fn burst(&self) -> usize {
        self.max_tokens as usize
    }

    /// Block until `n` tokens are available, then consume them. Requests
    /// larger than the burst are clamped so they cannot starve forever.
    pub async fn wait(&self, n: usize) {
        let need = (n as f64).min(self.max_tokens);
        loop {
            let deficit = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.max_tokens);
                state.last_refill = now;
                if state.tokens >= need {
                    state.tokens -= need;
                    return;
                }
                need - state.tokens
            };
            tokio::time::sleep(Duration::from_secs_f64(deficit / self.rate)).await;
        }
    }

    /// Give back tokens a short read did not use. Clamped at the burst.
    pub fn return_tokens(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.tokens = (state.tokens + n as f64).min(self.max_tokens);
    }

    #[cfg(test)]
    fn available(&self) -> f64 {
        self.state.lock().unwrap().tokens
    }
}

/// Byte stream whose throughput is capped by a shared [`TokenBucket`].
///
/// Each read is capped at [`RATE_LIMIT_CHUNK`] (and the bucket burst),
/// tokens are taken before the delegate read, and tokens for bytes the
/// delegate did not deliver are returned.
#[derive(Debug)]
pub struct ThrottledReader {
    inner: Box<dyn ObjectReader>,
    bucket: Option<Arc<TokenBucket>>,
}

impl ThrottledReader {
    pub fn new(inner: Box<dyn ObjectReader>, bucket: Option<Arc<TokenBucket>>) -> Self {
        Self { inner, bucket }
    }
}

#[async_trait]
impl ObjectReader for ThrottledReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let Some(bucket) = self.bucket.clone() else {
            return self.inner.read(buf).await;
        };
        let want = buf.len().min(RATE_LIMIT_CHUNK).min(bucket.burst()).max(1);
        bucket.wait(want).await;
        let n = self.inner.read(&mut buf[..want]).await?;
        if n < want {
            bucket.return_tokens(want - n);
        }
        Ok(n)
    }
}
