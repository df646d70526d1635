//! Token-bucket rate limiting.
//!
//! Two consumers: the dial limiter that paces outbound connection starts,
//! and the shared download limiter wrapped around every connection's read
//! side. Tokens refill continuously; a deficit turns into a sleep rather
//! than a rejection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;

pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    // Serializes waiters so a large acquire can't be starved by a
    // stream of small ones.
    gate: Semaphore,
}

struct TokenBucket {
    tokens: f64,
    burst: f64,
    tokens_per_sec: f64,
    last_update: Instant,
}

impl RateLimiter {
    /// A limiter refilling `tokens_per_sec`, holding at most `burst`.
    pub fn new(tokens_per_sec: f64, burst: f64) -> Arc<Self> {
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: burst,
                burst,
                tokens_per_sec,
                last_update: Instant::now(),
            }),
            gate: Semaphore::new(1),
        })
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Arc<Self> {
        Arc::new(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: f64::MAX,
                burst: f64::MAX,
                tokens_per_sec: f64::MAX,
                last_update: Instant::now(),
            }),
            gate: Semaphore::new(1),
        })
    }

    /// Takes `tokens` from the bucket, sleeping out any deficit.
    pub async fn acquire(&self, tokens: usize) {
        let _serial = self.gate.acquire().await.unwrap();
        let wait = self.take(tokens as f64);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    fn take(&self, amount: f64) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.last_update = now;
        bucket.tokens = (bucket.tokens + elapsed * bucket.tokens_per_sec).min(bucket.burst);

        if bucket.tokens >= amount {
            bucket.tokens -= amount;
            Duration::ZERO
        } else {
            let deficit = amount - bucket.tokens;
            bucket.tokens = 0.0;
            Duration::from_secs_f64(deficit / bucket.tokens_per_sec)
        }
    }

    /// Currently available tokens, for status output.
    pub fn available(&self) -> usize {
        let bucket = self.bucket.lock();
        if bucket.tokens >= usize::MAX as f64 {
            usize::MAX
        } else {
            bucket.tokens as usize
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_is_free_then_throttles() {
        let limiter = RateLimiter::new(10.0, 10.0);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire(1).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));

        limiter.acquire(1).await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn unlimited_never_sleeps() {
        let limiter = RateLimiter::unlimited();
        let start = Instant::now();
        limiter.acquire(usize::MAX / 2).await;
        limiter.acquire(usize::MAX / 2).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
