//! Token-bucket admission control for outbound model calls.
//!
//! Tokens accrue continuously at `refill_rate` per second up to `capacity`
//! (the burst size). [`RateLimiter::acquire`] never rejects: it only delays
//! the caller until a token is available.
//!
//! ```text
//!   acquire() ──► lock ──► refill ──► tokens ≥ 1 ? ──yes──► consume, return 0
//!                                         │
//!                                         no
//!                                         ▼
//!                        sleep (1 - tokens) / rate, tokens = 0
//! ```
//!
//! The wait happens inside the critical section, so concurrent callers queue
//! on the (FIFO) mutex and are admitted one refill interval apart instead of
//! all waking at once and double-spending the same token.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket state. Invariant: `0 <= tokens <= capacity`.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_to_next_token(&self) -> Duration {
        Duration::from_secs_f64(((1.0 - self.tokens) / self.refill_rate).max(0.0))
    }
}

/// Async token-bucket rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
    rate_per_second: f64,
    burst: u32,
}

impl RateLimiter {
    /// Create a limiter admitting `rate_per_second` calls with bursts of up
    /// to `burst`. The bucket starts full.
    pub fn new(rate_per_second: f64, burst: u32) -> Self {
        debug_assert!(rate_per_second > 0.0, "rate must be positive");
        let refill_rate = if rate_per_second > 0.0 {
            rate_per_second
        } else {
            f64::EPSILON
        };
        let capacity = f64::from(burst.max(1));
        Self {
            bucket: Mutex::new(TokenBucket::new(capacity, refill_rate)),
            rate_per_second: refill_rate,
            burst: burst.max(1),
        }
    }

    /// Wait for a token and consume it.
    ///
    /// Returns how long the caller was delayed; `Duration::ZERO` means the
    /// token was available immediately.
    pub async fn acquire(&self) -> Duration {
        let mut bucket = self.bucket.lock().await;
        if bucket.try_consume() {
            return Duration::ZERO;
        }

        let wait = bucket.time_to_next_token();
        tracing::debug!(
            wait_ms = wait.as_millis() as u64,
            tokens = bucket.tokens,
            "Rate limited: waiting for request slot"
        );
        tokio::time::sleep(wait).await;

        // The token accrued during the sleep is the one being consumed.
        bucket.tokens = 0.0;
        bucket.last_refill = Instant::now();
        wait
    }

    /// Consume a token only if one is available right now.
    pub async fn try_acquire(&self) -> bool {
        self.bucket.lock().await.try_consume()
    }

    /// Tokens currently available (after refill).
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill();
        bucket.tokens
    }

    pub fn rate_per_second(&self) -> f64 {
        self.rate_per_second
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }
}
