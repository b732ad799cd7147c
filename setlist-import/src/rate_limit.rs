//! Token-bucket rate limiting
//!
//! Thin wrapper over a direct `governor` limiter: `max` tokens per
//! `duration`, refilled continuously, bursts up to `max`.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

use crate::error::{ImportError, ImportResult};

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

pub struct TokenBucket {
    limiter: DirectLimiter,
    max: u32,
    period: Duration,
}

impl TokenBucket {
    /// `max` permits per `period`
    ///
    /// Returns `Configuration` when either bound is zero.
    pub fn new(max: u32, period: Duration) -> ImportResult<Self> {
        let burst = NonZeroU32::new(max).ok_or_else(|| {
            ImportError::Configuration("rate limit max must be greater than zero".to_string())
        })?;
        let quota = Quota::with_period(period / max)
            .ok_or_else(|| {
                ImportError::Configuration("rate limit duration must be non-zero".to_string())
            })?
            .allow_burst(burst);

        Ok(Self {
            limiter: RateLimiter::direct(quota),
            max,
            period,
        })
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    /// Wait for a token
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Wait for a token for at most `max_wait`
    ///
    /// Returns `false` if the wait expired; no token is consumed then.
    pub async fn acquire_within(&self, max_wait: Duration) -> bool {
        tokio::time::timeout(max_wait, self.limiter.until_ready())
            .await
            .is_ok()
    }
}
