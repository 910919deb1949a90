//! Declarative retry policy shared by page fetching and message delivery.
//!
//! delay(attempt) = min(base * 2^(attempt-1), max) + uniform jitter in [0, jitter]

use crate::config::ScrapingConfig;
use rand::Rng;
use std::time::Duration;

/// Retry/backoff policy passed into any call that can fail transiently.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the exponential part of a single delay.
    pub max_delay: Duration,
    /// Upper bound of the random extra added to each delay.
    pub jitter: Duration,
    /// Factor applied to the delay when the upstream asked us to slow down.
    pub rate_limit_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
            rate_limit_multiplier: 4,
        }
    }
}

impl RetryPolicy {
    /// Policy for listing page fetches.
    pub fn from_scraping(config: &ScrapingConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            jitter: Duration::from_millis(config.retry_base_delay_ms / 4),
            rate_limit_multiplier: config.rate_limit_multiplier.max(1),
        }
    }

    /// Policy for message delivery: three attempts, 2s/4s backoff.
    pub fn delivery() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
            rate_limit_multiplier: 1,
        }
    }

    /// Policy that retries immediately. Used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            rate_limit_multiplier: 1,
        }
    }

    /// Returns true if a further attempt is allowed after `attempt` (1-based) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Exponential part of the delay after `attempt` (1-based) failed, without jitter.
    pub fn base_delay_for(&self, attempt: u32, rate_limited: bool) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let mut delay = self.base_delay.saturating_mul(1u32 << exp);
        if delay > self.max_delay {
            delay = self.max_delay;
        }
        if rate_limited {
            delay = delay.saturating_mul(self.rate_limit_multiplier);
        }
        delay
    }

    /// Full delay after `attempt` (1-based) failed, including random jitter.
    pub fn delay_for(&self, attempt: u32, rate_limited: bool) -> Duration {
        let delay = self.base_delay_for(attempt, rate_limited);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

/// Sleeps for a uniformly random duration in `[min_sec, max_sec]`.
///
/// Non-finite bounds are treated as no delay.
pub async fn random_delay(min_sec: f64, max_sec: f64) {
    if !min_sec.is_finite() || !max_sec.is_finite() || max_sec <= 0.0 {
        return;
    }
    let secs = if max_sec > min_sec {
        rand::rng().random_range(min_sec..=max_sec)
    } else {
        min_sec
    };
    tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await;
}
