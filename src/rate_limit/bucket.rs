//! Token bucket arithmetic.
//!
//! Replenishes continuously at `requests_per_minute / 60` tokens per second, up to
//! `burst_size`. Token counts are fractional so slow refill rates neither over- nor
//! under-admit through integer truncation.

use crate::config::RateLimitConfig;
use std::time::Duration;

const MILLIS_PER_MINUTE: f64 = 60_000.0;

/// Bucket contents for one `(client, class)` key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketState {
    tokens: f64,
    last_refill_millis: u64,
}

/// Outcome of [`admit`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    /// One token was consumed.
    Admitted {
        /// Tokens left after consumption (fractional).
        remaining: f64,
    },
    /// Fewer than one token was available.
    Rejected {
        /// Time until the bucket reaches one token at the configured refill rate.
        retry_after: Duration,
    },
}

impl TokenBucketState {
    /// A fully replenished bucket; the initial state for a new key.
    pub fn full(config: &RateLimitConfig, now_millis: u64) -> Self {
        Self { tokens: f64::from(config.burst_size()), last_refill_millis: now_millis }
    }

    /// Build an explicit state. `tokens` is clamped to `[0, burst_size]`.
    pub fn with_tokens(config: &RateLimitConfig, tokens: f64, last_refill_millis: u64) -> Self {
        Self { tokens: clamp(tokens, config), last_refill_millis }
    }

    /// Tokens as of the last refill.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Timestamp of the last persisted refill.
    pub fn last_refill_millis(&self) -> u64 {
        self.last_refill_millis
    }

    /// Tokens the bucket would hold at `now`, without consuming any.
    pub fn projected(&self, config: &RateLimitConfig, now_millis: u64) -> f64 {
        let elapsed = now_millis.saturating_sub(self.last_refill_millis) as f64;
        let refill = elapsed * f64::from(config.requests_per_minute()) / MILLIS_PER_MINUTE;
        clamp(self.tokens + refill, config)
    }
}

fn clamp(tokens: f64, config: &RateLimitConfig) -> f64 {
    tokens.clamp(0.0, f64::from(config.burst_size()))
}

/// Try to take one token.
///
/// Admits only when the refilled, pre-decrement count is at least `1.0`. On admission the
/// returned state carries the decremented count and `now` as the refill instant. On rejection
/// the input state is returned unchanged, so repeated rejected calls never lose refill.
pub fn admit(
    state: &TokenBucketState,
    config: &RateLimitConfig,
    now_millis: u64,
) -> (Admission, TokenBucketState) {
    let available = state.projected(config, now_millis);

    if available >= 1.0 {
        let remaining = available - 1.0;
        let next = TokenBucketState {
            tokens: remaining,
            last_refill_millis: now_millis.max(state.last_refill_millis),
        };
        (Admission::Admitted { remaining }, next)
    } else {
        let missing = 1.0 - available;
        let wait_millis =
            (missing * MILLIS_PER_MINUTE / f64::from(config.requests_per_minute())).ceil();
        let retry_after = Duration::from_millis(wait_millis as u64);
        (Admission::Rejected { retry_after }, *state)
    }
}
