//! Rate limiting primitives.
//!
//! This module provides the building blocks for per-client, per-endpoint-class limiting:
//! - [`bucket`]: the token-bucket arithmetic as a pure function of `(state, config, now)`.
//! - [`RateLimitRegistry`]: owns one bucket per `(ClientIdentity, EndpointClass)` pair,
//!   creates them lazily, and evicts idle ones.
//! - [`Decision`]: the result of a check (Allowed/Denied).
//!
//! # Architecture
//!
//! - **Logic**: `bucket::admit` handles the math and never touches shared state.
//! - **Storage**: the registry keeps buckets in sharded maps, one per endpoint class, so that
//!   the read-modify-write for a key is serialized by that key's shard lock while unrelated
//!   keys proceed in parallel.

use std::time::Duration;

pub mod bucket;
pub mod registry;

pub use bucket::{Admission, TokenBucketState};
pub use registry::RateLimitRegistry;

/// The decision returned by a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request is allowed to proceed.
    Allowed {
        /// Whole tokens left after this admission.
        /// Useful for `X-RateLimit-Remaining` headers.
        remaining: u32,
    },
    /// The request is denied.
    Denied {
        /// How long until the bucket holds a full token again.
        /// Useful for `Retry-After` headers.
        retry_after: Duration,
        /// Configured requests per minute for the class.
        limit: u32,
    },
}

impl Decision {
    /// Helper to check if allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Advisory `Retry-After` in whole seconds, rounded up, never zero. `None` when allowed.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied { retry_after, .. } => Some(ceil_secs(*retry_after)),
        }
    }
}

pub(crate) fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}
