//! Registry owning one token bucket per `(ClientIdentity, EndpointClass)` pair.
//!
//! Buckets are created lazily on first sight of a key and start fully replenished. Each
//! endpoint class gets its own sharded map; a check locks only the shard holding its key,
//! and only for the O(1) refill-and-decrement, so unrelated clients never contend.

use super::bucket::{self, Admission, TokenBucketState};
use super::Decision;
use crate::clock::{duration_millis, Clock, MonotonicClock};
use crate::config::{RateLimitConfig, RateLimitTable};
use crate::identity::{ClientIdentity, EndpointClass};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct BucketEntry {
    state: TokenBucketState,
    last_seen_millis: u64,
}

/// Per-client, per-class token buckets.
#[derive(Debug)]
pub struct RateLimitRegistry {
    table: RateLimitTable,
    buckets: [DashMap<ClientIdentity, BucketEntry>; 5],
    clock: Arc<dyn Clock>,
}

impl RateLimitRegistry {
    /// Create an empty registry using the monotonic clock.
    pub fn new(table: RateLimitTable) -> Self {
        Self {
            table,
            buckets: std::array::from_fn(|_| DashMap::new()),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Share an existing clock handle.
    pub fn with_shared_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Limiter settings for a class.
    pub fn config(&self, class: EndpointClass) -> &RateLimitConfig {
        self.table.get(class)
    }

    /// Admit or reject one request.
    ///
    /// Linearizable per key: the refill, comparison, and decrement happen while the key's
    /// shard is locked, so two concurrent callers can never both spend the same token.
    pub fn check(&self, client: &ClientIdentity, class: EndpointClass) -> Decision {
        let config = self.table.get(class);
        let map = &self.buckets[class.index()];
        let now = self.clock.now_millis();

        let admission = match map.get_mut(client) {
            Some(mut entry) => Self::admit_entry(entry.value_mut(), config, now),
            None => {
                let mut entry = map.entry(client.clone()).or_insert_with(|| BucketEntry {
                    state: TokenBucketState::full(config, now),
                    last_seen_millis: now,
                });
                Self::admit_entry(entry.value_mut(), config, now)
            }
        };

        match admission {
            Admission::Admitted { remaining } => {
                Decision::Allowed { remaining: remaining.floor() as u32 }
            }
            Admission::Rejected { retry_after } => {
                debug!(
                    target: "trackgate::rate_limit",
                    client = %client,
                    class = %class,
                    limit = config.requests_per_minute(),
                    retry_after_ms = duration_millis(retry_after),
                    "rate limit exceeded"
                );
                Decision::Denied { retry_after, limit: config.requests_per_minute() }
            }
        }
    }

    fn admit_entry(entry: &mut BucketEntry, config: &RateLimitConfig, now: u64) -> Admission {
        let (admission, next) = bucket::admit(&entry.state, config, now);
        entry.state = next;
        entry.last_seen_millis = entry.last_seen_millis.max(now);
        admission
    }

    /// Snapshot of a bucket, if one exists.
    pub fn state(&self, client: &ClientIdentity, class: EndpointClass) -> Option<TokenBucketState> {
        self.buckets[class.index()].get(client).map(|entry| entry.state)
    }

    /// Drop buckets that have seen no request for `idle_ttl` and have refilled completely.
    ///
    /// Each shard is swept under its own write lock, so a bucket can never be removed
    /// while a check on it is in progress. Only full buckets are removed, which makes
    /// eviction invisible: a recreated bucket starts full too.
    pub fn evict_idle(&self, idle_ttl: Duration) -> usize {
        let now = self.clock.now_millis();
        let ttl = duration_millis(idle_ttl);
        let mut evicted = 0;

        for class in EndpointClass::ALL {
            let config = self.table.get(class);
            let burst = f64::from(config.burst_size());
            let map = &self.buckets[class.index()];
            let before = map.len();
            map.retain(|_, entry| {
                let idle = now.saturating_sub(entry.last_seen_millis) >= ttl;
                let full = entry.state.projected(config, now) >= burst;
                !(idle && full)
            });
            evicted += before.saturating_sub(map.len());
        }

        if evicted > 0 {
            debug!(target: "trackgate::rate_limit", evicted, "evicted idle buckets");
        }
        evicted
    }

    /// Number of live buckets across all classes.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(DashMap::len).sum()
    }

    /// True when no bucket exists.
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(DashMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::net::{IpAddr, Ipv4Addr};

    fn client(last: u8) -> ClientIdentity {
        ClientIdentity::from_addr(IpAddr::V4(Ipv4Addr::new(192, 168, 0, last)))
    }

    fn registry(clock: &ManualClock) -> RateLimitRegistry {
        let mut table = RateLimitTable::default();
        table.set(EndpointClass::Auth, RateLimitConfig::new(60, 5));
        RateLimitRegistry::new(table).with_clock(clock.clone())
    }

    #[test]
    fn burst_of_five_then_retry_after_one_second() {
        let clock = ManualClock::new();
        let reg = registry(&clock);
        let c = client(1);

        for _ in 0..5 {
            assert!(reg.check(&c, EndpointClass::Auth).is_allowed());
        }
        let denied = reg.check(&c, EndpointClass::Auth);
        assert_eq!(denied.retry_after_secs(), Some(1));
        assert!(matches!(denied, Decision::Denied { limit: 60, .. }));

        clock.advance(Duration::from_secs(1));
        assert!(reg.check(&c, EndpointClass::Auth).is_allowed());
    }

    #[test]
    fn keys_are_independent_across_clients_and_classes() {
        let clock = ManualClock::new();
        let reg = registry(&clock);
        let a = client(1);
        let b = client(2);

        for _ in 0..5 {
            assert!(reg.check(&a, EndpointClass::Auth).is_allowed());
        }
        assert!(!reg.check(&a, EndpointClass::Auth).is_allowed());
        assert!(reg.check(&b, EndpointClass::Auth).is_allowed());
        assert!(reg.check(&a, EndpointClass::Tracking).is_allowed());
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn remaining_counts_down() {
        let clock = ManualClock::new();
        let reg = registry(&clock);
        let c = client(3);
        assert_eq!(reg.check(&c, EndpointClass::Auth), Decision::Allowed { remaining: 4 });
        assert_eq!(reg.check(&c, EndpointClass::Auth), Decision::Allowed { remaining: 3 });
    }

    #[test]
    fn eviction_skips_recent_and_partially_drained_buckets() {
        let clock = ManualClock::new();
        let reg = registry(&clock);
        let drained = client(1);
        let light = client(2);

        for _ in 0..5 {
            reg.check(&drained, EndpointClass::Auth);
        }
        reg.check(&light, EndpointClass::Auth);

        // Not idle yet.
        assert_eq!(reg.evict_idle(Duration::from_secs(10)), 0);

        // Idle for 2s: `light` refilled fully, `drained` has only 2 of 5 tokens back.
        clock.advance(Duration::from_secs(2));
        assert_eq!(reg.evict_idle(Duration::from_secs(1)), 1);
        assert!(reg.state(&light, EndpointClass::Auth).is_none());
        assert!(reg.state(&drained, EndpointClass::Auth).is_some());

        clock.advance(Duration::from_secs(10));
        assert_eq!(reg.evict_idle(Duration::from_secs(1)), 1);
        assert!(reg.is_empty());
    }

    #[test]
    fn recreated_bucket_starts_full() {
        let clock = ManualClock::new();
        let reg = registry(&clock);
        let c = client(9);
        reg.check(&c, EndpointClass::Auth);
        clock.advance(Duration::from_secs(60));
        reg.evict_idle(Duration::from_secs(30));
        assert!(reg.is_empty());
        assert_eq!(reg.check(&c, EndpointClass::Auth), Decision::Allowed { remaining: 4 });
    }

    #[test]
    fn concurrent_checks_never_overspend() {
        let clock = ManualClock::new();
        let reg = Arc::new(registry(&clock));
        let c = client(7);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let reg = reg.clone();
                let c = c.clone();
                std::thread::spawn(move || {
                    (0..10).filter(|_| reg.check(&c, EndpointClass::Auth).is_allowed()).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 5, "time is frozen, so exactly the burst is admitted");
    }
}
