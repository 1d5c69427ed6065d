//! Brute-force protection for authentication endpoints.
//!
//! Each client moves through `Clear` → `Warned` → `Locked` as failed logins accumulate.
//! A lockout ends lazily: nothing runs when it expires, the next read simply observes that
//! `now >= locked_until` and clears the record. The per-client transitions are pure
//! functions of `(state, now)` on [`LockoutState`]; [`BruteForceTracker`] only applies them
//! under the client's shard lock so that concurrent reports increment a consistent counter.

use crate::clock::{duration_millis, Clock, MonotonicClock};
use crate::config::BruteForceConfig;
use crate::identity::ClientIdentity;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Externally visible lockout state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockoutStatus {
    /// No failures on record.
    Clear,
    /// Some failures, below the threshold.
    Warned {
        /// Consecutive failures so far.
        failed_attempts: u32,
    },
    /// Authentication attempts are refused until `until_millis`.
    Locked {
        /// Clock reading at which the lockout ends.
        until_millis: u64,
    },
}

/// What a recorded failure did to the client's record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The failure was counted; still below the threshold.
    Counted {
        /// Consecutive failures including this one.
        failed_attempts: u32,
        /// Configured threshold.
        threshold: u32,
    },
    /// This failure reached the threshold and started a lockout.
    Locked {
        /// Consecutive failures including this one.
        failed_attempts: u32,
        /// Clock reading at which the lockout ends.
        until_millis: u64,
    },
    /// The client was already locked; nothing changed and the lockout was not extended.
    AlreadyLocked {
        /// Clock reading at which the existing lockout ends.
        until_millis: u64,
    },
}

/// Failure history for one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutState {
    failed_attempts: u32,
    locked_until: Option<u64>,
    last_attempt_millis: u64,
}

impl LockoutState {
    /// The `Clear` state.
    pub fn clear(now_millis: u64) -> Self {
        Self { failed_attempts: 0, locked_until: None, last_attempt_millis: now_millis }
    }

    /// Consecutive failures on record.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    /// End of the current or most recent lockout, if one was set and not yet cleared.
    pub fn locked_until(&self) -> Option<u64> {
        self.locked_until
    }

    /// Time of the last recorded attempt.
    pub fn last_attempt_millis(&self) -> u64 {
        self.last_attempt_millis
    }

    /// Apply lockout expiry: a lock whose end has passed becomes `Clear`.
    pub fn expire(self, now_millis: u64) -> Self {
        match self.locked_until {
            Some(until) if now_millis >= until => Self {
                failed_attempts: 0,
                locked_until: None,
                last_attempt_millis: self.last_attempt_millis,
            },
            _ => self,
        }
    }

    /// Classify the state at `now`, as if [`LockoutState::expire`] had been applied.
    pub fn status(&self, now_millis: u64) -> LockoutStatus {
        let current = self.expire(now_millis);
        match (current.locked_until, current.failed_attempts) {
            (Some(until), _) => LockoutStatus::Locked { until_millis: until },
            (None, 0) => LockoutStatus::Clear,
            (None, failed_attempts) => LockoutStatus::Warned { failed_attempts },
        }
    }

    /// Count one failed attempt.
    pub fn record_failure(
        self,
        config: &BruteForceConfig,
        now_millis: u64,
    ) -> (Self, FailureOutcome) {
        let current = self.expire(now_millis);
        if let Some(until) = current.locked_until {
            let last_attempt_millis = now_millis.max(current.last_attempt_millis);
            let next = Self { last_attempt_millis, ..current };
            return (next, FailureOutcome::AlreadyLocked { until_millis: until });
        }

        let failed_attempts = current.failed_attempts.saturating_add(1);
        let last_attempt_millis = now_millis.max(current.last_attempt_millis);
        let threshold = config.failure_threshold();

        if failed_attempts >= threshold {
            let until = now_millis.saturating_add(duration_millis(config.lockout_duration()));
            let next = Self { failed_attempts, locked_until: Some(until), last_attempt_millis };
            (next, FailureOutcome::Locked { failed_attempts, until_millis: until })
        } else {
            let next = Self { failed_attempts, locked_until: None, last_attempt_millis };
            (next, FailureOutcome::Counted { failed_attempts, threshold })
        }
    }
}

/// Process-wide table of [`LockoutState`] keyed by client.
#[derive(Debug)]
pub struct BruteForceTracker {
    config: BruteForceConfig,
    entries: DashMap<ClientIdentity, LockoutState>,
    clock: Arc<dyn Clock>,
}

impl BruteForceTracker {
    /// Create an empty tracker using the monotonic clock.
    pub fn new(config: BruteForceConfig) -> Self {
        Self { config, entries: DashMap::new(), clock: Arc::new(MonotonicClock::default()) }
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

    /// Lockout settings.
    pub fn config(&self) -> &BruteForceConfig {
        &self.config
    }

    /// True iff the client is locked right now.
    ///
    /// An expired lockout is cleared as a side effect. Repeated calls without intervening
    /// reports change nothing else.
    pub fn check_locked(&self, client: &ClientIdentity) -> bool {
        self.locked_for(client).is_some()
    }

    /// Remaining lockout time, or `None` if the client may attempt to authenticate.
    pub fn locked_for(&self, client: &ClientIdentity) -> Option<Duration> {
        let now = self.clock.now_millis();
        let mut entry = self.entries.get_mut(client)?;
        let was_locked = entry.locked_until.is_some();
        let next = entry.expire(now);
        *entry = next;

        match next.locked_until {
            Some(until) => Some(Duration::from_millis(until.saturating_sub(now))),
            None => {
                if was_locked {
                    info!(target: "trackgate::brute_force", client = %client, "lockout expired");
                }
                None
            }
        }
    }

    /// Count a failed authentication attempt.
    pub fn record_failure(&self, client: &ClientIdentity) -> FailureOutcome {
        let now = self.clock.now_millis();
        let outcome = {
            let mut entry =
                self.entries.entry(client.clone()).or_insert_with(|| LockoutState::clear(now));
            let (next, outcome) = entry.record_failure(&self.config, now);
            *entry = next;
            outcome
        };

        match outcome {
            FailureOutcome::Counted { failed_attempts, threshold } => info!(
                target: "trackgate::brute_force",
                client = %client,
                attempt_count = failed_attempts,
                threshold,
                "failed authentication attempt"
            ),
            FailureOutcome::Locked { failed_attempts, until_millis } => warn!(
                target: "trackgate::brute_force",
                client = %client,
                attempt_count = failed_attempts,
                locked_until_ms = until_millis,
                "client locked out after repeated failed authentication"
            ),
            FailureOutcome::AlreadyLocked { .. } => debug!(
                target: "trackgate::brute_force",
                client = %client,
                "failure reported while locked; lockout not extended"
            ),
        }
        outcome
    }

    /// A successful authentication clears all history for the client.
    pub fn record_success(&self, client: &ClientIdentity) {
        if let Some((_, prev)) = self.entries.remove(client) {
            if prev.failed_attempts > 0 {
                debug!(
                    target: "trackgate::brute_force",
                    client = %client,
                    cleared_attempts = prev.failed_attempts,
                    "failure history cleared by successful authentication"
                );
            }
        }
    }

    /// Administrative unlock. Returns whether a record existed.
    pub fn reset(&self, client: &ClientIdentity) -> bool {
        let existed = self.entries.remove(client).is_some();
        if existed {
            info!(
                target: "trackgate::brute_force",
                client = %client,
                "lockout record reset by operator"
            );
        }
        existed
    }

    /// Current status without mutating anything.
    pub fn status(&self, client: &ClientIdentity) -> LockoutStatus {
        let now = self.clock.now_millis();
        self.entries.get(client).map_or(LockoutStatus::Clear, |entry| entry.status(now))
    }

    /// Drop records with no attempt for `idle_ttl`. Records still inside a lockout window are
    /// always kept.
    pub fn evict_idle(&self, idle_ttl: Duration) -> usize {
        let now = self.clock.now_millis();
        let ttl = duration_millis(idle_ttl);
        let before = self.entries.len();
        self.entries.retain(|_, state| {
            let idle = now.saturating_sub(state.last_attempt_millis) >= ttl;
            let locked = matches!(state.status(now), LockoutStatus::Locked { .. });
            !idle || locked
        });
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(target: "trackgate::brute_force", evicted, "evicted idle lockout records");
        }
        evicted
    }

    /// Number of clients with a record.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no client has a record.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::net::{IpAddr, Ipv6Addr};
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn client() -> ClientIdentity {
        ClientIdentity::from_addr(IpAddr::V6(Ipv6Addr::LOCALHOST))
    }

    fn tracker(clock: &ManualClock) -> BruteForceTracker {
        let config = BruteForceConfig::new(5, Duration::from_secs(15 * 60)).unwrap();
        BruteForceTracker::new(config).with_clock(clock.clone())
    }

    #[test]
    fn threshold_minus_one_failures_only_warn() {
        let clock = ManualClock::new();
        let t = tracker(&clock);
        let c = client();
        for i in 1..5 {
            assert_eq!(
                t.record_failure(&c),
                FailureOutcome::Counted { failed_attempts: i, threshold: 5 }
            );
        }
        assert!(!t.check_locked(&c));
        assert_eq!(t.status(&c), LockoutStatus::Warned { failed_attempts: 4 });
    }

    #[test]
    fn reaching_threshold_locks() {
        let clock = ManualClock::new();
        let t = tracker(&clock);
        let c = client();
        for _ in 0..4 {
            t.record_failure(&c);
        }
        clock.advance(Duration::from_millis(200));
        let outcome = t.record_failure(&c);
        assert_eq!(outcome, FailureOutcome::Locked { failed_attempts: 5, until_millis: 900_200 });
        assert!(t.check_locked(&c));
        assert_eq!(t.locked_for(&c), Some(Duration::from_secs(900)));
    }

    #[test]
    fn failures_while_locked_do_not_extend() {
        let clock = ManualClock::new();
        let t = tracker(&clock);
        let c = client();
        for _ in 0..5 {
            t.record_failure(&c);
        }
        clock.advance(Duration::from_secs(60));
        assert_eq!(t.record_failure(&c), FailureOutcome::AlreadyLocked { until_millis: 900_000 });
        assert_eq!(t.status(&c), LockoutStatus::Locked { until_millis: 900_000 });
    }

    #[test]
    fn lockout_expires_lazily_and_monotonically() {
        let clock = ManualClock::new();
        let t = tracker(&clock);
        let c = client();
        for _ in 0..5 {
            t.record_failure(&c);
        }
        clock.advance(Duration::from_secs(15 * 60));
        // Exactly at the boundary the client is free.
        assert!(!t.check_locked(&c));
        assert_eq!(t.status(&c), LockoutStatus::Clear);
        // Repeated checks never re-lock without new failures.
        for _ in 0..10 {
            clock.advance(Duration::from_millis(1));
            assert!(!t.check_locked(&c));
        }
        assert_eq!(
            t.record_failure(&c),
            FailureOutcome::Counted { failed_attempts: 1, threshold: 5 }
        );
    }

    #[test]
    fn failure_after_unobserved_expiry_starts_fresh() {
        let clock = ManualClock::new();
        let t = tracker(&clock);
        let c = client();
        for _ in 0..5 {
            t.record_failure(&c);
        }
        clock.advance(Duration::from_secs(16 * 60));
        assert_eq!(
            t.record_failure(&c),
            FailureOutcome::Counted { failed_attempts: 1, threshold: 5 }
        );
    }

    #[test]
    fn success_resets_any_count() {
        let clock = ManualClock::new();
        let t = tracker(&clock);
        let c = client();
        for _ in 0..3 {
            t.record_failure(&c);
        }
        t.record_success(&c);
        assert_eq!(t.status(&c), LockoutStatus::Clear);
        assert!(t.is_empty());
        for i in 1..5 {
            assert_eq!(
                t.record_failure(&c),
                FailureOutcome::Counted { failed_attempts: i, threshold: 5 }
            );
        }
    }

    #[test]
    fn check_locked_is_idempotent_while_locked() {
        let clock = ManualClock::new();
        let t = tracker(&clock);
        let c = client();
        for _ in 0..5 {
            t.record_failure(&c);
        }
        let before = t.status(&c);
        for _ in 0..5 {
            assert!(t.check_locked(&c));
        }
        assert_eq!(t.status(&c), before);
    }

    #[test]
    fn reset_unlocks() {
        let clock = ManualClock::new();
        let t = tracker(&clock);
        let c = client();
        for _ in 0..5 {
            t.record_failure(&c);
        }
        assert!(t.reset(&c));
        assert!(!t.check_locked(&c));
        assert!(!t.reset(&c));
    }

    #[test]
    fn eviction_keeps_locked_clients() {
        let clock = ManualClock::new();
        let t = tracker(&clock);
        let locked = client();
        let warned = ClientIdentity::from_addr("10.1.1.1".parse().unwrap());
        for _ in 0..5 {
            t.record_failure(&locked);
        }
        t.record_failure(&warned);
        clock.advance(Duration::from_secs(600));
        assert_eq!(t.evict_idle(Duration::from_secs(300)), 1);
        assert!(t.check_locked(&locked));
        assert_eq!(t.status(&warned), LockoutStatus::Clear);
    }

    #[test]
    fn attempts_log_at_info_and_lockout_at_warn() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(SharedWriter(buffer.clone())))
            .with_max_level(tracing::Level::DEBUG)
            .with_target(true)
            .with_ansi(false)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let clock = ManualClock::new();
        let t = tracker(&clock);
        let c = client();
        for _ in 0..5 {
            t.record_failure(&c);
        }

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        let attempts: Vec<_> =
            logs.lines().filter(|l| l.contains("failed authentication attempt")).collect();
        assert_eq!(attempts.len(), 4);
        assert!(attempts
            .iter()
            .all(|l| l.contains("INFO") && l.contains("trackgate::brute_force")));
        let lockout = logs
            .lines()
            .find(|l| l.contains("client locked out"))
            .expect("lockout should be logged");
        assert!(lockout.contains("WARN"));
        assert!(lockout.contains("attempt_count=5"));
    }

    #[test]
    fn pure_status_matches_state_machine() {
        let config = BruteForceConfig::new(2, Duration::from_secs(10)).unwrap();
        let s0 = LockoutState::clear(0);
        assert_eq!(s0.status(0), LockoutStatus::Clear);
        let (s1, _) = s0.record_failure(&config, 1_000);
        assert_eq!(s1.status(1_000), LockoutStatus::Warned { failed_attempts: 1 });
        let (s2, outcome) = s1.record_failure(&config, 2_000);
        assert_eq!(outcome, FailureOutcome::Locked { failed_attempts: 2, until_millis: 12_000 });
        assert!(s2.locked_until().unwrap() >= 2_000);
        assert_eq!(s2.status(11_999), LockoutStatus::Locked { until_millis: 12_000 });
        assert_eq!(s2.status(12_000), LockoutStatus::Clear);
        assert_eq!(s2.expire(12_000).failed_attempts(), 0);
    }
}
