//! Background eviction of idle admission state.
//!
//! Eviction is advisory: a removed bucket is recreated full and a removed lockout record is
//! recreated clear, which is exactly what an idle entry would have decayed to. The sweep only
//! ever takes one shard lock at a time, so request-serving tasks are never stalled behind it.

use crate::admission::AdmissionGate;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

/// What one sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Idle, fully refilled token buckets.
    pub buckets: usize,
    /// Idle lockout records outside any lockout window.
    pub lockouts: usize,
    /// Spent refresh-token ids whose tokens have expired.
    pub spent_refresh_ids: usize,
}

impl SweepReport {
    /// True when nothing was removed.
    pub fn is_empty(&self) -> bool {
        self.buckets == 0 && self.lockouts == 0 && self.spent_refresh_ids == 0
    }
}

/// Handle to a running sweeper. Dropping it stops the task.
#[derive(Debug)]
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Whether the sweep task has stopped.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Run [`AdmissionGate::sweep`] every `sweep_interval` on the current tokio runtime.
pub fn spawn_sweeper<S>(gate: Arc<AdmissionGate<S>>) -> SweeperHandle
where
    S: Send + Sync + 'static,
{
    let period = gate.sweep_interval();
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = gate.sweep();
            if !report.is_empty() {
                debug!(
                    target: "trackgate::sweeper",
                    buckets = report.buckets,
                    lockouts = report.lockouts,
                    spent_refresh_ids = report.spent_refresh_ids,
                    "swept idle admission state"
                );
            }
        }
    });
    SweeperHandle { task }
}
