//! Thread-safe counters for pull and push operations

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Monotonic pull/push counters, never reset while the process lives
#[derive(Debug, Default)]
pub struct Metrics {
    pulls: AtomicU64,
    pull_failures: AtomicU64,
    pull_duration_ms: AtomicU64,
    pushes: AtomicU64,
    push_failures: AtomicU64,
    push_duration_ms: AtomicU64,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_pull(&self, elapsed: Duration, success: bool) {
        self.pulls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.pull_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.pull_duration_ms
            .fetch_add(millis(elapsed), Ordering::Relaxed);
    }

    pub fn record_push(&self, elapsed: Duration, success: bool) {
        self.pushes.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.push_failures.fetch_add(1, Ordering::Relaxed);
        }
        self.push_duration_ms
            .fetch_add(millis(elapsed), Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let pulls = self.pulls.load(Ordering::Relaxed);
        let pull_duration_ms_total = self.pull_duration_ms.load(Ordering::Relaxed);
        let pushes = self.pushes.load(Ordering::Relaxed);
        let push_duration_ms_total = self.push_duration_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            pulls,
            pull_failures: self.pull_failures.load(Ordering::Relaxed),
            pull_duration_ms_total,
            pull_avg_ms: pull_duration_ms_total.checked_div(pulls).unwrap_or(0),
            pushes,
            push_failures: self.push_failures.load(Ordering::Relaxed),
            push_duration_ms_total,
            push_avg_ms: push_duration_ms_total.checked_div(pushes).unwrap_or(0),
        }
    }
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// Serializable copy of [`Metrics`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub pulls: u64,
    pub pull_failures: u64,
    pub pull_duration_ms_total: u64,
    pub pull_avg_ms: u64,
    pub pushes: u64,
    pub push_failures: u64,
    pub push_duration_ms_total: u64,
    pub push_avg_ms: u64,
}

impl fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Metrics:")?;
        writeln!(
            f,
            " - pulls: {}, failures: {}, avg ms: {}",
            self.pulls, self.pull_failures, self.pull_avg_ms
        )?;
        write!(
            f,
            " - pushes: {}, failures: {}, avg ms: {}",
            self.pushes, self.push_failures, self.push_avg_ms
        )
    }
}
