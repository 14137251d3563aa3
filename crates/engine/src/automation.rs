//! Periodic pulls on a background thread

use crate::sync::RepositorySync;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tether_core::ErrorKind;
use tracing::{debug, info, warn};

const FALLBACK_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Interval of a `*/N * * * *` schedule
///
/// Any other form, or a non-positive `N`, falls back to five minutes.
#[must_use]
pub fn parse_schedule(schedule: &str) -> Duration {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    let minutes = match fields.as_slice() {
        [minute, "*", "*", "*", "*"] => minute
            .strip_prefix("*/")
            .and_then(|n| n.parse::<u64>().ok())
            .filter(|&n| n > 0),
        _ => None,
    };

    match minutes {
        Some(n) => Duration::from_secs(n * 60),
        None => {
            warn!(schedule, "Unsupported schedule, pulling every 5 minutes");
            FALLBACK_INTERVAL
        }
    }
}

/// Handle to the running automation thread
pub struct Scheduler {
    stop: Sender<()>,
    handle: JoinHandle<()>,
    interval: Duration,
}

impl Scheduler {
    /// Start pulling on the configured schedule, or `None` when automation is off
    pub fn start(sync: Arc<RepositorySync>) -> Option<Self> {
        let config = sync.config().automation;
        if !config.enabled {
            return None;
        }
        Some(Self::with_interval(
            sync,
            parse_schedule(&config.schedule),
            config.dry_run,
        ))
    }

    /// Start with an explicit interval
    pub fn with_interval(sync: Arc<RepositorySync>, interval: Duration, dry_run: bool) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        info!(?interval, dry_run, "Starting scheduled pulls");

        let handle = thread::spawn(move || {
            loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => tick(&sync, dry_run),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("Scheduled pulls stopped");
        });

        Self {
            stop,
            handle,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop the thread and wait for a running tick to finish
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            warn!("Scheduler thread panicked");
        }
    }
}

fn tick(sync: &RepositorySync, dry_run: bool) {
    let result = if dry_run {
        sync.preview_pull().map(|preview| preview.to_string())
    } else {
        sync.pull_with_retry().map(|outcome| outcome.to_string())
    };

    match result {
        Ok(summary) => debug!(dry_run, "Scheduled pull: {summary}"),
        Err(e) if e.kind() == ErrorKind::Busy => {
            debug!("Scheduled pull skipped, another operation is running");
        }
        // Failures are already reported by the operation itself
        Err(e) => debug!(kind = ?e.kind(), "Scheduled pull failed"),
    }
}
