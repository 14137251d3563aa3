//! Mutual exclusion for repository mutations
//!
//! The gate is a try-lock: a second caller is rejected with
//! [`Error::Busy`](tether_core::Error::Busy) instead of waiting. Nested steps
//! of an operation receive the [`GateGuard`] by reference as proof that the
//! gate is already held, so nothing ever re-acquires it.
//!
//! A gate built with [`SyncGate::with_lock_file`] also takes an exclusive
//! advisory lock on that file, so engines in separate processes (the
//! scheduler, a webhook delivery, a one-shot CLI call) exclude each other.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tether_core::{Action, Error, Result};
use tracing::{debug, warn};

/// Process-wide busy flag plus the name of the running action
#[derive(Debug, Default)]
pub struct SyncGate {
    busy: AtomicBool,
    running: Mutex<Option<Action>>,
    lock_path: Option<PathBuf>,
}

impl SyncGate {
    /// Gate local to this process
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gate that also holds an OS lock on `path` while acquired
    #[must_use]
    pub fn with_lock_file(path: impl Into<PathBuf>) -> Self {
        Self {
            lock_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn lock_path(&self) -> Option<&Path> {
        self.lock_path.as_deref()
    }

    /// Take the gate for `action`, or fail immediately if it is held
    pub fn try_acquire(&self, action: Action) -> Result<GateGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let running = self
                .running()
                .map_or_else(|| "unknown".to_string(), |a| a.label().to_string());
            debug!(%action, %running, "Sync gate busy");
            return Err(Error::Busy { running });
        }

        let lock = match self.lock_file(action) {
            Ok(lock) => lock,
            Err(e) => {
                self.busy.store(false, Ordering::Release);
                return Err(e);
            }
        };

        self.set_running(Some(action));
        debug!(%action, "Sync gate acquired");
        Ok(GateGuard {
            gate: self,
            action,
            lock,
        })
    }

    /// Open and lock the lock file, recording `action` in it for other processes
    fn lock_file(&self, action: Action) -> Result<Option<File>> {
        let Some(path) = &self.lock_path else {
            return Ok(None);
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::path_io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::path_io(path, e))?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                let running = fs::read_to_string(path)
                    .ok()
                    .map(|label| label.trim().to_string())
                    .filter(|label| !label.is_empty())
                    .unwrap_or_else(|| "unknown".to_string());
                debug!(%action, %running, "Sync gate held by another process");
                return Err(Error::Busy { running });
            }
            Err(e) => return Err(Error::path_io(path, e)),
        }

        // The label is informational; a failed write still leaves the lock held
        if let Err(e) = file.set_len(0).and_then(|()| file.write_all(action.label().as_bytes())) {
            warn!(path = %path.display(), error = %e, "Failed to record gate holder");
        }
        Ok(Some(file))
    }

    /// Whether an operation in this process holds the gate
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Action currently holding the gate in this process
    pub fn running(&self) -> Option<Action> {
        match self.running.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_running(&self, action: Option<Action>) {
        match self.running.lock() {
            Ok(mut guard) => *guard = action,
            Err(poisoned) => *poisoned.into_inner() = action,
        }
    }
}

/// Held gate; released on drop, including during unwinding
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a SyncGate,
    action: Action,
    lock: Option<File>,
}

impl GateGuard<'_> {
    pub fn action(&self) -> Action {
        self.action
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        // closing the file releases the OS lock before the flag opens up
        drop(self.lock.take());
        self.gate.set_running(None);
        self.gate.busy.store(false, Ordering::Release);
        debug!(action = %self.action, "Sync gate released");
    }
}
