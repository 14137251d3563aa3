//! # Tether Engine
//!
//! Keeps a live server tree in sync with a git remote.
//!
//! - **Sync**: pull, push, reset, revert, rollback, external merges and
//!   recovery, all serialized through one [`SyncGate`]
//! - **Ignore list**: the managed allow/deny section of `.gitignore`
//! - **Jars**: unloading and reloading plugin artifacts changed by a pull
//! - **Inspection**: status, history, branches and previews
//! - **Maintenance**: backups, the doctor report and scheduled pulls

pub mod automation;
pub mod backup;
pub mod change;
pub mod doctor;
pub mod gate;
pub mod ignore_list;
pub mod inspect;
pub mod jars;
pub mod metrics;
pub(crate) mod repo;
pub mod retry;
pub mod sync;

// Re-export error types from core
pub use tether_core::{Error, ErrorKind, Result};

pub use automation::Scheduler;
pub use backup::BackupReport;
pub use change::{ChangeEntry, ChangeKind};
pub use doctor::{CheckStatus, DoctorReport};
pub use gate::{GateGuard, SyncGate};
pub use ignore_list::IgnoreListManager;
pub use inspect::{BranchInfo, CommitDetails, LogEntry, Preview, StatusReport};
pub use jars::{
    CommandPluginHost, JarApplyReport, JarClearReport, JarReloadCoordinator, StagedJarOps,
};
pub use metrics::{Metrics, MetricsSnapshot};
pub use retry::RetryPolicy;
pub use sync::{
    MergeOutcome, MergePreference, PullOutcome, PushOutcome, RemovedPaths, RepositorySync,
    TrackOutcome,
};
