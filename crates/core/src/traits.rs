//! Collaborator traits for tether components
//!
//! The engine talks to the game server and to whatever renders progress only
//! through these interfaces, so both can be swapped out in tests.

use crate::Result;
use std::fmt;

/// Repository operations that report progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Pull,
    Push,
    Reset,
    Revert,
    Rollback,
    Branch,
    Merge,
    Ready,
    Track,
    Untrack,
    Recovery,
    Preview,
    Jars,
}

impl Action {
    /// Lowercase name used in busy messages and progress labels
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Pull => "pull",
            Self::Push => "push",
            Self::Reset => "reset",
            Self::Revert => "revert",
            Self::Rollback => "rollback",
            Self::Branch => "branch",
            Self::Merge => "merge",
            Self::Ready => "ready",
            Self::Track => "add",
            Self::Untrack => "remove",
            Self::Recovery => "recovery",
            Self::Preview => "preview",
            Self::Jars => "jars",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Receives human-readable status transitions for running operations
///
/// Implementations must be cheap; they are called while the sync gate is held.
pub trait ProgressSink: Send + Sync {
    /// An operation acquired the gate and started working
    fn started(&self, action: Action);

    /// The operation finished successfully
    fn succeeded(&self, action: Action, message: &str);

    /// The operation failed
    fn failed(&self, action: Action, message: &str);
}

/// Progress sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn started(&self, _action: Action) {}

    fn succeeded(&self, _action: Action, _message: &str) {}

    fn failed(&self, _action: Action, _message: &str) {}
}

/// Server-side hooks for plugin artifacts
///
/// # Examples
///
/// ```ignore
/// fn reload(host: &dyn PluginHost, name: &str) -> Result<()> {
///     host.unload(name)?;
///     host.load(name)
/// }
/// ```
pub trait PluginHost: Send + Sync {
    /// Unload a running plugin by its logical name
    fn unload(&self, name: &str) -> Result<()>;

    /// Load a plugin by its logical name
    fn load(&self, name: &str) -> Result<()>;

    /// Schedule a restart of the dependent server process
    fn restart(&self) -> Result<()>;
}
