//! Command trait for the tether CLI
//!
//! Every subcommand implements [`Command`] and receives the shared
//! [`RuntimeContext`], which owns the one [`tether_engine::RepositorySync`]
//! of this process.

use crate::common::RuntimeContext;
use crate::error::Result;

/// Trait for all tether commands
///
/// # Example
///
/// ```rust,ignore
/// use crate::command::Command;
/// use crate::common::RuntimeContext;
/// use crate::error::Result;
/// use clap::Args;
///
/// #[derive(Debug, Args)]
/// pub struct MyCommand {
///     #[arg(long)]
///     pub json: bool,
/// }
///
/// impl Command for MyCommand {
///     type Output = ();
///
///     fn execute(&self, context: &RuntimeContext) -> Result<()> {
///         let status = context.sync().status()?;
///         println!("{status}");
///         Ok(())
///     }
/// }
/// ```
pub trait Command {
    /// The type returned by this command
    type Output;

    /// Execute the command with the given runtime context
    ///
    /// # Errors
    ///
    /// Returns a `CommandError` if the command fails to execute. Error messages should
    /// be descriptive enough for the operator to understand what went wrong.
    fn execute(&self, context: &RuntimeContext) -> Result<Self::Output>;
}
