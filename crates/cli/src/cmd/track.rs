//! Adding and removing tracked paths

use clap::Args;

use crate::command::Command;
use crate::common::{RuntimeContext, print_output};
use crate::error::Result;

/// Add command
#[derive(Debug, Args)]
pub struct AddCommand {
    /// Paths relative to the server root
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for AddCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        for path in &self.paths {
            let outcome = context.sync().track(path)?;
            print_output(&outcome, self.json)?;
        }
        Ok(())
    }
}

/// Remove command
///
/// The files stay on disk; only the repository stops tracking them.
#[derive(Debug, Args)]
pub struct RemoveCommand {
    /// Paths relative to the server root
    #[arg(required = true)]
    pub paths: Vec<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for RemoveCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        for path in &self.paths {
            let outcome = context.sync().untrack(path)?;
            print_output(&outcome, self.json)?;
        }
        Ok(())
    }
}
