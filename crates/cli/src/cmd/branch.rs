//! Branch listing and switching

use clap::Args;
use owo_colors::OwoColorize;

use crate::command::Command;
use crate::common::{RuntimeContext, print_json};
use crate::error::Result;

/// Branch command
///
/// Without a name, lists local branches. With a name, switches to it,
/// creating it from `origin/<name>` or the current commit when needed.
#[derive(Debug, Args)]
pub struct BranchCommand {
    /// Branch to switch to
    pub name: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for BranchCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let sync = context.sync();
        if let Some(name) = &self.name {
            let message = sync.switch_branch(name)?;
            if self.json {
                return print_json(&serde_json::json!({ "branch": name, "message": message }));
            }
            println!("{message}");
            return Ok(());
        }

        let branches = sync.branches()?;
        if self.json {
            return print_json(&branches);
        }
        for branch in &branches {
            if branch.current {
                println!("{}", branch.green());
            } else {
                println!("{branch}");
            }
        }
        Ok(())
    }
}
