//! External merges and recovery from a broken working tree

use clap::Args;
use owo_colors::OwoColorize;
use tether_core::Error;
use tether_engine::MergePreference;

use crate::cmd::sync::print_commit;
use crate::command::Command;
use crate::common::{RuntimeContext, print_output};
use crate::error::Result;

/// Merge command
#[derive(Debug, Args)]
pub struct MergeCommand {
    /// Configured remote name or repository URL
    pub remote: String,

    /// Branch of that remote to merge
    pub branch: String,

    /// Side that wins conflicting hunks (ours, theirs)
    #[arg(long, value_parser = parse_preference)]
    pub prefer: Option<MergePreference>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

fn parse_preference(value: &str) -> std::result::Result<MergePreference, String> {
    value.parse().map_err(|e: Error| e.to_string())
}

impl Command for MergeCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let outcome = context
            .sync()
            .merge_external(&self.remote, &self.branch, self.prefer)?;
        print_output(&outcome, self.json)?;
        if outcome.merged && !self.json {
            println!(
                "{} plain pushes are blocked until you run `tether push --force` or `tether merge-abort`",
                "Note:".yellow()
            );
        }
        Ok(())
    }
}

/// Merge-abort command
#[derive(Debug, Args)]
pub struct MergeAbortCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for MergeAbortCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let oid = context.sync().merge_abort()?;
        print_commit("Merge aborted, working tree reset to", &oid.to_string(), self.json)
    }
}

/// Repo-reset command
#[derive(Debug, Args)]
pub struct RepoResetCommand {
    /// Confirm deleting the repository metadata
    #[arg(long)]
    pub yes: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for RepoResetCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        if !self.yes {
            return Err(Error::Precondition(
                "repo-reset deletes .git and .gitignore; pass --yes to confirm".to_string(),
            )
            .into());
        }
        let removed = context.sync().repo_reset()?;
        print_output(&removed, self.json)?;
        if !self.json {
            for path in &removed.0 {
                println!("  {}", path.display());
            }
        }
        Ok(())
    }
}
