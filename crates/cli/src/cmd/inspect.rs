//! Read-only views of the repository

use clap::{Args, Subcommand};
use owo_colors::OwoColorize;

use crate::command::Command;
use crate::common::{RuntimeContext, print_json, print_output};
use crate::error::Result;

/// Status command
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for StatusCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let report = context.sync().status()?;
        print_output(&report, self.json)
    }
}

/// Log command
#[derive(Debug, Args)]
pub struct LogCommand {
    /// Page of ten commits, newest first
    #[arg(default_value_t = 1)]
    pub page: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for LogCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let entries = context.sync().log(self.page)?;
        if self.json {
            return print_json(&entries);
        }
        println!("{}", format!("History, page {}", self.page).bold());
        for entry in &entries {
            println!("{entry}");
        }
        Ok(())
    }
}

/// Show command
#[derive(Debug, Args)]
pub struct ShowCommand {
    /// Commit to describe
    #[arg(default_value = "HEAD")]
    pub rev: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for ShowCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let details = context.sync().show(&self.rev)?;
        print_output(&details, self.json)
    }
}

/// What to preview
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum PreviewTarget {
    /// Fetch and list what a pull would bring in
    Pull,
    /// List what a push would commit and send
    Push,
}

/// Preview command
#[derive(Debug, Args)]
pub struct PreviewCommand {
    #[command(subcommand)]
    pub target: PreviewTarget,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,
}

impl Command for PreviewCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let sync = context.sync();
        let preview = match self.target {
            PreviewTarget::Pull => sync.preview_pull()?,
            PreviewTarget::Push => sync.preview_push()?,
        };
        print_output(&preview, self.json)
    }
}
