//! Staged plugin reloads

use clap::Subcommand;
use owo_colors::OwoColorize;

use crate::common::{RuntimeContext, print_json};
use crate::error::Result;

/// Commands for plugin jars queued by staged pulls
#[derive(Debug, Subcommand)]
pub enum JarsCommands {
    /// Show queued unloads and loads
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Run the queue through the plugin host and empty it
    Apply {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Drop the queue without running anything
    Clear,
}

/// Run a jars subcommand
pub fn run(command: &JarsCommands, context: &RuntimeContext) -> Result<()> {
    let sync = context.sync();
    match command {
        JarsCommands::List { json } => {
            let staged = sync.jars().staged();
            if *json {
                return print_json(&staged);
            }
            if staged.is_empty() {
                println!("No staged jar operations");
                return Ok(());
            }
            for name in &staged.unload {
                println!("{} {name}", "unload".yellow());
            }
            for name in &staged.load {
                println!("{} {name}", "load".green());
            }
        }
        JarsCommands::Apply { json } => {
            let report = sync.apply_staged_jars()?;
            if *json {
                return print_json(&report);
            }
            for name in &report.unloaded {
                println!("{} unloaded {name}", "✓".green());
            }
            for name in &report.loaded {
                println!("{} loaded {name}", "✓".green());
            }
            for name in &report.failed {
                println!("{} {name} failed, see the log", "✗".red());
            }
        }
        JarsCommands::Clear => {
            let report = sync.clear_staged_jars()?;
            println!("{report}");
        }
    }
    Ok(())
}
