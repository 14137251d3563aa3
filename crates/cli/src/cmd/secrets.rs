//! Inspecting the secrets store

use clap::Subcommand;
use owo_colors::OwoColorize;
use tether_secrets::SecretStore;

use crate::common::{RuntimeContext, print_json};
use crate::error::Result;

/// Commands for the secrets store
#[derive(Debug, Subcommand)]
pub enum SecretsCommands {
    /// Check that every placeholder is present in its file
    Validate {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show a file with its secrets substituted, without writing it
    Preview {
        /// File relative to the server root, as named in the store
        file: String,
    },
}

fn load(context: &RuntimeContext) -> Result<SecretStore> {
    let store = SecretStore::load(context.sync().layout().secrets_store())?;
    context.sync().refresh_redactions(&store);
    Ok(store)
}

/// Run a secrets subcommand
pub fn run(command: &SecretsCommands, context: &RuntimeContext) -> Result<()> {
    let store = load(context)?;
    match command {
        SecretsCommands::Validate { json } => {
            let issues = store.validate(context.root());
            if *json {
                let issues: Vec<_> = issues
                    .iter()
                    .map(|issue| serde_json::json!({ "file": issue.file, "message": issue.message }))
                    .collect();
                return print_json(&issues);
            }
            if issues.is_empty() {
                println!("{} {} secrets valid", "✓".green(), store.len());
            } else {
                for issue in &issues {
                    println!("{} {issue}", "✗".red());
                }
            }
        }
        SecretsCommands::Preview { file } => {
            println!("{}", store.preview(context.root(), file)?);
        }
    }
    Ok(())
}
