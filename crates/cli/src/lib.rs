//! Tether CLI library
//!
//! Maps one subcommand to one engine operation on the server root. Kept as
//! a library so the argument surface can be tested without spawning the
//! binary.

pub mod cmd;
pub mod command;
pub mod common;
pub mod error;
pub mod ui;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tether_core::{ProgressSink, Redactor};

use command::Command;
use common::RuntimeContext;
use ui::SpinnerProgress;

/// Tether - keep a live server directory in sync with a git remote
#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Keep a live server directory in sync with a git remote")]
#[command(version)]
#[command(long_about = "Keep a live server directory in sync with a git remote

The server root is the working tree. Everything in it is ignored unless
added with `tether add`; secrets listed in the store never reach the
remote and are restored on every checkout.")]
pub struct Cli {
    /// Server root (the repository working tree)
    #[arg(long, env = "TETHER_ROOT", value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Path to the config file (default: <root>/plugins/Tether/tether.toml)
    #[arg(long, env = "TETHER_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose output (shows DEBUG level logs)
    #[arg(short, long)]
    pub verbose: bool,

    /// Append logs to a file
    #[arg(long, env = "TETHER_LOG_FILE", value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the tether CLI
#[derive(Subcommand)]
pub enum Commands {
    /// Fetch and merge the remote branch, initializing the repository if needed
    Pull(cmd::sync::PullCommand),

    /// Commit all local changes and push them
    Push(cmd::sync::PushCommand),

    /// Hard reset the working tree to a commit
    Reset(cmd::sync::ResetCommand),

    /// Commit the inverse of a commit and push it
    Revert(cmd::sync::RevertCommand),

    /// Reset to the newest commit at or before a point in time
    Rollback(cmd::sync::RollbackCommand),

    /// Commit and push a ready-to-merge descriptor for external tooling
    Ready(cmd::sync::ReadyCommand),

    /// List branches, or switch to one
    Branch(cmd::branch::BranchCommand),

    /// Merge a branch of another remote into the working tree for review
    Merge(cmd::recovery::MergeCommand),

    /// Abandon a pending merge and reset to HEAD
    MergeAbort(cmd::recovery::MergeAbortCommand),

    /// Delete the repository metadata so the next pull starts over
    RepoReset(cmd::recovery::RepoResetCommand),

    /// Start tracking paths and push the change
    Add(cmd::track::AddCommand),

    /// Stop tracking paths and push the change; files stay on disk
    Remove(cmd::track::RemoveCommand),

    /// Show branch, tracking state and local changes
    Status(cmd::inspect::StatusCommand),

    /// Show commit history, ten commits per page
    Log(cmd::inspect::LogCommand),

    /// Show one commit and the paths it changed
    Show(cmd::inspect::ShowCommand),

    /// Show what a pull or push would do without doing it
    Preview(cmd::inspect::PreviewCommand),

    /// Zip the tracked files and extra paths into the backups directory
    Backup(cmd::maintenance::BackupCommand),

    /// Check configuration, repository, remote and secrets
    Doctor(cmd::maintenance::DoctorCommand),

    /// Inspect the secrets store
    #[command(subcommand)]
    Secrets(cmd::secrets::SecretsCommands),

    /// Manage plugin jar operations queued by staged pulls
    #[command(subcommand)]
    Jars(cmd::jars::JarsCommands),

    /// Handle an upstream push notification
    Webhook(cmd::run::WebhookCommand),

    /// Pull on a schedule until stopped
    Run(cmd::run::RunCommand),
}

impl Commands {
    /// Commands that own the terminal for a long time draw no spinners
    fn quiet(&self) -> bool {
        matches!(self, Self::Run(_) | Self::Webhook(_))
    }
}

fn execute_command(command: &Commands, context: &RuntimeContext) -> error::Result<()> {
    match command {
        Commands::Pull(c) => c.execute(context),
        Commands::Push(c) => c.execute(context),
        Commands::Reset(c) => c.execute(context),
        Commands::Revert(c) => c.execute(context),
        Commands::Rollback(c) => c.execute(context),
        Commands::Ready(c) => c.execute(context),
        Commands::Branch(c) => c.execute(context),
        Commands::Merge(c) => c.execute(context),
        Commands::MergeAbort(c) => c.execute(context),
        Commands::RepoReset(c) => c.execute(context),
        Commands::Add(c) => c.execute(context),
        Commands::Remove(c) => c.execute(context),
        Commands::Status(c) => c.execute(context),
        Commands::Log(c) => c.execute(context),
        Commands::Show(c) => c.execute(context),
        Commands::Preview(c) => c.execute(context),
        Commands::Backup(c) => c.execute(context),
        Commands::Doctor(c) => c.execute(context),
        Commands::Secrets(c) => cmd::secrets::run(c, context),
        Commands::Jars(c) => cmd::jars::run(c, context),
        Commands::Webhook(c) => c.execute(context),
        Commands::Run(c) => c.execute(context),
    }
}

/// # Errors
///
/// Returns an error if:
/// - Logging initialization fails
/// - The server root or the configuration cannot be resolved
/// - Command execution fails
///
/// Error messages pass through the redactor before they are returned.
pub fn run(cli: Cli) -> Result<()> {
    let redactor = Arc::new(Redactor::new());
    tether_config::logging::init(cli.verbose, cli.log_file.as_deref(), Arc::clone(&redactor))
        .context("Failed to initialize logging")?;

    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to determine the server root")?,
    };

    let progress: Arc<dyn ProgressSink> = if cli.command.quiet() {
        Arc::new(SpinnerProgress::quiet())
    } else {
        Arc::new(SpinnerProgress::new())
    };
    let context = RuntimeContext::new(
        &root,
        cli.config.as_deref(),
        Arc::clone(&redactor),
        progress,
    )
    .map_err(|e| anyhow!(redactor.redact(&format!("{e:#}"))))?;

    execute_command(&cli.command, &context)
        .map_err(|e| anyhow!(redactor.redact(&format!("{e:#}"))))
}
