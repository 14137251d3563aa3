//! Long-running mode and webhook delivery

use clap::Args;
use std::io::{self, BufRead};
use std::time::Duration;
use tether_core::Error;
use tether_engine::Scheduler;
use tracing::{info, warn};

use crate::command::Command;
use crate::common::{RuntimeContext, print_output};
use crate::error::Result;

/// Run command
///
/// Pulls on the configured schedule and reads console commands from stdin:
/// `pull`, `status`, `metrics` and `stop`. When stdin closes the scheduler
/// keeps running until the process is terminated.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Pull every N minutes, even if automation is disabled in the config
    #[arg(long, value_name = "MINUTES")]
    pub every: Option<u64>,

    /// Only preview incoming changes instead of pulling
    #[arg(long)]
    pub dry_run: bool,
}

impl Command for RunCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let sync = context.shared();
        let scheduler = match self.every {
            Some(0) => {
                return Err(Error::Precondition("--every must be at least 1".to_string()).into());
            }
            Some(minutes) => Some(Scheduler::with_interval(
                sync,
                Duration::from_secs(minutes * 60),
                self.dry_run || context.sync().config().automation.dry_run,
            )),
            None => Scheduler::start(sync),
        };
        let Some(scheduler) = scheduler else {
            return Err(Error::Precondition(
                "automation.enabled is false; enable it or pass --every".to_string(),
            )
            .into());
        };

        info!(interval = ?scheduler.interval(), "Running; type `stop` to exit");
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let line = line?;
            match line.trim() {
                "" => {}
                "stop" | "quit" | "exit" => {
                    scheduler.stop();
                    println!("{}", context.sync().metrics().snapshot());
                    return Ok(());
                }
                "pull" => report(context, context.sync().pull().map(|o| o.to_string())),
                "status" => report(context, context.sync().status().map(|s| s.to_string())),
                "metrics" => println!("{}", context.sync().metrics().snapshot()),
                other => warn!(command = other, "Unknown console command"),
            }
        }

        info!("stdin closed, running until terminated");
        loop {
            std::thread::park();
        }
    }
}

fn report(context: &RuntimeContext, result: tether_core::Result<String>) {
    match result {
        Ok(summary) => println!("{summary}"),
        Err(e) => eprintln!("{}", context.redactor().redact(&e.to_string())),
    }
}

/// Webhook command
///
/// Entry point for an upstream push notification; pulls with retries.
#[derive(Debug, Args)]
pub struct WebhookCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for WebhookCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let outcome = context.sync().on_external_push()?;
        print_output(&outcome, self.json)
    }
}
