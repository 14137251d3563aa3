//! Backups and the health report

use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;
use tether_core::platform::CURRENT_PLATFORM;
use tether_engine::{CheckStatus, DoctorReport};

use crate::command::Command;
use crate::common::{RuntimeContext, print_json, print_output};
use crate::error::{CommandError, Result};

/// Backup command
#[derive(Debug, Args)]
pub struct BackupCommand {
    /// Archive name, sanitized and suffixed with a timestamp
    #[arg(default_value = "backup")]
    pub name: String,

    /// Untracked paths to include, relative to the server root
    #[arg(short, long = "include", value_name = "PATH")]
    pub include: Vec<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for BackupCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let report = context.sync().backup(&self.name, &self.include)?;
        print_output(&report, self.json)
    }
}

#[derive(Debug, Serialize)]
struct BuildInfo {
    version: &'static str,
    git_sha: Option<&'static str>,
    rustc: Option<&'static str>,
    timestamp: Option<&'static str>,
}

impl BuildInfo {
    fn current() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            git_sha: option_env!("VERGEN_GIT_SHA"),
            rustc: option_env!("VERGEN_RUSTC_SEMVER"),
            timestamp: option_env!("VERGEN_BUILD_TIMESTAMP"),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput<'a> {
    build: BuildInfo,
    healthy: bool,
    #[serde(flatten)]
    report: &'a DoctorReport,
}

/// Doctor command
///
/// Exits non-zero when any check failed.
#[derive(Debug, Args)]
pub struct DoctorCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for DoctorCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let report = context.sync().doctor();
        let build = BuildInfo::current();

        if self.json {
            print_json(&DoctorOutput {
                build,
                healthy: report.healthy(),
                report: &report,
            })?;
        } else {
            println!(
                "{} {} ({}, {}/{})",
                "tether".bold(),
                build.version,
                build.git_sha.unwrap_or("unknown build"),
                CURRENT_PLATFORM.os,
                CURRENT_PLATFORM.arch
            );
            for check in &report.checks {
                let label = match check.status {
                    CheckStatus::Pass => "  ok".green().to_string(),
                    CheckStatus::Warn => "warn".yellow().to_string(),
                    CheckStatus::Fail => "FAIL".red().to_string(),
                };
                println!("[{label}] {}: {}", check.name, check.detail);
            }
        }

        let failed = report
            .checks
            .iter()
            .filter(|c| c.status == CheckStatus::Fail)
            .count();
        if failed > 0 {
            return Err(CommandError::Unhealthy { failed });
        }
        Ok(())
    }
}
