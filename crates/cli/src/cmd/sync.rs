//! Pull, push and history rewinding commands

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use clap::Args;
use serde::Serialize;
use tracing::debug;

use crate::command::Command;
use crate::common::{RuntimeContext, print_json, print_output};
use crate::error::{CommandError, Result};

const LOCAL_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"];

/// Pull command
#[derive(Debug, Args)]
pub struct PullCommand {
    /// Fail on the first transient error instead of backing off and retrying
    #[arg(long)]
    pub no_retry: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for PullCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let sync = context.sync();
        let outcome = if self.no_retry {
            sync.pull()?
        } else {
            sync.pull_with_retry()?
        };
        print_output(&outcome, self.json)?;
        if !self.json {
            for change in &outcome.changes {
                println!("  {change}");
            }
        }
        Ok(())
    }
}

/// Push command
#[derive(Debug, Args)]
pub struct PushCommand {
    /// Commit message
    #[arg(short, long)]
    pub message: String,

    /// Author name recorded on the commit (default: repository.author_name)
    #[arg(long)]
    pub author: Option<String>,

    /// Push despite a pending external merge or a require-force branch
    #[arg(short, long)]
    pub force: bool,

    /// Fail on the first transient error instead of backing off and retrying
    #[arg(long)]
    pub no_retry: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for PushCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let sync = context.sync();
        let author = self.author.as_deref();
        let outcome = if self.no_retry {
            sync.push(&self.message, author, self.force)?
        } else {
            sync.push_with_retry(&self.message, author, self.force)?
        };
        print_output(&outcome, self.json)
    }
}

/// Reset command
#[derive(Debug, Args)]
pub struct ResetCommand {
    /// Commit, branch or tag to reset to
    #[arg(default_value = "HEAD")]
    pub rev: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for ResetCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let oid = context.sync().reset(&self.rev)?;
        print_commit("Reset to", &oid.to_string(), self.json)
    }
}

/// Revert command
#[derive(Debug, Args)]
pub struct RevertCommand {
    /// Commit to revert
    pub rev: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for RevertCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let oid = context.sync().revert(&self.rev)?;
        print_commit("Reverted with", &oid.to_string(), self.json)
    }
}

/// Rollback command
#[derive(Debug, Args)]
pub struct RollbackCommand {
    /// RFC 3339 instant, or local time as `YYYY-MM-DD HH:MM[:SS]`
    pub time: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for RollbackCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let at = parse_time(&self.time)?;
        debug!(%at, "Rolling back");
        let oid = context.sync().rollback(at)?;
        print_commit("Rolled back to", &oid.to_string(), self.json)
    }
}

/// Ready-to-merge command
#[derive(Debug, Args)]
pub struct ReadyCommand {
    /// Branch the current work should be merged into
    #[arg(long)]
    pub target: Option<String>,

    /// Author name recorded in the descriptor
    #[arg(long)]
    pub author: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

impl Command for ReadyCommand {
    type Output = ();

    fn execute(&self, context: &RuntimeContext) -> Result<()> {
        let oid = context
            .sync()
            .mark_ready(self.target.as_deref(), self.author.as_deref())?;
        print_commit("Marked ready to merge in", &oid.to_string(), self.json)
    }
}

#[derive(Serialize)]
struct CommitOutput<'a> {
    commit: &'a str,
}

/// Print a commit-producing result, short id for humans and full id for JSON
pub(crate) fn print_commit(label: &str, commit: &str, json: bool) -> Result<()> {
    if json {
        return print_json(&CommitOutput { commit });
    }
    let short = git_short(commit);
    println!("{label} {short}");
    Ok(())
}

fn git_short(commit: &str) -> String {
    commit.chars().take(7).collect()
}

/// Parse an RFC 3339 instant or a local wall-clock time
pub fn parse_time(input: &str) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(input) {
        return Ok(at.with_timezone(&Utc));
    }
    for format in LOCAL_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Local
                .from_local_datetime(&naive)
                .earliest()
                .map(|at| at.with_timezone(&Utc))
                .ok_or_else(|| CommandError::invalid("time", input, "does not exist locally"));
        }
    }
    Err(CommandError::invalid(
        "time",
        input,
        "expected RFC 3339 or YYYY-MM-DD HH:MM[:SS]",
    ))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_rfc3339() {
        let at = parse_time("2024-03-01T12:30:00+02:00").unwrap();
        assert_eq!(at.to_rfc3339(), "2024-03-01T10:30:00+00:00");
    }

    #[test]
    fn test_parse_local_time() {
        let at = parse_time("2024-03-01 12:30").unwrap();
        let local = at.with_timezone(&Local);
        assert_eq!((local.hour(), local.minute(), local.second()), (12, 30, 0));

        let with_seconds = parse_time(" 2024-03-01 12:30:15 ").unwrap();
        assert_eq!(with_seconds.with_timezone(&Local).second(), 15);
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        for input in ["yesterday", "2024-03-01", "12:30", ""] {
            let err = parse_time(input).unwrap_err();
            assert!(matches!(err, CommandError::InvalidArgument { .. }), "{input}");
        }
    }

    #[test]
    fn test_git_short() {
        assert_eq!(
            git_short("0123456789abcdef0123456789abcdef01234567"),
            "0123456"
        );
        assert_eq!(git_short("abc"), "abc");
    }
}
