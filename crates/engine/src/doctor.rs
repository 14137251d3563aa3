//! Health report for one server root

use crate::ignore_list::IgnoreListManager;
use crate::repo::{self, ORIGIN};
use crate::sync::{RepositorySync, short_id};
use serde::Serialize;
use std::fmt;
use tether_core::Action;
use tether_core::platform::CURRENT_PLATFORM;
use tether_secrets::{FilterMode, SecretStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    const fn label(self) -> &'static str {
        match self {
            Self::Pass => "ok",
            Self::Warn => "warn",
            Self::Fail => "FAIL",
        }
    }
}

/// One line of the report
#[derive(Debug, Clone, Serialize)]
pub struct Check {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DoctorReport {
    pub checks: Vec<Check>,
}

impl DoctorReport {
    fn push(&mut self, name: &'static str, status: CheckStatus, detail: impl Into<String>) {
        self.checks.push(Check {
            name,
            status,
            detail: detail.into(),
        });
    }

    /// No check failed
    pub fn healthy(&self) -> bool {
        self.checks.iter().all(|c| c.status != CheckStatus::Fail)
    }

    pub fn get(&self, name: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.name == name)
    }
}

impl fmt::Display for DoctorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, check) in self.checks.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "[{:>4}] {}: {}", check.status.label(), check.name, check.detail)?;
        }
        Ok(())
    }
}

impl RepositorySync {
    /// Check credentials, repository, remote, ignore file, secrets and markers
    ///
    /// Never fails: every problem becomes a line in the report. Every detail
    /// passes through the redactor.
    pub fn doctor(&self) -> DoctorReport {
        use CheckStatus::{Fail, Pass, Warn};

        let config = self.config();
        let mut report = DoctorReport::default();
        report.push(
            "platform",
            Pass,
            format!("{}/{}", CURRENT_PLATFORM.os, CURRENT_PLATFORM.arch),
        );

        match config.repository.require_url() {
            Ok(url) => report.push("remote", Pass, url.to_string()),
            Err(e) => report.push("remote", Fail, e.to_string()),
        }
        if config.repository.credentials().is_some() {
            report.push("credentials", Pass, "set");
        } else {
            report.push("credentials", Warn, "missing, relying on default credentials");
        }

        self.check_repository(&config, &mut report);

        let ignore = IgnoreListManager::new(self.layout.ignore_file());
        match ignore.managed_entries() {
            Ok(entries) => report.push(
                "ignore list",
                Pass,
                format!("{} managed rules", entries.len()),
            ),
            Err(e) if self.layout.ignore_file().exists() => {
                report.push("ignore list", Fail, e.to_string());
            }
            Err(_) => report.push("ignore list", Warn, "no ignore file yet"),
        }

        match SecretStore::load(self.layout.secrets_store()) {
            Ok(store) => {
                self.refresh_redactions(&store);
                let issues = store.validate(self.layout.root());
                match self.filters.rules(self.layout.root(), &store) {
                    Ok(filters) => {
                        let mode = match filters.mode {
                            FilterMode::StreamEditor => "stream editor".to_string(),
                            FilterMode::ReplaceTool(path) => {
                                format!("replace tool at {}", path.display())
                            }
                        };
                        report.push(
                            "secret filters",
                            Pass,
                            format!("{mode}, {} filtered files", filters.rules.len()),
                        );
                    }
                    Err(e) => report.push("secret filters", Fail, e.to_string()),
                }
                if issues.is_empty() {
                    report.push("secrets", Pass, format!("{} secrets", store.len()));
                } else {
                    let detail = issues
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("; ");
                    report.push("secrets", Warn, detail);
                }
            }
            Err(e) => report.push("secrets", Fail, e.to_string()),
        }

        if self.layout.merged_marker().exists() {
            report.push(
                "merge marker",
                Warn,
                "external merge waiting for review; push needs --force",
            );
        } else {
            report.push("merge marker", Pass, "absent");
        }

        match self.gate.running() {
            Some(action) => report.push("sync gate", Warn, format!("busy ({action})")),
            None => report.push("sync gate", Pass, "idle"),
        }

        let staged = self.jars().staged();
        if !staged.is_empty() {
            report.push(
                "staged jars",
                Warn,
                format!("{} unloads, {} loads waiting", staged.unload.len(), staged.load.len()),
            );
        }

        for check in &mut report.checks {
            check.detail = self.redactor().redact(&check.detail);
        }
        report
    }

    fn check_repository(&self, config: &tether_config::Config, report: &mut DoctorReport) {
        use CheckStatus::{Fail, Pass, Warn};

        if !self.layout.repo_exists() {
            report.push("repository", Warn, "not initialized; run pull");
            return;
        }
        let repository = match repo::open(self.layout.root()) {
            Ok(repository) => repository,
            Err(e) => {
                report.push("repository", Fail, e.to_string());
                return;
            }
        };
        let branch = repo::current_branch(&repository).unwrap_or_else(|_| "(detached)".to_string());
        let head = repo::head_commit(&repository)
            .ok()
            .flatten()
            .map_or_else(|| "no commits".to_string(), |c| short_id(c.id()));
        report.push("repository", Pass, format!("branch {branch} at {head}"));

        // Fetching moves tracking refs, so it needs the gate
        let fetched = match self.gate.try_acquire(Action::Preview) {
            Ok(_guard) => {
                match repo::fetch(
                    &repository,
                    ORIGIN,
                    &[repo::tracking_refspec(ORIGIN)],
                    config.repository.credentials().as_ref(),
                ) {
                    Ok(()) => {
                        report.push("fetch", Pass, "origin reachable");
                        true
                    }
                    Err(e) => {
                        report.push("fetch", Fail, e.to_string());
                        false
                    }
                }
            }
            Err(e) => {
                report.push("fetch", Warn, format!("skipped: {e}"));
                false
            }
        };

        let local = repo::head_commit(&repository).ok().flatten().map(|c| c.id());
        match (local, repo::remote_branch_oid(&repository, ORIGIN, &branch)) {
            (Some(local), Some(remote)) => match repo::ahead_behind(&repository, local, remote) {
                Ok((ahead, behind)) => report.push(
                    "tracking",
                    if behind > 0 { Warn } else { Pass },
                    format!("ahead {ahead}, behind {behind}"),
                ),
                Err(e) => report.push("tracking", Fail, e.to_string()),
            },
            _ if fetched => report.push("tracking", Warn, format!("{branch} not on remote")),
            _ => {}
        }
    }
}
