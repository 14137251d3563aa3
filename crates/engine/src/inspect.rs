//! Read-only views of the repository: status, history, branches and previews

use crate::change::ChangeEntry;
use crate::jars::StagedJarOps;
use crate::repo::{self, GitContext, ORIGIN};
use crate::sync::{RepositorySync, no_repository, resolve_commit, short_id};
use chrono::{DateTime, Local, Utc};
use git2::{BranchType, Repository, Sort};
use serde::Serialize;
use std::fmt;
use tether_core::{Action, Error, Result};
use tether_secrets::{FilterRule, SecretStore};

/// Commits per page of [`RepositorySync::log`]
pub const LOG_PAGE_SIZE: usize = 10;

const SUMMARY_WIDTH: usize = 40;

/// Snapshot of the working tree against HEAD and origin
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub initialized: bool,
    pub branch: Option<String>,
    pub head: Option<String>,
    /// `(ahead, behind)` against the remote branch, if it exists
    pub tracking: Option<(usize, usize)>,
    pub changes: Vec<ChangeEntry>,
    pub merge_pending: bool,
    pub staged_jars: StagedJarOps,
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.initialized {
            return write!(f, "No repository yet; run pull first");
        }
        write!(
            f,
            "On branch {}",
            self.branch.as_deref().unwrap_or("(detached)")
        )?;
        match &self.head {
            Some(head) => writeln!(f, " at {head}")?,
            None => writeln!(f, " (no commits)")?,
        }
        match self.tracking {
            Some((ahead, behind)) => writeln!(f, "Ahead {ahead}, behind {behind}")?,
            None => writeln!(f, "No remote branch")?,
        }
        if self.changes.is_empty() {
            write!(f, "No local changes")?;
        } else {
            write!(f, "Local changes:")?;
            for change in &self.changes {
                write!(f, "\n  {change}")?;
            }
        }
        if self.merge_pending {
            write!(f, "\nExternal merge waiting for review")?;
        }
        if !self.staged_jars.is_empty() {
            write!(
                f,
                "\nStaged jars: {} to unload, {} to load",
                self.staged_jars.unload.len(),
                self.staged_jars.load.len()
            )?;
        }
        Ok(())
    }
}

/// One commit in a history listing
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: String,
    pub summary: String,
    pub author: String,
    pub time: DateTime<Utc>,
}

impl LogEntry {
    fn from_commit(commit: &git2::Commit<'_>) -> Self {
        Self {
            id: short_id(commit.id()),
            summary: commit
                .summary()
                .unwrap_or_default()
                .chars()
                .take(SUMMARY_WIDTH)
                .collect(),
            author: commit.author().name().unwrap_or_default().to_string(),
            time: DateTime::from_timestamp(commit.author().when().seconds(), 0)
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}: {}",
            self.id,
            self.time.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            self.author,
            self.summary
        )
    }
}

/// A commit with its message and changed paths
#[derive(Debug, Clone, Serialize)]
pub struct CommitDetails {
    pub entry: LogEntry,
    pub message: String,
    pub changes: Vec<ChangeEntry>,
}

impl fmt::Display for CommitDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.entry)?;
        let body = self.message.trim();
        if body != self.entry.summary {
            writeln!(f, "\n{body}\n")?;
        }
        for change in &self.changes {
            writeln!(f, "  {change}")?;
        }
        Ok(())
    }
}

/// A local branch and how it relates to origin
#[derive(Debug, Clone, Serialize)]
pub struct BranchInfo {
    pub name: String,
    pub current: bool,
    pub tracking: Option<(usize, usize)>,
}

impl fmt::Display for BranchInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.current { '*' } else { ' ' };
        match self.tracking {
            Some((ahead, behind)) => {
                write!(f, "{marker} {} (ahead {ahead}, behind {behind})", self.name)
            }
            None => write!(f, "{marker} {} [no remote]", self.name),
        }
    }
}

/// Which way a preview looks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

/// What a pull or push would change
#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub direction: Direction,
    /// Commits that would be transferred
    pub commits: usize,
    pub changes: Vec<ChangeEntry>,
}

impl fmt::Display for Preview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (label, empty) = match self.direction {
            Direction::Incoming => ("Incoming", "Nothing to pull"),
            Direction::Outgoing => ("Outgoing", "Nothing to push"),
        };
        if self.changes.is_empty() && self.commits == 0 {
            return write!(f, "{empty}");
        }
        write!(
            f,
            "{label}: {} commits, {} changed paths",
            self.commits,
            self.changes.len()
        )?;
        for change in &self.changes {
            write!(f, "\n  {change}")?;
        }
        Ok(())
    }
}

impl RepositorySync {
    /// Current branch, head, tracking counts and uncommitted changes
    pub fn status(&self) -> Result<StatusReport> {
        let staged_jars = self.jars().staged();
        if !self.layout.repo_exists() {
            return Ok(StatusReport {
                initialized: false,
                branch: None,
                head: None,
                tracking: None,
                changes: Vec::new(),
                merge_pending: false,
                staged_jars,
            });
        }

        let rules = self.current_rules()?;
        let repo = repo::open(self.layout.root())?;
        let branch = repo::current_branch(&repo).ok();
        let head = repo::head_commit(&repo)?;
        let tracking = match (&head, &branch) {
            (Some(head), Some(branch)) => repo::remote_branch_oid(&repo, ORIGIN, branch)
                .map(|remote| repo::ahead_behind(&repo, head.id(), remote))
                .transpose()?,
            _ => None,
        };

        Ok(StatusReport {
            initialized: true,
            branch,
            head: head.as_ref().map(|c| short_id(c.id())),
            tracking,
            changes: repo::local_changes(&repo, &rules)?,
            merge_pending: self.layout.merged_marker().exists(),
            staged_jars,
        })
    }

    /// Page `page` (1-based) of the history of HEAD, newest first
    ///
    /// Pages past the end of history are a precondition error; page 1 of an
    /// empty history is empty.
    pub fn log(&self, page: usize) -> Result<Vec<LogEntry>> {
        if page == 0 {
            return Err(Error::Precondition("Pages start at 1".to_string()));
        }
        let repo = self.open_existing()?;
        if repo::head_commit(&repo)?.is_none() {
            return Ok(Vec::new());
        }

        let mut walk = repo.revwalk().git_context("walk history")?;
        walk.set_sorting(Sort::TIME).git_context("walk history")?;
        walk.push_head().git_context("walk history")?;

        let entries = walk
            .skip((page - 1) * LOG_PAGE_SIZE)
            .take(LOG_PAGE_SIZE)
            .map(|oid| {
                let oid = oid.git_context("walk history")?;
                let commit = repo.find_commit(oid).git_context("find commit")?;
                Ok(LogEntry::from_commit(&commit))
            })
            .collect::<Result<Vec<_>>>()?;

        if entries.is_empty() && page > 1 {
            return Err(Error::Precondition(format!(
                "Page {page} is past the end of history"
            )));
        }
        Ok(entries)
    }

    /// Message and changed paths of `rev`
    pub fn show(&self, rev: &str) -> Result<CommitDetails> {
        let repo = self.open_existing()?;
        let commit = resolve_commit(&repo, rev)?;

        let tree = commit.tree().git_context("resolve tree")?;
        let parent_tree = match commit.parent(0) {
            Ok(parent) => Some(parent.tree().git_context("resolve parent tree")?),
            Err(_) => None,
        };
        let changes = repo::diff_trees(&repo, parent_tree.as_ref(), Some(&tree))?;

        Ok(CommitDetails {
            entry: LogEntry::from_commit(&commit),
            message: commit.message().unwrap_or_default().to_string(),
            changes,
        })
    }

    /// Local branches with ahead/behind counts against origin
    pub fn branches(&self) -> Result<Vec<BranchInfo>> {
        let repo = self.open_existing()?;
        let current = repo::current_branch(&repo).ok();

        let mut infos = Vec::new();
        for entry in repo
            .branches(Some(BranchType::Local))
            .git_context("list branches")?
        {
            let (branch, _) = entry.git_context("list branches")?;
            let Some(name) = branch.name().git_context("branch name")?.map(str::to_string) else {
                continue;
            };
            let tracking = match (branch.get().target(), repo::remote_branch_oid(&repo, ORIGIN, &name)) {
                (Some(local), Some(remote)) => Some(repo::ahead_behind(&repo, local, remote)?),
                _ => None,
            };
            infos.push(BranchInfo {
                current: current.as_deref() == Some(name.as_str()),
                name,
                tracking,
            });
        }
        Ok(infos)
    }

    /// Fetch and list what a pull would bring in, without merging
    pub fn preview_pull(&self) -> Result<Preview> {
        self.run_locked(Action::Preview, |_guard| {
            let config = self.config();
            let repo = self.open_existing()?;
            repo::fetch(
                &repo,
                ORIGIN,
                &[repo::tracking_refspec(ORIGIN)],
                config.repository.credentials().as_ref(),
            )?;

            let branch = repo::current_branch(&repo)?;
            let remote = repo::remote_branch_oid(&repo, ORIGIN, &branch)
                .ok_or_else(|| Error::NotFound(format!("Branch {branch} does not exist on the remote")))?;
            let incoming = repo.find_commit(remote).git_context("find remote commit")?;
            let head = repo::head_commit(&repo)?;

            let (commits, base_tree) = match &head {
                Some(head) => {
                    let (_, behind) = repo::ahead_behind(&repo, head.id(), remote)?;
                    (behind, Some(head.tree().git_context("resolve HEAD tree")?))
                }
                None => (count_commits(&repo, remote)?, None),
            };
            let incoming_tree = incoming.tree().git_context("resolve remote tree")?;
            let changes = if commits == 0 {
                Vec::new()
            } else {
                repo::diff_trees(&repo, base_tree.as_ref(), Some(&incoming_tree))?
            };

            Ok(Preview {
                direction: Direction::Incoming,
                commits,
                changes,
            })
        })
    }

    /// List uncommitted changes and unpushed commits
    pub fn preview_push(&self) -> Result<Preview> {
        self.run_locked(Action::Preview, |_guard| {
            let rules = self.current_rules()?;
            let repo = self.open_existing()?;
            let branch = repo::current_branch(&repo)?;
            let commits = match (
                repo::head_commit(&repo)?,
                repo::remote_branch_oid(&repo, ORIGIN, &branch),
            ) {
                (Some(head), Some(remote)) => repo::ahead_behind(&repo, head.id(), remote)?.0,
                (Some(head), None) => count_commits(&repo, head.id())?,
                (None, _) => 0,
            };

            Ok(Preview {
                direction: Direction::Outgoing,
                commits,
                changes: repo::local_changes(&repo, &rules)?,
            })
        })
    }

    fn open_existing(&self) -> Result<Repository> {
        if !self.layout.repo_exists() {
            return Err(no_repository());
        }
        repo::open(self.layout.root())
    }

    /// Filter rules for the current store without rewriting repository config
    fn current_rules(&self) -> Result<Vec<FilterRule>> {
        let store = SecretStore::load(self.layout.secrets_store())?;
        self.refresh_redactions(&store);
        Ok(self.filters.rules(self.layout.root(), &store)?.rules)
    }
}

fn count_commits(repo: &Repository, tip: git2::Oid) -> Result<usize> {
    let mut walk = repo.revwalk().git_context("walk history")?;
    walk.push(tip).git_context("walk history")?;
    Ok(walk.count())
}
