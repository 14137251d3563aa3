//! Repository synchronization
//!
//! Every mutating operation runs inside [`RepositorySync::run_locked`]: take
//! the [`SyncGate`], report progress, run, release. Steps shared between
//! operations take the held [`GateGuard`] instead of acquiring again.

use crate::change::ChangeEntry;
use crate::gate::{GateGuard, SyncGate};
use crate::ignore_list::IgnoreListManager;
use crate::jars::{CommandPluginHost, JarApplyReport, JarClearReport, JarReloadCoordinator};
use crate::metrics::Metrics;
use crate::repo::{self, GitContext, ORIGIN};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{BranchType, FileFavor, MergeOptions, Oid, Repository, RepositoryState};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tether_config::layout::{IGNORE_FILE, READY_MARKER};
use tether_config::{Config, Layout, ProtectedMode};
use tether_core::{
    Action, Error, ErrorKind, NoopProgress, PluginHost, ProgressSink, Redactor, Result,
};
use tether_secrets::{FilterRule, SecretFilterManager, SecretStore, normalize_path};
use tracing::{debug, error, info, warn};

/// Commit message of the baseline pushed by the first pull
pub const INITIAL_COMMIT_MESSAGE: &str = "initial setup commit";

/// Default target branch of the ready-to-merge signal
pub const DEFAULT_READY_TARGET: &str = "main";

/// Side that wins conflicting hunks in an external merge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MergePreference {
    Ours,
    Theirs,
}

impl std::str::FromStr for MergePreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ours" => Ok(Self::Ours),
            "theirs" => Ok(Self::Theirs),
            other => Err(Error::Precondition(format!(
                "Unknown merge preference '{other}', expected 'ours' or 'theirs'"
            ))),
        }
    }
}

/// Result of a pull
#[derive(Debug, Clone, Serialize)]
pub struct PullOutcome {
    pub branch: String,
    /// The repository was created by this pull
    pub initialized: bool,
    /// HEAD moved
    pub changed: bool,
    #[serde(serialize_with = "serialize_oid")]
    pub before: Option<Oid>,
    #[serde(serialize_with = "serialize_oid")]
    pub after: Option<Oid>,
    /// Paths the pull wrote
    pub changes: Vec<ChangeEntry>,
    /// Baseline commit pushed while initializing
    #[serde(serialize_with = "serialize_oid")]
    pub baseline: Option<Oid>,
}

impl fmt::Display for PullOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.initialized {
            write!(f, "Initialized repository on {}", self.branch)?;
            if let Some(baseline) = self.baseline {
                write!(f, " and pushed baseline {}", short_id(baseline))?;
            }
            return Ok(());
        }
        if !self.changed {
            return write!(f, "Already up to date on {}", self.branch);
        }
        write!(f, "Pulled {} changed paths on {}", self.changes.len(), self.branch)?;
        if let (Some(before), Some(after)) = (self.before, self.after) {
            write!(f, " ({}..{})", short_id(before), short_id(after))?;
        }
        Ok(())
    }
}

/// Result of a push
#[derive(Debug, Clone, Serialize)]
pub struct PushOutcome {
    pub branch: String,
    #[serde(serialize_with = "serialize_oid")]
    pub commit: Option<Oid>,
    pub changes: Vec<ChangeEntry>,
}

impl fmt::Display for PushOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.commit {
            Some(commit) => write!(
                f,
                "Pushed {} to {} ({} changed paths)",
                short_id(commit),
                self.branch,
                self.changes.len()
            ),
            None => write!(f, "Pushed pending commits to {}", self.branch),
        }
    }
}

/// Result of merging an external branch
#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub source: String,
    pub merged: bool,
    pub conflicts: Vec<String>,
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.merged {
            return write!(f, "{} is already merged", self.source);
        }
        write!(f, "Merged {} into the working tree", self.source)?;
        if !self.conflicts.is_empty() {
            write!(
                f,
                " with {} conflicts ({})",
                self.conflicts.len(),
                self.conflicts.join(", ")
            )?;
        }
        write!(f, "; review and push with force to commit")
    }
}

/// Result of adding or removing a tracked path
#[derive(Debug, Clone, Serialize)]
pub struct TrackOutcome {
    pub path: String,
    pub tracked: bool,
    /// Changed index entries committed
    pub changes: usize,
}

impl fmt::Display for TrackOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = if self.tracked { "Added" } else { "Removed" };
        write!(f, "{verb} {} ({} changes)", self.path, self.changes)
    }
}

/// Files deleted by a repository reset
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemovedPaths(pub Vec<PathBuf>);

impl fmt::Display for RemovedPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "Nothing to remove");
        }
        write!(f, "Removed {} repository files", self.0.len())
    }
}

#[derive(Debug, Serialize)]
struct ReadyDescriptor<'a> {
    branch: &'a str,
    target: &'a str,
    author: &'a str,
    timestamp: String,
}

#[allow(clippy::ref_option, clippy::trivially_copy_pass_by_ref)]
fn serialize_oid<S: serde::Serializer>(oid: &Option<Oid>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match oid {
        Some(oid) => serializer.serialize_some(&oid.to_string()),
        None => serializer.serialize_none(),
    }
}

/// First seven hex digits of a commit id
pub fn short_id(oid: Oid) -> String {
    oid.to_string().chars().take(7).collect()
}

#[derive(Clone, Copy)]
enum Timed {
    Pull,
    Push,
}

pub(crate) fn no_repository() -> Error {
    Error::Precondition("No repository yet; run pull first".to_string())
}

/// Pull, push and recovery operations on one server root
pub struct RepositorySync {
    pub(crate) layout: Layout,
    config: RwLock<Config>,
    config_path: Option<PathBuf>,
    pub(crate) gate: Arc<SyncGate>,
    metrics: Arc<Metrics>,
    redactor: Arc<Redactor>,
    pub(crate) filters: SecretFilterManager,
    jars: JarReloadCoordinator,
    host: Arc<dyn PluginHost>,
    progress: Arc<dyn ProgressSink>,
}

impl RepositorySync {
    /// Engine for the server tree at `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, config: Config) -> Self {
        let root = root.into();
        let layout = Layout::new(root.clone(), &config);
        let tool_source = config.secrets.replace_tool.as_ref().map(|p| root.join(p));
        let filters = SecretFilterManager::new(layout.tools_dir(), tool_source);
        let jars = JarReloadCoordinator::new(&config.jars).with_state_file(layout.staged_jars());
        let host = Arc::new(CommandPluginHost::new(root, &config));
        let gate = Arc::new(SyncGate::with_lock_file(layout.sync_lock()));

        Self {
            layout,
            config: RwLock::new(config),
            config_path: None,
            gate,
            metrics: Arc::new(Metrics::new()),
            redactor: Arc::new(Redactor::new()),
            filters,
            jars,
            host,
            progress: Arc::new(NoopProgress),
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: Arc<dyn PluginHost>) -> Self {
        self.host = host;
        self
    }

    /// Share one gate between several engines on the same root
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<SyncGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Share the redaction set with the logging layer
    #[must_use]
    pub fn with_redactor(mut self, redactor: Arc<Redactor>) -> Self {
        self.redactor = redactor;
        self
    }

    #[must_use]
    pub fn with_filter_manager(mut self, filters: SecretFilterManager) -> Self {
        self.filters = filters;
        self
    }

    /// Persist branch switches to this file
    #[must_use]
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn gate(&self) -> &SyncGate {
        &self.gate
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn redactor(&self) -> &Arc<Redactor> {
        &self.redactor
    }

    pub fn jars(&self) -> &JarReloadCoordinator {
        &self.jars
    }

    pub fn host(&self) -> &dyn PluginHost {
        self.host.as_ref()
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> Config {
        match self.config.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Fetch and merge the remote branch, initializing the repository first if needed
    ///
    /// Conflicts are resolved in favor of the remote.
    pub fn pull(&self) -> Result<PullOutcome> {
        self.timed(Timed::Pull, || {
            self.run_locked(Action::Pull, |guard| self.pull_locked(guard))
        })
    }

    /// Commit every local change and push it
    ///
    /// `force` overrides the external-merge marker and `require-force`
    /// protected branches; it never force-updates the remote ref.
    pub fn push(&self, message: &str, author: Option<&str>, force: bool) -> Result<PushOutcome> {
        self.timed(Timed::Push, || {
            self.run_locked(Action::Push, |guard| {
                self.push_locked(guard, message, author, force)
            })
        })
    }

    /// [`Self::pull`] with exponential backoff on transient failures
    pub fn pull_with_retry(&self) -> Result<PullOutcome> {
        let policy = RetryPolicy::from(&self.config().retry);
        policy.run("pull", |_| self.pull())
    }

    /// [`Self::push`] with exponential backoff on transient failures
    pub fn push_with_retry(
        &self,
        message: &str,
        author: Option<&str>,
        force: bool,
    ) -> Result<PushOutcome> {
        let policy = RetryPolicy::from(&self.config().retry);
        policy.run("push", |_| self.push(message, author, force))
    }

    /// Entry point for webhook deliveries announcing a push upstream
    pub fn on_external_push(&self) -> Result<PullOutcome> {
        info!("External push event received, pulling");
        self.pull_with_retry()
    }

    /// Commit a ready-to-merge descriptor and push it
    pub fn mark_ready(&self, target: Option<&str>, author: Option<&str>) -> Result<Oid> {
        self.run_locked(Action::Ready, |guard| {
            let config = self.config();
            self.require_repository()?;
            self.configure_filters(guard)?;
            let repo = repo::open(self.layout.root())?;
            let branch = repo::current_branch(&repo)?;
            let target = target.unwrap_or(DEFAULT_READY_TARGET);
            let author = author.unwrap_or(&config.repository.author_name);

            let descriptor = ReadyDescriptor {
                branch: &branch,
                target,
                author,
                timestamp: Utc::now().to_rfc3339(),
            };
            let path = self.layout.ready_marker();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::path_io(parent, e))?;
            }
            let content = serde_json::to_string_pretty(&descriptor)
                .map_err(|e| Error::Config(format!("Failed to encode ready descriptor: {e}")))?;
            fs::write(&path, content).map_err(|e| Error::path_io(&path, e))?;

            let mut index = repo.index().git_context("open index")?;
            index
                .add_path(Path::new(READY_MARKER))
                .git_context("stage ready descriptor")?;
            let signature = repo::signature(author, &config.repository.author_email)?;
            let oid = repo::commit_index(
                &repo,
                &mut index,
                &signature,
                &format!("Ready to merge {branch} into {target}"),
            )?;
            repo::push_branch(&repo, &branch, config.repository.credentials().as_ref())?;
            Ok(oid)
        })
    }

    /// Hard reset the working tree and branch to `rev`
    pub fn reset(&self, rev: &str) -> Result<Oid> {
        self.run_locked(Action::Reset, |guard| self.reset_locked(guard, rev))
    }

    /// Commit the inverse of `rev` and push it
    pub fn revert(&self, rev: &str) -> Result<Oid> {
        self.run_locked(Action::Revert, |guard| {
            let config = self.config();
            self.require_repository()?;
            let rules = self.configure_filters(guard)?;
            let repo = repo::open(self.layout.root())?;
            self.require_clean(&repo, &rules, "reverting")?;

            let target = resolve_commit(&repo, rev)?;
            let head = repo::head_commit(&repo)?
                .ok_or_else(|| Error::Precondition("Nothing to revert yet".to_string()))?;
            let branch = repo::current_branch(&repo)?;

            let mainline = u32::from(target.parent_count() > 1);
            let mut index = repo
                .revert_commit(&target, &head, mainline, None)
                .git_context("revert")?;
            if index.has_conflicts() {
                return Err(Error::Precondition(format!(
                    "Reverting {} conflicts with later changes",
                    short_id(target.id())
                )));
            }
            let tree_id = index.write_tree_to(&repo).git_context("write tree")?;
            let tree = repo.find_tree(tree_id).git_context("find tree")?;

            let signature = self.signature(&config, None)?;
            let message = format!(
                "Revert \"{}\"\n\nThis reverts commit {}.",
                target.summary().unwrap_or_default(),
                target.id()
            );
            let oid = repo
                .commit(None, &signature, &signature, &message, &tree, &[&head])
                .git_context("commit revert")?;
            let reverted = repo.find_commit(oid).git_context("find revert")?;
            repo::advance_branch(&repo, &branch, &reverted, "tether: revert")?;
            repo::smudge_worktree(self.layout.root(), &rules)?;
            repo::push_branch(&repo, &branch, config.repository.credentials().as_ref())?;
            Ok(oid)
        })
    }

    /// Reset to the newest first-parent commit authored at or before `at`
    pub fn rollback(&self, at: DateTime<Utc>) -> Result<Oid> {
        self.run_locked(Action::Rollback, |guard| {
            if at > Utc::now() {
                return Err(Error::NotFound(format!(
                    "Rollback time {} is in the future",
                    at.to_rfc3339()
                )));
            }
            self.require_repository()?;
            let target = {
                let repo = repo::open(self.layout.root())?;
                find_commit_at(&repo, at.timestamp())?.ok_or_else(|| {
                    Error::NotFound(format!("No commit found at or before {}", at.to_rfc3339()))
                })?
            };
            info!(commit = %target, "Rolling back");
            self.reset_locked(guard, &target.to_string())
        })
    }

    /// Merge `branch` of another remote into the working tree without committing
    ///
    /// `remote` is either a configured remote name or a URL; URLs get a
    /// temporary remote that is removed afterwards. Leaves a marker that blocks
    /// plain pushes until the result is reviewed.
    pub fn merge_external(
        &self,
        remote: &str,
        branch: &str,
        preference: Option<MergePreference>,
    ) -> Result<MergeOutcome> {
        self.run_locked(Action::Merge, |guard| {
            let config = self.config();
            self.require_repository()?;
            let rules = self.configure_filters(guard)?;
            let repo = repo::open(self.layout.root())?;
            if repo::head_commit(&repo)?.is_none() {
                return Err(Error::Precondition("Pull before merging".to_string()));
            }
            self.require_clean(&repo, &rules, "merging")?;

            let temporary = repo.find_remote(remote).is_err();
            if temporary && !looks_like_location(remote) {
                return Err(Error::NotFound(format!(
                    "Remote {remote} is not configured and is not a URL or path"
                )));
            }
            let name = if temporary {
                let name = format!("external-{}", Utc::now().timestamp_millis());
                repo.remote(&name, remote)
                    .git_context("add temporary remote")?;
                name
            } else {
                remote.to_string()
            };

            let result = self.merge_from(&repo, &rules, &name, remote, branch, preference, &config);

            if temporary && let Err(e) = repo.remote_delete(&name) {
                warn!(remote = %name, error = %e, "Failed to remove temporary remote");
            }
            result
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_from(
        &self,
        repo: &Repository,
        rules: &[FilterRule],
        name: &str,
        source: &str,
        branch: &str,
        preference: Option<MergePreference>,
        config: &Config,
    ) -> Result<MergeOutcome> {
        let source = format!("{}/{branch}", self.redactor.redact(source));
        let refspec = format!("+refs/heads/{branch}:refs/remotes/{name}/{branch}");
        repo::fetch(repo, name, &[refspec], config.repository.credentials().as_ref())?;
        let oid = repo::remote_branch_oid(repo, name, branch)
            .ok_or_else(|| Error::NotFound(format!("Branch {source} was not found")))?;

        let incoming = repo.find_annotated_commit(oid).git_context("find incoming")?;
        let (analysis, _) = repo
            .merge_analysis(&[&incoming])
            .git_context("analyze merge")?;
        if analysis.is_up_to_date() {
            return Ok(MergeOutcome {
                source,
                merged: false,
                conflicts: Vec::new(),
            });
        }

        let root = self.layout.root();
        repo::clean_worktree(root, rules)?;
        let mut options = MergeOptions::new();
        if let Some(preference) = preference {
            options.file_favor(match preference {
                MergePreference::Ours => FileFavor::Ours,
                MergePreference::Theirs => FileFavor::Theirs,
            });
        }
        let mut checkout = CheckoutBuilder::new();
        checkout.allow_conflicts(true).conflict_style_merge(true);
        let merged = repo.merge(&[&incoming], Some(&mut options), Some(&mut checkout));
        repo::smudge_worktree(root, rules)?;
        merged.git_context("merge")?;

        let conflicts = repo::conflicted_paths(repo)?;
        let marker = self.layout.merged_marker();
        fs::write(&marker, b"").map_err(|e| Error::path_io(&marker, e))?;
        info!(%source, conflicts = conflicts.len(), "Merged external branch");

        Ok(MergeOutcome {
            source,
            merged: true,
            conflicts,
        })
    }

    /// Check out `name`, creating it if needed and following the remote branch
    pub fn switch_branch(&self, name: &str) -> Result<String> {
        self.run_locked(Action::Branch, |guard| {
            let config = self.config();
            self.require_repository()?;
            let rules = self.configure_filters(guard)?;
            let repo = repo::open(self.layout.root())?;
            self.require_clean(&repo, &rules, "switching branches")?;
            repo::fetch(
                &repo,
                ORIGIN,
                &[repo::tracking_refspec(ORIGIN)],
                config.repository.credentials().as_ref(),
            )?;

            let previous = repo::current_branch(&repo)?;
            let remote = repo::remote_branch_oid(&repo, ORIGIN, name);
            let local = repo.find_branch(name, BranchType::Local).ok();

            let target = match (&local, remote) {
                (_, Some(remote)) => remote,
                (Some(branch), None) => branch
                    .get()
                    .target()
                    .ok_or_else(|| Error::NotFound(format!("Branch {name} has no commit")))?,
                (None, None) => repo::head_commit(&repo)?
                    .map(|c| c.id())
                    .ok_or_else(|| Error::Precondition("Pull before creating branches".to_string()))?,
            };
            let commit = repo.find_commit(target).git_context("find branch commit")?;

            if local.is_none() {
                let mut created = repo.branch(name, &commit, false).git_context("create branch")?;
                if remote.is_some() {
                    created
                        .set_upstream(Some(&format!("{ORIGIN}/{name}")))
                        .git_context("set upstream")?;
                }
                info!(branch = name, "Created branch");
            }
            repo.set_head(&format!("refs/heads/{name}"))
                .git_context("switch branch")?;
            repo::hard_reset(&repo, &commit, &rules)?;

            self.persist_branch(name)?;
            Ok(format!("Switched from {previous} to {name}"))
        })
    }

    /// Abandon an in-progress merge and reset to HEAD
    pub fn merge_abort(&self) -> Result<Oid> {
        self.run_locked(Action::Recovery, |guard| {
            self.require_repository()?;
            let rules = self.configure_filters(guard)?;
            let repo = repo::open(self.layout.root())?;
            repo.cleanup_state().git_context("clear merge state")?;
            let head = repo::head_commit(&repo)?
                .ok_or_else(|| Error::Precondition("Nothing to reset yet".to_string()))?;
            repo::hard_reset(&repo, &head, &rules)?;

            let marker = self.layout.merged_marker();
            if marker.exists() {
                fs::remove_file(&marker).map_err(|e| Error::path_io(&marker, e))?;
            }
            Ok(head.id())
        })
    }

    /// Delete the repository metadata and ignore file so the next pull starts over
    pub fn repo_reset(&self) -> Result<RemovedPaths> {
        self.run_locked(Action::Recovery, |_guard| {
            let mut removed = Vec::new();
            let git_dir = self.layout.git_dir();
            if git_dir.is_dir() {
                fs::remove_dir_all(&git_dir).map_err(|e| Error::path_io(&git_dir, e))?;
                removed.push(git_dir);
            }
            for path in [
                self.layout.ignore_file(),
                self.layout.attributes_file(),
                self.layout.merged_marker(),
            ] {
                if path.is_file() {
                    fs::remove_file(&path).map_err(|e| Error::path_io(&path, e))?;
                    removed.push(path);
                }
            }
            warn!(removed = removed.len(), "Repository reset");
            Ok(RemovedPaths(removed))
        })
    }

    /// Whitelist `path` in the ignore file, commit it and push
    pub fn track(&self, path: &str) -> Result<TrackOutcome> {
        self.run_locked(Action::Track, |guard| {
            let config = self.config();
            self.require_repository()?;
            let rel = self.relative(path)?;
            let is_dir = self.layout.root().join(&rel).is_dir();
            IgnoreListManager::new(self.layout.ignore_file()).allow(&rel, is_dir)?;

            let rules = self.configure_filters(guard)?;
            let repo = repo::open(self.layout.root())?;
            let mut index = repo::stage(&repo, &[rel.as_str(), IGNORE_FILE], &rules)?;
            self.commit_tracking(&repo, &mut index, &config, rel, true)
        })
    }

    /// Stop tracking `path`, commit the removal and push; the files stay on disk
    pub fn untrack(&self, path: &str) -> Result<TrackOutcome> {
        self.run_locked(Action::Untrack, |guard| {
            let config = self.config();
            self.require_repository()?;
            let rel = self.relative(path)?;
            let repo = repo::open(self.layout.root())?;
            let mut index = repo.index().git_context("open index")?;
            let is_dir = self.layout.root().join(&rel).is_dir()
                || index.get_path(Path::new(&rel), 0).is_none();
            IgnoreListManager::new(self.layout.ignore_file()).deny(&rel, is_dir)?;
            self.configure_filters(guard)?;

            index
                .remove_all([rel.as_str()], None)
                .git_context("unstage path")?;
            index
                .add_path(Path::new(IGNORE_FILE))
                .git_context("stage ignore file")?;
            self.commit_tracking(&repo, &mut index, &config, rel, false)
        })
    }

    fn commit_tracking(
        &self,
        repo: &Repository,
        index: &mut git2::Index,
        config: &Config,
        rel: String,
        tracked: bool,
    ) -> Result<TrackOutcome> {
        let changes = repo::index_changes(repo, index)?;
        if changes.is_empty() {
            index.read(true).git_context("reload index")?;
            return Ok(TrackOutcome {
                path: rel,
                tracked,
                changes: 0,
            });
        }

        let message = if tracked {
            format!("Added {rel}")
        } else {
            format!("Removed {rel}")
        };
        let signature = self.signature(config, None)?;
        repo::commit_index(repo, index, &signature, &message)?;
        let branch = repo::current_branch(repo)?;
        repo::push_branch(repo, &branch, config.repository.credentials().as_ref())?;
        Ok(TrackOutcome {
            path: rel,
            tracked,
            changes: changes.len(),
        })
    }

    /// Run the plugin unloads and loads queued by staged pulls
    pub fn apply_staged_jars(&self) -> Result<JarApplyReport> {
        self.run_locked(Action::Jars, |_guard| Ok(self.jars.apply(self.host.as_ref())))
    }

    /// Drop the queued plugin operations without running them
    pub fn clear_staged_jars(&self) -> Result<JarClearReport> {
        self.run_locked(Action::Jars, |_guard| Ok(self.jars.clear()))
    }

    /// Acquire the gate for `action`, run `op` and report the outcome
    pub(crate) fn run_locked<T, F>(&self, action: Action, op: F) -> Result<T>
    where
        T: fmt::Display,
        F: FnOnce(&GateGuard<'_>) -> Result<T>,
    {
        let guard = match self.gate.try_acquire(action) {
            Ok(guard) => guard,
            Err(e) => {
                self.report_failure(action, &e);
                return Err(e);
            }
        };
        self.progress.started(action);
        let result = op(&guard);
        drop(guard);

        match &result {
            Ok(value) => {
                let message = self.redactor.redact(&value.to_string());
                info!(%action, "{message}");
                self.progress.succeeded(action, &message);
            }
            Err(e) => self.report_failure(action, e),
        }
        result
    }

    fn report_failure(&self, action: Action, err: &Error) {
        let message = self.redactor.redact(&err.to_string());
        match err.kind() {
            ErrorKind::Precondition | ErrorKind::Busy | ErrorKind::NotFound => {
                info!(%action, kind = ?err.kind(), "{message}");
            }
            _ => error!(%action, kind = ?err.kind(), "{message}"),
        }
        self.progress.failed(action, &message);
    }

    /// Count every attempt, busy rejections included, as success or failure
    fn timed<T>(&self, which: Timed, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let start = Instant::now();
        let result = op();
        let elapsed = start.elapsed();
        match which {
            Timed::Pull => self.metrics.record_pull(elapsed, result.is_ok()),
            Timed::Push => self.metrics.record_push(elapsed, result.is_ok()),
        }
        result
    }

    /// Reload the secret store, refresh redactions and rewrite the filter config
    pub(crate) fn configure_filters(&self, _guard: &GateGuard<'_>) -> Result<Vec<FilterRule>> {
        let store = SecretStore::load(self.layout.secrets_store())?;
        self.refresh_redactions(&store);
        let report = self.filters.configure(self.layout.root(), &store)?;
        Ok(report.map(|r| r.rules).unwrap_or_default())
    }

    /// Mask every secret value and the remote token in log output
    pub fn refresh_redactions(&self, store: &SecretStore) {
        let token = self.config().repository.token;
        self.redactor.refresh(
            store
                .values()
                .map(str::to_string)
                .chain(std::iter::once(token)),
        );
        debug!(tokens = self.redactor.len(), "Refreshed redactions");
    }

    fn pull_locked(&self, guard: &GateGuard<'_>) -> Result<PullOutcome> {
        let config = self.config();
        let url = config.repository.require_url()?.to_string();
        let outcome = if self.layout.repo_exists() {
            self.update(guard, &config, &url)?
        } else {
            self.initialize(guard, &config, &url)?
        };

        if outcome.changed
            && config.restart.on_pull
            && let Err(e) = self.host.restart()
        {
            warn!(error = %self.redactor.redact(&e.to_string()), "Restart after pull failed");
        }
        Ok(outcome)
    }

    fn initialize(&self, guard: &GateGuard<'_>, config: &Config, url: &str) -> Result<PullOutcome> {
        let root = self.layout.root();
        let branch = config.repository.branch.clone();
        let credentials = config.repository.credentials();
        info!(%branch, "Initializing repository");

        let repo = Repository::init(root).git_context("init repository")?;
        repo::ensure_remote(&repo, ORIGIN, url)?;
        repo::fetch(&repo, ORIGIN, &[repo::tracking_refspec(ORIGIN)], credentials.as_ref())?;

        let remote_tip = repo::remote_branch_oid(&repo, ORIGIN, &branch);
        let changes = if let Some(tip) = remote_tip {
            let commit = repo.find_commit(tip).git_context("find remote commit")?;
            let changes = repo::advance_branch(&repo, &branch, &commit, "tether: initial checkout")?;
            repo.find_branch(&branch, BranchType::Local)
                .and_then(|mut local| local.set_upstream(Some(&format!("{ORIGIN}/{branch}"))))
                .git_context("set upstream")?;
            changes
        } else {
            debug!(%branch, "Remote branch missing, starting from empty history");
            repo.set_head(&format!("refs/heads/{branch}"))
                .git_context("set HEAD")?;
            Vec::new()
        };

        IgnoreListManager::new(self.layout.ignore_file()).ensure_exists()?;
        let rules = self.configure_filters(guard)?;
        repo::smudge_worktree(root, &rules)?;

        let mut index = repo::stage_all(&repo, &rules)?;
        let pending = repo::index_changes(&repo, &mut index)?;
        let baseline = if remote_tip.is_none() || !pending.is_empty() {
            let signature = self.signature(config, None)?;
            let oid = repo::commit_index(&repo, &mut index, &signature, INITIAL_COMMIT_MESSAGE)?;
            repo::push_branch(&repo, &branch, credentials.as_ref())?;
            Some(oid)
        } else {
            index.read(true).git_context("reload index")?;
            None
        };

        let after = repo::head_commit(&repo)?.map(|c| c.id());
        Ok(PullOutcome {
            branch,
            initialized: true,
            changed: after.is_some(),
            before: None,
            after,
            changes,
            baseline,
        })
    }

    fn update(&self, guard: &GateGuard<'_>, config: &Config, url: &str) -> Result<PullOutcome> {
        let root = self.layout.root();
        let rules = self.configure_filters(guard)?;
        let repo = repo::open(root)?;
        repo::ensure_remote(&repo, ORIGIN, url)?;
        repo::fetch(
            &repo,
            ORIGIN,
            &[repo::tracking_refspec(ORIGIN)],
            config.repository.credentials().as_ref(),
        )?;

        let branch = repo::current_branch(&repo)?;
        let head = repo::head_commit(&repo)?;
        let Some(remote_oid) = repo::remote_branch_oid(&repo, ORIGIN, &branch) else {
            return match head {
                Some(head) => self.push_pending_baseline(&repo, config, &branch, head.id()),
                None => Err(Error::NotFound(format!(
                    "Branch {branch} does not exist on the remote"
                ))),
            };
        };
        let incoming = repo.find_commit(remote_oid).git_context("find remote commit")?;
        let before = head.as_ref().map(git2::Commit::id);

        let jar_plan = if config.jars.enabled {
            let head_tree = match &head {
                Some(commit) => Some(commit.tree().git_context("resolve HEAD tree")?),
                None => None,
            };
            let incoming_tree = incoming.tree().git_context("resolve remote tree")?;
            let diff = repo::diff_trees(&repo, head_tree.as_ref(), Some(&incoming_tree))?;
            let plan = self.jars.plan(root, &diff);
            self.jars.unload(self.host.as_ref(), &plan.unload);
            Some(plan)
        } else {
            None
        };

        let changes = match head {
            None => repo::advance_branch(&repo, &branch, &incoming, "tether: fast-forward")?,
            Some(head) => {
                let annotated = repo
                    .find_annotated_commit(remote_oid)
                    .git_context("find remote commit")?;
                let (analysis, _) = repo
                    .merge_analysis(&[&annotated])
                    .git_context("analyze merge")?;

                if analysis.is_up_to_date() {
                    Vec::new()
                } else if analysis.is_fast_forward() {
                    repo::advance_branch(&repo, &branch, &incoming, "tether: fast-forward")?
                } else {
                    let tree_id = repo::merge_theirs(&repo, &head, &incoming)?;
                    let tree = repo.find_tree(tree_id).git_context("find merged tree")?;
                    let signature = self.signature(config, None)?;
                    let message = format!("Merge remote-tracking branch '{ORIGIN}/{branch}'");
                    let oid = repo
                        .commit(None, &signature, &signature, &message, &tree, &[&head, &incoming])
                        .git_context("commit merge")?;
                    let merged = repo.find_commit(oid).git_context("find merge")?;
                    repo::advance_branch(&repo, &branch, &merged, "tether: merge")?
                }
            }
        };
        repo::smudge_worktree(root, &rules)?;

        if let Some(plan) = jar_plan {
            self.jars.load(self.host.as_ref(), root, &plan.load);
        }

        let after = repo::head_commit(&repo)?.map(|c| c.id());
        Ok(PullOutcome {
            branch,
            initialized: false,
            changed: before != after,
            before,
            after,
            changes,
            baseline: None,
        })
    }

    /// Publish local history the remote never received, e.g. a baseline
    /// whose push failed while initializing
    fn push_pending_baseline(
        &self,
        repo: &Repository,
        config: &Config,
        branch: &str,
        head: Oid,
    ) -> Result<PullOutcome> {
        warn!(%branch, "Remote branch missing, pushing local history");
        repo::push_branch(repo, branch, config.repository.credentials().as_ref())?;
        Ok(PullOutcome {
            branch: branch.to_string(),
            initialized: false,
            changed: false,
            before: Some(head),
            after: Some(head),
            changes: Vec::new(),
            baseline: Some(head),
        })
    }

    fn push_locked(
        &self,
        guard: &GateGuard<'_>,
        message: &str,
        author: Option<&str>,
        force: bool,
    ) -> Result<PushOutcome> {
        let config = self.config();
        self.require_repository()?;
        let rules = self.configure_filters(guard)?;
        let repo = repo::open(self.layout.root())?;
        let branch = repo::current_branch(&repo)?;

        if config.repository.is_protected(&branch) {
            match config.repository.protected_mode {
                ProtectedMode::Block => {
                    return Err(Error::Precondition(format!(
                        "Branch {branch} is protected; pushes are blocked"
                    )));
                }
                ProtectedMode::RequireForce if !force => {
                    return Err(Error::Precondition(format!(
                        "Branch {branch} is protected; push with force to continue"
                    )));
                }
                _ => {}
            }
        }
        if self.layout.merged_marker().exists() && !force {
            return Err(Error::Precondition(
                "The working tree holds an unreviewed external merge; review it and push with force"
                    .to_string(),
            ));
        }

        let mut index = repo::stage_all(&repo, &rules)?;
        let changes = repo::index_changes(&repo, &mut index)?;
        let merging = repo.state() == RepositoryState::Merge;

        let commit = if changes.is_empty() && !merging {
            index.read(true).git_context("reload index")?;
            if self.unpushed_commits(&repo, &branch)? == 0 {
                return Err(Error::Precondition("No local changes to push".to_string()));
            }
            None
        } else {
            let signature = self.signature(&config, author)?;
            Some(repo::commit_index(&repo, &mut index, &signature, message)?)
        };

        repo::push_branch(&repo, &branch, config.repository.credentials().as_ref())?;

        let marker = self.layout.merged_marker();
        if marker.exists() {
            fs::remove_file(&marker).map_err(|e| Error::path_io(&marker, e))?;
        }
        Ok(PushOutcome {
            branch,
            commit,
            changes,
        })
    }

    /// Local commits origin has not seen, e.g. after a failed push attempt
    fn unpushed_commits(&self, repo: &Repository, branch: &str) -> Result<usize> {
        let Some(head) = repo::head_commit(repo)? else {
            return Ok(0);
        };
        match repo::remote_branch_oid(repo, ORIGIN, branch) {
            Some(remote) => Ok(repo::ahead_behind(repo, head.id(), remote)?.0),
            None => Ok(1),
        }
    }

    fn reset_locked(&self, guard: &GateGuard<'_>, rev: &str) -> Result<Oid> {
        self.require_repository()?;
        let rules = self.configure_filters(guard)?;
        let repo = repo::open(self.layout.root())?;
        let commit = resolve_commit(&repo, rev)?;
        repo::hard_reset(&repo, &commit, &rules)?;
        info!(commit = %short_id(commit.id()), "Reset working tree");
        Ok(commit.id())
    }

    fn require_repository(&self) -> Result<()> {
        if self.layout.repo_exists() {
            Ok(())
        } else {
            Err(no_repository())
        }
    }

    fn require_clean(&self, repo: &Repository, rules: &[FilterRule], doing: &str) -> Result<()> {
        let changes = repo::local_changes(repo, rules)?;
        if changes.is_empty() {
            return Ok(());
        }
        Err(Error::Precondition(format!(
            "{} uncommitted changes; push or reset them before {doing}",
            changes.len()
        )))
    }

    fn signature(&self, config: &Config, author: Option<&str>) -> Result<git2::Signature<'static>> {
        repo::signature(
            author.unwrap_or(&config.repository.author_name),
            &config.repository.author_email,
        )
    }

    /// Path relative to the root, refusing anything that escapes it
    pub(crate) fn relative(&self, path: &str) -> Result<String> {
        let rel = normalize_path(path);
        let rel = rel.trim_end_matches('/').to_string();
        if rel.is_empty() || rel.split('/').any(|part| part == "..") {
            return Err(Error::Precondition(format!(
                "{path} is not a path inside the server root"
            )));
        }
        Ok(rel)
    }

    fn persist_branch(&self, name: &str) -> Result<()> {
        let updated = {
            let mut config = match self.config.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            config.repository.branch = name.to_string();
            config.clone()
        };
        if let Some(path) = &self.config_path {
            updated.save(path)?;
            debug!(path = %path.display(), branch = name, "Saved active branch");
        }
        Ok(())
    }
}

/// Whether `remote` names a repository location rather than a remote
fn looks_like_location(remote: &str) -> bool {
    remote.contains("://") || remote.contains('@') || Path::new(remote).exists()
}

pub(crate) fn resolve_commit<'r>(repo: &'r Repository, rev: &str) -> Result<git2::Commit<'r>> {
    repo.revparse_single(rev)
        .and_then(|object| object.peel_to_commit())
        .map_err(|_| Error::NotFound(format!("Commit {rev} was not found")))
}

/// Newest commit on HEAD's first-parent chain authored at or before `at`
pub fn find_commit_at(repo: &Repository, at: i64) -> Result<Option<Oid>> {
    let mut current = repo::head_commit(repo)?;
    while let Some(commit) = current {
        if commit.author().when().seconds() <= at {
            return Ok(Some(commit.id()));
        }
        current = commit.parent(0).ok();
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;

    #[test]
    fn test_merge_preference_parse() {
        assert_eq!("ours".parse::<MergePreference>().unwrap(), MergePreference::Ours);
        assert_eq!("THEIRS".parse::<MergePreference>().unwrap(), MergePreference::Theirs);
        assert_eq!(
            "both".parse::<MergePreference>().unwrap_err().kind(),
            ErrorKind::Precondition
        );
    }

    #[test]
    fn test_pull_outcome_display() {
        let oid = Oid::from_str("0123456789abcdef0123456789abcdef01234567").unwrap();
        let outcome = PullOutcome {
            branch: "main".to_string(),
            initialized: false,
            changed: false,
            before: Some(oid),
            after: Some(oid),
            changes: Vec::new(),
            baseline: None,
        };
        assert_eq!(outcome.to_string(), "Already up to date on main");
        assert_eq!(short_id(oid), "0123456");
    }

    #[test]
    fn test_relative_rejects_escapes() {
        let sync = RepositorySync::new("/srv", Config::default());
        assert_eq!(sync.relative("./plugins/app/").unwrap(), "plugins/app");
        assert_eq!(sync.relative("\\world\\region").unwrap(), "world/region");
        assert!(sync.relative("../etc").is_err());
        assert!(sync.relative("/").is_err());
    }
}
