//! libgit2 plumbing shared by the sync operations
//!
//! libgit2 does not run external filter drivers, so staging applies the clean
//! side of each [`FilterRule`] itself and every checkout is followed by
//! [`smudge_worktree`].

use crate::change::{self, ChangeEntry};
use git2::build::CheckoutBuilder;
use git2::{
    Commit, Cred, CredentialType, DiffFindOptions, ErrorClass, ErrorCode, FetchOptions, FileFavor, Index, IndexAddOption,
    IndexEntry, IndexMatchedPath, IndexTime, MergeOptions, Oid, PushOptions, RemoteCallbacks,
    Repository, RepositoryState, ResetType, Signature, Tree,
};
use secrecy::ExposeSecret;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tether_config::Credentials;
use tether_core::{Error, Result};
use tether_secrets::{FilterRule, normalize_path};
use tracing::{debug, warn};

pub(crate) const ORIGIN: &str = "origin";

/// Stage bits of an index entry's flags
const STAGE_MASK: u16 = 0x3000;

/// Attach an operation name to libgit2 failures
pub(crate) trait GitContext<T> {
    fn git_context(self, what: &str) -> Result<T>;
}

impl<T> GitContext<T> for std::result::Result<T, git2::Error> {
    #[inline]
    fn git_context(self, what: &str) -> Result<T> {
        self.map_err(|e| classify(what, &e))
    }
}

/// Map a libgit2 failure onto the error kinds the retry policy understands
///
/// Only failures that can clear up on their own stay transient.
pub(crate) fn classify(what: &str, err: &git2::Error) -> Error {
    match err.code() {
        ErrorCode::NotFastForward => Error::Precondition(format!(
            "{what}: the remote has commits this server does not; pull first ({})",
            err.message()
        )),
        ErrorCode::Conflict
        | ErrorCode::MergeConflict
        | ErrorCode::Unmerged
        | ErrorCode::Uncommitted
        | ErrorCode::Modified
        | ErrorCode::BareRepo
        | ErrorCode::UnbornBranch
        | ErrorCode::Invalid
        | ErrorCode::InvalidSpec => Error::Precondition(format!("{what}: {}", err.message())),
        ErrorCode::Auth | ErrorCode::Certificate => Error::Config(format!(
            "{what}: {}; check repository.user and repository.token",
            err.message()
        )),
        ErrorCode::NotFound if !matches!(err.class(), ErrorClass::Net | ErrorClass::Http) => {
            Error::NotFound(format!("{what}: {}", err.message()))
        }
        _ => Error::transient(what, err.message()),
    }
}

pub(crate) fn open(root: &Path) -> Result<Repository> {
    Repository::open(root).git_context("open repository")
}

pub(crate) fn workdir(repo: &Repository) -> Result<&Path> {
    repo.workdir()
        .ok_or_else(|| Error::Precondition("Repository has no working tree".to_string()))
}

/// Callbacks answering credential requests with the configured token
///
/// The token is offered once; a second request means it was rejected.
pub(crate) fn remote_callbacks(credentials: Option<&Credentials>) -> RemoteCallbacks<'_> {
    let mut callbacks = RemoteCallbacks::new();
    let mut offered = false;
    callbacks.credentials(move |_url, _username, allowed| {
        if let Some(creds) = credentials
            && allowed.contains(CredentialType::USER_PASS_PLAINTEXT)
            && !offered
        {
            offered = true;
            return Cred::userpass_plaintext(&creds.user, creds.token.expose_secret());
        }
        if allowed.contains(CredentialType::DEFAULT) {
            return Cred::default();
        }
        Err(git2::Error::from_str("no usable credentials for remote"))
    });
    callbacks
}

/// Point `name` at `url`, creating the remote if needed
pub(crate) fn ensure_remote(repo: &Repository, name: &str, url: &str) -> Result<()> {
    match repo.find_remote(name) {
        Ok(remote) if remote.url() == Some(url) => Ok(()),
        Ok(_) => repo.remote_set_url(name, url).git_context("update remote url"),
        Err(_) => repo.remote(name, url).map(|_| ()).git_context("add remote"),
    }
}

/// Fetch `refspecs` from the remote `name`
pub(crate) fn fetch(
    repo: &Repository,
    name: &str,
    refspecs: &[String],
    credentials: Option<&Credentials>,
) -> Result<()> {
    let mut remote = repo.find_remote(name).git_context("find remote")?;
    let mut options = FetchOptions::new();
    options.remote_callbacks(remote_callbacks(credentials));
    remote
        .fetch(refspecs, Some(&mut options), None)
        .git_context("fetch")?;
    debug!(remote = name, "Fetched");
    Ok(())
}

/// Refspec mirroring every branch of `name` into its tracking namespace
pub(crate) fn tracking_refspec(name: &str) -> String {
    format!("+refs/heads/*:refs/remotes/{name}/*")
}

/// Push `branch` to origin; a rejected update is an error
///
/// Never forces: a diverged remote has to be pulled first.
pub(crate) fn push_branch(
    repo: &Repository,
    branch: &str,
    credentials: Option<&Credentials>,
) -> Result<()> {
    let mut remote = repo.find_remote(ORIGIN).git_context("find remote")?;
    let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");

    let mut rejection: Option<String> = None;
    {
        let mut callbacks = remote_callbacks(credentials);
        callbacks.push_update_reference(|refname, status| {
            if let Some(message) = status {
                rejection = Some(format!("{refname}: {message}"));
            }
            Ok(())
        });
        let mut options = PushOptions::new();
        options.remote_callbacks(callbacks);
        remote
            .push(&[refspec.as_str()], Some(&mut options))
            .git_context("push")?;
    }

    if let Some(reason) = rejection {
        return Err(Error::Precondition(format!(
            "Push rejected ({reason}); pull and try again"
        )));
    }
    debug!(branch, "Pushed");
    Ok(())
}

pub(crate) fn signature(name: &str, email: &str) -> Result<Signature<'static>> {
    Signature::now(name, email).git_context("build signature")
}

/// Commit at HEAD, or `None` on an unborn branch
pub(crate) fn head_commit(repo: &Repository) -> Result<Option<Commit<'_>>> {
    match repo.head() {
        Ok(head) => head.peel_to_commit().map(Some).git_context("resolve HEAD"),
        Err(e) if matches!(e.code(), git2::ErrorCode::UnbornBranch | git2::ErrorCode::NotFound) => {
            Ok(None)
        }
        Err(e) => Err(Error::transient("resolve HEAD", e.message())),
    }
}

/// Branch HEAD points at, including unborn branches
pub(crate) fn current_branch(repo: &Repository) -> Result<String> {
    if let Ok(head) = repo.head()
        && head.is_branch()
        && let Some(name) = head.shorthand()
    {
        return Ok(name.to_string());
    }

    let head = repo.find_reference("HEAD").git_context("read HEAD")?;
    head.symbolic_target()
        .and_then(|target| target.strip_prefix("refs/heads/"))
        .map(str::to_string)
        .ok_or_else(|| Error::Precondition("HEAD is detached; switch to a branch first".to_string()))
}

/// Tip of `remote/branch` from the last fetch
pub(crate) fn remote_branch_oid(repo: &Repository, remote: &str, branch: &str) -> Option<Oid> {
    repo.refname_to_id(&format!("refs/remotes/{remote}/{branch}"))
        .ok()
}

pub(crate) fn ahead_behind(repo: &Repository, local: Oid, upstream: Oid) -> Result<(usize, usize)> {
    repo.graph_ahead_behind(local, upstream)
        .git_context("count ahead/behind")
}

/// Changes between two trees with rename detection
pub(crate) fn diff_trees(
    repo: &Repository,
    old: Option<&Tree<'_>>,
    new: Option<&Tree<'_>>,
) -> Result<Vec<ChangeEntry>> {
    let mut diff = repo
        .diff_tree_to_tree(old, new, None)
        .git_context("diff trees")?;
    diff.find_similar(Some(DiffFindOptions::new().renames(true)))
        .git_context("detect renames")?;
    Ok(change::entries(&diff))
}

fn is_filtered(filtered: &HashSet<&str>, path: &Path) -> bool {
    filtered.contains(normalize_path(&path.to_string_lossy()).as_str())
}

/// Stage every change in the working tree into the repository index
///
/// The index is modified in memory only; callers write it when committing.
/// Files with secrets are staged with their cleaned content.
pub(crate) fn stage_all(repo: &Repository, rules: &[FilterRule]) -> Result<Index> {
    stage(repo, &["*"], rules)
}

/// Stage changes below `pathspecs` only
pub(crate) fn stage(
    repo: &Repository,
    pathspecs: &[&str],
    rules: &[FilterRule],
) -> Result<Index> {
    let root = workdir(repo)?.to_path_buf();
    let mut index = repo.index().git_context("open index")?;
    let filtered: HashSet<&str> = rules.iter().map(|r| r.path.as_str()).collect();

    let mut skip = |path: &Path, _spec: &[u8]| -> i32 { i32::from(is_filtered(&filtered, path)) };
    index
        .update_all(pathspecs.iter().copied(), Some(&mut skip as &mut IndexMatchedPath<'_>))
        .git_context("stage tracked files")?;
    index
        .add_all(
            pathspecs.iter().copied(),
            IndexAddOption::DEFAULT,
            Some(&mut skip as &mut IndexMatchedPath<'_>),
        )
        .git_context("stage new files")?;

    if matches!(pathspecs, ["*"]) {
        for name in [tether_config::layout::IGNORE_FILE, tether_config::layout::ATTRIBUTES_FILE] {
            let rel = Path::new(name);
            if root.join(rel).is_file() {
                index.add_path(rel).git_context("stage metadata file")?;
            } else if index.get_path(rel, 0).is_some() {
                index.remove_path(rel).git_context("unstage metadata file")?;
            }
        }
    }

    for rule in rules {
        if !pathspecs.iter().any(|spec| covers(spec, &rule.path)) {
            continue;
        }
        stage_filtered(repo, &root, &mut index, rule)?;
    }

    Ok(index)
}

fn covers(spec: &str, path: &str) -> bool {
    spec == "*"
        || spec == path
        || path
            .strip_prefix(spec.trim_end_matches('/'))
            .is_some_and(|rest| rest.starts_with('/'))
}

fn stage_filtered(
    repo: &Repository,
    root: &Path,
    index: &mut Index,
    rule: &FilterRule,
) -> Result<()> {
    let rel = Path::new(&rule.path);
    let full = root.join(rel);
    let tracked = index.get_path(rel, 0);

    if !full.is_file() {
        if tracked.is_some() {
            index.remove_path(rel).git_context("unstage removed file")?;
        }
        return Ok(());
    }
    if tracked.is_none() && repo.is_path_ignored(rel).unwrap_or(true) {
        return Ok(());
    }

    let raw = fs::read(&full).map_err(|e| Error::path_io(&full, e))?;
    let cleaned = match String::from_utf8(raw) {
        Ok(text) => rule.clean(&text).into_bytes(),
        Err(e) => {
            warn!(path = %rule.path, "File with secrets is not UTF-8, staging as is");
            e.into_bytes()
        }
    };

    let entry = IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode: tracked.as_ref().map_or(0o100_644, |e| e.mode),
        uid: 0,
        gid: 0,
        file_size: u32::try_from(cleaned.len()).unwrap_or(u32::MAX),
        id: Oid::zero(),
        flags: 0,
        flags_extended: 0,
        path: rule.path.clone().into_bytes(),
    };
    index
        .add_frombuffer(&entry, &cleaned)
        .git_context("stage cleaned file")
}

/// Diff between HEAD and the staged index
pub(crate) fn index_changes(repo: &Repository, index: &mut Index) -> Result<Vec<ChangeEntry>> {
    let tree_id = index.write_tree().git_context("write index tree")?;
    let tree = repo.find_tree(tree_id).git_context("find index tree")?;
    let head_tree = match head_commit(repo)? {
        Some(commit) => Some(commit.tree().git_context("resolve HEAD tree")?),
        None => None,
    };
    diff_trees(repo, head_tree.as_ref(), Some(&tree))
}

/// Uncommitted changes in the working tree, leaving the index untouched
pub(crate) fn local_changes(repo: &Repository, rules: &[FilterRule]) -> Result<Vec<ChangeEntry>> {
    let mut index = stage_all(repo, rules)?;
    let changes = index_changes(repo, &mut index)?;
    index.read(true).git_context("reload index")?;
    Ok(changes)
}

/// Commit the staged index on HEAD, concluding a pending merge if any
pub(crate) fn commit_index(
    repo: &Repository,
    index: &mut Index,
    author: &Signature<'_>,
    message: &str,
) -> Result<Oid> {
    if index.has_conflicts() {
        return Err(Error::Precondition(
            "Resolve the merge conflicts before pushing".to_string(),
        ));
    }
    index.write().git_context("write index")?;
    let tree_id = index.write_tree().git_context("write tree")?;
    let tree = repo.find_tree(tree_id).git_context("find tree")?;

    let mut parents: Vec<Commit<'_>> = head_commit(repo)?.into_iter().collect();
    if repo.state() == RepositoryState::Merge {
        let mut heads = Vec::new();
        // `mergehead_foreach` needs `&mut Repository`; use a second handle
        let mut merge_repo = Repository::open(repo.path()).git_context("open repository")?;
        merge_repo.mergehead_foreach(|oid| {
            heads.push(*oid);
            true
        })
        .git_context("read merge heads")?;
        for oid in heads {
            parents.push(repo.find_commit(oid).git_context("find merge head")?);
        }
    }
    let parent_refs: Vec<&Commit<'_>> = parents.iter().collect();

    let oid = repo
        .commit(Some("HEAD"), author, author, message, &tree, &parent_refs)
        .git_context("commit")?;
    if repo.state() != RepositoryState::Clean {
        repo.cleanup_state().git_context("clean up merge state")?;
    }
    debug!(%oid, "Committed");
    Ok(oid)
}

/// Write plaintext back into files with secrets
pub(crate) fn smudge_worktree(root: &Path, rules: &[FilterRule]) -> Result<usize> {
    rewrite_worktree(root, rules, FilterRule::smudge)
}

/// Put placeholders back into files with secrets, matching the index
pub(crate) fn clean_worktree(root: &Path, rules: &[FilterRule]) -> Result<usize> {
    rewrite_worktree(root, rules, FilterRule::clean)
}

fn rewrite_worktree(
    root: &Path,
    rules: &[FilterRule],
    transform: fn(&FilterRule, &str) -> String,
) -> Result<usize> {
    let mut rewritten = 0;
    for rule in rules {
        let path = root.join(&rule.path);
        if !path.is_file() {
            continue;
        }
        let Ok(content) = fs::read_to_string(&path) else {
            warn!(path = %rule.path, "Skipping non UTF-8 file with secrets");
            continue;
        };
        let updated = transform(rule, &content);
        if updated != content {
            fs::write(&path, updated).map_err(|e| Error::path_io(&path, e))?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

/// Check out `to`, touching only the paths that differ from `from`
///
/// Working tree edits to other paths survive; changed paths take the incoming
/// version.
pub(crate) fn checkout_changed(
    repo: &Repository,
    from: Option<&Tree<'_>>,
    to: &Tree<'_>,
) -> Result<Vec<ChangeEntry>> {
    let changes = diff_trees(repo, from, Some(to))?;
    if changes.is_empty() {
        return Ok(changes);
    }

    let mut builder = CheckoutBuilder::new();
    builder.force().disable_pathspec_match(true);
    for change in &changes {
        for path in [change.old_path.as_deref(), change.new_path.as_deref()]
            .into_iter()
            .flatten()
        {
            builder.path(path);
        }
    }
    repo.checkout_tree(to.as_object(), Some(&mut builder))
        .git_context("checkout")?;
    Ok(changes)
}

/// Move the current branch to `target` and check out only what changed
pub(crate) fn advance_branch(
    repo: &Repository,
    branch: &str,
    target: &Commit<'_>,
    message: &str,
) -> Result<Vec<ChangeEntry>> {
    let from = match head_commit(repo)? {
        Some(commit) => Some(commit.tree().git_context("resolve HEAD tree")?),
        None => None,
    };
    let to = target.tree().git_context("resolve target tree")?;
    let changes = checkout_changed(repo, from.as_ref(), &to)?;

    repo.reference(&format!("refs/heads/{branch}"), target.id(), true, message)
        .git_context("update branch")?;
    repo.set_head(&format!("refs/heads/{branch}"))
        .git_context("set HEAD")?;
    Ok(changes)
}

/// Hard reset to `commit`, then restore secrets in the working tree
pub(crate) fn hard_reset(repo: &Repository, commit: &Commit<'_>, rules: &[FilterRule]) -> Result<()> {
    let mut builder = CheckoutBuilder::new();
    builder.force();
    repo.reset(commit.as_object(), ResetType::Hard, Some(&mut builder))
        .git_context("reset")?;
    smudge_worktree(workdir(repo)?, rules)?;
    Ok(())
}

/// Merge `theirs` into `ours` in memory, resolving every conflict to `theirs`
///
/// Returns the id of the merged tree.
pub(crate) fn merge_theirs(repo: &Repository, ours: &Commit<'_>, theirs: &Commit<'_>) -> Result<Oid> {
    let mut options = MergeOptions::new();
    options.file_favor(FileFavor::Theirs);
    let mut index = repo
        .merge_commits(ours, theirs, Some(&options))
        .git_context("merge")?;
    resolve_to_theirs(&mut index)?;
    index.write_tree_to(repo).git_context("write merged tree")
}

fn resolve_to_theirs(index: &mut Index) -> Result<()> {
    if !index.has_conflicts() {
        return Ok(());
    }

    let conflicts = index
        .conflicts()
        .git_context("read conflicts")?
        .collect::<std::result::Result<Vec<_>, _>>()
        .git_context("read conflicts")?;

    for conflict in conflicts {
        let Some(path) = conflict
            .their
            .as_ref()
            .or(conflict.our.as_ref())
            .or(conflict.ancestor.as_ref())
            .map(|entry| String::from_utf8_lossy(&entry.path).into_owned())
        else {
            continue;
        };

        index
            .conflict_remove(Path::new(&path))
            .git_context("resolve conflict")?;
        if let Some(mut entry) = conflict.their {
            entry.flags &= !STAGE_MASK;
            index.add(&entry).git_context("resolve conflict")?;
        }
        debug!(path = %path, "Resolved conflict with incoming version");
    }
    Ok(())
}

/// Paths with unresolved conflicts in the repository index
pub(crate) fn conflicted_paths(repo: &Repository) -> Result<Vec<String>> {
    let index = repo.index().git_context("open index")?;
    if !index.has_conflicts() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for conflict in index.conflicts().git_context("read conflicts")? {
        let conflict = conflict.git_context("read conflicts")?;
        if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
            paths.push(String::from_utf8_lossy(&entry.path).into_owned());
        }
    }
    Ok(paths)
}
