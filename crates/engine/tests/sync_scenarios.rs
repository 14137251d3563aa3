//! End-to-end repository operations against a local bare remote

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use chrono::{DateTime, Utc};
use common::{RecordingHost, Remote, Server};
use git2::Repository;
use std::fs;
use std::sync::Arc;
use tether_config::{Config, ProtectedMode};
use tether_core::{Action, ErrorKind};
use tether_engine::IgnoreListManager;

const SECRETS: &str = r#"
1:
  file: "plugins/app/config.yml"
  db_pass: "hunter2"
"#;

#[test]
fn test_initial_pull_into_empty_root_fast_forwards() {
    let remote = Remote::new();
    let tip = remote.seed("main", &[("server.properties", "motd=hello\n")], 1_700_000_000);
    let server = Server::new(&remote);

    let outcome = server.sync.pull().unwrap();
    assert!(outcome.initialized);
    assert!(outcome.changed);
    assert_eq!(outcome.baseline, None);
    assert_eq!(outcome.after, Some(tip));
    assert_eq!(server.head(), Some(tip));
    assert_eq!(remote.commit_count("main"), 1);
    assert_eq!(server.read("server.properties"), "motd=hello\n");

    let again = server.sync.pull().unwrap();
    assert!(!again.initialized);
    assert!(!again.changed);
    assert!(again.changes.is_empty());
    assert_eq!(remote.commit_count("main"), 1);
}

#[test]
fn test_initial_pull_against_empty_remote_pushes_baseline() {
    let remote = Remote::new();
    let server = Server::new(&remote);

    let outcome = server.sync.pull().unwrap();
    assert!(outcome.initialized);
    let baseline = outcome.baseline.unwrap();
    assert_eq!(remote.tip("main"), Some(baseline));
    assert!(remote.file("main", ".gitignore").is_some());
    assert!(remote.file("main", "secrets.yml").is_none());
}

#[test]
fn test_pull_brings_in_remote_commits() {
    let remote = Remote::new();
    remote.seed("main", &[("server.properties", "motd=hello\n")], 1_700_000_000);
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    let tip = remote.commit_at(
        "main",
        &[("server.properties", "motd=updated\n")],
        1_700_000_100,
        "update motd",
    );
    let outcome = server.sync.pull().unwrap();
    assert!(outcome.changed);
    assert_eq!(outcome.after, Some(tip));
    assert_eq!(outcome.changes.len(), 1);
    assert_eq!(server.read("server.properties"), "motd=updated\n");
}

#[test]
fn test_push_without_changes_is_precondition() {
    let remote = Remote::new();
    let server = Server::new(&remote);
    server.sync.pull().unwrap();
    let before = remote.tip("main");

    let err = server.sync.push("nothing", None, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_eq!(remote.tip("main"), before);
    assert_eq!(server.head(), before);
}

#[test]
fn test_push_without_repository_is_precondition() {
    let remote = Remote::new();
    let server = Server::new(&remote);
    let err = server.sync.push("x", None, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(!server.sync.gate().is_busy());
}

#[test]
fn test_track_push_untrack() {
    let remote = Remote::new();
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    server.write("server.properties", "motd=hello\n");
    let tracked = server.sync.track("server.properties").unwrap();
    assert!(tracked.tracked);
    assert!(tracked.changes >= 1);
    assert_eq!(
        remote.file("main", "server.properties").as_deref(),
        Some("motd=hello\n")
    );
    assert!(
        IgnoreListManager::new(server.path(".gitignore"))
            .managed_entries()
            .unwrap()
            .contains(&"!/server.properties*".to_string())
    );

    server.write("server.properties", "motd=changed\n");
    let pushed = server.sync.push("Change motd", Some("Operator"), false).unwrap();
    assert!(pushed.commit.is_some());
    assert_eq!(pushed.changes.len(), 1);
    assert_eq!(
        remote.file("main", "server.properties").as_deref(),
        Some("motd=changed\n")
    );

    let removed = server.sync.untrack("server.properties").unwrap();
    assert!(!removed.tracked);
    assert!(remote.file("main", "server.properties").is_none());
    assert_eq!(server.read("server.properties"), "motd=changed\n");
}

#[test]
fn test_track_unchanged_path_does_not_commit() {
    let remote = Remote::new();
    let server = Server::new(&remote);
    server.sync.pull().unwrap();
    server.write("eula.txt", "eula=true\n");
    server.sync.track("eula.txt").unwrap();
    let tip = remote.tip("main");

    let outcome = server.sync.track("eula.txt").unwrap();
    assert_eq!(outcome.changes, 0);
    assert_eq!(remote.tip("main"), tip);
}

#[test]
fn test_secrets_never_reach_the_remote() {
    let remote = Remote::new();
    let first = Server::with_secrets(&remote, SECRETS);
    first.sync.pull().unwrap();

    first.write("plugins/app/config.yml", "password: hunter2\n");
    first.sync.track("plugins/app/config.yml").unwrap();
    assert_eq!(
        remote.file("main", "plugins/app/config.yml").as_deref(),
        Some("password: {{db_pass}}\n")
    );
    assert_eq!(first.read("plugins/app/config.yml"), "password: hunter2\n");
    assert!(
        remote
            .file("main", ".gitattributes")
            .unwrap()
            .contains("plugins/app/config.yml filter=plugins/app/config.yml")
    );

    let second = Server::with_secrets(&remote, SECRETS);
    let outcome = second.sync.pull().unwrap();
    assert_eq!(outcome.baseline, None);
    assert_eq!(second.read("plugins/app/config.yml"), "password: hunter2\n");

    first.write("plugins/app/config.yml", "password: hunter2\nport: 1\n");
    first.sync.reset("HEAD").unwrap();
    assert_eq!(first.read("plugins/app/config.yml"), "password: hunter2\n");
}

#[test]
fn test_secret_values_are_redacted() {
    let remote = Remote::new();
    let server = Server::with_secrets(&remote, SECRETS);
    server.sync.pull().unwrap();
    assert_eq!(
        server.sync.redactor().redact("db password is hunter2"),
        "db password is ****"
    );
}

#[test]
fn test_rollback_resolves_commit_by_time() {
    let remote = Remote::new();
    let first = remote.seed("main", &[("server.properties", "v=1\n")], 1_600_000_000);
    let second = remote.commit_at("main", &[("server.properties", "v=2\n")], 1_700_000_000, "v2");
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    let too_early = DateTime::<Utc>::from_timestamp(1_500_000_000, 0).unwrap();
    let err = server.sync.rollback(too_early).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    assert_eq!(server.sync.rollback(Utc::now()).unwrap(), second);

    let between = DateTime::<Utc>::from_timestamp(1_650_000_000, 0).unwrap();
    assert_eq!(server.sync.rollback(between).unwrap(), first);
    assert_eq!(server.read("server.properties"), "v=1\n");
}

#[test]
fn test_rollback_into_future_is_not_found() {
    let remote = Remote::new();
    remote.seed("main", &[], 1_600_000_000);
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    let future = Utc::now() + chrono::Duration::days(1);
    let err = server.sync.rollback(future).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_busy_gate_rejects_second_operation() {
    let remote = Remote::new();
    let server = Server::new(&remote);
    server.sync.pull().unwrap();
    let pulls = server.sync.metrics().snapshot().pulls;

    {
        let _held = server.sync.gate().try_acquire(Action::Push).unwrap();
        let err = server.sync.pull().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(err.to_string().contains("push"));
        assert_eq!(
            server.sync.reset("HEAD").unwrap_err().kind(),
            ErrorKind::Busy
        );
    }

    assert!(!server.sync.gate().is_busy());
    let snapshot = server.sync.metrics().snapshot();
    assert_eq!(snapshot.pulls, pulls + 1);
    assert_eq!(snapshot.pull_failures, 1);
    server.sync.pull().unwrap();
    assert_eq!(server.sync.metrics().snapshot().pulls, pulls + 2);
}

#[test]
fn test_engines_on_one_root_share_the_gate() {
    let remote = Remote::new();
    remote.seed("main", &[("a.txt", "1\n")], 1_600_000_000);
    let daemon = Server::new(&remote);
    daemon.sync.pull().unwrap();
    remote.commit_at("main", &[("a.txt", "2\n")], 1_700_000_000, "bump");
    let webhook = daemon.second_engine();

    {
        let _held = daemon.sync.gate().try_acquire(Action::Pull).unwrap();
        let err = webhook.on_external_push().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(err.to_string().contains("(pull)"));
        assert_eq!(
            webhook.push("x", None, false).unwrap_err().kind(),
            ErrorKind::Busy
        );
        assert_eq!(daemon.read("a.txt"), "1\n");
    }

    let outcome = webhook.on_external_push().unwrap();
    assert!(outcome.changed);
    assert_eq!(daemon.read("a.txt"), "2\n");
    assert!(!daemon.sync.pull().unwrap().changed);
}

#[test]
fn test_protected_branch_blocks_pushes() {
    let remote = Remote::new();
    remote.seed("main", &[("server.properties", "v=1\n")], 1_600_000_000);
    let mut config = Config::default();
    config.repository.url = remote.url();
    config.repository.protected_branches = vec!["main".to_string()];
    config.repository.protected_mode = ProtectedMode::Block;
    let server = Server::with_config(config, "");
    server.sync.pull().unwrap();
    let tip = remote.tip("main");

    server.write("server.properties", "v=2\n");
    for force in [false, true] {
        let err = server.sync.push("change", None, force).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert!(err.to_string().contains("blocked"));
    }
    assert_eq!(remote.tip("main"), tip);
}

#[test]
fn test_protected_branch_requires_force() {
    let remote = Remote::new();
    remote.seed("main", &[("server.properties", "v=1\n")], 1_600_000_000);
    let mut config = Config::default();
    config.repository.url = remote.url();
    config.repository.protected_branches = vec!["main".to_string()];
    config.repository.protected_mode = ProtectedMode::RequireForce;
    let server = Server::with_config(config, "");
    server.sync.pull().unwrap();
    let tip = remote.tip("main");

    server.write("server.properties", "v=2\n");
    let err = server.sync.push("change", None, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_eq!(remote.tip("main"), tip);

    let pushed = server.sync.push("change", None, true).unwrap();
    assert_eq!(remote.tip("main"), pushed.commit);
    assert_eq!(remote.file("main", "server.properties").as_deref(), Some("v=2\n"));
}

fn jar_server(remote: &Remote, staging: bool, host: &Arc<RecordingHost>) -> Server {
    let mut config = Config::default();
    config.repository.url = remote.url();
    config.jars.enabled = true;
    config.jars.staging = staging;
    Server::with_config(config, "").with_host(host.clone())
}

fn update_essentials(remote: &Remote) {
    remote.commit_changes(
        "main",
        &[("plugins/Essentials-2.0.jar", "new build of the jar")],
        &["plugins/Essentials-1.0.jar"],
        1_700_000_000,
        "update essentials",
    );
}

#[test]
fn test_pull_reloads_changed_jars() {
    let remote = Remote::new();
    remote.seed(
        "main",
        &[("plugins/Essentials-1.0.jar", "old"), ("plugins/Vault.jar", "vault")],
        1_600_000_000,
    );
    let host = Arc::new(RecordingHost::default());
    let server = jar_server(&remote, false, &host);
    server.sync.pull().unwrap();
    assert!(host.calls().is_empty());

    update_essentials(&remote);
    let outcome = server.sync.pull().unwrap();
    assert!(outcome.changed);
    assert_eq!(host.calls(), vec!["unload Essentials", "load Essentials"]);
    assert!(!server.path("plugins/Essentials-1.0.jar").exists());
    assert!(server.path("plugins/Essentials-2.0.jar").exists());
    assert!(server.sync.jars().staged().is_empty());
}

#[test]
fn test_staged_jars_apply_from_another_engine() {
    let remote = Remote::new();
    remote.seed("main", &[("plugins/Essentials-1.0.jar", "old")], 1_600_000_000);
    let host = Arc::new(RecordingHost::default());
    let server = jar_server(&remote, true, &host);
    server.sync.pull().unwrap();

    update_essentials(&remote);
    server.sync.pull().unwrap();
    assert!(host.calls().is_empty());
    assert!(server.sync.layout().staged_jars().exists());

    let cli = server.second_engine().with_host(host.clone());
    {
        let _held = server.sync.gate().try_acquire(Action::Pull).unwrap();
        let err = cli.apply_staged_jars().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(host.calls().is_empty());
    }

    let report = cli.apply_staged_jars().unwrap();
    assert_eq!(report.unloaded, vec!["Essentials"]);
    assert_eq!(report.loaded, vec!["Essentials"]);
    assert_eq!(host.calls(), vec!["unload Essentials", "load Essentials"]);
    assert!(server.sync.jars().staged().is_empty());
    assert!(!server.sync.layout().staged_jars().exists());
    assert_eq!(cli.clear_staged_jars().unwrap().dropped, 0);
}

#[test]
fn test_diverged_history_merges_with_remote_winning() {
    let remote = Remote::new();
    remote.seed("main", &[("x.txt", "base\n")], 1_600_000_000);
    let ours = Server::new(&remote);
    ours.sync.pull().unwrap();
    let theirs = Server::new(&remote);
    theirs.sync.pull().unwrap();

    theirs.write("x.txt", "remote\n");
    theirs.sync.push("remote edit", None, false).unwrap();

    // rejected as non fast-forward; the local commit stays behind
    ours.write("x.txt", "local\n");
    let err = ours.sync.push_with_retry("local edit", None, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_eq!(ours.sync.metrics().snapshot().pushes, 1);

    let outcome = ours.sync.pull().unwrap();
    assert!(outcome.changed);
    assert_eq!(ours.read("x.txt"), "remote\n");
    let repo = Repository::open(ours.root()).unwrap();
    let head = repo.head().unwrap().peel_to_commit().unwrap();
    assert_eq!(head.parent_count(), 2);

    let pushed = ours.sync.push("publish merge", None, false).unwrap();
    assert_eq!(pushed.commit, None);
    assert_eq!(remote.tip("main"), Some(head.id()));
    assert_eq!(remote.file("main", "x.txt").as_deref(), Some("remote\n"));
}

#[test]
fn test_unknown_remote_name_is_not_found() {
    let remote = Remote::new();
    remote.seed("main", &[], 1_600_000_000);
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    let err = server
        .sync
        .merge_external("upstrem", "main", None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let repo = Repository::open(server.root()).unwrap();
    let remotes = repo.remotes().unwrap();
    assert_eq!(remotes.iter().flatten().collect::<Vec<_>>(), vec!["origin"]);
    assert!(!server.sync.layout().merged_marker().exists());
}

#[test]
fn test_pull_publishes_baseline_the_remote_never_got() {
    let remote = Remote::new();
    let server = Server::new(&remote);
    let baseline = server.sync.pull().unwrap().baseline.unwrap();

    // as if the baseline push had failed during initialization
    let remote_repo = remote.repo();
    let mut published = remote_repo.find_reference("refs/heads/main").unwrap();
    published.delete().unwrap();
    let local = Repository::open(server.root()).unwrap();
    if let Ok(mut tracking) = local.find_reference("refs/remotes/origin/main") {
        tracking.delete().unwrap();
    }

    let outcome = server.sync.pull().unwrap();
    assert!(!outcome.initialized);
    assert!(!outcome.changed);
    assert_eq!(outcome.baseline, Some(baseline));
    assert_eq!(remote.tip("main"), Some(baseline));

    let again = server.sync.pull().unwrap();
    assert_eq!(again.baseline, None);
    assert!(!again.changed);
}

#[test]
fn test_revert_pushes_inverse_commit() {
    let remote = Remote::new();
    remote.seed("main", &[("server.properties", "v=1\n")], 1_600_000_000);
    let change = remote.commit_at("main", &[("server.properties", "v=2\n")], 1_700_000_000, "v2");
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    let oid = server.sync.revert(&change.to_string()).unwrap();
    assert_eq!(remote.tip("main"), Some(oid));
    assert_eq!(server.read("server.properties"), "v=1\n");
    assert_eq!(remote.file("main", "server.properties").as_deref(), Some("v=1\n"));
}

#[test]
fn test_merge_external_blocks_plain_push() {
    let remote = Remote::new();
    remote.seed("main", &[("server.properties", "v=1\n")], 1_600_000_000);
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    let base = remote.tip("main").unwrap();
    let repo = remote.repo();
    repo.branch("feature", &repo.find_commit(base).unwrap(), false)
        .unwrap();
    remote.commit_at("feature", &[("notes.txt", "merged\n")], 1_700_000_000, "notes");

    let outcome = server
        .sync
        .merge_external(&remote.url(), "feature", None)
        .unwrap();
    assert!(outcome.merged);
    assert!(outcome.conflicts.is_empty());
    assert_eq!(server.read("notes.txt"), "merged\n");
    assert!(server.sync.layout().merged_marker().exists());

    let err = server.sync.push("merge", None, false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);

    let pushed = server.sync.push("Merge feature", None, true).unwrap();
    assert!(pushed.commit.is_some());
    assert!(!server.sync.layout().merged_marker().exists());
    assert_eq!(remote.file("main", "notes.txt").as_deref(), Some("merged\n"));

    let remote_repo = remote.repo();
    let merged = remote_repo.find_commit(remote.tip("main").unwrap()).unwrap();
    assert_eq!(merged.parent_count(), 2);
}

#[test]
fn test_merge_abort_restores_head() {
    let remote = Remote::new();
    let base = remote.seed("main", &[("server.properties", "v=1\n")], 1_600_000_000);
    let repo = remote.repo();
    repo.branch("feature", &repo.find_commit(base).unwrap(), false)
        .unwrap();
    remote.commit_at("feature", &[("notes.txt", "merged\n")], 1_700_000_000, "notes");
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    server
        .sync
        .merge_external(&remote.url(), "feature", None)
        .unwrap();
    let head = server.sync.merge_abort().unwrap();
    assert_eq!(head, base);
    assert!(!server.sync.layout().merged_marker().exists());
}

#[test]
fn test_switch_branch_follows_remote() {
    let remote = Remote::new();
    let base = remote.seed("main", &[("server.properties", "v=1\n")], 1_600_000_000);
    let repo = remote.repo();
    repo.branch("staging", &repo.find_commit(base).unwrap(), false)
        .unwrap();
    let staging = remote.commit_at("staging", &[("server.properties", "v=staging\n")], 1_700_000_000, "staging");
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    server.sync.switch_branch("staging").unwrap();
    assert_eq!(server.head(), Some(staging));
    assert_eq!(server.read("server.properties"), "v=staging\n");
    assert_eq!(server.sync.config().repository.branch, "staging");
}

#[test]
fn test_switch_branch_refuses_local_changes() {
    let remote = Remote::new();
    remote.seed("main", &[("server.properties", "v=1\n")], 1_600_000_000);
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    server.write("server.properties", "v=dirty\n");
    let err = server.sync.switch_branch("other").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert_eq!(server.read("server.properties"), "v=dirty\n");
}

#[test]
fn test_repo_reset_forces_reinitialization() {
    let remote = Remote::new();
    remote.seed("main", &[("server.properties", "v=1\n")], 1_600_000_000);
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    let removed = server.sync.repo_reset().unwrap();
    assert!(!removed.0.is_empty());
    assert!(!server.path(".git").exists());
    assert!(!server.path(".gitignore").exists());
    assert!(server.path("server.properties").exists());

    let outcome = server.sync.pull().unwrap();
    assert!(outcome.initialized);
}

#[test]
fn test_mark_ready_commits_descriptor() {
    let remote = Remote::new();
    remote.seed("main", &[], 1_600_000_000);
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    server.sync.mark_ready(Some("production"), Some("Operator")).unwrap();
    let descriptor = remote.file("main", ".tether/ready-to-merge.json").unwrap();
    let value: serde_json::Value = serde_json::from_str(&descriptor).unwrap();
    assert_eq!(value["branch"], "main");
    assert_eq!(value["target"], "production");
    assert_eq!(value["author"], "Operator");
    assert!(fs::read_to_string(server.sync.layout().ready_marker()).is_ok());
}

#[test]
fn test_status_and_history() {
    let remote = Remote::new();
    remote.seed("main", &[("server.properties", "v=1\n")], 1_600_000_000);
    remote.commit_at("main", &[("server.properties", "v=2\n")], 1_700_000_000, "second change");
    let server = Server::new(&remote);
    server.sync.pull().unwrap();

    server.write("server.properties", "v=3\n");
    let status = server.sync.status().unwrap();
    assert!(status.initialized);
    assert_eq!(status.branch.as_deref(), Some("main"));
    assert_eq!(status.tracking, Some((0, 0)));
    assert_eq!(status.changes.len(), 1);

    let log = server.sync.log(1).unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].summary, "second change");
    assert_eq!(server.sync.log(2).unwrap_err().kind(), ErrorKind::Precondition);

    let details = server.sync.show("HEAD").unwrap();
    assert_eq!(details.changes.len(), 1);
    assert_eq!(details.changes[0].path(), "server.properties");

    let branches = server.sync.branches().unwrap();
    assert_eq!(branches.len(), 1);
    assert_eq!(branches[0].to_string(), "* main (ahead 0, behind 0)");
}

#[test]
fn test_previews_do_not_change_anything() {
    let remote = Remote::new();
    remote.seed("main", &[("server.properties", "v=1\n")], 1_600_000_000);
    let server = Server::new(&remote);
    server.sync.pull().unwrap();
    let head = server.head();

    let tip = remote.commit_at("main", &[("server.properties", "v=2\n")], 1_700_000_000, "v2");
    let incoming = server.sync.preview_pull().unwrap();
    assert_eq!(incoming.commits, 1);
    assert_eq!(incoming.changes.len(), 1);
    assert_eq!(server.head(), head);
    assert_eq!(server.read("server.properties"), "v=1\n");

    server.write("server.properties", "v=local\n");
    let outgoing = server.sync.preview_push().unwrap();
    assert_eq!(outgoing.changes.len(), 1);
    assert_eq!(remote.tip("main"), Some(tip));
}

#[test]
fn test_missing_url_is_config_error() {
    let server = Server::with_config(tether_config::Config::default(), "");
    let err = server.sync.pull().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(server.sync.metrics().snapshot().pull_failures, 1);
}
