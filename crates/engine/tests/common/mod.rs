//! Shared fixtures: a bare remote and server roots wired to it

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use git2::{Index, IndexEntry, IndexTime, Oid, Repository, Signature, Time};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tether_config::Config;
use tether_core::{PluginHost, Result};
use tether_engine::RepositorySync;
use tether_engine::ignore_list::DEFAULT_IGNORE;
use tether_secrets::{CapabilityDetector, SecretFilterManager};

/// Reports a stream editor without probing the system
pub struct AssumeSed;

impl CapabilityDetector for AssumeSed {
    fn stream_editor_available(&self) -> bool {
        true
    }
}

/// Plugin host that records every call
#[derive(Default)]
pub struct RecordingHost {
    calls: Mutex<Vec<String>>,
}

impl RecordingHost {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

impl PluginHost for RecordingHost {
    fn unload(&self, name: &str) -> Result<()> {
        self.record(format!("unload {name}"))
    }

    fn load(&self, name: &str) -> Result<()> {
        self.record(format!("load {name}"))
    }

    fn restart(&self) -> Result<()> {
        self.record("restart".to_string())
    }
}

/// A bare repository standing in for the hosted remote
pub struct Remote {
    pub dir: TempDir,
}

impl Remote {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Repository::init_bare(dir.path()).unwrap();
        Self { dir }
    }

    pub fn url(&self) -> String {
        self.dir.path().to_string_lossy().to_string()
    }

    pub fn repo(&self) -> Repository {
        Repository::open_bare(self.dir.path()).unwrap()
    }

    pub fn tip(&self, branch: &str) -> Option<Oid> {
        self.repo()
            .refname_to_id(&format!("refs/heads/{branch}"))
            .ok()
    }

    pub fn commit_count(&self, branch: &str) -> usize {
        let repo = self.repo();
        let Some(tip) = self.tip(branch) else {
            return 0;
        };
        let mut walk = repo.revwalk().unwrap();
        walk.push(tip).unwrap();
        walk.count()
    }

    /// Content of `path` in the tip of `branch`
    pub fn file(&self, branch: &str, path: &str) -> Option<String> {
        let repo = self.repo();
        let tip = self.tip(branch)?;
        let tree = repo.find_commit(tip).unwrap().tree().unwrap();
        let entry = tree.get_path(Path::new(path)).ok()?;
        let blob = repo.find_blob(entry.id()).unwrap();
        Some(String::from_utf8_lossy(blob.content()).into_owned())
    }

    /// Commit `files` on top of `branch` with an author time of `seconds`
    pub fn commit_at(&self, branch: &str, files: &[(&str, &str)], seconds: i64, message: &str) -> Oid {
        self.commit_changes(branch, files, &[], seconds, message)
    }

    /// Commit `files` and the removal of `removed` on top of `branch`
    pub fn commit_changes(
        &self,
        branch: &str,
        files: &[(&str, &str)],
        removed: &[&str],
        seconds: i64,
        message: &str,
    ) -> Oid {
        let repo = self.repo();
        let parent = self
            .tip(branch)
            .map(|oid| repo.find_commit(oid).unwrap());
        let mut index = Index::new().unwrap();
        if let Some(parent) = &parent {
            index.read_tree(&parent.tree().unwrap()).unwrap();
        }
        for path in removed {
            index.remove_path(Path::new(path)).unwrap();
        }
        for (path, content) in files {
            index.add(&blob_entry(&repo, path, content)).unwrap();
        }
        let tree = repo.find_tree(index.write_tree_to(&repo).unwrap()).unwrap();
        let signature = Signature::new("Admin", "admin@example.com", &Time::new(seconds, 0)).unwrap();
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        repo.commit(
            Some(&format!("refs/heads/{branch}")),
            &signature,
            &signature,
            message,
            &tree,
            &parents,
        )
        .unwrap()
    }

    /// Seed `branch` with the default ignore file and `files`
    pub fn seed(&self, branch: &str, files: &[(&str, &str)], seconds: i64) -> Oid {
        let mut all = vec![(".gitignore", DEFAULT_IGNORE)];
        all.extend_from_slice(files);
        self.commit_at(branch, &all, seconds, "seed")
    }
}

fn blob_entry(repo: &Repository, path: &str, content: &str) -> IndexEntry {
    IndexEntry {
        ctime: IndexTime::new(0, 0),
        mtime: IndexTime::new(0, 0),
        dev: 0,
        ino: 0,
        mode: 0o100_644,
        uid: 0,
        gid: 0,
        file_size: u32::try_from(content.len()).unwrap(),
        id: repo.blob(content.as_bytes()).unwrap(),
        flags: 0,
        flags_extended: 0,
        path: path.as_bytes().to_vec(),
    }
}

/// A server root synchronized with `remote`
pub struct Server {
    pub dir: TempDir,
    pub sync: RepositorySync,
}

impl Server {
    pub fn new(remote: &Remote) -> Self {
        Self::with_secrets(remote, "")
    }

    pub fn with_secrets(remote: &Remote, store: &str) -> Self {
        let mut config = Config::default();
        config.repository.url = remote.url();
        Self::with_config(config, store)
    }

    pub fn with_config(config: Config, store: &str) -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("secrets.yml"), store).unwrap();
        let tools = dir.path().join("plugins/Tether/tools");
        let filters = SecretFilterManager::new(tools, None).with_detector(Box::new(AssumeSed));
        let sync = RepositorySync::new(dir.path(), config).with_filter_manager(filters);
        Self { dir, sync }
    }

    /// Same server, driving plugins through `host`
    #[must_use]
    pub fn with_host(self, host: Arc<dyn PluginHost>) -> Self {
        Self {
            dir: self.dir,
            sync: self.sync.with_host(host),
        }
    }

    /// A second engine on this root, as another process would build it
    pub fn second_engine(&self) -> RepositorySync {
        let tools = self.path("plugins/Tether/tools");
        let filters = SecretFilterManager::new(tools, None).with_detector(Box::new(AssumeSed));
        RepositorySync::new(self.root(), self.sync.config()).with_filter_manager(filters)
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn write(&self, rel: &str, content: &str) {
        let path = self.path(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path(rel)).unwrap()
    }

    pub fn head(&self) -> Option<Oid> {
        let repo = Repository::open(self.root()).ok()?;
        repo.head().ok()?.target()
    }
}
