//! On-disk layout of a synced server
//!
//! The server root is the repository working tree. Everything tether itself
//! owns (tools, backups, config) lives below the configured data directory.

use crate::Config;
use std::path::{Path, PathBuf};

/// Ignore file at the root of the working tree
pub const IGNORE_FILE: &str = ".gitignore";
/// Filter attribute mapping file
pub const ATTRIBUTES_FILE: &str = ".gitattributes";
/// Zero-byte marker left behind by an external merge
pub const MERGED_MARKER: &str = ".tether-merged-externals";
/// Descriptor written by the ready-to-merge signal
pub const READY_MARKER: &str = ".tether/ready-to-merge.json";
/// Config file name inside the data directory
pub const CONFIG_FILE: &str = "tether.toml";

/// Resolved paths for one server root
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    data_dir: PathBuf,
    secrets_store: PathBuf,
}

impl Layout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, config: &Config) -> Self {
        let root = root.into();
        let data_dir = root.join(&config.paths.data_dir);
        let secrets_store = root.join(&config.secrets.store);
        Self {
            root,
            data_dir,
            secrets_store,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }

    pub fn ignore_file(&self) -> PathBuf {
        self.root.join(IGNORE_FILE)
    }

    pub fn attributes_file(&self) -> PathBuf {
        self.root.join(ATTRIBUTES_FILE)
    }

    pub fn merged_marker(&self) -> PathBuf {
        self.root.join(MERGED_MARKER)
    }

    pub fn ready_marker(&self) -> PathBuf {
        self.root.join(READY_MARKER)
    }

    pub fn secrets_store(&self) -> &Path {
        &self.secrets_store
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.data_dir.join("tools")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir.join(CONFIG_FILE)
    }

    /// Queue of staged plugin unloads and loads
    pub fn staged_jars(&self) -> PathBuf {
        self.data_dir.join("staged-jars.json")
    }

    /// Advisory lock file shared by every process syncing this root
    pub fn sync_lock(&self) -> PathBuf {
        self.data_dir.join("sync.lock")
    }

    /// A live repository needs both the metadata directory and the ignore file
    pub fn repo_exists(&self) -> bool {
        self.git_dir().is_dir() && self.ignore_file().is_file()
    }
}
