//! Common utilities and types shared across CLI commands

use crate::error::Result;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tether_config::{Config, Layout};
use tether_core::{ProgressSink, Redactor};
use tether_engine::RepositorySync;

/// Runtime context passed to every command
///
/// Holds the engine for the server root. The redactor is shared with the
/// logging layer, so anything the engine learns to mask is also masked in
/// log output and command errors.
pub struct RuntimeContext {
    sync: Arc<RepositorySync>,
    config_path: PathBuf,
}

impl RuntimeContext {
    /// Build the engine for `root` from the configuration at `config_path`
    ///
    /// A missing configuration file yields defaults; commands that need a
    /// remote then fail with a configuration error.
    pub fn new(
        root: &Path,
        config_path: Option<&Path>,
        redactor: Arc<Redactor>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self> {
        let config_path =
            config_path.map_or_else(|| default_config_path(root), Path::to_path_buf);
        let config = Config::load_or_default(&config_path)?;
        redactor.refresh([config.repository.token.clone()]);

        let sync = RepositorySync::new(root, config)
            .with_config_path(&config_path)
            .with_redactor(redactor)
            .with_progress(progress);

        Ok(Self {
            sync: Arc::new(sync),
            config_path,
        })
    }

    pub fn sync(&self) -> &RepositorySync {
        &self.sync
    }

    /// Shared handle for background work such as the scheduler
    pub fn shared(&self) -> Arc<RepositorySync> {
        Arc::clone(&self.sync)
    }

    pub fn root(&self) -> &Path {
        self.sync.layout().root()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn redactor(&self) -> &Redactor {
        self.sync.redactor()
    }
}

/// `<root>/<data_dir>/tether.toml` with the default data directory
pub fn default_config_path(root: &Path) -> PathBuf {
    Layout::new(root, &Config::default()).config_file()
}

/// Print `value` as pretty JSON on stdout
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print `value` as JSON when asked, otherwise through its `Display`
pub fn print_output<T: Serialize + std::fmt::Display>(value: &T, json: bool) -> Result<()> {
    if json {
        print_json(value)
    } else {
        println!("{value}");
        Ok(())
    }
}
