//! Configuration management
//!
//! This module handles loading and saving the tether configuration file.

use crate::Result;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tether_core::Error;

/// How pushes to a protected branch are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProtectedMode {
    /// Protected branches behave like any other branch
    #[default]
    Off,
    /// Pushes are always refused
    Block,
    /// Pushes need an explicit force flag
    RequireForce,
}

/// Remote repository settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Remote URL, required for pull and push
    #[serde(default)]
    pub url: String,

    /// Branch the server tracks
    #[serde(default = "default_branch")]
    pub branch: String,

    /// User name for HTTP authentication
    #[serde(default)]
    pub user: String,

    /// Password or access token for HTTP authentication
    #[serde(default)]
    pub token: String,

    /// Author name used for automated commits
    #[serde(default = "default_author_name")]
    pub author_name: String,

    /// Author email used for automated commits
    #[serde(default = "default_author_email")]
    pub author_email: String,

    /// Branches guarded by `protected_mode`
    #[serde(default)]
    pub protected_branches: Vec<String>,

    #[serde(default)]
    pub protected_mode: ProtectedMode,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            branch: default_branch(),
            user: String::new(),
            token: String::new(),
            author_name: default_author_name(),
            author_email: default_author_email(),
            protected_branches: Vec::new(),
            protected_mode: ProtectedMode::Off,
        }
    }
}

/// Username and token pair for the remote
#[derive(Debug, Clone)]
pub struct Credentials {
    pub user: String,
    pub token: SecretString,
}

impl RepositoryConfig {
    /// Remote URL, or a configuration error when unset
    pub fn require_url(&self) -> Result<&str> {
        let url = self.url.trim();
        if url.is_empty() {
            return Err(Error::Config(
                "repository.url is not set; configure the remote before syncing".to_string(),
            ));
        }
        Ok(url)
    }

    /// Credentials when both user and token are configured
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        if self.user.is_empty() || self.token.is_empty() {
            return None;
        }
        Some(Credentials {
            user: self.user.clone(),
            token: SecretString::from(self.token.clone()),
        })
    }

    /// Whether `branch` is on the protected list
    #[must_use]
    pub fn is_protected(&self, branch: &str) -> bool {
        self.protected_branches.iter().any(|b| b == branch)
    }
}

/// Backoff settings for the retry wrapper
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Secrets store and filter tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretsConfig {
    /// Store file, relative to the server root
    #[serde(default = "default_store")]
    pub store: PathBuf,

    /// Explicit location of the bundled replace executable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_tool: Option<PathBuf>,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            store: default_store(),
            replace_tool: None,
        }
    }
}

/// Plugin artifact reload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JarsConfig {
    /// Unload and reload changed plugin jars around a pull
    #[serde(default)]
    pub enabled: bool,

    /// Queue jar operations until an explicit apply
    #[serde(default)]
    pub staging: bool,

    #[serde(default = "default_unload_command")]
    pub unload_command: String,

    #[serde(default = "default_load_command")]
    pub load_command: String,

    /// Jars whose names contain any of these are never touched
    #[serde(default = "default_skip")]
    pub skip: Vec<String>,
}

impl Default for JarsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            staging: false,
            unload_command: default_unload_command(),
            load_command: default_load_command(),
            skip: default_skip(),
        }
    }
}

/// Restart behavior after a pull
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default)]
    pub on_pull: bool,

    /// Command run by the default plugin host to restart the server
    #[serde(default)]
    pub command: String,
}

/// Periodic pull settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Cron-like schedule, only `*/N * * * *` is understood
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// Only preview incoming changes instead of pulling
    #[serde(default)]
    pub dry_run: bool,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            schedule: default_schedule(),
            dry_run: false,
        }
    }
}

/// Data directory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Tool and backup directory, relative to the server root
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub repository: RepositoryConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub secrets: SecretsConfig,

    #[serde(default)]
    pub jars: JarsConfig,

    #[serde(default)]
    pub restart: RestartConfig,

    #[serde(default)]
    pub automation: AutomationConfig,

    #[serde(default)]
    pub paths: PathsConfig,
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_author_name() -> String {
    "Tether".to_string()
}

fn default_author_email() -> String {
    "tether@localhost".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    10_000
}

fn default_store() -> PathBuf {
    PathBuf::from("secrets.yml")
}

fn default_unload_command() -> String {
    "plugman unload {name}".to_string()
}

fn default_load_command() -> String {
    "plugman load {name}".to_string()
}

fn default_skip() -> Vec<String> {
    vec!["Tether".to_string(), "PlugMan".to_string()]
}

fn default_schedule() -> String {
    "*/5 * * * *".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("plugins/Tether")
}

impl Config {
    /// Load configuration from a file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or TOML parsing fails
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file {}: {e}", path.display()))
        })
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Write configuration back to disk
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| Error::path_io(parent, e))?;
        }
        fs::write(path, content).map_err(|e| Error::path_io(path, e))
    }
}
