//! Configuration management for tether
//!
//! This crate handles:
//! - Configuration loading and saving (`tether.toml`)
//! - The on-disk layout of the server root and data directory
//! - Logging initialization with secret redaction

pub mod config;
pub mod layout;
pub mod logging;

// Re-export error types from core
pub use tether_core::{Error, Result};

// Re-export main types
pub use config::{
    AutomationConfig, Config, Credentials, JarsConfig, PathsConfig, ProtectedMode,
    RepositoryConfig, RestartConfig, RetryConfig, SecretsConfig,
};
pub use layout::Layout;
