//! Core types and utilities for tether
//!
//! This is the foundation crate (Layer 0) that all other tether crates depend on.
//! It provides:
//! - The error taxonomy shared by every repository operation
//! - Log redaction tokens
//! - Platform detection
//! - Collaborator traits (plugin host, progress sink)
//!
//! This crate has no dependencies on other tether crates.

pub mod error;
pub mod platform;
pub mod redact;
pub mod traits;

pub use error::{Error, ErrorKind, Result};
pub use redact::Redactor;
pub use traits::{Action, NoopProgress, PluginHost, ProgressSink};
