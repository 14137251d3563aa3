//! Base error types for tether
//!
//! Every failure is tagged with an [`ErrorKind`] so callers (and the retry
//! wrapper in particular) can tell a refused precondition from a flaky network.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// The operation was refused before doing anything
    Precondition,
    /// Another mutating operation holds the sync gate
    Busy,
    /// Malformed or missing configuration
    Config,
    /// A commit, branch or remote could not be resolved
    NotFound,
    /// Network or repository failure that may succeed on a later attempt
    Transient,
    /// Filesystem failure
    Io,
}

/// Base error type for shared functionality
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IO error tied to a specific path
    #[error("Failed to access {}: {source}", path.display())]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Operation refused before it started
    #[error("{0}")]
    Precondition(String),

    /// Sync gate is held by another operation
    #[error("Another operation is already running ({running}); try again later")]
    Busy { running: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing commit, branch or remote
    #[error("{0}")]
    NotFound(String),

    /// Repository or network failure
    #[error("{context}: {message}")]
    Transient { context: String, message: String },

    /// Ignore file does not contain the managed section markers
    #[error("Ignore file {} is missing the managed section markers", path.display())]
    MissingMarkers { path: PathBuf },
}

impl Error {
    /// Wrap an IO error with the path it concerns
    pub fn path_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::PathIo {
            path: path.into(),
            source,
        }
    }

    /// Build a transient error from any displayable cause
    pub fn transient(context: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::Transient {
            context: context.into(),
            message: cause.to_string(),
        }
    }

    /// Classification used for reporting and retry decisions
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::PathIo { .. } => ErrorKind::Io,
            Self::Precondition(_) => ErrorKind::Precondition,
            Self::Busy { .. } => ErrorKind::Busy,
            Self::Config(_) | Self::MissingMarkers { .. } => ErrorKind::Config,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Transient { .. } => ErrorKind::Transient,
        }
    }

    /// Whether repeating the same call could plausibly succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Io)
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
