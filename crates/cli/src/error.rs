//! Error types for CLI commands

use thiserror::Error;

/// Errors that can occur during command execution
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CommandError {
    /// Failure reported by the sync engine
    #[error(transparent)]
    Engine(#[from] tether_core::Error),

    /// Invalid command-line value
    #[error("Invalid {what} '{value}': {reason}")]
    InvalidArgument {
        /// Which argument was rejected
        what: &'static str,
        /// The value as given
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// The doctor report contains failed checks
    #[error("{failed} health checks failed")]
    Unhealthy {
        /// Number of failed checks
        failed: usize,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for CommandError {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(err.into())
    }
}

/// Result type alias for command operations
pub type Result<T> = std::result::Result<T, CommandError>;

impl CommandError {
    /// Create an `InvalidArgument` error
    pub fn invalid(what: &'static str, value: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidArgument {
            what,
            value: value.into(),
            reason: reason.to_string(),
        }
    }

    /// Classification of engine failures, if this is one
    pub fn kind(&self) -> Option<tether_core::ErrorKind> {
        match self {
            Self::Engine(e) => Some(e.kind()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;
    use tether_core::ErrorKind;

    #[test]
    fn test_engine_error_keeps_message_and_kind() {
        let error: CommandError = tether_core::Error::Busy {
            running: "pull".to_string(),
        }
        .into();

        assert_eq!(error.kind(), Some(ErrorKind::Busy));
        assert_eq!(
            error.to_string(),
            "Another operation is already running (pull); try again later"
        );
    }

    #[test]
    fn test_invalid_argument() {
        let error = CommandError::invalid("time", "yesterday", "expected RFC 3339");
        assert_eq!(
            error.to_string(),
            "Invalid time 'yesterday': expected RFC 3339"
        );
        assert_eq!(error.kind(), None);
    }

    #[test]
    fn test_unhealthy() {
        let error = CommandError::Unhealthy { failed: 2 };
        assert_eq!(error.to_string(), "2 health checks failed");
    }

    #[test]
    fn test_anyhow_error_conversion() {
        let error: CommandError = anyhow::anyhow!("something went wrong").into();
        assert!(matches!(error, CommandError::Other(_)));
        assert!(error.to_string().contains("something went wrong"));
    }
}
