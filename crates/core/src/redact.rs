//! Scrubbing of secret values from emitted text
//!
//! The token set is shared between the logging layer and the components that
//! load secrets or credentials, so it lives behind an `RwLock`.

use std::sync::RwLock;

/// Replacement written in place of every redacted token
pub const MASK: &str = "****";

/// Thread-safe set of strings that must never leave the process in clear text
#[derive(Debug, Default)]
pub struct Redactor {
    tokens: RwLock<Vec<String>>,
}

impl Redactor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole token set
    ///
    /// Empty strings are dropped. Longer tokens are matched first so a secret
    /// that contains another secret is masked as a whole.
    pub fn refresh<I, S>(&self, tokens: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut fresh: Vec<String> = tokens
            .into_iter()
            .map(Into::into)
            .filter(|t| !t.is_empty())
            .collect();
        fresh.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        fresh.dedup();

        match self.tokens.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    /// Number of tokens currently masked
    pub fn len(&self) -> usize {
        self.tokens.read().map_or(0, |t| t.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return `text` with every known token replaced by [`MASK`]
    pub fn redact(&self, text: &str) -> String {
        let Ok(tokens) = self.tokens.read() else {
            return text.to_string();
        };
        let mut out = text.to_string();
        for token in tokens.iter() {
            if out.contains(token.as_str()) {
                out = out.replace(token.as_str(), MASK);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_masks_all_occurrences() {
        let redactor = Redactor::new();
        redactor.refresh(["hunter2", "ghp_token"]);
        let out = redactor.redact("auth ghp_token failed, password hunter2 (hunter2)");
        assert_eq!(out, "auth **** failed, password **** (****)");
    }

    #[test]
    fn test_refresh_replaces_previous_tokens() {
        let redactor = Redactor::new();
        redactor.refresh(["old"]);
        redactor.refresh(["new"]);
        assert_eq!(redactor.redact("old new"), "old ****");
        assert_eq!(redactor.len(), 1);
    }

    #[test]
    fn test_longer_tokens_win() {
        let redactor = Redactor::new();
        redactor.refresh(["abc", "abcdef"]);
        assert_eq!(redactor.redact("key=abcdef"), "key=****");
    }

    #[test]
    fn test_empty_tokens_ignored() {
        let redactor = Redactor::new();
        redactor.refresh(["", "x1"]);
        assert_eq!(redactor.len(), 1);
        assert_eq!(redactor.redact("plain"), "plain");
    }
}
