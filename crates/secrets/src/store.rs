//! Secrets store loading, validation and preview
//!
//! The store is a YAML document of named blocks. Each block names a target
//! `file` and any number of `identifier: value` pairs:
//!
//! ```yaml
//! 1:
//!   file: "plugins/app/config.yml"
//!   db_pass: "hunter2"
//! ```
//!
//! The target file contains `{{db_pass}}` in the repository and `hunter2` in
//! the working tree.

use crate::normalize_path;
use indexmap::IndexMap;
use regex::Regex;
use serde_yaml::Value;
use similar::{ChangeTag, TextDiff};
use std::fmt;
use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::sync::LazyLock;
use tether_core::{Error, Result};
use tracing::{debug, info};

/// Written when the store file does not exist yet
pub const EXAMPLE_STORE: &str = r#"# Secrets kept out of the repository.
#
# Each block names a target file (relative to the server root) and any number
# of identifier/value pairs. Committed files contain {{identifier}}, the
# running server sees the value.
#
# Helpers resolved in memory only:
#   ${ENV:NAME}      value of environment variable NAME (empty if unset)
#   ${RANDOM_PORT}   a currently free local TCP port
#
# Identifiers and values must not contain single quotes.

1:
  file: "plugins/example-plugin-1/config.yml"
  database_password: "password"
  database_username: "username"

2:
  file: "plugins/example-plugin-2/config.yml"
  license_key: "license_key"
"#;

/// Message returned by [`SecretStore::preview`] for files without secrets
pub const NO_SECRETS_MESSAGE: &str = "No secrets configured for this file.";
/// Message returned by [`SecretStore::preview`] when substitution is a no-op
pub const NO_CHANGES_MESSAGE: &str = "No changes after applying secrets.";

static ENV_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{ENV:([A-Za-z_][A-Za-z0-9_]*)\}").expect("Failed to compile env helper pattern")
});

const RANDOM_PORT_TOKEN: &str = "${RANDOM_PORT}";

/// One secret binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub identifier: String,
    pub file: String,
    pub value: String,
}

impl Secret {
    /// Placeholder text committed in place of the value
    #[must_use]
    pub fn placeholder(&self) -> String {
        format!("{{{{{}}}}}", self.identifier)
    }
}

/// A problem found by [`SecretStore::validate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub file: String,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.file, self.message)
    }
}

/// Secrets grouped by target file, in store order
#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    files: IndexMap<String, Vec<Secret>>,
}

impl SecretStore {
    /// Read the store file, writing the documented example first if absent
    ///
    /// # Errors
    ///
    /// Returns `Config` errors for malformed blocks and `Io` errors when the
    /// file cannot be read or the example cannot be written.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent).map_err(|e| Error::path_io(parent, e))?;
            }
            fs::write(path, EXAMPLE_STORE).map_err(|e| Error::path_io(path, e))?;
            info!(path = %path.display(), "Created example secrets store");
        }

        let content = fs::read_to_string(path).map_err(|e| Error::path_io(path, e))?;
        let store = Self::parse(&content)?;
        debug!(files = store.len(), "Loaded secrets store");
        Ok(store)
    }

    /// Parse store content
    pub fn parse(content: &str) -> Result<Self> {
        let doc: Value = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse secrets store: {e}")))?;

        let blocks = match doc {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(blocks) => blocks,
            _ => {
                return Err(Error::Config(
                    "Secrets store must be a mapping of secret blocks".to_string(),
                ));
            }
        };

        let mut files: IndexMap<String, Vec<Secret>> = IndexMap::new();

        for (block_key, block) in blocks {
            let block_name = scalar(&block_key).unwrap_or_else(|| "?".to_string());
            let Value::Mapping(entries) = block else {
                return Err(Error::Config(format!(
                    "Secrets block '{block_name}' must be a mapping"
                )));
            };

            let file = entries
                .get("file")
                .and_then(scalar)
                .map(|f| normalize_path(&f))
                .filter(|f| !f.is_empty())
                .ok_or_else(|| {
                    Error::Config(format!(
                        "Every secrets block must have a file (block '{block_name}')"
                    ))
                })?;
            if file.contains('\'') || file.contains('"') {
                return Err(Error::Config(format!(
                    "File path must not contain quotes: {file}"
                )));
            }

            let secrets = files.entry(file.clone()).or_default();

            for (key, value) in &entries {
                let Some(identifier) = scalar(key) else {
                    return Err(Error::Config(format!(
                        "Secret identifiers must be plain strings in {file}"
                    )));
                };
                if identifier == "file" {
                    continue;
                }
                let raw = scalar(value).ok_or_else(|| {
                    Error::Config(format!(
                        "Every secret must have a value ({file}: {identifier})"
                    ))
                })?;
                let value = resolve_helpers(&raw)?;

                if identifier.contains('\'') || value.contains('\'') {
                    return Err(Error::Config(format!(
                        "Secret identifiers and values must not contain single quotes ({file}: {identifier})"
                    )));
                }
                if secrets.iter().any(|s| s.identifier == identifier) {
                    return Err(Error::Config(format!(
                        "Duplicate secret identifier '{identifier}' for {file}"
                    )));
                }

                secrets.push(Secret {
                    identifier,
                    file: file.clone(),
                    value,
                });
            }
        }

        files.retain(|_, secrets| !secrets.is_empty());
        Ok(Self { files })
    }

    /// Number of files with at least one secret
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Files and their secrets, in store order
    pub fn files(&self) -> impl Iterator<Item = (&str, &[Secret])> {
        self.files.iter().map(|(f, s)| (f.as_str(), s.as_slice()))
    }

    /// Secrets bound to `file` (empty when none)
    pub fn secrets_for(&self, file: &str) -> &[Secret] {
        self.files
            .get(&normalize_path(file))
            .map_or(&[], Vec::as_slice)
    }

    /// Every secret value, for log redaction
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.files.values().flatten().map(|s| s.value.as_str())
    }

    /// Substitute placeholders in `content` with the values bound to `file`
    pub fn apply(&self, file: &str, content: &str) -> String {
        let mut out = content.to_string();
        for secret in self.secrets_for(file) {
            out = out.replace(&secret.placeholder(), &secret.value);
        }
        out
    }

    /// Check every target file exists and carries each of its placeholders
    pub fn validate(&self, root: &Path) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        for (file, secrets) in &self.files {
            let target = root.join(file);
            if !target.is_file() {
                issues.push(ValidationIssue {
                    file: file.clone(),
                    message: "Target file does not exist".to_string(),
                });
                continue;
            }

            let content = match fs::read_to_string(&target) {
                Ok(content) => content,
                Err(e) => {
                    issues.push(ValidationIssue {
                        file: file.clone(),
                        message: format!("Unable to read file: {e}"),
                    });
                    continue;
                }
            };

            for secret in secrets {
                let placeholder = secret.placeholder();
                if !content.contains(&placeholder) {
                    issues.push(ValidationIssue {
                        file: file.clone(),
                        message: format!("Missing placeholder {placeholder}"),
                    });
                }
            }
        }

        issues
    }

    /// Render a before/after diff of `file` with its secrets applied
    ///
    /// Nothing is written.
    pub fn preview(&self, root: &Path, file: &str) -> Result<String> {
        let normalized = normalize_path(file);
        if self.secrets_for(&normalized).is_empty() {
            return Ok(NO_SECRETS_MESSAGE.to_string());
        }

        let target = root.join(&normalized);
        let before = fs::read_to_string(&target).map_err(|e| Error::path_io(&target, e))?;
        let after = self.apply(&normalized, &before);
        if before == after {
            return Ok(NO_CHANGES_MESSAGE.to_string());
        }

        let mut lines = vec![
            format!("--- {normalized} (current)"),
            format!("+++ {normalized} (with secrets)"),
        ];
        let diff = TextDiff::from_lines(&before, &after);
        for change in diff.iter_all_changes() {
            let text = change.value().trim_end_matches(['\r', '\n']);
            match change.tag() {
                ChangeTag::Delete => lines.push(format!("-{text}")),
                ChangeTag::Insert => lines.push(format!("+{text}")),
                ChangeTag::Equal => {}
            }
        }
        Ok(lines.join("\n"))
    }
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Expand `${ENV:NAME}` and `${RANDOM_PORT}` in a secret value
fn resolve_helpers(raw: &str) -> Result<String> {
    let mut value = ENV_TOKEN
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned();

    while value.contains(RANDOM_PORT_TOKEN) {
        let port = free_port()?;
        value = value.replacen(RANDOM_PORT_TOKEN, &port.to_string(), 1);
    }

    Ok(value)
}

fn free_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
