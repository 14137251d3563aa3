//! # Tether Secrets
//!
//! Keeps secret values out of committed history. A declarative store binds
//! `(file, identifier, value)` triples; committed files carry `{{identifier}}`
//! placeholders and the working tree carries the real values.
//!
//! - [`SecretStore`] loads, validates and previews the bindings
//! - [`SecretFilterManager`] turns them into clean/smudge filter rules
//! - [`replace`] is the substitution used by the bundled `tether-replace` tool

pub mod filter;
pub mod replace;
pub mod store;

pub use filter::{
    CapabilityDetector, FilterMode, FilterReport, FilterRule, SecretFilterManager,
    SystemStreamEditor,
};
pub use store::{Secret, SecretStore, ValidationIssue};

/// Normalize a repository-relative path: forward slashes, no leading `./`
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let forward = path.trim().replace('\\', "/");
    let mut rest = forward.as_str();
    while let Some(stripped) = rest.strip_prefix("./") {
        rest = stripped;
    }
    rest.trim_start_matches('/').to_string()
}
