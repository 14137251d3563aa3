//! Clean/smudge filter wiring for files with secrets
//!
//! Every file with at least one secret gets a filter named after its path. The
//! clean side swaps secret values for `{{identifier}}` placeholders, the smudge
//! side reverses it. Commands use `sed` when the host has one and fall back to
//! the bundled `tether-replace` executable otherwise.
//!
//! The same rules are exposed as in-process transformations
//! ([`FilterRule::clean`], [`FilterRule::smudge`]) because libgit2 does not run
//! external filter drivers.

use crate::replace::{self, encode_arg};
use crate::store::SecretStore;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tether_core::platform::CURRENT_PLATFORM;
use tether_core::{Error, Result};
use tracing::{debug, info};

/// How long a stream editor probe result stays valid
pub const PROBE_TTL: Duration = Duration::from_secs(5 * 60);

/// File stem of the bundled substitution executable
pub const REPLACE_TOOL: &str = "tether-replace";

/// Answers whether the host provides a usable line-oriented stream editor
pub trait CapabilityDetector: Send + Sync {
    fn stream_editor_available(&self) -> bool;
}

/// Probes the system `sed` by running a trivial substitution
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemStreamEditor;

impl CapabilityDetector for SystemStreamEditor {
    fn stream_editor_available(&self) -> bool {
        if which::which("sed").is_err() {
            return false;
        }
        duct::cmd("sed", ["-e", "s/a/b/"])
            .stdin_bytes("a\n")
            .stderr_null()
            .read()
            .is_ok_and(|out| out == "b")
    }
}

/// Which command family the generated filters use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterMode {
    StreamEditor,
    ReplaceTool(PathBuf),
}

/// Clean and smudge definitions for one file
#[derive(Debug, Clone)]
pub struct FilterRule {
    /// Normalized repository path, also used as the filter name
    pub path: String,
    /// `(secret, placeholder)` in store order
    pairs: Vec<(String, String)>,
    pub clean_command: String,
    pub smudge_command: String,
}

impl FilterRule {
    /// Plaintext to placeholders
    pub fn clean(&self, content: &str) -> String {
        replace::apply_pairs(content, &self.pairs)
    }

    /// Placeholders to plaintext
    pub fn smudge(&self, content: &str) -> String {
        let inverse: Vec<(String, String)> = self
            .pairs
            .iter()
            .map(|(secret, placeholder)| (placeholder.clone(), secret.clone()))
            .collect();
        replace::apply_pairs(content, &inverse)
    }

    /// Line written to the attributes file
    pub fn attribute_line(&self) -> String {
        format!("{} filter={}", self.path, self.path)
    }
}

/// Outcome of [`SecretFilterManager::configure`]
#[derive(Debug, Clone)]
pub struct FilterReport {
    pub mode: FilterMode,
    pub rules: Vec<FilterRule>,
}

/// Derives, installs and caches filter rules
pub struct SecretFilterManager {
    detector: Box<dyn CapabilityDetector>,
    ttl: Duration,
    last_probe: Mutex<Option<(bool, Instant)>>,
    probe_platform: bool,
    tools_dir: PathBuf,
    tool_source: Option<PathBuf>,
}

impl SecretFilterManager {
    /// Manager installing the replace tool into `tools_dir`
    ///
    /// `tool_source` overrides where the tool is copied from; by default it is
    /// looked up next to the running executable.
    #[must_use]
    pub fn new(tools_dir: impl Into<PathBuf>, tool_source: Option<PathBuf>) -> Self {
        Self {
            detector: Box::new(SystemStreamEditor),
            ttl: PROBE_TTL,
            last_probe: Mutex::new(None),
            probe_platform: !CURRENT_PLATFORM.is_windows(),
            tools_dir: tools_dir.into(),
            tool_source,
        }
    }

    #[must_use]
    pub fn with_detector(mut self, detector: Box<dyn CapabilityDetector>) -> Self {
        self.detector = detector;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Whether `sed` may be used, probing at most once per TTL
    pub fn stream_editor_available(&self) -> bool {
        if !self.probe_platform {
            return false;
        }

        let mut last = match self.last_probe.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some((available, at)) = *last
            && at.elapsed() < self.ttl
        {
            return available;
        }

        let available = self.detector.stream_editor_available();
        debug!(available, "Probed stream editor");
        *last = Some((available, Instant::now()));
        available
    }

    /// Path the replace tool is installed at
    pub fn tool_path(&self) -> PathBuf {
        self.tools_dir
            .join(CURRENT_PLATFORM.executable_name(REPLACE_TOOL))
    }

    /// Derive the rules for `store` without touching the repository
    ///
    /// Installs the replace tool when it is needed and missing.
    pub fn rules(&self, root: &Path, store: &SecretStore) -> Result<FilterReport> {
        let mode = if self.stream_editor_available() {
            FilterMode::StreamEditor
        } else {
            FilterMode::ReplaceTool(self.ensure_tool()?)
        };

        let mut rules = Vec::new();
        for (file, secrets) in store.files() {
            let pairs: Vec<(String, String)> = secrets
                .iter()
                .filter(|s| !s.value.is_empty())
                .map(|s| (s.value.clone(), s.placeholder()))
                .collect();
            if pairs.is_empty() {
                continue;
            }

            let (clean_command, smudge_command) = match &mode {
                FilterMode::StreamEditor => (sed_command(&pairs, false), sed_command(&pairs, true)),
                FilterMode::ReplaceTool(tool) => {
                    let program = tool_invocation(root, tool);
                    (
                        replace_command(&program, &pairs, false),
                        replace_command(&program, &pairs, true),
                    )
                }
            };

            rules.push(FilterRule {
                path: file.to_string(),
                pairs,
                clean_command,
                smudge_command,
            });
        }

        Ok(FilterReport { mode, rules })
    }

    /// Rebuild the attribute file and the repository filter config from scratch
    ///
    /// Returns `None` when `root` holds no repository yet.
    pub fn configure(&self, root: &Path, store: &SecretStore) -> Result<Option<FilterReport>> {
        if !root.join(".git").is_dir() {
            debug!(root = %root.display(), "No repository, skipping filter setup");
            return Ok(None);
        }

        let report = self.rules(root, store)?;
        write_attributes(root, &report.rules)?;
        write_repo_config(root, &report.rules)?;

        info!(
            files = report.rules.len(),
            sed = matches!(report.mode, FilterMode::StreamEditor),
            "Configured secret filters"
        );
        Ok(Some(report))
    }

    fn ensure_tool(&self) -> Result<PathBuf> {
        let target = self.tool_path();
        if target.is_file() {
            return Ok(target);
        }

        let source = match &self.tool_source {
            Some(path) => path.clone(),
            None => bundled_tool_path()?,
        };
        if !source.is_file() {
            return Err(Error::path_io(
                &source,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "bundled replace tool is missing",
                ),
            ));
        }

        fs::create_dir_all(&self.tools_dir).map_err(|e| Error::path_io(&self.tools_dir, e))?;
        fs::copy(&source, &target).map_err(|e| Error::path_io(&target, e))?;
        make_executable(&target)?;
        info!(path = %target.display(), "Installed replace tool");
        Ok(target)
    }
}

fn bundled_tool_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()?;
    let dir = exe.parent().unwrap_or_else(|| Path::new("."));
    Ok(dir.join(CURRENT_PLATFORM.executable_name(REPLACE_TOOL)))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).map_err(|e| Error::path_io(path, e))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Program path as the filter command sees it (git runs filters from the root)
fn tool_invocation(root: &Path, tool: &Path) -> String {
    let rendered = match tool.strip_prefix(root) {
        Ok(relative) if CURRENT_PLATFORM.is_windows() => {
            format!(".\\{}", relative.display().to_string().replace('/', "\\"))
        }
        Ok(relative) => format!("./{}", relative.display().to_string().replace('\\', "/")),
        Err(_) => tool.display().to_string(),
    };
    if rendered.contains(' ') {
        format!("\"{rendered}\"")
    } else {
        rendered
    }
}

fn replace_command(program: &str, pairs: &[(String, String)], smudge: bool) -> String {
    let mut command = program.to_string();
    for (secret, placeholder) in pairs {
        let (from, to) = if smudge {
            (placeholder, secret)
        } else {
            (secret, placeholder)
        };
        let _ = write!(command, " {} {}", encode_arg(from), encode_arg(to));
    }
    command
}

fn sed_command(pairs: &[(String, String)], smudge: bool) -> String {
    let mut command = String::from("sed");
    for (secret, placeholder) in pairs {
        let (from, to) = if smudge {
            (placeholder, secret)
        } else {
            (secret, placeholder)
        };
        let _ = write!(
            command,
            " -e 's/{}/{}/g'",
            sed_pattern(from),
            sed_replacement(to)
        );
    }
    command
}

fn sed_pattern(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '/' | '.' | '*' | '[' | ']' | '^' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn sed_replacement(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '/' | '&') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn write_attributes(root: &Path, rules: &[FilterRule]) -> Result<()> {
    let path = root.join(".gitattributes");
    if path.exists() {
        fs::remove_file(&path).map_err(|e| Error::path_io(&path, e))?;
    }
    if rules.is_empty() {
        return Ok(());
    }

    let mut content = String::new();
    for rule in rules {
        content.push_str(&rule.attribute_line());
        content.push('\n');
    }
    fs::write(&path, content).map_err(|e| Error::path_io(&path, e))
}

fn write_repo_config(root: &Path, rules: &[FilterRule]) -> Result<()> {
    let repo = git2::Repository::open(root).map_err(|e| Error::transient("open repository", e))?;
    let mut config = repo
        .config()
        .and_then(|c| c.open_level(git2::ConfigLevel::Local))
        .map_err(|e| Error::transient("open repository config", e))?;

    let mut stale = Vec::new();
    {
        let mut entries = config
            .entries(Some(r"^filter\..*"))
            .map_err(|e| Error::transient("read filter config", e))?;
        while let Some(entry) = entries.next() {
            let entry = entry.map_err(|e| Error::transient("read filter config", e))?;
            if let Some(name) = entry.name()
                && !stale.iter().any(|n: &String| n == name)
            {
                stale.push(name.to_string());
            }
        }
    }
    for name in &stale {
        config
            .remove_multivar(name, ".*")
            .map_err(|e| Error::transient("remove filter config", e))?;
    }

    for rule in rules {
        config
            .set_str(&format!("filter.{}.clean", rule.path), &rule.clean_command)
            .and_then(|()| {
                config.set_str(&format!("filter.{}.smudge", rule.path), &rule.smudge_command)
            })
            .map_err(|e| Error::transient("write filter config", e))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct CountingDetector {
        available: bool,
        probes: Arc<AtomicUsize>,
    }

    impl CapabilityDetector for CountingDetector {
        fn stream_editor_available(&self) -> bool {
            self.probes.fetch_add(1, Ordering::Relaxed);
            self.available
        }
    }

    fn manager(available: bool, tools_dir: &Path) -> (SecretFilterManager, Arc<AtomicUsize>) {
        let probes = Arc::new(AtomicUsize::new(0));
        let mut manager = SecretFilterManager::new(tools_dir, None).with_detector(Box::new(
            CountingDetector {
                available,
                probes: Arc::clone(&probes),
            },
        ));
        manager.probe_platform = true;
        (manager, probes)
    }

    fn store() -> SecretStore {
        SecretStore::parse(
            "1:\n  file: plugins/app/config.yml\n  db_pass: hunter2\n  db_user: admin\n",
        )
        .unwrap()
    }

    #[test]
    fn test_probe_is_cached_within_ttl() {
        let temp = TempDir::new().unwrap();
        let (manager, probes) = manager(true, temp.path());
        assert!(manager.stream_editor_available());
        assert!(manager.stream_editor_available());
        assert_eq!(probes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_probe_expires() {
        let temp = TempDir::new().unwrap();
        let (manager, probes) = manager(true, temp.path());
        let manager = manager.with_ttl(Duration::ZERO);
        manager.stream_editor_available();
        manager.stream_editor_available();
        assert_eq!(probes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_platform_without_stream_editor_skips_probe() {
        let temp = TempDir::new().unwrap();
        let (mut manager, probes) = manager(true, temp.path());
        manager.probe_platform = false;
        assert!(!manager.stream_editor_available());
        assert_eq!(probes.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_sed_commands() {
        let temp = TempDir::new().unwrap();
        let (manager, _) = manager(true, temp.path());
        let report = manager.rules(temp.path(), &store()).unwrap();

        assert_eq!(report.mode, FilterMode::StreamEditor);
        let rule = &report.rules[0];
        assert_eq!(rule.path, "plugins/app/config.yml");
        assert_eq!(
            rule.clean_command,
            "sed -e 's/hunter2/{{db_pass}}/g' -e 's/admin/{{db_user}}/g'"
        );
        assert_eq!(
            rule.smudge_command,
            "sed -e 's/{{db_pass}}/hunter2/g' -e 's/{{db_user}}/admin/g'"
        );
        assert_eq!(
            rule.attribute_line(),
            "plugins/app/config.yml filter=plugins/app/config.yml"
        );
    }

    #[test]
    fn test_sed_escapes_special_characters() {
        assert_eq!(sed_pattern("a/b.c*"), "a\\/b\\.c\\*");
        assert_eq!(sed_replacement("x&y/z"), "x\\&y\\/z");
    }

    #[test]
    fn test_replace_tool_commands() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("bundled-tool");
        fs::write(&source, b"#!/bin/sh\n").unwrap();
        let tools = temp.path().join("plugins/Tether/tools");

        let (mut manager, _) = manager(false, &tools);
        manager.tool_source = Some(source);
        let report = manager.rules(temp.path(), &store()).unwrap();

        assert!(matches!(report.mode, FilterMode::ReplaceTool(_)));
        assert!(manager.tool_path().is_file());

        let rule = &report.rules[0];
        let program = tool_invocation(temp.path(), &manager.tool_path());
        assert_eq!(
            rule.clean_command,
            format!(
                "{program} {} {} {} {}",
                encode_arg("hunter2"),
                encode_arg("{{db_pass}}"),
                encode_arg("admin"),
                encode_arg("{{db_user}}")
            )
        );
        assert_eq!(
            rule.smudge_command,
            format!(
                "{program} {} {} {} {}",
                encode_arg("{{db_pass}}"),
                encode_arg("hunter2"),
                encode_arg("{{db_user}}"),
                encode_arg("admin")
            )
        );
    }

    #[test]
    fn test_missing_tool_is_io_error() {
        let temp = TempDir::new().unwrap();
        let (mut manager, _) = manager(false, &temp.path().join("tools"));
        manager.tool_source = Some(temp.path().join("does-not-exist"));
        let err = manager.rules(temp.path(), &store()).unwrap_err();
        assert_eq!(err.kind(), tether_core::ErrorKind::Io);
    }

    #[test]
    fn test_clean_then_smudge_is_identity() {
        let temp = TempDir::new().unwrap();
        let (manager, _) = manager(true, temp.path());
        let report = manager.rules(temp.path(), &store()).unwrap();
        let rule = &report.rules[0];

        let plaintext = "user: admin\npass: hunter2\nhost: localhost\n";
        let cleaned = rule.clean(plaintext);
        assert_eq!(cleaned, "user: {{db_user}}\npass: {{db_pass}}\nhost: localhost\n");
        assert_eq!(rule.smudge(&cleaned), plaintext);
    }

    #[test]
    fn test_no_rule_for_empty_values() {
        let temp = TempDir::new().unwrap();
        let (manager, _) = manager(true, temp.path());
        let store = SecretStore::parse("1:\n  file: a.yml\n  k: \"\"\n").unwrap();
        assert!(manager.rules(temp.path(), &store).unwrap().rules.is_empty());
    }

    #[test]
    fn test_configure_without_repository_is_noop() {
        let temp = TempDir::new().unwrap();
        let (manager, _) = manager(true, temp.path());
        assert!(manager.configure(temp.path(), &store()).unwrap().is_none());
        assert!(!temp.path().join(".gitattributes").exists());
    }

    #[test]
    fn test_configure_rewrites_wiring() {
        let temp = TempDir::new().unwrap();
        let repo = git2::Repository::init(temp.path()).unwrap();
        {
            let mut cfg = repo.config().unwrap();
            cfg.set_str("filter.stale/file.yml.clean", "cat").unwrap();
            cfg.set_str("filter.stale/file.yml.smudge", "cat").unwrap();
        }
        fs::write(temp.path().join(".gitattributes"), "stale/file.yml filter=stale/file.yml\n")
            .unwrap();

        let (manager, _) = manager(true, temp.path());
        manager.configure(temp.path(), &store()).unwrap().unwrap();

        assert_eq!(
            fs::read_to_string(temp.path().join(".gitattributes")).unwrap(),
            "plugins/app/config.yml filter=plugins/app/config.yml\n"
        );

        let cfg = git2::Repository::open(temp.path()).unwrap().config().unwrap();
        assert!(cfg.get_string("filter.stale/file.yml.clean").is_err());
        assert_eq!(
            cfg.get_string("filter.plugins/app/config.yml.smudge").unwrap(),
            "sed -e 's/{{db_pass}}/hunter2/g' -e 's/{{db_user}}/admin/g'"
        );
    }

    #[test]
    fn test_configure_empty_store_removes_attributes() {
        let temp = TempDir::new().unwrap();
        git2::Repository::init(temp.path()).unwrap();
        fs::write(temp.path().join(".gitattributes"), "old filter=old\n").unwrap();

        let (manager, _) = manager(true, temp.path());
        let report = manager
            .configure(temp.path(), &SecretStore::default())
            .unwrap()
            .unwrap();
        assert!(report.rules.is_empty());
        assert!(!temp.path().join(".gitattributes").exists());
    }
}
