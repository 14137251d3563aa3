//! Plugin jar unload/reload around a pull
//!
//! A pull that adds, changes or removes `plugins/*.jar` must unload the old
//! plugin before the files move and load the new one afterwards. With staging
//! enabled both steps are queued until [`JarReloadCoordinator::apply`]; the
//! queue is kept in a state file so a later process can apply it.

use crate::change::ChangeEntry;
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tether_config::JarsConfig;
use tether_core::{Error, PluginHost, Result};
use tracing::{debug, info, warn};

const PLUGINS_DIR: &str = "plugins/";
const MANIFESTS: [&str; 2] = ["plugin.yml", "paper-plugin.yml"];

/// Queued plugin operations, in insertion order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedJarOps {
    pub unload: IndexSet<String>,
    pub load: IndexSet<String>,
}

impl StagedJarOps {
    pub fn is_empty(&self) -> bool {
        self.unload.is_empty() && self.load.is_empty()
    }
}

/// Jars touched by an incoming diff
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JarPlan {
    /// Plugin names, resolved from the jars as they are before the pull
    pub unload: Vec<String>,
    /// Jar paths to resolve once the pull has landed
    pub load: Vec<String>,
}

impl JarPlan {
    pub fn is_empty(&self) -> bool {
        self.unload.is_empty() && self.load.is_empty()
    }
}

/// Result of executing queued operations
#[derive(Debug, Clone, Default, Serialize)]
pub struct JarApplyReport {
    pub unloaded: Vec<String>,
    pub loaded: Vec<String>,
    pub failed: Vec<String>,
}

impl fmt::Display for JarApplyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Unloaded {}, loaded {} plugins",
            self.unloaded.len(),
            self.loaded.len()
        )?;
        if !self.failed.is_empty() {
            write!(f, "; {} failed", self.failed.len())?;
        }
        Ok(())
    }
}

/// Queued operations dropped without running
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct JarClearReport {
    pub dropped: usize,
}

impl fmt::Display for JarClearReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dropped {} staged jar operations", self.dropped)
    }
}

pub struct JarReloadCoordinator {
    staging: bool,
    skip: Vec<String>,
    staged: Mutex<StagedJarOps>,
    state_file: Option<PathBuf>,
}

impl JarReloadCoordinator {
    #[must_use]
    pub fn new(config: &JarsConfig) -> Self {
        Self {
            staging: config.staging,
            skip: config.skip.clone(),
            staged: Mutex::new(StagedJarOps::default()),
            state_file: None,
        }
    }

    /// Persist the queue in `path`, picking up whatever is already queued there
    #[must_use]
    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(staged) = read_queue(&path) {
            self.staged = Mutex::new(staged);
        }
        self.state_file = Some(path);
        self
    }

    pub fn is_staging(&self) -> bool {
        self.staging
    }

    /// Split `changes` into unload names and load paths
    ///
    /// Must run before the pull so the outgoing jars can still be read.
    pub fn plan(&self, root: &Path, changes: &[ChangeEntry]) -> JarPlan {
        let mut plan = JarPlan::default();
        for change in changes {
            if change.kind.unloads()
                && let Some(old) = change.old_path.as_deref()
                && is_plugin_jar(old)
                && let Some(name) = self.resolve(root, old)
                && !plan.unload.contains(&name)
            {
                plan.unload.push(name);
            }
            if change.kind.loads()
                && let Some(new) = change.new_path.as_deref()
                && is_plugin_jar(new)
            {
                plan.load.push(new.to_string());
            }
        }
        debug!(unload = plan.unload.len(), load = plan.load.len(), "Planned jar reloads");
        plan
    }

    /// Unload `names` now, or queue them when staging
    pub fn unload(&self, host: &dyn PluginHost, names: &[String]) {
        if self.staging {
            self.update(|staged| staged.unload.extend(names.iter().cloned()));
            return;
        }
        for name in names {
            run_step(host, name, false);
        }
    }

    /// Resolve the freshly pulled `paths` and load them, or queue them when staging
    pub fn load(&self, host: &dyn PluginHost, root: &Path, paths: &[String]) {
        let names: Vec<String> = paths
            .iter()
            .filter_map(|path| self.resolve(root, path))
            .collect();
        if self.staging {
            self.update(|staged| staged.load.extend(names));
            return;
        }
        for name in &names {
            run_step(host, name, true);
        }
    }

    /// Run every queued unload, then every queued load, and clear the queue
    ///
    /// Individual failures are logged and reported, never propagated.
    pub fn apply(&self, host: &dyn PluginHost) -> JarApplyReport {
        let staged = self.update(std::mem::take);
        let mut report = JarApplyReport::default();

        for name in staged.unload {
            if run_step(host, &name, false) {
                report.unloaded.push(name);
            } else {
                report.failed.push(name);
            }
        }
        for name in staged.load {
            if run_step(host, &name, true) {
                report.loaded.push(name);
            } else {
                report.failed.push(name);
            }
        }

        info!(
            unloaded = report.unloaded.len(),
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Applied staged jar operations"
        );
        report
    }

    pub fn staged(&self) -> StagedJarOps {
        let mut staged = self.lock();
        self.reload(&mut staged);
        staged.clone()
    }

    pub fn clear(&self) -> JarClearReport {
        self.update(|staged| {
            let dropped = staged.unload.len() + staged.load.len();
            *staged = StagedJarOps::default();
            JarClearReport { dropped }
        })
    }

    fn resolve(&self, root: &Path, path: &str) -> Option<String> {
        let name = plugin_name(&root.join(path));
        if self.skip.iter().any(|skip| name.contains(skip.as_str())) {
            debug!(%name, "Skipping protected plugin");
            return None;
        }
        Some(name)
    }

    /// Mutate the queue under its lock and write it back to the state file
    ///
    /// The file is re-read first: another process may have applied or
    /// extended the queue since this one last looked.
    fn update<T>(&self, edit: impl FnOnce(&mut StagedJarOps) -> T) -> T {
        let mut staged = self.lock();
        self.reload(&mut staged);
        let result = edit(&mut staged);
        if let Some(path) = &self.state_file
            && let Err(e) = save_queue(path, &staged)
        {
            warn!(path = %path.display(), error = %e, "Failed to save jar queue");
        }
        result
    }

    fn reload(&self, staged: &mut StagedJarOps) {
        if let Some(path) = &self.state_file
            && let Some(on_disk) = read_queue(path)
        {
            *staged = on_disk;
        }
    }

    fn lock(&self) -> MutexGuard<'_, StagedJarOps> {
        match self.staged.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Queue stored in `path`; a missing file is an empty queue, an unreadable one
/// is ignored
fn read_queue(path: &Path) -> Option<StagedJarOps> {
    match fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(staged) => Some(staged),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable jar queue");
                None
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Some(StagedJarOps::default()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read jar queue");
            None
        }
    }
}

fn save_queue(path: &Path, staged: &StagedJarOps) -> Result<()> {
    if staged.is_empty() {
        if path.exists() {
            fs::remove_file(path).map_err(|e| Error::path_io(path, e))?;
        }
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::path_io(parent, e))?;
    }
    let content = serde_json::to_string_pretty(staged)
        .map_err(|e| Error::Config(format!("Failed to encode jar queue: {e}")))?;
    fs::write(path, content).map_err(|e| Error::path_io(path, e))
}

fn run_step(host: &dyn PluginHost, name: &str, load: bool) -> bool {
    let result = if load { host.load(name) } else { host.unload(name) };
    match result {
        Ok(()) => {
            info!(name, load, "Plugin reloaded");
            true
        }
        Err(e) => {
            warn!(name, load, error = %e, "Plugin operation failed");
            false
        }
    }
}

/// Whether `path` is a jar under the plugins directory
pub fn is_plugin_jar(path: &str) -> bool {
    path.starts_with(PLUGINS_DIR)
        && Path::new(path)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jar"))
}

/// Logical plugin name of the jar at `path`
///
/// Tries the manifest inside the archive, then a manifest in the plugin's data
/// folder, then the file name up to its first separator.
pub fn plugin_name(path: &Path) -> String {
    if let Some(name) = archive_manifest_name(path) {
        return name;
    }
    if let Some(name) = sibling_manifest_name(path) {
        return name;
    }
    file_name_stem(path)
}

fn archive_manifest_name(path: &Path) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut archive = zip::ZipArchive::new(file).ok()?;
    for manifest in MANIFESTS {
        let Ok(mut entry) = archive.by_name(manifest) else {
            continue;
        };
        let mut content = String::new();
        if entry.read_to_string(&mut content).is_ok()
            && let Some(name) = manifest_name(&content)
        {
            return Some(name);
        }
    }
    None
}

fn sibling_manifest_name(path: &Path) -> Option<String> {
    let candidates: Vec<PathBuf> = if path
        .file_name()
        .is_some_and(|name| MANIFESTS.iter().any(|m| name == *m))
    {
        vec![path.to_path_buf()]
    } else {
        let stem = path.file_stem()?;
        let dir = path.parent()?.join(stem);
        MANIFESTS.iter().map(|m| dir.join(m)).collect()
    };

    candidates
        .iter()
        .filter_map(|candidate| fs::read_to_string(candidate).ok())
        .find_map(|content| manifest_name(&content))
}

fn manifest_name(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let value = line.strip_prefix("name:")?.trim();
        let value = value.trim_matches(|c| c == '"' || c == '\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn file_name_stem(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cut = file_name
        .find(['-', ' ', '_', '.'])
        .unwrap_or(file_name.len());
    match &file_name[..cut] {
        "" => file_name,
        name => name.to_string(),
    }
}

/// Plugin host driving the server through configured shell commands
///
/// `{name}` in a command is replaced with the plugin name.
#[derive(Debug, Clone)]
pub struct CommandPluginHost {
    root: PathBuf,
    unload_command: String,
    load_command: String,
    restart_command: String,
}

impl CommandPluginHost {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, config: &tether_config::Config) -> Self {
        Self {
            root: root.into(),
            unload_command: config.jars.unload_command.clone(),
            load_command: config.jars.load_command.clone(),
            restart_command: config.restart.command.clone(),
        }
    }

    fn run(&self, template: &str, name: Option<&str>) -> Result<()> {
        let words = shell_words::split(template)
            .map_err(|e| Error::Config(format!("Invalid command '{template}': {e}")))?;
        let mut words = words
            .into_iter()
            .map(|word| match name {
                Some(name) => word.replace("{name}", name),
                None => word,
            });
        let Some(program) = words.next() else {
            return Err(Error::Config("Command is empty".to_string()));
        };
        let args: Vec<String> = words.collect();

        debug!(%program, ?args, "Running host command");
        duct::cmd(&program, &args)
            .dir(&self.root)
            .stdout_null()
            .run()
            .map_err(|e| Error::transient(format!("run {program}"), e))?;
        Ok(())
    }
}

impl PluginHost for CommandPluginHost {
    fn unload(&self, name: &str) -> Result<()> {
        self.run(&self.unload_command, Some(name))
    }

    fn load(&self, name: &str) -> Result<()> {
        self.run(&self.load_command, Some(name))
    }

    fn restart(&self) -> Result<()> {
        if self.restart_command.trim().is_empty() {
            return Err(Error::Config("restart.command is not set".to_string()));
        }
        self.run(&self.restart_command, None)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;
    use crate::change::ChangeKind;
    use std::io::Write;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    impl RecordingHost {
        fn record(&self, call: String, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(call);
            if self.fail_on.as_deref() == Some(name) {
                return Err(Error::transient("host", "refused"));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PluginHost for RecordingHost {
        fn unload(&self, name: &str) -> Result<()> {
            self.record(format!("unload {name}"), name)
        }

        fn load(&self, name: &str) -> Result<()> {
            self.record(format!("load {name}"), name)
        }

        fn restart(&self) -> Result<()> {
            self.record("restart".to_string(), "")
        }
    }

    fn write_jar(path: &Path, manifest: Option<&str>) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        if let Some(manifest) = manifest {
            writer.start_file("plugin.yml", options).unwrap();
            writer.write_all(manifest.as_bytes()).unwrap();
        }
        writer.start_file("Main.class", options).unwrap();
        writer.write_all(b"\xca\xfe\xba\xbe").unwrap();
        writer.finish().unwrap();
    }

    fn coordinator(staging: bool) -> JarReloadCoordinator {
        JarReloadCoordinator::new(&JarsConfig {
            enabled: true,
            staging,
            skip: vec!["Tether".to_string()],
            ..JarsConfig::default()
        })
    }

    fn change(kind: ChangeKind, old: Option<&str>, new: Option<&str>) -> ChangeEntry {
        ChangeEntry {
            kind,
            old_path: old.map(str::to_string),
            new_path: new.map(str::to_string),
        }
    }

    #[test]
    fn test_name_from_archive_manifest() {
        let temp = TempDir::new().unwrap();
        let jar = temp.path().join("plugins/essentials-2.20.jar");
        write_jar(&jar, Some("name: 'EssentialsX'\nversion: 2.20\n"));
        assert_eq!(plugin_name(&jar), "EssentialsX");
    }

    #[test]
    fn test_name_from_sibling_manifest() {
        let temp = TempDir::new().unwrap();
        let jar = temp.path().join("plugins/worldedit-7.jar");
        write_jar(&jar, None);
        let folder = temp.path().join("plugins/worldedit-7");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("plugin.yml"), "name: WorldEdit\n").unwrap();
        assert_eq!(plugin_name(&jar), "WorldEdit");
    }

    #[test]
    fn test_name_from_file_name() {
        assert_eq!(plugin_name(Path::new("/nope/LuckPerms-Bukkit-5.4.jar")), "LuckPerms");
        assert_eq!(plugin_name(Path::new("/nope/Vault.jar")), "Vault");
        assert_eq!(plugin_name(Path::new("/nope/My Plugin.jar")), "My");
        assert_eq!(plugin_name(Path::new("/nope/core_utils.jar")), "core");
    }

    #[test]
    fn test_is_plugin_jar() {
        assert!(is_plugin_jar("plugins/Vault.jar"));
        assert!(is_plugin_jar("plugins/Vault.JAR"));
        assert!(!is_plugin_jar("libs/Vault.jar"));
        assert!(!is_plugin_jar("plugins/Vault/config.yml"));
    }

    #[test]
    fn test_plan_classifies_changes() {
        let temp = TempDir::new().unwrap();
        let coordinator = coordinator(false);
        let changes = vec![
            change(ChangeKind::Added, None, Some("plugins/New.jar")),
            change(ChangeKind::Deleted, Some("plugins/Old.jar"), None),
            change(ChangeKind::Modified, Some("plugins/Both.jar"), Some("plugins/Both.jar")),
            change(ChangeKind::Modified, Some("server.properties"), Some("server.properties")),
            change(ChangeKind::Added, None, Some("plugins/Tether.jar")),
        ];

        let plan = coordinator.plan(temp.path(), &changes);
        assert_eq!(plan.unload, vec!["Old", "Both"]);
        assert_eq!(plan.load, vec!["plugins/New.jar", "plugins/Both.jar", "plugins/Tether.jar"]);

        let host = RecordingHost::default();
        coordinator.load(&host, temp.path(), &plan.load);
        assert_eq!(host.calls(), vec!["load New", "load Both"]);
    }

    #[test]
    fn test_immediate_mode_runs_at_once() {
        let temp = TempDir::new().unwrap();
        let coordinator = coordinator(false);
        let host = RecordingHost::default();

        coordinator.unload(&host, &["Old".to_string()]);
        coordinator.load(&host, temp.path(), &["plugins/New.jar".to_string()]);

        assert_eq!(host.calls(), vec!["unload Old", "load New"]);
        assert!(coordinator.staged().is_empty());
    }

    #[test]
    fn test_staging_defers_until_apply() {
        let temp = TempDir::new().unwrap();
        let coordinator = coordinator(true);
        let host = RecordingHost::default();

        coordinator.load(&host, temp.path(), &["plugins/A.jar".to_string()]);
        coordinator.unload(&host, &["B".to_string(), "C".to_string()]);
        coordinator.unload(&host, &["B".to_string()]);
        assert!(host.calls().is_empty());

        let staged = coordinator.staged();
        assert_eq!(staged.unload.iter().collect::<Vec<_>>(), vec!["B", "C"]);
        assert_eq!(staged.load.iter().collect::<Vec<_>>(), vec!["A"]);

        let report = coordinator.apply(&host);
        assert_eq!(host.calls(), vec!["unload B", "unload C", "load A"]);
        assert_eq!(report.unloaded, vec!["B", "C"]);
        assert_eq!(report.loaded, vec!["A"]);
        assert!(coordinator.staged().is_empty());
    }

    #[test]
    fn test_apply_clears_despite_failures() {
        let temp = TempDir::new().unwrap();
        let coordinator = coordinator(true);
        let host = RecordingHost {
            fail_on: Some("B".to_string()),
            ..RecordingHost::default()
        };

        coordinator.unload(&host, &["B".to_string()]);
        coordinator.load(&host, temp.path(), &["plugins/A.jar".to_string()]);
        let report = coordinator.apply(&host);

        assert_eq!(report.failed, vec!["B"]);
        assert_eq!(report.loaded, vec!["A"]);
        assert!(coordinator.staged().is_empty());
    }

    #[test]
    fn test_queue_survives_restart() {
        let temp = TempDir::new().unwrap();
        let state = temp.path().join("data/staged-jars.json");
        let host = RecordingHost::default();

        let first = coordinator(true).with_state_file(&state);
        first.unload(&host, &["Old".to_string()]);
        assert!(state.exists());

        let second = coordinator(true).with_state_file(&state);
        assert_eq!(second.staged().unload.iter().collect::<Vec<_>>(), vec!["Old"]);
        second.apply(&host);
        assert_eq!(host.calls(), vec!["unload Old"]);
        assert!(!state.exists());

        fs::write(&state, "not json").unwrap();
        assert!(coordinator(true).with_state_file(&state).staged().is_empty());
    }

    #[test]
    fn test_queue_follows_other_process() {
        let temp = TempDir::new().unwrap();
        let state = temp.path().join("staged-jars.json");
        let host = RecordingHost::default();
        let daemon = coordinator(true).with_state_file(&state);
        let cli = coordinator(true).with_state_file(&state);

        daemon.unload(&host, &["Old".to_string()]);
        let report = cli.apply(&host);
        assert_eq!(report.unloaded, vec!["Old"]);
        assert!(daemon.staged().is_empty());

        daemon.unload(&host, &["Next".to_string()]);
        assert_eq!(cli.clear().dropped, 1);
        daemon.unload(&host, &["Last".to_string()]);
        assert_eq!(daemon.staged().unload.iter().collect::<Vec<_>>(), vec!["Last"]);
        assert_eq!(host.calls(), vec!["unload Old"]);
    }

    #[test]
    fn test_command_host_requires_restart_command() {
        let host = CommandPluginHost::new("/", &tether_config::Config::default());
        let err = host.restart().unwrap_err();
        assert_eq!(err.kind(), tether_core::ErrorKind::Config);
    }
}
