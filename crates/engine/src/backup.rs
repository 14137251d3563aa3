//! Zip export of the tracked tree

use crate::repo;
use crate::sync::RepositorySync;
use chrono::Local;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tether_core::{Error, Result};
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

static UNSAFE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("valid backup name pattern"));

/// A finished backup archive
#[derive(Debug, Clone, Serialize)]
pub struct BackupReport {
    pub path: PathBuf,
    pub files: usize,
}

impl fmt::Display for BackupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Backup written to {} ({} files)",
            self.path.display(),
            self.files
        )
    }
}

/// Replace everything outside `[A-Za-z0-9._-]` with `_`
#[must_use]
pub fn sanitize_name(name: &str) -> String {
    let cleaned = UNSAFE_NAME.replace_all(name.trim(), "_");
    if cleaned.is_empty() {
        "backup".to_string()
    } else {
        cleaned.into_owned()
    }
}

impl RepositorySync {
    /// Archive every tracked file plus `extra` paths into the backups directory
    ///
    /// Extra directories are walked recursively. `.git`, the backups
    /// directory and symbolic links are never included, so nothing outside
    /// the server root ends up in the archive.
    pub fn backup(&self, name: &str, extra: &[String]) -> Result<BackupReport> {
        let root = self.layout.root();
        let backups = self.layout.backups_dir();
        let excluded_backups = backups
            .strip_prefix(root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"));

        let mut files = BTreeSet::new();
        if self.layout.repo_exists() {
            let repository = repo::open(root)?;
            let index = repository
                .index()
                .map_err(|e| Error::transient("read index", e.message()))?;
            for entry in index.iter() {
                files.insert(String::from_utf8_lossy(&entry.path).into_owned());
            }
        }

        for path in extra {
            let rel = self.relative(path)?;
            let absolute = root.join(&rel);
            if fs::symlink_metadata(&absolute).is_err() {
                return Err(Error::NotFound(format!("{rel} does not exist")));
            }
            if let Some(link) = first_symlink(root, &rel) {
                warn!(path = %rel, link = %link.display(), "Skipping path behind a symbolic link");
                continue;
            }
            for entry in WalkDir::new(&absolute).follow_links(false) {
                let entry = entry.map_err(|e| {
                    Error::path_io(&absolute, io::Error::other(e.to_string()))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                if let Ok(inner) = entry.path().strip_prefix(root) {
                    files.insert(inner.to_string_lossy().replace('\\', "/"));
                }
            }
        }

        let lock = self
            .layout
            .sync_lock()
            .strip_prefix(root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"));
        files.retain(|rel| {
            lock.as_deref() != Some(rel.as_str())
                && !is_under(rel, ".git")
                && excluded_backups
                    .as_deref()
                    .is_none_or(|dir| !is_under(rel, dir))
        });

        fs::create_dir_all(&backups).map_err(|e| Error::path_io(&backups, e))?;
        let archive = backups.join(format!(
            "{}-{}.zip",
            sanitize_name(name),
            Local::now().format("%Y%m%d-%H%M%S")
        ));
        let written = write_archive(root, &archive, &files)?;

        info!(path = %archive.display(), files = written, "Backup created");
        Ok(BackupReport {
            path: archive,
            files: written,
        })
    }
}

/// First component of `rel` below `root` that is a symbolic link
fn first_symlink(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut current = root.to_path_buf();
    for component in rel.split('/') {
        current.push(component);
        if fs::symlink_metadata(&current).is_ok_and(|m| m.file_type().is_symlink()) {
            return Some(current);
        }
    }
    None
}

fn is_under(rel: &str, dir: &str) -> bool {
    rel == dir
        || rel
            .strip_prefix(dir)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn write_archive(root: &Path, archive: &Path, files: &BTreeSet<String>) -> Result<usize> {
    let zip_error = |e: zip::result::ZipError| Error::path_io(archive, io::Error::other(e));

    let out = File::create(archive).map_err(|e| Error::path_io(archive, e))?;
    let mut writer = ZipWriter::new(out);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut written = 0;
    for rel in files {
        let path = root.join(rel);
        if first_symlink(root, rel).is_some() {
            debug!(path = %rel, "Skipping symbolic link");
            continue;
        }
        // Tracked files deleted from the working tree are skipped
        let mut source = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %rel, "Skipping missing file");
                continue;
            }
            Err(e) => return Err(Error::path_io(&path, e)),
        };
        writer.start_file(rel.as_str(), options).map_err(zip_error)?;
        io::copy(&mut source, &mut writer).map_err(|e| Error::path_io(&path, e))?;
        written += 1;
    }

    writer.finish().map_err(zip_error)?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use tether_config::Config;

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("before update"), "before_update");
        assert_eq!(sanitize_name("v1.2-rc_3"), "v1.2-rc_3");
        assert_eq!(sanitize_name("../x"), ".._x");
        assert_eq!(sanitize_name("  "), "backup");
    }

    #[test]
    fn test_is_under_respects_segments() {
        assert!(is_under(".git/config", ".git"));
        assert!(is_under(".git", ".git"));
        assert!(!is_under(".gitignore", ".git"));
    }

    #[test]
    fn test_backup_extra_paths_without_repository() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("world/region")).unwrap();
        fs::write(root.join("world/level.dat"), "level").unwrap();
        fs::write(root.join("world/region/r.0.0.mca"), "region").unwrap();
        fs::create_dir_all(root.join("plugins/Tether/backups")).unwrap();
        fs::write(root.join("plugins/Tether/backups/old.zip"), "old").unwrap();

        let sync = RepositorySync::new(root, Config::default());
        let report = sync
            .backup("pre update", &["world".to_string(), "plugins".to_string()])
            .unwrap();

        assert_eq!(report.files, 2);
        let name = report.path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("pre_update-"));
        assert!(name.ends_with(".zip"));

        let mut archive = zip::ZipArchive::new(File::open(&report.path).unwrap()).unwrap();
        let mut content = String::new();
        archive
            .by_name("world/region/r.0.0.mca")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "region");
        assert!(archive.by_name("plugins/Tether/backups/old.zip").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_backup_skips_symbolic_links() {
        let outside = TempDir::new().unwrap();
        fs::write(outside.path().join("id_rsa"), "private").unwrap();
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("world")).unwrap();
        fs::write(root.join("world/level.dat"), "level").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("linked")).unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("world/escape")).unwrap();

        let sync = RepositorySync::new(root, Config::default());
        let report = sync
            .backup("links", &["linked".to_string(), "world".to_string()])
            .unwrap();

        assert_eq!(report.files, 1);
        let mut archive = zip::ZipArchive::new(File::open(&report.path).unwrap()).unwrap();
        assert_eq!(archive.len(), 1);
        assert!(archive.by_name("world/level.dat").is_ok());
    }

    #[test]
    fn test_backup_rejects_escaping_paths() {
        let temp = TempDir::new().unwrap();
        let sync = RepositorySync::new(temp.path(), Config::default());
        let err = sync.backup("x", &["../etc".to_string()]).unwrap_err();
        assert_eq!(err.kind(), tether_core::ErrorKind::Precondition);
    }
}
