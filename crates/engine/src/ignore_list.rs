//! Managed whitelist section of the ignore file
//!
//! The ignore file defaults everything to ignored. Between two marker lines
//! tether keeps one rule per tracked path:
//!
//! - allow: `!/path*` (directories: `!/dir/**`)
//! - deny: `/path` (directories: `!/dir/*/` and `/dir/*`)
//!
//! Allowing a nested path also re-includes each ancestor directory
//! (`!/a/` + `/a/*`), otherwise git would never descend into it. Denying a
//! path drops the ancestor pairs no remaining allow rule lives under.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tether_core::{Error, Result};
use tether_secrets::normalize_path;
use tracing::{debug, info};

pub const BEGIN_MARKER: &str = "# Tether IGNORE SECTION BEGIN";
pub const END_MARKER: &str = "# Tether IGNORE SECTION END";

/// Ignore file written when a repository is first initialized
pub const DEFAULT_IGNORE: &str = include_str!("../resources/default.gitignore");

/// Reads and rewrites the managed section of one ignore file
#[derive(Debug, Clone)]
pub struct IgnoreListManager {
    path: PathBuf,
}

impl IgnoreListManager {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write [`DEFAULT_IGNORE`] if the file is missing; returns whether it wrote
    pub fn ensure_exists(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        fs::write(&self.path, DEFAULT_IGNORE).map_err(|e| Error::path_io(&self.path, e))?;
        info!(path = %self.path.display(), "Wrote default ignore file");
        Ok(true)
    }

    /// Whitelist `target` for tracking
    pub fn allow(&self, target: &str, is_dir: bool) -> Result<()> {
        self.edit(|lines| allow(lines, target, is_dir))
    }

    /// Stop tracking `target`
    pub fn deny(&self, target: &str, is_dir: bool) -> Result<()> {
        self.edit(|lines| deny(lines, target, is_dir))
    }

    /// Lines currently between the markers
    pub fn managed_entries(&self) -> Result<Vec<String>> {
        let lines = self.read()?;
        let (begin, end) = self.bounds(&lines)?;
        Ok(lines[begin + 1..end].to_vec())
    }

    fn edit(&self, change: impl FnOnce(&mut Vec<String>) -> Option<()>) -> Result<()> {
        let mut lines = self.read()?;
        if change(&mut lines).is_none() {
            return Err(Error::MissingMarkers {
                path: self.path.clone(),
            });
        }
        let lines = normalize(lines).ok_or_else(|| Error::MissingMarkers {
            path: self.path.clone(),
        })?;

        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(&self.path, content).map_err(|e| Error::path_io(&self.path, e))?;
        debug!(path = %self.path.display(), "Updated ignore list");
        Ok(())
    }

    fn read(&self) -> Result<Vec<String>> {
        let content =
            fs::read_to_string(&self.path).map_err(|e| Error::path_io(&self.path, e))?;
        Ok(content.lines().map(str::to_string).collect())
    }

    fn bounds(&self, lines: &[String]) -> Result<(usize, usize)> {
        section_bounds(lines).ok_or_else(|| Error::MissingMarkers {
            path: self.path.clone(),
        })
    }
}

fn section_bounds(lines: &[String]) -> Option<(usize, usize)> {
    let begin = lines.iter().position(|l| l.trim() == BEGIN_MARKER)?;
    let end = lines.iter().position(|l| l.trim() == END_MARKER)?;
    (begin < end).then_some((begin, end))
}

/// Target path in rule form: no leading slash, directories end in `/*`
fn git_path(target: &str, is_dir: bool) -> String {
    let mut path = normalize_path(target);
    while let Some(stripped) = path.strip_suffix("/*").or_else(|| path.strip_suffix('/')) {
        path = stripped.to_string();
    }
    if is_dir { format!("{path}/*") } else { path }
}

/// Path a rule line refers to, without negation, anchoring or wildcards
fn rule_path(line: &str) -> &str {
    let line = line.trim();
    let line = line.strip_prefix('!').unwrap_or(line);
    let line = line.strip_prefix('/').unwrap_or(line);
    line.trim_end_matches(['*', '/'])
}

fn covers(target: &str, line: &str) -> bool {
    let path = rule_path(line);
    !path.is_empty()
        && (path == target
            || path
                .strip_prefix(target)
                .is_some_and(|rest| rest.starts_with('/')))
}

/// Drop every rule for `target` or anything below it
fn remove_rules(lines: &mut Vec<String>, target: &str) -> Option<()> {
    let (begin, end) = section_bounds(lines)?;
    let mut index = end;
    while index > begin + 1 {
        index -= 1;
        if covers(target, &lines[index]) {
            lines.remove(index);
        }
    }
    Some(())
}

fn insert_after_begin(lines: &mut Vec<String>, line: String) -> Option<()> {
    let (begin, _) = section_bounds(lines)?;
    lines.insert(begin + 1, line);
    Some(())
}

fn insert_before_end(lines: &mut Vec<String>, line: String) -> Option<()> {
    let (_, end) = section_bounds(lines)?;
    lines.insert(end, line);
    Some(())
}

fn allow(lines: &mut Vec<String>, target: &str, is_dir: bool) -> Option<()> {
    let git = git_path(target, is_dir);
    let bare = rule_path(&git).to_string();
    remove_rules(lines, &bare)?;

    // re-include every ancestor directory so git descends into it
    let mut ancestor = String::new();
    let components: Vec<&str> = bare.split('/').collect();
    let depth = if is_dir {
        components.len()
    } else {
        components.len().saturating_sub(1)
    };
    for component in &components[..depth] {
        if !ancestor.is_empty() {
            ancestor.push('/');
        }
        ancestor.push_str(component);
        for line in [format!("!/{ancestor}/"), format!("/{ancestor}/*")] {
            if !lines.iter().any(|l| l.trim() == line) {
                insert_before_end(lines, line)?;
            }
        }
    }

    insert_after_begin(lines, format!("!/{git}*"))
}

fn deny(lines: &mut Vec<String>, target: &str, is_dir: bool) -> Option<()> {
    let git = git_path(target, is_dir);
    let bare = rule_path(&git).to_string();
    remove_rules(lines, &bare)?;
    prune_ancestors(lines, &bare)?;
    if is_dir {
        insert_before_end(lines, format!("!/{git}/"))?;
    }
    insert_before_end(lines, format!("/{git}"))
}

/// Remove the re-include pairs of `target`'s ancestors, deepest first, until
/// one still has an allow rule below it
fn prune_ancestors(lines: &mut Vec<String>, target: &str) -> Option<()> {
    let components: Vec<&str> = target.split('/').collect();
    for depth in (1..components.len()).rev() {
        let ancestor = components[..depth].join("/");
        let (begin, end) = section_bounds(lines)?;
        let needed = lines[begin + 1..end].iter().any(|line| {
            let line = line.trim();
            line.starts_with('!')
                && line.ends_with('*')
                && rule_path(line)
                    .strip_prefix(ancestor.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        });
        if needed {
            break;
        }

        let pair = [format!("!/{ancestor}/"), format!("/{ancestor}/*")];
        let mut index = end;
        while index > begin + 1 {
            index -= 1;
            if pair.iter().any(|p| lines[index].trim() == p) {
                lines.remove(index);
            }
        }
        debug!(%ancestor, "Dropped unused ancestor re-include");
    }
    Some(())
}

/// Drop duplicate lines (blank lines excepted) and sort the managed section
///
/// Returns `None` if the markers are missing.
pub fn normalize(lines: Vec<String>) -> Option<Vec<String>> {
    let mut seen = HashSet::new();
    let mut lines: Vec<String> = lines
        .into_iter()
        .filter(|line| line.trim().is_empty() || seen.insert(line.clone()))
        .collect();

    let (begin, end) = section_bounds(&lines)?;
    lines[begin + 1..end].sort_by(|a, b| compare_rules(a, b));
    Some(lines)
}

/// Order by path text; equal paths put the allow rule first
pub fn compare_rules(a: &str, b: &str) -> Ordering {
    fn key(line: &str) -> (&str, bool) {
        let line = line.trim();
        let (line, allow) = match line.strip_prefix('!') {
            Some(rest) => (rest, true),
            None => (line, false),
        };
        (line.strip_suffix('*').unwrap_or(line), allow)
    }

    let (path_a, allow_a) = key(a);
    let (path_b, allow_b) = key(b);
    path_a.cmp(path_b).then_with(|| allow_b.cmp(&allow_a))
}
