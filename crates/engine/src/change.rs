//! Classification of diff entries
//!
//! One mapping from git delta to change kind, shared by log rendering, pull
//! and push previews, and jar reload planning.

use serde::Serialize;
use std::fmt;

/// What happened to a path between two trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Deleted,
    Modified,
    Renamed,
    Copied,
}

impl ChangeKind {
    /// Map a libgit2 delta; unmodified, ignored and untracked entries map to `None`
    #[must_use]
    pub fn from_delta(delta: git2::Delta) -> Option<Self> {
        match delta {
            git2::Delta::Added => Some(Self::Added),
            git2::Delta::Deleted => Some(Self::Deleted),
            git2::Delta::Modified | git2::Delta::Typechange | git2::Delta::Conflicted => {
                Some(Self::Modified)
            }
            git2::Delta::Renamed => Some(Self::Renamed),
            git2::Delta::Copied => Some(Self::Copied),
            _ => None,
        }
    }

    /// Single character prefix used in listings
    #[must_use]
    pub const fn symbol(self) -> char {
        match self {
            Self::Added => '+',
            Self::Deleted => '-',
            Self::Modified => '#',
            Self::Renamed => '>',
            Self::Copied => '=',
        }
    }

    /// The previous version must be unloaded before the change lands
    #[must_use]
    pub const fn unloads(self) -> bool {
        matches!(self, Self::Deleted | Self::Modified | Self::Renamed)
    }

    /// The new version must be loaded after the change lands
    #[must_use]
    pub const fn loads(self) -> bool {
        matches!(
            self,
            Self::Added | Self::Modified | Self::Renamed | Self::Copied
        )
    }
}

/// One changed path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEntry {
    pub kind: ChangeKind,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
}

impl ChangeEntry {
    /// The path that exists after the change, or the removed path for deletions
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }
}

impl fmt::Display for ChangeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, &self.old_path, &self.new_path) {
            (ChangeKind::Renamed | ChangeKind::Copied, Some(old), Some(new)) if old != new => {
                write!(f, "{} {old} -> {new}", self.kind.symbol())
            }
            _ => write!(f, "{} {}", self.kind.symbol(), self.path()),
        }
    }
}

/// Collect classified entries from a diff
pub fn entries(diff: &git2::Diff<'_>) -> Vec<ChangeEntry> {
    diff.deltas()
        .filter_map(|delta| {
            let kind = ChangeKind::from_delta(delta.status())?;
            let path_of = |file: git2::DiffFile<'_>| {
                file.path()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            };
            let old_path = path_of(delta.old_file()).filter(|_| kind != ChangeKind::Added);
            let new_path = path_of(delta.new_file()).filter(|_| kind != ChangeKind::Deleted);
            Some(ChangeEntry {
                kind,
                old_path,
                new_path,
            })
        })
        .collect()
}
