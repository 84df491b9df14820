//! Three-way merge of stashed changes onto the working tree
//!
//! For every file in a [`StashItem`] the resolver compares three states:
//!
//! - **base**: content at the version the stash was taken from
//! - **ours**: current working-tree content
//! - **theirs**: content recorded in the stash
//!
//! A missing file is a state of its own, so deletions take part in the same
//! rules as edits. The result is a list of [`FileMerge`] values describing
//! both the outcome and the action the checkout applier should take. The
//! resolver never touches the disk.
//!
//! Files an earlier load left with conflict markers are listed in
//! [`StashItem::unresolved`]. While the markers are still in place the file
//! stays in conflict; once they are gone the user's edit is taken as the
//! resolution.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::entry::{ComponentId, FileSet, StashItem};
use crate::options::{ConflictPolicy, MergeStrategy};

const OURS_MARKER: &str = "<<<<<<< ";
const THEIRS_MARKER: &str = ">>>>>>> ";

/// Side picked when a conflict was resolved by strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolvedSide {
    Ours,
    Theirs,
}

/// Why a file was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Path is absolute or leaves the component directory
    UnsafePath,
}

/// Result of merging a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeOutcome {
    AppliedClean,
    AppliedResolved(ResolvedSide),
    /// `markers_written` is also set for a file still holding markers from
    /// an earlier load
    Conflict { markers_written: bool },
    Skipped(SkipReason),
}

impl MergeOutcome {
    /// True if the file needs manual attention
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True if the file on disk carries conflict markers
    pub fn has_markers(&self) -> bool {
        matches!(self, Self::Conflict { markers_written: true })
    }
}

/// What to do with the working file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileAction {
    /// Leave the working file untouched
    Keep,
    Write(Vec<u8>),
    Remove,
}

/// Merge decision for one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMerge {
    pub path: PathBuf,
    pub outcome: MergeOutcome,
    pub action: FileAction,
}

/// Merge decisions for one component
#[derive(Debug, Clone)]
pub struct ComponentMerge {
    pub component_id: ComponentId,
    pub files: Vec<FileMerge>,
}

impl ComponentMerge {
    pub fn conflicts(&self) -> impl Iterator<Item = &FileMerge> {
        self.files.iter().filter(|f| f.outcome.is_conflict())
    }
}

/// Labels printed after the conflict markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerLabels {
    pub ours: String,
    pub base: String,
    pub theirs: String,
}

impl Default for MarkerLabels {
    fn default() -> Self {
        Self {
            ours: "ours (working tree)".to_string(),
            base: "base".to_string(),
            theirs: "theirs (stash)".to_string(),
        }
    }
}

/// Per-file three-way merge
#[derive(Debug, Clone, Default)]
pub struct MergeResolver {
    labels: MarkerLabels,
}

impl MergeResolver {
    pub fn new(labels: MarkerLabels) -> Self {
        Self { labels }
    }

    /// Merge every file of `item` against the current working state
    ///
    /// `base` holds the files of `item.base_version`, `working` the files
    /// currently on disk.
    pub fn resolve(
        &self,
        item: &StashItem,
        base: &FileSet,
        working: &FileSet,
        policy: ConflictPolicy,
    ) -> ComponentMerge {
        let files = item
            .file_deltas
            .iter()
            .map(|(path, delta)| {
                if !is_safe_path(path) {
                    return FileMerge {
                        path: path.clone(),
                        outcome: MergeOutcome::Skipped(SkipReason::UnsafePath),
                        action: FileAction::Keep,
                    };
                }

                let base = base.get(path).map(Vec::as_slice);
                let ours = working.get(path).map(Vec::as_slice);
                let theirs = delta.content();

                if item.unresolved.contains(path) {
                    self.recheck_unresolved(path, ours, theirs, policy)
                } else {
                    self.merge_file(path, base, ours, theirs, policy)
                }
            })
            .collect();

        ComponentMerge {
            component_id: item.component_id.clone(),
            files,
        }
    }

    /// Decide a single file
    pub fn merge_file(
        &self,
        path: &Path,
        base: Option<&[u8]>,
        ours: Option<&[u8]>,
        theirs: Option<&[u8]>,
        policy: ConflictPolicy,
    ) -> FileMerge {
        let (outcome, action) = match policy {
            ConflictPolicy::ForceOurs => (MergeOutcome::AppliedClean, FileAction::Keep),
            ConflictPolicy::ForceTheirs => (MergeOutcome::AppliedClean, take(ours, theirs)),
            ConflictPolicy::Strategy(_) | ConflictPolicy::Unset => {
                if ours == base || ours == theirs {
                    (MergeOutcome::AppliedClean, take(ours, theirs))
                } else if theirs == base {
                    (MergeOutcome::AppliedClean, FileAction::Keep)
                } else {
                    self.settle_conflict(base, ours, theirs, policy)
                }
            }
        };

        debug!(path = %path.display(), outcome = ?outcome, "Merged file");
        file_merge(path, outcome, action)
    }

    /// Decide a file an earlier load wrote markers into
    ///
    /// The pre-conflict working content is gone, so `ours` can no longer be
    /// chosen for a file that still carries markers.
    fn recheck_unresolved(
        &self,
        path: &Path,
        ours: Option<&[u8]>,
        theirs: Option<&[u8]>,
        policy: ConflictPolicy,
    ) -> FileMerge {
        let still_marked = ours.is_some_and(has_conflict_markers);

        let (outcome, action) = match policy {
            ConflictPolicy::ForceOurs => (MergeOutcome::AppliedClean, FileAction::Keep),
            ConflictPolicy::ForceTheirs => (MergeOutcome::AppliedClean, take(ours, theirs)),
            _ if !still_marked => (MergeOutcome::AppliedClean, FileAction::Keep),
            ConflictPolicy::Strategy(MergeStrategy::Theirs) => (
                MergeOutcome::AppliedResolved(ResolvedSide::Theirs),
                take(ours, theirs),
            ),
            _ => (
                MergeOutcome::Conflict {
                    markers_written: true,
                },
                FileAction::Keep,
            ),
        };

        debug!(path = %path.display(), outcome = ?outcome, still_marked, "Rechecked unresolved file");
        file_merge(path, outcome, action)
    }

    fn settle_conflict(
        &self,
        base: Option<&[u8]>,
        ours: Option<&[u8]>,
        theirs: Option<&[u8]>,
        policy: ConflictPolicy,
    ) -> (MergeOutcome, FileAction) {
        let unmarked = (
            MergeOutcome::Conflict {
                markers_written: false,
            },
            FileAction::Keep,
        );

        match policy {
            ConflictPolicy::Strategy(MergeStrategy::Ours) => (
                MergeOutcome::AppliedResolved(ResolvedSide::Ours),
                FileAction::Keep,
            ),
            ConflictPolicy::Strategy(MergeStrategy::Theirs) => (
                MergeOutcome::AppliedResolved(ResolvedSide::Theirs),
                take(ours, theirs),
            ),
            ConflictPolicy::Strategy(MergeStrategy::Manual) => {
                match self.render_conflict(base, ours, theirs) {
                    Some(marked) => (
                        MergeOutcome::Conflict {
                            markers_written: true,
                        },
                        FileAction::Write(marked.into_bytes()),
                    ),
                    None => unmarked,
                }
            }
            _ => unmarked,
        }
    }

    /// Render a diff3-style conflict; a missing side renders as empty
    ///
    /// Returns `None` when a side is not UTF-8 text.
    pub fn render_conflict(
        &self,
        base: Option<&[u8]>,
        ours: Option<&[u8]>,
        theirs: Option<&[u8]>,
    ) -> Option<String> {
        let base = as_text(base)?;
        let ours = as_text(ours)?;
        let theirs = as_text(theirs)?;

        let mut out = String::new();
        out.push_str(&format!("{}{}\n", OURS_MARKER, self.labels.ours));
        push_section(&mut out, ours);
        out.push_str(&format!("||||||| {}\n", self.labels.base));
        push_section(&mut out, base);
        out.push_str("=======\n");
        push_section(&mut out, theirs);
        out.push_str(&format!("{}{}\n", THEIRS_MARKER, self.labels.theirs));
        Some(out)
    }
}

fn file_merge(path: &Path, outcome: MergeOutcome, action: FileAction) -> FileMerge {
    FileMerge {
        path: path.to_path_buf(),
        outcome,
        action,
    }
}

/// Action turning `ours` into `target`
fn take(ours: Option<&[u8]>, target: Option<&[u8]>) -> FileAction {
    match target {
        _ if ours == target => FileAction::Keep,
        Some(content) => FileAction::Write(content.to_vec()),
        None => FileAction::Remove,
    }
}

/// `Some("")` for a missing side, `None` for binary content
fn as_text(content: Option<&[u8]>) -> Option<&str> {
    match content {
        Some(bytes) => std::str::from_utf8(bytes).ok(),
        None => Some(""),
    }
}

fn push_section(out: &mut String, content: &str) {
    out.push_str(content);
    if !content.is_empty() && !content.ends_with('\n') {
        out.push('\n');
    }
}

/// True if `content` still holds an opening and a closing conflict marker
pub fn has_conflict_markers(content: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(content) else {
        return false;
    };
    text.lines().any(|l| l.starts_with(OURS_MARKER)) && text.lines().any(|l| l.starts_with(THEIRS_MARKER))
}

/// Relative path that stays inside its root
pub fn is_safe_path(path: &Path) -> bool {
    path.components().next().is_some()
        && path.components().all(|c| matches!(c, Component::Normal(_)))
}
