//! Writing merge results to the working tree

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::entry::{FileSet, StashItem};
use crate::error::StashError;
use crate::merge::{is_safe_path, ComponentMerge, FileAction, MergeOutcome};

/// Counts reported for one applied component
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Files written, removed or kept without conflict
    pub applied: usize,
    /// Files left in conflict, with or without markers
    pub conflicts: usize,
    pub skipped: usize,
    /// Paths that need manual resolution
    pub conflicted_paths: Vec<PathBuf>,
    /// Conflicted paths carrying markers on disk
    pub marked_paths: Vec<PathBuf>,
}

/// Applies merge decisions to a component directory
#[derive(Debug, Clone, Default)]
pub struct CheckoutApplier;

impl CheckoutApplier {
    pub fn new() -> Self {
        Self
    }

    /// Apply every file decision of `merge` under `root`
    ///
    /// Stops at the first I/O failure; files already written stay written.
    pub async fn apply(&self, root: &Path, merge: &ComponentMerge) -> Result<ApplyStats, StashError> {
        let mut stats = ApplyStats::default();

        for file in &merge.files {
            let target = root.join(&file.path);

            match &file.action {
                FileAction::Keep => {}
                FileAction::Write(content) => write_atomic(&target, content).await?,
                FileAction::Remove => remove_if_exists(&target).await?,
            }

            match file.outcome {
                MergeOutcome::AppliedClean | MergeOutcome::AppliedResolved(_) => stats.applied += 1,
                MergeOutcome::Conflict { markers_written } => {
                    warn!(
                        component = %merge.component_id,
                        path = %file.path.display(),
                        markers_written,
                        "File left in conflict"
                    );
                    stats.conflicts += 1;
                    stats.conflicted_paths.push(file.path.clone());
                    if markers_written {
                        stats.marked_paths.push(file.path.clone());
                    }
                }
                MergeOutcome::Skipped(reason) => {
                    warn!(
                        component = %merge.component_id,
                        path = %file.path.display(),
                        reason = ?reason,
                        "Skipped file"
                    );
                    stats.skipped += 1;
                }
            }

            debug!(path = %target.display(), action = action_name(&file.action), "Applied file");
        }

        Ok(stats)
    }

    /// Put every file touched by `item` back to its `base` content
    pub async fn revert(&self, root: &Path, item: &StashItem, base: &FileSet) -> Result<usize, StashError> {
        let mut reverted = 0;

        for path in item.file_deltas.keys() {
            if !is_safe_path(path) {
                continue;
            }

            let target = root.join(path);
            match base.get(path) {
                Some(content) => write_atomic(&target, content).await?,
                None => remove_if_exists(&target).await?,
            }
            reverted += 1;
        }

        debug!(component = %item.component_id, files = reverted, "Reverted component to base");
        Ok(reverted)
    }
}

/// Write `bytes` to `path` through a temporary sibling and a rename
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = temp_sibling(path);
    let result = write_and_rename(&tmp_path, path, bytes).await;
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
    }
    result
}

async fn write_and_rename(tmp_path: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    fs::rename(tmp_path, path).await
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.stow-tmp", name))
}

fn action_name(action: &FileAction) -> &'static str {
    match action {
        FileAction::Keep => "keep",
        FileAction::Write(_) => "write",
        FileAction::Remove => "remove",
    }
}
