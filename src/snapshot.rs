//! Working-state snapshots

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crate::entry::{ComponentId, FileDelta, FileSet, StashItem, VersionRef};

/// Computes the stashable delta of a component
pub struct SnapshotBuilder;

impl SnapshotBuilder {
    /// Capture the delta between `base` and `working`
    ///
    /// Returns `None` when the component has no changes.
    pub fn capture(
        component_id: ComponentId,
        base_version: VersionRef,
        base: &FileSet,
        working: &FileSet,
    ) -> Option<StashItem> {
        let file_deltas = Self::deltas(base, working);
        if file_deltas.is_empty() {
            return None;
        }

        Some(StashItem {
            component_id,
            base_version,
            file_deltas,
            unresolved: BTreeSet::new(),
        })
    }

    /// Per-path changes turning `base` into `working`
    pub fn deltas(base: &FileSet, working: &FileSet) -> BTreeMap<PathBuf, FileDelta> {
        let changed = working.iter().filter_map(|(path, content)| {
            let delta = match base.get(path) {
                None => FileDelta::Added(content.clone()),
                Some(old) if old != content => FileDelta::Modified(content.clone()),
                Some(_) => return None,
            };
            Some((path.clone(), delta))
        });

        let removed = base
            .keys()
            .filter(|path| !working.contains_key(*path))
            .map(|path| (path.clone(), FileDelta::Deleted));

        changed.chain(removed).collect()
    }
}
