//! Stash manager - coordinates save and load

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::checkout::{ApplyStats, CheckoutApplier};
use crate::entry::{ComponentId, StashEntry, StashId, StashItem, StashMeta};
use crate::error::StashError;
use crate::lock::ProjectLock;
use crate::merge::{MarkerLabels, MergeResolver};
use crate::options::{CheckoutOptions, ConflictPolicy};
use crate::snapshot::SnapshotBuilder;
use crate::storage::{StashStack, StashStorage};
use crate::workspace::{Workspace, META_DIR};

const LOCK_FILE: &str = "stash.lock";

/// Configuration for the stash manager
#[derive(Debug, Clone)]
pub struct StashConfig {
    /// Storage directory for the stash stack
    pub stash_dir: PathBuf,
    /// How long to wait for another stash operation to finish
    pub lock_timeout: Duration,
    pub lock_retry_interval: Duration,
    /// Labels written after conflict markers
    pub marker_labels: MarkerLabels,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            stash_dir: PathBuf::from(META_DIR).join("stash"),
            lock_timeout: Duration::from_secs(5),
            lock_retry_interval: Duration::from_millis(50),
            marker_labels: MarkerLabels::default(),
        }
    }
}

impl StashConfig {
    /// Default configuration anchored at a project root
    pub fn for_root(root: &Path) -> Self {
        Self {
            stash_dir: root.join(META_DIR).join("stash"),
            ..Self::default()
        }
    }
}

/// Component left with unresolved files
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentConflict {
    pub component_id: ComponentId,
    pub paths: Vec<PathBuf>,
}

/// Component that could not be restored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComponentFailure {
    pub component_id: ComponentId,
    pub error: String,
}

/// Outcome of loading the latest stash
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadReport {
    pub stash_id: StashId,
    /// Components restored without conflicts
    pub restored: Vec<ComponentId>,
    pub conflicts: Vec<ComponentConflict>,
    pub failures: Vec<ComponentFailure>,
    /// Files written, removed or kept cleanly
    pub applied_files: usize,
    pub skipped_files: usize,
    /// Whether the entry was removed from the stack
    pub popped: bool,
}

impl LoadReport {
    fn new(stash_id: StashId) -> Self {
        Self {
            stash_id,
            restored: Vec::new(),
            conflicts: Vec::new(),
            failures: Vec::new(),
            applied_files: 0,
            skipped_files: 0,
            popped: false,
        }
    }

    /// True when nothing needs manual attention
    pub fn is_complete(&self) -> bool {
        self.conflicts.is_empty() && self.failures.is_empty()
    }

    /// Number of files left in conflict
    pub fn conflict_count(&self) -> usize {
        self.conflicts.iter().map(|c| c.paths.len()).sum()
    }
}

/// Saves modified components to the stash and restores them
pub struct StashManager<W> {
    config: StashConfig,
    workspace: W,
    stack: StashStack,
    resolver: MergeResolver,
    applier: CheckoutApplier,
}

impl<W: Workspace> StashManager<W> {
    /// Open the stash stack configured in `config`
    pub async fn open(config: StashConfig, workspace: W) -> Result<Self, StashError> {
        let stack = StashStack::open(StashStorage::new(config.stash_dir.clone())).await?;
        let resolver = MergeResolver::new(config.marker_labels.clone());

        Ok(Self {
            config,
            workspace,
            stack,
            resolver,
            applier: CheckoutApplier::new(),
        })
    }

    /// Stash modified components matching `pattern`
    ///
    /// The captured components are reverted to their resolved version once
    /// the entry is stored.
    pub async fn save(
        &self,
        pattern: Option<&str>,
        message: Option<String>,
    ) -> Result<Vec<ComponentId>, StashError> {
        let _lock = self.lock().await?;
        self.stack.refresh().await?;

        let selection = self.workspace.modified_components(pattern).await?;
        let mut captured = Vec::new();

        for id in selection {
            let version = self.workspace.resolved_version(&id).await?;
            let base = self.workspace.base_files(&id, &version).await?;
            let working = self.workspace.working_files(&id).await?;

            match SnapshotBuilder::capture(id.clone(), version, &base, &working) {
                Some(item) => captured.push((item, base)),
                None => debug!(component = %id, "No changes to stash"),
            }
        }

        if captured.is_empty() {
            return Err(StashError::NoModifiedComponents);
        }

        let items: Vec<StashItem> = captured.iter().map(|(item, _)| item.clone()).collect();
        let entry = StashEntry::new(message, items);
        let stash_id = entry.id;
        let ids = entry.component_ids();
        self.stack.push(entry).await?;

        for (item, base) in &captured {
            let dir = self.workspace.component_dir(&item.component_id);
            self.applier.revert(&dir, item, base).await?;
        }

        info!(
            stash_id = %stash_id,
            components = ids.len(),
            "Stashed components"
        );

        Ok(ids)
    }

    /// Restore the latest stash entry onto the working tree
    ///
    /// The entry is popped only when every component was restored without
    /// conflicts or failures.
    pub async fn load_latest(&self, options: CheckoutOptions) -> Result<LoadReport, StashError> {
        let policy = options.policy()?;
        let _lock = self.lock().await?;
        self.stack.refresh().await?;

        let entry = self.stack.peek_latest().ok_or(StashError::EmptyStash)?;
        let mut report = LoadReport::new(entry.id);
        let mut unresolved = BTreeMap::new();

        info!(
            stash_id = %entry.id,
            components = entry.items.len(),
            policy = ?policy,
            "Loading stash"
        );

        for item in &entry.items {
            let id = item.component_id.clone();

            match self.restore_item(item, policy).await {
                Ok(stats) => {
                    unresolved.insert(
                        id.clone(),
                        stats.marked_paths.iter().cloned().collect::<BTreeSet<_>>(),
                    );
                    report.applied_files += stats.applied;
                    report.skipped_files += stats.skipped;
                    if stats.conflicts == 0 {
                        report.restored.push(id);
                    } else {
                        report.conflicts.push(ComponentConflict {
                            component_id: id,
                            paths: stats.conflicted_paths,
                        });
                    }
                }
                Err(e) => {
                    warn!(component = %id, error = %e, "Failed to restore component");
                    report.failures.push(ComponentFailure {
                        component_id: id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.is_complete() {
            self.stack.pop(entry.id).await?;
            report.popped = true;
        } else {
            if unresolved_changed(&entry, &unresolved) {
                self.stack.set_unresolved(entry.id, &unresolved).await?;
            }
            warn!(
                stash_id = %entry.id,
                conflicts = report.conflict_count(),
                failures = report.failures.len(),
                "Stash retained"
            );
        }

        Ok(report)
    }

    /// List stash entries, newest first
    pub fn list(&self) -> Vec<StashMeta> {
        self.stack.list()
    }

    /// Number of stash entries
    pub fn count(&self) -> usize {
        self.stack.len()
    }

    pub fn workspace(&self) -> &W {
        &self.workspace
    }

    // === Private Methods ===

    async fn restore_item(
        &self,
        item: &StashItem,
        policy: ConflictPolicy,
    ) -> Result<ApplyStats, StashError> {
        let id = &item.component_id;
        let base = self.workspace.base_files(id, &item.base_version).await?;
        let working = self.workspace.working_files(id).await?;

        let merge = self.resolver.resolve(item, &base, &working, policy);
        let stats = self
            .applier
            .apply(&self.workspace.component_dir(id), &merge)
            .await?;

        debug!(
            component = %id,
            applied = stats.applied,
            conflicts = stats.conflicts,
            "Restored component"
        );
        Ok(stats)
    }

    async fn lock(&self) -> Result<ProjectLock, StashError> {
        ProjectLock::acquire(
            &self.config.stash_dir.join(LOCK_FILE),
            self.config.lock_timeout,
            self.config.lock_retry_interval,
        )
        .await
    }
}

/// True if any restored component's marked files differ from the stored set
fn unresolved_changed(
    entry: &StashEntry,
    unresolved: &BTreeMap<ComponentId, BTreeSet<PathBuf>>,
) -> bool {
    entry.items.iter().any(|item| {
        unresolved
            .get(&item.component_id)
            .is_some_and(|paths| *paths != item.unresolved)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::VersionRef;
    use crate::options::MergeStrategy;
    use crate::workspace::DirWorkspace;
    use tempfile::{tempdir, TempDir};

    fn write(root: &Path, path: &str, content: &str) {
        let path = root.join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn read(root: &Path, path: &str) -> String {
        std::fs::read_to_string(root.join(path)).unwrap()
    }

    /// Project with tracked components, each holding `index.ts` = "A"
    async fn project(components: &[&str]) -> (TempDir, StashManager<DirWorkspace>) {
        let dir = tempdir().unwrap();
        let ws = DirWorkspace::new(dir.path());
        for name in components {
            write(dir.path(), &format!("{}/index.ts", name), "A");
            ws.track(&ComponentId::new(*name), &VersionRef::new("1.0.0"))
                .await
                .unwrap();
        }

        let manager = StashManager::open(StashConfig::for_root(dir.path()), ws)
            .await
            .unwrap();
        (dir, manager)
    }

    fn strategy(strategy: MergeStrategy) -> CheckoutOptions {
        CheckoutOptions {
            merge_strategy: Some(strategy),
            ..CheckoutOptions::default()
        }
    }

    /// Stash "C" over base "A", then edit the working file to "B"
    async fn diverged() -> (TempDir, StashManager<DirWorkspace>) {
        let (dir, manager) = project(&["button"]).await;
        write(dir.path(), "button/index.ts", "C");
        manager.save(None, None).await.unwrap();
        assert_eq!(read(dir.path(), "button/index.ts"), "A");
        write(dir.path(), "button/index.ts", "B");
        (dir, manager)
    }

    // === Save Tests ===

    #[tokio::test]
    async fn test_save_reverts_working_tree() {
        let (dir, manager) = project(&["button", "card"]).await;
        write(dir.path(), "button/index.ts", "changed");
        write(dir.path(), "button/extra.ts", "new file");

        let ids = manager.save(None, Some("wip".to_string())).await.unwrap();

        assert_eq!(ids, vec![ComponentId::new("button")]);
        assert_eq!(manager.count(), 1);
        assert_eq!(read(dir.path(), "button/index.ts"), "A");
        assert!(!dir.path().join("button/extra.ts").exists());
        assert_eq!(manager.list()[0].summary, "wip");
    }

    #[tokio::test]
    async fn test_save_without_modifications() {
        let (_dir, manager) = project(&["button"]).await;

        let result = manager.save(None, None).await;

        assert!(matches!(result, Err(StashError::NoModifiedComponents)));
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_save_pattern_without_match() {
        let (dir, manager) = project(&["button"]).await;
        write(dir.path(), "button/index.ts", "changed");

        let result = manager.save(Some("card*"), None).await;

        assert!(matches!(result, Err(StashError::NoModifiedComponents)));
        assert_eq!(read(dir.path(), "button/index.ts"), "changed");
    }

    // === Load Tests ===

    #[tokio::test]
    async fn test_load_empty_stash() {
        let (_dir, manager) = project(&["button"]).await;

        let result = manager.load_latest(CheckoutOptions::default()).await;
        assert!(matches!(result, Err(StashError::EmptyStash)));
    }

    #[tokio::test]
    async fn test_round_trip_force_theirs() {
        let (dir, manager) = project(&["button", "card"]).await;
        write(dir.path(), "button/index.ts", "button edit");
        write(dir.path(), "button/src/new.ts", "added");
        std::fs::remove_file(dir.path().join("card/index.ts")).unwrap();
        let before_button = manager
            .workspace()
            .working_files(&ComponentId::new("button"))
            .await
            .unwrap();

        manager.save(None, None).await.unwrap();

        let options = CheckoutOptions {
            force_theirs: true,
            ..CheckoutOptions::default()
        };
        let report = manager.load_latest(options).await.unwrap();

        assert!(report.popped);
        assert_eq!(report.restored.len(), 2);
        assert_eq!(manager.count(), 0);
        let after_button = manager
            .workspace()
            .working_files(&ComponentId::new("button"))
            .await
            .unwrap();
        assert_eq!(before_button, after_button);
        assert!(!dir.path().join("card/index.ts").exists());
    }

    #[tokio::test]
    async fn test_conflicting_force_flags_touch_nothing() {
        let (dir, manager) = diverged().await;

        let options = CheckoutOptions {
            merge_strategy: None,
            force_ours: true,
            force_theirs: true,
        };
        let result = manager.load_latest(options).await;

        assert!(matches!(result, Err(StashError::InvalidOptions(_))));
        assert_eq!(read(dir.path(), "button/index.ts"), "B");
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn test_manual_strategy_writes_markers() {
        let (dir, manager) = diverged().await;

        let report = manager.load_latest(strategy(MergeStrategy::Manual)).await.unwrap();

        let content = read(dir.path(), "button/index.ts");
        assert!(content.starts_with("<<<<<<<"));
        assert!(content.contains("\nB\n"));
        assert!(content.contains("\nC\n"));
        assert_eq!(report.conflict_count(), 1);
        assert!(!report.popped);
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn test_ours_strategy_pops() {
        let (dir, manager) = diverged().await;

        let report = manager.load_latest(strategy(MergeStrategy::Ours)).await.unwrap();

        assert_eq!(read(dir.path(), "button/index.ts"), "B");
        assert!(report.popped);
        assert_eq!(report.restored, vec![ComponentId::new("button")]);
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_theirs_strategy_overwrites() {
        let (dir, manager) = diverged().await;

        let report = manager.load_latest(strategy(MergeStrategy::Theirs)).await.unwrap();

        assert_eq!(read(dir.path(), "button/index.ts"), "C");
        assert!(report.popped);
    }

    #[tokio::test]
    async fn test_unset_strategy_reports_conflict() {
        let (dir, manager) = diverged().await;

        let report = manager.load_latest(CheckoutOptions::default()).await.unwrap();

        assert_eq!(read(dir.path(), "button/index.ts"), "B");
        assert_eq!(
            report.conflicts,
            vec![ComponentConflict {
                component_id: ComponentId::new("button"),
                paths: vec![PathBuf::from("index.ts")],
            }]
        );
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn test_load_is_lifo() {
        let (dir, manager) = project(&["x", "y"]).await;

        write(dir.path(), "x/index.ts", "x edit");
        manager.save(Some("x"), None).await.unwrap();
        write(dir.path(), "y/index.ts", "y edit");
        manager.save(Some("y"), None).await.unwrap();

        let first = manager.load_latest(CheckoutOptions::default()).await.unwrap();
        assert_eq!(first.restored, vec![ComponentId::new("y")]);
        assert_eq!(read(dir.path(), "y/index.ts"), "y edit");
        assert_eq!(read(dir.path(), "x/index.ts"), "A");

        let second = manager.load_latest(CheckoutOptions::default()).await.unwrap();
        assert_eq!(second.restored, vec![ComponentId::new("x")]);
        assert_eq!(read(dir.path(), "x/index.ts"), "x edit");
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_other_components() {
        let (dir, manager) = project(&["button", "card"]).await;
        write(dir.path(), "button/index.ts", "b");
        write(dir.path(), "card/index.ts", "c");
        manager.save(None, None).await.unwrap();

        // Base version of button disappears from the store
        std::fs::remove_dir_all(dir.path().join(".stow/versions/button")).unwrap();

        let report = manager.load_latest(CheckoutOptions::default()).await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].component_id, ComponentId::new("button"));
        assert_eq!(report.restored, vec![ComponentId::new("card")]);
        assert_eq!(read(dir.path(), "card/index.ts"), "c");
        assert!(!report.popped);
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn test_operations_are_serialized() {
        let dir = tempdir().unwrap();
        let config = StashConfig {
            lock_timeout: Duration::from_millis(20),
            lock_retry_interval: Duration::from_millis(5),
            ..StashConfig::for_root(dir.path())
        };
        let manager = StashManager::open(config.clone(), DirWorkspace::new(dir.path()))
            .await
            .unwrap();

        let _held = ProjectLock::try_acquire(&config.stash_dir.join(LOCK_FILE))
            .await
            .unwrap();

        assert!(matches!(
            manager.load_latest(CheckoutOptions::default()).await,
            Err(StashError::Locked(_))
        ));
    }

    #[tokio::test]
    async fn test_stash_survives_reopen() {
        let (dir, manager) = project(&["button"]).await;
        write(dir.path(), "button/index.ts", "edit");
        manager.save(None, None).await.unwrap();
        drop(manager);

        let reopened = StashManager::open(
            StashConfig::for_root(dir.path()),
            DirWorkspace::new(dir.path()),
        )
        .await
        .unwrap();
        assert_eq!(reopened.count(), 1);

        reopened.load_latest(CheckoutOptions::default()).await.unwrap();
        assert_eq!(read(dir.path(), "button/index.ts"), "edit");
    }

    #[tokio::test]
    async fn test_two_managers_keep_both_stashes() {
        let (dir, a) = project(&["button", "card"]).await;
        let b = StashManager::open(
            StashConfig::for_root(dir.path()),
            DirWorkspace::new(dir.path()),
        )
        .await
        .unwrap();

        write(dir.path(), "button/index.ts", "first edit");
        a.save(Some("button"), Some("first".to_string())).await.unwrap();
        write(dir.path(), "card/index.ts", "second edit");
        b.save(Some("card"), Some("second".to_string())).await.unwrap();

        let reopened = StashManager::open(
            StashConfig::for_root(dir.path()),
            DirWorkspace::new(dir.path()),
        )
        .await
        .unwrap();
        let summaries: Vec<String> = reopened.list().into_iter().map(|m| m.summary).collect();
        assert_eq!(summaries, vec!["second", "first"]);

        // a restores b's entry first, then its own
        let report = a.load_latest(CheckoutOptions::default()).await.unwrap();
        assert_eq!(report.restored, vec![ComponentId::new("card")]);
        let report = a.load_latest(CheckoutOptions::default()).await.unwrap();
        assert_eq!(report.restored, vec![ComponentId::new("button")]);
        assert_eq!(read(dir.path(), "button/index.ts"), "first edit");
        assert_eq!(read(dir.path(), "card/index.ts"), "second edit");
    }

    #[tokio::test]
    async fn test_binary_file_round_trip() {
        let (dir, manager) = project(&["button"]).await;
        let png = dir.path().join("button/img.png");
        std::fs::write(&png, [0xff, 0xfe]).unwrap();

        manager.save(None, None).await.unwrap();
        assert!(!png.exists());

        let report = manager.load_latest(CheckoutOptions::default()).await.unwrap();

        assert!(report.popped);
        assert_eq!(std::fs::read(&png).unwrap(), vec![0xff, 0xfe]);
    }

    #[tokio::test]
    async fn test_binary_conflict_keeps_working_file() {
        let (dir, manager) = project(&["button"]).await;
        let png = dir.path().join("button/img.png");
        std::fs::write(&png, [0xff, 0xfe]).unwrap();
        manager.save(None, None).await.unwrap();
        std::fs::write(&png, [0xff, 0x00]).unwrap();

        let report = manager.load_latest(strategy(MergeStrategy::Manual)).await.unwrap();

        assert_eq!(report.conflict_count(), 1);
        assert_eq!(std::fs::read(&png).unwrap(), vec![0xff, 0x00]);
        assert!(!report.popped);
    }

    #[tokio::test]
    async fn test_manual_load_twice_does_not_nest_markers() {
        let (dir, manager) = diverged().await;
        manager.load_latest(strategy(MergeStrategy::Manual)).await.unwrap();
        let marked = read(dir.path(), "button/index.ts");
        drop(manager);

        let reopened = StashManager::open(
            StashConfig::for_root(dir.path()),
            DirWorkspace::new(dir.path()),
        )
        .await
        .unwrap();
        let report = reopened.load_latest(strategy(MergeStrategy::Manual)).await.unwrap();

        assert_eq!(read(dir.path(), "button/index.ts"), marked);
        assert_eq!(marked.matches("<<<<<<<").count(), 1);
        assert_eq!(report.conflict_count(), 1);
        assert_eq!(reopened.count(), 1);
    }

    #[tokio::test]
    async fn test_resolved_by_hand_then_load_pops() {
        let (dir, manager) = diverged().await;
        manager.load_latest(strategy(MergeStrategy::Manual)).await.unwrap();

        write(dir.path(), "button/index.ts", "B and C");
        let report = manager.load_latest(CheckoutOptions::default()).await.unwrap();

        assert!(report.popped);
        assert_eq!(report.restored, vec![ComponentId::new("button")]);
        assert_eq!(read(dir.path(), "button/index.ts"), "B and C");
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn test_theirs_after_manual_replaces_markers() {
        let (dir, manager) = diverged().await;
        manager.load_latest(strategy(MergeStrategy::Manual)).await.unwrap();

        let report = manager.load_latest(strategy(MergeStrategy::Theirs)).await.unwrap();

        assert!(report.popped);
        assert_eq!(read(dir.path(), "button/index.ts"), "C");
    }

    #[tokio::test]
    async fn test_modified_in_stash_deleted_in_working_tree() {
        let (dir, manager) = diverged().await;
        std::fs::remove_file(dir.path().join("button/index.ts")).unwrap();

        let report = manager.load_latest(strategy(MergeStrategy::Manual)).await.unwrap();

        assert_eq!(report.conflict_count(), 1);
        assert!(!report.popped);
        assert_eq!(
            read(dir.path(), "button/index.ts"),
            "<<<<<<< ours (working tree)\n||||||| base\nA\n=======\nC\n>>>>>>> theirs (stash)\n"
        );
    }

    #[tokio::test]
    async fn test_deleted_in_stash_modified_in_working_tree() {
        let (dir, manager) = project(&["button"]).await;
        std::fs::remove_file(dir.path().join("button/index.ts")).unwrap();
        manager.save(None, None).await.unwrap();
        assert_eq!(read(dir.path(), "button/index.ts"), "A");
        write(dir.path(), "button/index.ts", "B");

        let report = manager.load_latest(CheckoutOptions::default()).await.unwrap();
        assert_eq!(report.conflict_count(), 1);
        assert_eq!(read(dir.path(), "button/index.ts"), "B");

        let report = manager.load_latest(strategy(MergeStrategy::Theirs)).await.unwrap();
        assert!(report.popped);
        assert!(!dir.path().join("button/index.ts").exists());
    }

    #[tokio::test]
    async fn test_write_failure_mid_component() {
        let (dir, manager) = project(&["button", "card"]).await;
        write(dir.path(), "button/a.ts", "a");
        write(dir.path(), "button/b.ts", "b");
        write(dir.path(), "card/index.ts", "c");
        manager.save(None, None).await.unwrap();

        // A directory in place of b.ts makes its write fail
        std::fs::create_dir_all(dir.path().join("button/b.ts")).unwrap();

        let options = CheckoutOptions {
            force_theirs: true,
            ..CheckoutOptions::default()
        };
        let report = manager.load_latest(options).await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].component_id, ComponentId::new("button"));
        assert_eq!(read(dir.path(), "button/a.ts"), "a");
        assert_eq!(report.restored, vec![ComponentId::new("card")]);
        assert_eq!(read(dir.path(), "card/index.ts"), "c");
        assert!(!report.popped);
        assert_eq!(manager.count(), 1);
    }
}
