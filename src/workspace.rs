//! Component workspace access
//!
//! The stash engine does not own the component storage model. It talks to it
//! through [`Workspace`], which resolves patterns to modified components and
//! hands out base and working-tree contents. [`DirWorkspace`] is a plain
//! directory implementation: every top-level directory of the project is a
//! component, and resolved versions are copies kept under `.stow/versions`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use glob::Pattern;
use tokio::fs;
use tracing::debug;

use crate::checkout::write_atomic;
use crate::entry::{ComponentId, FileSet, VersionRef};
use crate::error::StashError;

/// Name of the project metadata directory
pub const META_DIR: &str = ".stow";

const RESOLVED_FILE: &str = "resolved.json";

/// Access to components, their resolved versions and working files
#[allow(async_fn_in_trait)]
pub trait Workspace {
    /// Components with pending modifications, filtered by an optional pattern
    async fn modified_components(&self, pattern: Option<&str>) -> Result<Vec<ComponentId>, StashError>;

    /// Version the component's working tree is checked out from
    async fn resolved_version(&self, id: &ComponentId) -> Result<VersionRef, StashError>;

    /// Files of a resolved version
    async fn base_files(&self, id: &ComponentId, version: &VersionRef) -> Result<FileSet, StashError>;

    /// Files currently in the working tree
    async fn working_files(&self, id: &ComponentId) -> Result<FileSet, StashError>;

    /// Directory the component's files live under
    fn component_dir(&self, id: &ComponentId) -> PathBuf;
}

/// Directory-backed workspace
#[derive(Debug, Clone)]
pub struct DirWorkspace {
    root: PathBuf,
}

impl DirWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Record the current working files of `id` as resolved `version`
    pub async fn track(&self, id: &ComponentId, version: &VersionRef) -> Result<usize, StashError> {
        let dir = self.component_dir(id);
        if !dir.is_dir() {
            return Err(StashError::ComponentNotFound(id.clone()));
        }

        let files = read_tree(&dir).await?;
        let version_dir = self.version_dir(id, version);
        if version_dir.exists() {
            fs::remove_dir_all(&version_dir).await?;
        }
        for (path, content) in &files {
            write_atomic(&version_dir.join(path), content).await?;
        }

        let mut resolved = self.load_resolved().await?;
        resolved.insert(id.clone(), version.clone());
        self.save_resolved(&resolved).await?;

        debug!(component = %id, version = %version, files = files.len(), "Tracked component version");
        Ok(files.len())
    }

    /// Top-level component directories, sorted
    pub async fn components(&self) -> Result<Vec<ComponentId>, StashError> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_dir() {
                continue;
            }
            ids.push(ComponentId::new(name));
        }

        ids.sort();
        Ok(ids)
    }

    async fn load_resolved(&self) -> Result<BTreeMap<ComponentId, VersionRef>, StashError> {
        let path = self.meta_dir().join(RESOLVED_FILE);
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let json = fs::read_to_string(&path).await?;
        serde_json::from_str(&json).map_err(|e| {
            StashError::StorageError(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    async fn save_resolved(&self, resolved: &BTreeMap<ComponentId, VersionRef>) -> Result<(), StashError> {
        let json = serde_json::to_string_pretty(resolved)
            .map_err(|e| StashError::StorageError(format!("Failed to serialize versions: {}", e)))?;
        write_atomic(&self.meta_dir().join(RESOLVED_FILE), json.as_bytes()).await?;
        Ok(())
    }

    fn meta_dir(&self) -> PathBuf {
        self.root.join(META_DIR)
    }

    fn version_dir(&self, id: &ComponentId, version: &VersionRef) -> PathBuf {
        self.meta_dir()
            .join("versions")
            .join(id.as_str())
            .join(version.as_str())
    }
}

impl Workspace for DirWorkspace {
    async fn modified_components(&self, pattern: Option<&str>) -> Result<Vec<ComponentId>, StashError> {
        let pattern = pattern
            .map(Pattern::new)
            .transpose()
            .map_err(|e| StashError::InvalidOptions(format!("Invalid component pattern: {}", e)))?;

        let resolved = self.load_resolved().await?;
        let mut modified = Vec::new();

        for (id, version) in &resolved {
            if let Some(pattern) = &pattern {
                if !pattern.matches(id.as_str()) {
                    continue;
                }
            }

            let base = self.base_files(id, version).await?;
            let working = self.working_files(id).await?;
            if base != working {
                modified.push(id.clone());
            }
        }

        Ok(modified)
    }

    async fn resolved_version(&self, id: &ComponentId) -> Result<VersionRef, StashError> {
        self.load_resolved()
            .await?
            .remove(id)
            .ok_or_else(|| StashError::ComponentNotFound(id.clone()))
    }

    async fn base_files(&self, id: &ComponentId, version: &VersionRef) -> Result<FileSet, StashError> {
        let dir = self.version_dir(id, version);
        if !dir.is_dir() {
            return Err(StashError::StorageError(format!(
                "Version {} of {} is missing",
                version, id
            )));
        }
        read_tree(&dir).await
    }

    async fn working_files(&self, id: &ComponentId) -> Result<FileSet, StashError> {
        let dir = self.component_dir(id);
        if !dir.exists() {
            return Ok(FileSet::new());
        }
        read_tree(&dir).await
    }

    fn component_dir(&self, id: &ComponentId) -> PathBuf {
        self.root.join(id.as_str())
    }
}

/// Read every file under `dir`, keyed by relative path
async fn read_tree(dir: &Path) -> Result<FileSet, StashError> {
    let mut files = FileSet::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                pending.push(path);
                continue;
            }
            if path.to_string_lossy().ends_with(".stow-tmp") {
                continue;
            }

            let content = fs::read(&path).await?;
            let relative = path
                .strip_prefix(dir)
                .map_err(|e| StashError::StorageError(e.to_string()))?
                .to_path_buf();
            files.insert(relative, content);
        }
    }

    Ok(files)
}
