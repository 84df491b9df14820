//! Stash stack storage

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::checkout::write_atomic;
use crate::entry::{ComponentId, StashEntry, StashId, StashMeta};
use crate::error::StashError;

const STACK_FILE: &str = "stack.json";
const FORMAT_VERSION: u32 = 1;

/// On-disk layout of the stack, oldest entry first
#[derive(Debug, Default, Serialize, Deserialize)]
struct StackFile {
    format: u32,
    entries: Vec<StashEntry>,
}

/// Storage backend for the stash stack
pub struct StashStorage {
    /// Base directory for stash storage
    base_dir: PathBuf,
}

impl StashStorage {
    /// Create a new storage backend
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Initialize storage directory
    pub async fn init(&self) -> Result<(), StashError> {
        fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            StashError::StorageError(format!("Failed to create storage directory: {}", e))
        })?;

        debug!(dir = %self.base_dir.display(), "Initialized stash storage");
        Ok(())
    }

    /// Load the stack, empty if nothing was saved yet
    pub async fn load(&self) -> Result<Vec<StashEntry>, StashError> {
        let path = self.stack_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let json = fs::read_to_string(&path)
            .await
            .map_err(|e| StashError::StorageError(format!("Failed to read stash stack: {}", e)))?;

        let file: StackFile = serde_json::from_str(&json).map_err(|e| {
            StashError::StorageError(format!("Failed to deserialize stash stack: {}", e))
        })?;

        if file.format != FORMAT_VERSION {
            return Err(StashError::StorageError(format!(
                "Unsupported stash format {} (expected {})",
                file.format, FORMAT_VERSION
            )));
        }

        debug!(entries = file.entries.len(), "Loaded stash stack");
        Ok(file.entries)
    }

    /// Replace the stored stack; durable once this returns
    pub async fn save(&self, entries: &[StashEntry]) -> Result<u64, StashError> {
        let file = StackFile {
            format: FORMAT_VERSION,
            entries: entries.to_vec(),
        };

        let json = serde_json::to_string_pretty(&file).map_err(|e| {
            StashError::StorageError(format!("Failed to serialize stash stack: {}", e))
        })?;

        let size = json.len() as u64;
        write_atomic(&self.stack_path(), json.as_bytes())
            .await
            .map_err(|e| StashError::StorageError(format!("Failed to write stash stack: {}", e)))?;

        debug!(entries = entries.len(), size = size, "Saved stash stack");
        Ok(size)
    }

    fn stack_path(&self) -> PathBuf {
        self.base_dir.join(STACK_FILE)
    }
}

/// Ordered stack of stash entries, newest last
///
/// Mutations start from the stored stack, not the in-memory view, so several
/// handles on the same storage never drop each other's entries. Callers hold
/// the project lock across a mutation. The view is updated only after the
/// write is durable.
pub struct StashStack {
    storage: StashStorage,
    entries: RwLock<Vec<StashEntry>>,
}

impl StashStack {
    /// Open the stack stored under `storage`
    pub async fn open(storage: StashStorage) -> Result<Self, StashError> {
        storage.init().await?;
        let entries = storage.load().await?;

        Ok(Self {
            storage,
            entries: RwLock::new(entries),
        })
    }

    /// Reload the in-memory view from storage
    pub async fn refresh(&self) -> Result<(), StashError> {
        let entries = self.storage.load().await?;
        *self.entries.write() = entries;
        Ok(())
    }

    /// Append an entry on top of the stack
    pub async fn push(&self, entry: StashEntry) -> Result<(), StashError> {
        let id = entry.id;
        let mut next = self.storage.load().await?;
        next.push(entry);

        self.commit(next).await?;

        info!(stash_id = %id, "Pushed stash entry");
        Ok(())
    }

    /// Top entry, without removing it
    pub fn peek_latest(&self) -> Option<StashEntry> {
        self.entries.read().last().cloned()
    }

    /// Remove the top entry
    ///
    /// `expected` must be the id of the current top entry, so an entry is
    /// only ever popped by the load that restored it.
    pub async fn pop(&self, expected: StashId) -> Result<StashEntry, StashError> {
        let mut next = self.storage.load().await?;
        match next.last() {
            None => return Err(StashError::EmptyStash),
            Some(top) if top.id != expected => {
                return Err(StashError::StorageError(format!(
                    "Stash {} is no longer on top of the stack",
                    expected
                )));
            }
            Some(_) => {}
        }

        let popped = next.pop().ok_or(StashError::EmptyStash)?;
        self.commit(next).await?;

        info!(stash_id = %popped.id, "Popped stash entry");
        Ok(popped)
    }

    /// Record which files of entry `id` still carry conflict markers
    ///
    /// Components missing from `unresolved` keep their current set.
    pub async fn set_unresolved(
        &self,
        id: StashId,
        unresolved: &BTreeMap<ComponentId, BTreeSet<PathBuf>>,
    ) -> Result<(), StashError> {
        let mut next = self.storage.load().await?;
        let entry = next
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StashError::StorageError(format!("Stash {} is gone", id)))?;

        for item in &mut entry.items {
            if let Some(paths) = unresolved.get(&item.component_id) {
                item.unresolved = paths.clone();
            }
        }

        self.commit(next).await?;

        debug!(stash_id = %id, components = unresolved.len(), "Updated unresolved files");
        Ok(())
    }

    /// List all entries, newest first
    pub fn list(&self) -> Vec<StashMeta> {
        self.entries.read().iter().rev().map(StashEntry::to_meta).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    async fn commit(&self, entries: Vec<StashEntry>) -> Result<(), StashError> {
        self.storage.save(&entries).await?;
        *self.entries.write() = entries;
        Ok(())
    }
}
