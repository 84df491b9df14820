//! Stash entry data structures

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// File contents of a component keyed by path relative to the component root
pub type FileSet = BTreeMap<PathBuf, Vec<u8>>;

/// Unique identifier of a stash entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StashId(Uuid);

impl StashId {
    /// Generate a fresh id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// First eight hex digits, for display
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for StashId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StashId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a versioned component
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a resolved component version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionRef(String);

impl VersionRef {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Change to a single file relative to the base version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "lowercase")]
pub enum FileDelta {
    /// File absent from the base version
    Added(#[serde(with = "base64_content")] Vec<u8>),
    /// File present in the base version with different content
    Modified(#[serde(with = "base64_content")] Vec<u8>),
    /// File present in the base version, gone from the working tree
    Deleted,
}

impl FileDelta {
    /// Content the file has after the delta is applied, `None` if deleted
    pub fn content(&self) -> Option<&[u8]> {
        match self {
            Self::Added(content) | Self::Modified(content) => Some(content.as_slice()),
            Self::Deleted => None,
        }
    }
}

/// Stashed changes of one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StashItem {
    pub component_id: ComponentId,
    /// Version the working tree diverged from at stash time
    pub base_version: VersionRef,
    pub file_deltas: BTreeMap<PathBuf, FileDelta>,
    /// Paths written with conflict markers by an earlier load
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unresolved: BTreeSet<PathBuf>,
}

impl StashItem {
    /// Number of changed files
    pub fn file_count(&self) -> usize {
        self.file_deltas.len()
    }

    /// Total bytes of stashed content
    pub fn estimated_size(&self) -> u64 {
        self.file_deltas
            .values()
            .filter_map(FileDelta::content)
            .map(|c| c.len() as u64)
            .sum()
    }
}

/// A captured, point-in-time snapshot of uncommitted component changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StashEntry {
    pub id: StashId,
    /// Optional user message
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub items: Vec<StashItem>,
}

impl StashEntry {
    pub fn new(message: Option<String>, items: Vec<StashItem>) -> Self {
        Self {
            id: StashId::new(),
            message,
            created_at: Utc::now(),
            items,
        }
    }

    /// Components captured in this entry, in stash order
    pub fn component_ids(&self) -> Vec<ComponentId> {
        self.items.iter().map(|i| i.component_id.clone()).collect()
    }

    /// Get summary description
    pub fn summary(&self) -> String {
        match &self.message {
            Some(message) => message.clone(),
            None => format!(
                "{} component(s) at {}",
                self.items.len(),
                self.created_at.format("%Y-%m-%d %H:%M:%S")
            ),
        }
    }

    pub fn estimated_size(&self) -> u64 {
        self.items.iter().map(StashItem::estimated_size).sum()
    }

    /// Convert to listing metadata
    pub fn to_meta(&self) -> StashMeta {
        StashMeta {
            id: self.id,
            message: self.message.clone(),
            created_at: self.created_at,
            components: self.component_ids(),
            file_count: self.items.iter().map(StashItem::file_count).sum(),
            size_bytes: self.estimated_size(),
            summary: self.summary(),
        }
    }
}

/// File contents as base64 strings in the stack file
mod base64_content {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Lightweight view of a stash entry for listings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StashMeta {
    pub id: StashId,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub components: Vec<ComponentId>,
    pub file_count: usize,
    pub size_bytes: u64,
    pub summary: String,
}
