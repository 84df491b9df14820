//! Stash error types

use thiserror::Error;

use crate::entry::ComponentId;

/// Errors that can occur in stash operations
///
/// Merge conflicts are not errors; they are reported through
/// [`LoadReport`](crate::manager::LoadReport).
#[derive(Debug, Error)]
pub enum StashError {
    /// Checkout options are contradictory or name an unknown strategy
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Save found nothing to stash
    #[error("No modified components to stash")]
    NoModifiedComponents,

    /// Load found no stash entry
    #[error("No stash found")]
    EmptyStash,

    /// Component unknown to the workspace
    #[error("Component not found: {0}")]
    ComponentNotFound(ComponentId),

    /// Storage error
    #[error("Storage error: {0}")]
    StorageError(String),

    /// Another stash operation holds the project lock
    #[error("Stash is locked: {0}")]
    Locked(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl StashError {
    /// True for errors raised before any state was touched
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidOptions(_) | Self::NoModifiedComponents | Self::EmptyStash
        )
    }
}
