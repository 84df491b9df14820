//! # Stow
//!
//! Stash engine for versioned components - put modified work aside, bring it
//! back later.
//!
//! This crate provides:
//! - Snapshots of uncommitted component changes, stored as an ordered stack
//! - Reverting stashed components to their resolved version
//! - Restoring the latest stash with a per-file three-way merge
//! - Conflict policies: ours, theirs, manual markers, or report only
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                  StashManager                    │
//! │                                                  │
//! │   save ──► SnapshotBuilder ──► StashStack.push   │
//! │                                                  │
//! │   load ──► StashStack.peek                       │
//! │              │                                   │
//! │              ▼                                   │
//! │  ┌────────────────────────────────────────────┐  │
//! │  │  MergeResolver   base / ours / theirs      │  │
//! │  └────────────────────────────────────────────┘  │
//! │              │                                   │
//! │              ▼                                   │
//! │  ┌────────────────────────────────────────────┐  │
//! │  │  CheckoutApplier  atomic per-file writes   │  │
//! │  └────────────────────────────────────────────┘  │
//! │              │                                   │
//! │              ▼                                   │
//! │        StashStack.pop (only if no conflicts)     │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use stow::{CheckoutOptions, DirWorkspace, StashConfig, StashManager};
//!
//! let config = StashConfig::for_root(&root);
//! let manager = StashManager::open(config, DirWorkspace::new(&root)).await?;
//!
//! // Stash every modified component
//! let ids = manager.save(None, Some("wip".to_string())).await?;
//!
//! // Bring it back, writing markers on conflict
//! let options = CheckoutOptions::from_flags(Some("manual"), false, false, false)?;
//! let report = manager.load_latest(options).await?;
//! ```

pub mod checkout;
pub mod entry;
pub mod error;
pub mod lock;
pub mod manager;
pub mod merge;
pub mod options;
pub mod snapshot;
pub mod storage;
pub mod workspace;

pub use checkout::{ApplyStats, CheckoutApplier};
pub use entry::{ComponentId, FileDelta, FileSet, StashEntry, StashId, StashItem, StashMeta, VersionRef};
pub use error::StashError;
pub use manager::{LoadReport, StashConfig, StashManager};
pub use merge::{FileMerge, MergeOutcome, MergeResolver};
pub use options::{CheckoutOptions, ConflictPolicy, MergeStrategy};
pub use snapshot::SnapshotBuilder;
pub use storage::{StashStack, StashStorage};
pub use workspace::{DirWorkspace, Workspace};
