//! Checkout options and conflict policy

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StashError;

/// How to settle a file both sides changed differently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Keep the working-tree content
    Ours,
    /// Take the stashed content
    Theirs,
    /// Write conflict markers into the file
    Manual,
}

impl FromStr for MergeStrategy {
    type Err = StashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ours" => Ok(Self::Ours),
            "theirs" => Ok(Self::Theirs),
            "manual" => Ok(Self::Manual),
            _ => Err(StashError::InvalidOptions(
                "--auto-merge-resolve must be one of the following: [ours, theirs, manual]"
                    .to_string(),
            )),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ours => "ours",
            Self::Theirs => "theirs",
            Self::Manual => "manual",
        })
    }
}

/// Options for restoring a stash entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckoutOptions {
    pub merge_strategy: Option<MergeStrategy>,
    /// Do not merge, preserve local files as is
    pub force_ours: bool,
    /// Do not merge, overwrite with stashed files
    pub force_theirs: bool,
}

impl CheckoutOptions {
    /// Build options from raw command-line flags
    ///
    /// `manual` overrides `auto_merge_resolve`. The strategy name is checked
    /// even when `manual` is set.
    pub fn from_flags(
        auto_merge_resolve: Option<&str>,
        manual: bool,
        force_ours: bool,
        force_theirs: bool,
    ) -> Result<Self, StashError> {
        let mut merge_strategy = auto_merge_resolve
            .map(str::parse::<MergeStrategy>)
            .transpose()?;
        if manual {
            merge_strategy = Some(MergeStrategy::Manual);
        }

        let options = Self {
            merge_strategy,
            force_ours,
            force_theirs,
        };
        options.policy()?;
        Ok(options)
    }

    /// Validate and collapse the flags into a single policy
    pub fn policy(&self) -> Result<ConflictPolicy, StashError> {
        match (self.force_ours, self.force_theirs) {
            (true, true) => Err(StashError::InvalidOptions(
                "please use either --force-ours or --force-theirs, not both".to_string(),
            )),
            (true, false) => Ok(ConflictPolicy::ForceOurs),
            (false, true) => Ok(ConflictPolicy::ForceTheirs),
            (false, false) => Ok(self
                .merge_strategy
                .map_or(ConflictPolicy::Unset, ConflictPolicy::Strategy)),
        }
    }
}

/// Validated conflict policy; force variants bypass merging entirely
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    ForceOurs,
    ForceTheirs,
    Strategy(MergeStrategy),
    /// Report conflicts without touching the files
    Unset,
}
