//! Stage-tagged build error taxonomy.
//!
//! Every `BuildError` is fatal to its node only: the node transitions
//! to `Failed`, its transitive dependents are skipped, and unrelated
//! subtrees keep building.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cellar_core::RecipeError;
use cellar_store::StoreError;

/// Pipeline stage in which a node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStage {
    Fetch,
    Integrity,
    Patch,
    Recipe,
    Normalize,
    Publish,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStage::Fetch => "fetch",
            BuildStage::Integrity => "integrity",
            BuildStage::Patch => "patch",
            BuildStage::Recipe => "recipe",
            BuildStage::Normalize => "normalize",
            BuildStage::Publish => "publish",
        };
        write!(f, "{name}")
    }
}

/// A node-local build failure.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Checksum mismatch on source or patch bytes. Never retried; the
    /// untrusted content is never handed to a build step.
    #[error("integrity mismatch for {what}: expected {expected}, got {actual}")]
    Integrity {
        what: String,
        expected: String,
        actual: String,
    },

    /// No locator candidate yielded the payload.
    #[error("fetch failed for '{locator}': {reason}")]
    Fetch { locator: String, reason: String },

    /// A patch failed to apply.
    #[error("patch '{patch}' failed: {reason}")]
    Patch { patch: String, reason: String },

    /// The build closure reported failure.
    #[error("recipe failed: {0}")]
    Recipe(#[from] RecipeError),

    /// An output-normalization step failed.
    #[error("normalization failed: {0}")]
    Normalize(String),

    /// The staged tree could not be published.
    #[error("publish failed: {0}")]
    Publish(#[from] StoreError),

    /// An I/O failure while arranging the working tree, tagged with
    /// the stage it interrupted.
    #[error("I/O error during {stage}: {source}")]
    Io {
        stage: BuildStage,
        source: std::io::Error,
    },
}

impl BuildError {
    /// Wraps an I/O error with the stage it interrupted.
    pub fn io(stage: BuildStage, source: std::io::Error) -> Self {
        BuildError::Io { stage, source }
    }

    /// The pipeline stage this error belongs to.
    pub fn stage(&self) -> BuildStage {
        match self {
            BuildError::Fetch { .. } => BuildStage::Fetch,
            BuildError::Integrity { .. } => BuildStage::Integrity,
            BuildError::Patch { .. } => BuildStage::Patch,
            BuildError::Recipe(_) => BuildStage::Recipe,
            BuildError::Normalize(_) => BuildStage::Normalize,
            BuildError::Publish(_) => BuildStage::Publish,
            BuildError::Io { stage, .. } => *stage,
        }
    }
}
