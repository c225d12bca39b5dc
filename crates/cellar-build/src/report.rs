//! Per-node run outcomes.
//!
//! A run report lists every node the scheduler considered, in
//! dependency order, with the outcome it reached. Reports serialize to
//! JSON as a list rather than a map so package identities stay
//! structured.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cellar_core::PackageId;
use cellar_store::{Fingerprint, Provenance};

use crate::error::BuildStage;
use crate::verifier::TestReport;

/// Terminal outcome of one graph node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// An install root exists for the node's fingerprint, whether
    /// freshly built, unpacked from a bottle, or already cached.
    Installed {
        provenance: Provenance,
        path: PathBuf,
    },
    /// The node's own pipeline failed at the named stage.
    Failed { stage: BuildStage, reason: String },
    /// Never attempted. `due_to` names the failed dependency, or is
    /// `None` when the run was cancelled.
    Skipped { due_to: Option<PackageId> },
}

impl NodeOutcome {
    pub fn is_installed(&self) -> bool {
        matches!(self, NodeOutcome::Installed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeReport {
    pub id: PackageId,
    pub fingerprint: Fingerprint,
    pub outcome: NodeOutcome,
    /// Keg-only reason, for operators: the root is not meant to be
    /// linked into a shared prefix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keg_only: Option<String>,
}

/// Everything one scheduler run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// The identities the run was asked to install.
    pub roots: Vec<PackageId>,
    /// One entry per graph node, providers first.
    pub nodes: Vec<NodeReport>,
    /// Advisory post-install check results.
    pub tests: Vec<TestReport>,
}

impl RunReport {
    /// True when every requested root reached an install root.
    pub fn success(&self) -> bool {
        self.roots
            .iter()
            .all(|root| self.outcome(root).is_some_and(NodeOutcome::is_installed))
    }

    pub fn outcome(&self, id: &PackageId) -> Option<&NodeOutcome> {
        self.nodes
            .iter()
            .find(|node| &node.id == id)
            .map(|node| &node.outcome)
    }

    pub fn test_outcome(&self, id: &PackageId) -> Option<&TestReport> {
        self.tests.iter().find(|test| &test.id == id)
    }

    pub fn installed(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|node| node.outcome.is_installed())
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, json)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(io::Error::other)
    }
}
