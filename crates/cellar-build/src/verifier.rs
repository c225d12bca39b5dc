//! Post-install acceptance tests.
//!
//! Check recipes run against the published install root in a fresh
//! working directory, with the package's runtime and test dependency
//! roots resolved. Their results are advisory: a failed check is
//! recorded in the run report but never unpublishes the root or fails
//! the run.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cellar_core::{CheckContext, CheckRecipe, Descriptor, PackageName};
use cellar_store::InstallRoot;

use crate::executor::controlled_env;
use crate::RunOptions;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TestOutcome {
    Passed,
    Failed { reason: String },
}

/// Result of one package's check recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub id: cellar_core::PackageId,
    pub outcome: TestOutcome,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.outcome == TestOutcome::Passed
    }
}

/// Runs check recipes against installed roots.
pub struct Verifier<'a> {
    options: &'a RunOptions,
}

impl<'a> Verifier<'a> {
    pub fn new(options: &'a RunOptions) -> Self {
        Verifier { options }
    }

    /// Runs the descriptor's check recipe, if it has one.
    ///
    /// `dep_roots` maps the package's runtime and test dependencies to
    /// their install roots. Returns `None` for packages without checks.
    pub fn verify(
        &self,
        descriptor: &Descriptor,
        root: &InstallRoot,
        dep_roots: &BTreeMap<PackageName, PathBuf>,
    ) -> Option<TestReport> {
        let check = descriptor.check.as_ref()?;
        let outcome = match self.run_check(check.as_ref(), &root.path, dep_roots) {
            Ok(()) => {
                info!(package = %descriptor.id, "post-install check passed");
                TestOutcome::Passed
            }
            Err(reason) => {
                warn!(package = %descriptor.id, %reason, "post-install check failed");
                TestOutcome::Failed { reason }
            }
        };
        Some(TestReport {
            id: descriptor.id.clone(),
            outcome,
        })
    }

    fn run_check(
        &self,
        check: &dyn CheckRecipe,
        install_root: &Path,
        dep_roots: &BTreeMap<PackageName, PathBuf>,
    ) -> Result<(), String> {
        let work = tempfile::tempdir().map_err(|e| e.to_string())?;
        let context = CheckContext {
            install_root: install_root.to_path_buf(),
            work_dir: work.path().to_path_buf(),
            dep_roots: dep_roots.clone(),
            env: controlled_env(self.options, dep_roots),
        };
        check.run(&context).map_err(|e| e.to_string())
    }
}
