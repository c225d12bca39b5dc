//! The build/check closure seam.
//!
//! The orchestration core never depends on what a recipe does
//! internally, only on its success/failure contract. Recipes receive a
//! [`BuildContext`] naming the disposable directories and the resolved
//! dependency install roots; dependency roots are read-only by contract.
//!
//! Blanket impls let plain closures act as recipes, which is how tests
//! and embedders usually provide them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::id::PackageName;

/// Errors a recipe invocation can surface.
#[derive(Debug, Error)]
pub enum RecipeError {
    /// An external build step exited non-zero.
    #[error("step '{step}' exited with status {status}")]
    ExitStatus { step: String, status: i32 },

    /// Recipe-internal failure with a free-form reason.
    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a build recipe may observe.
///
/// `dep_roots` maps dependency names to their published install roots.
/// `env` is the complete controlled environment for any spawned
/// process; nothing else is implicitly inherited.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Unpacked/fetched source tree, patches already applied.
    pub source_dir: PathBuf,
    /// Scratch space, discarded after the build.
    pub work_dir: PathBuf,
    /// Holding directory; its final contents become the install root.
    pub staging_dir: PathBuf,
    /// Resolved dependency install roots, read-only.
    pub dep_roots: BTreeMap<PackageName, PathBuf>,
    /// Platform-resolved build arguments, fixed at plan time.
    pub args: Vec<String>,
    /// Controlled process environment.
    pub env: BTreeMap<String, String>,
}

impl BuildContext {
    /// Install root of a named dependency, if resolved.
    pub fn dep_root(&self, name: &PackageName) -> Option<&Path> {
        self.dep_roots.get(name).map(PathBuf::as_path)
    }
}

/// Context for a post-install acceptance test.
#[derive(Debug, Clone)]
pub struct CheckContext {
    /// The published install root under test (read-only).
    pub install_root: PathBuf,
    /// Scratch space for the test run.
    pub work_dir: PathBuf,
    /// Install roots of the package's runtime and test dependencies,
    /// read-only.
    pub dep_roots: BTreeMap<PackageName, PathBuf>,
    /// Controlled process environment.
    pub env: BTreeMap<String, String>,
}

impl CheckContext {
    /// Install root of a named dependency, if resolved.
    pub fn dep_root(&self, name: &PackageName) -> Option<&Path> {
        self.dep_roots.get(name).map(PathBuf::as_path)
    }
}

/// A package's build closure.
pub trait BuildRecipe: Send + Sync {
    fn run(&self, ctx: &BuildContext) -> Result<(), RecipeError>;
}

impl<F> BuildRecipe for F
where
    F: Fn(&BuildContext) -> Result<(), RecipeError> + Send + Sync,
{
    fn run(&self, ctx: &BuildContext) -> Result<(), RecipeError> {
        self(ctx)
    }
}

/// A package's post-install test closure. Advisory: failures are
/// surfaced but never revert an installed artifact.
pub trait CheckRecipe: Send + Sync {
    fn run(&self, ctx: &CheckContext) -> Result<(), RecipeError>;
}

impl<F> CheckRecipe for F
where
    F: Fn(&CheckContext) -> Result<(), RecipeError> + Send + Sync,
{
    fn run(&self, ctx: &CheckContext) -> Result<(), RecipeError> {
        self(ctx)
    }
}

/// An output-normalization step run against the staged tree before
/// publish: symlink fix-ups, path rewrites in generated config files so
/// they reference installed dependency roots instead of build-time
/// temporary paths.
pub trait NormalizeStep: Send + Sync {
    fn apply(
        &self,
        staging_dir: &Path,
        dep_roots: &BTreeMap<PackageName, PathBuf>,
    ) -> Result<(), RecipeError>;
}

impl<F> NormalizeStep for F
where
    F: Fn(&Path, &BTreeMap<PackageName, PathBuf>) -> Result<(), RecipeError> + Send + Sync,
{
    fn apply(
        &self,
        staging_dir: &Path,
        dep_roots: &BTreeMap<PackageName, PathBuf>,
    ) -> Result<(), RecipeError> {
        self(staging_dir, dep_roots)
    }
}
