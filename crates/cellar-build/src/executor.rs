//! The per-node build pipeline.
//!
//! `fetch -> verify -> patch -> recipe -> normalize -> publish`, all
//! inside a disposable working directory. Dependency install roots are
//! injected through the controlled environment and the
//! [`BuildContext`]; they are never mutated. No partial install root
//! is ever published: failure at any stage discards the holding
//! directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, info};

use cellar_core::{BuildContext, Descriptor, NormalizeStep, PackageName, RecipeError};
use cellar_store::{Cellar, Fingerprint, InstallRoot, Provenance};

use crate::error::{BuildError, BuildStage};
use crate::fetch::{verify_integrity, Fetcher};
use crate::patch::Patcher;
use crate::RunOptions;

/// Drives one descriptor through the build pipeline.
pub struct Executor<'a> {
    cellar: &'a Cellar,
    fetcher: &'a dyn Fetcher,
    patcher: &'a dyn Patcher,
    options: &'a RunOptions,
}

impl<'a> Executor<'a> {
    pub fn new(
        cellar: &'a Cellar,
        fetcher: &'a dyn Fetcher,
        patcher: &'a dyn Patcher,
        options: &'a RunOptions,
    ) -> Self {
        Executor {
            cellar,
            fetcher,
            patcher,
            options,
        }
    }

    /// Builds one node and publishes its install root.
    ///
    /// `dep_roots` maps every build-constraining dependency to its
    /// already-published install root.
    pub fn execute(
        &self,
        descriptor: &Descriptor,
        fingerprint: &Fingerprint,
        dep_roots: &BTreeMap<PackageName, PathBuf>,
    ) -> Result<InstallRoot, BuildError> {
        info!(package = %descriptor.id, %fingerprint, "building from source");
        let work = tempfile::tempdir().map_err(|e| BuildError::io(BuildStage::Fetch, e))?;

        // Fetch and pin the source before anything else touches it.
        let source_bytes =
            self.fetcher
                .fetch(&descriptor.source.locator)
                .map_err(|e| BuildError::Fetch {
                    locator: descriptor.source.locator.primary.clone(),
                    reason: e.to_string(),
                })?;
        verify_integrity(
            &source_bytes,
            &descriptor.source.integrity,
            &format!("{} source", descriptor.id),
        )?;

        let source_dir = work.path().join("src");
        fs::create_dir_all(&source_dir).map_err(|e| BuildError::io(BuildStage::Fetch, e))?;
        fs::write(
            source_dir.join(source_file_name(&descriptor.source.locator.primary)),
            &source_bytes,
        )
        .map_err(|e| BuildError::io(BuildStage::Fetch, e))?;

        // Patches apply strictly in declared order.
        for (index, patch) in descriptor.patches.iter().enumerate() {
            let patch_bytes =
                self.fetcher
                    .fetch(&patch.locator)
                    .map_err(|e| BuildError::Fetch {
                        locator: patch.locator.primary.clone(),
                        reason: e.to_string(),
                    })?;
            verify_integrity(
                &patch_bytes,
                &patch.integrity,
                &format!("{} patch #{index}", descriptor.id),
            )?;

            let target = match &patch.target_dir {
                Some(dir) => source_dir.join(dir),
                None => source_dir.clone(),
            };
            fs::create_dir_all(&target).map_err(|e| BuildError::io(BuildStage::Patch, e))?;
            debug!(package = %descriptor.id, patch = index, target = %target.display(), "applying patch");
            self.patcher
                .apply(&patch_bytes, &target)
                .map_err(|e| BuildError::Patch {
                    patch: patch.locator.primary.clone(),
                    reason: e.to_string(),
                })?;
        }

        // Holding directory lives under the cellar so publish can
        // rename it into place atomically.
        let staging = self.cellar.staging_dir().map_err(BuildError::Publish)?;

        let context = BuildContext {
            source_dir,
            work_dir: work.path().to_path_buf(),
            staging_dir: staging.path().to_path_buf(),
            dep_roots: dep_roots.clone(),
            args: descriptor.args.resolve(&self.options.platform),
            env: controlled_env(self.options, dep_roots),
        };
        descriptor.recipe.run(&context)?;

        if let Some(step) = &descriptor.normalize {
            step.apply(staging.path(), dep_roots)
                .map_err(|e| BuildError::Normalize(e.to_string()))?;
        }

        let root = self
            .cellar
            .publish(&descriptor.id, fingerprint, staging.path(), Provenance::Built)?;
        info!(package = %descriptor.id, path = %root.path.display(), "published install root");
        Ok(root)
    }
}

/// Builds the controlled process environment for a recipe: dependency
/// paths injected, nothing else implicitly inherited.
pub(crate) fn controlled_env(
    options: &RunOptions,
    dep_roots: &BTreeMap<PackageName, PathBuf>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    let mut path_entries: Vec<String> = dep_roots
        .values()
        .map(|root| root.join("bin").to_string_lossy().into_owned())
        .collect();
    path_entries.push("/usr/bin".into());
    path_entries.push("/bin".into());
    env.insert("PATH".into(), path_entries.join(":"));

    for (name, root) in dep_roots {
        env.insert(
            format!("CELLAR_DEP_{}", env_key(name)),
            root.to_string_lossy().into_owned(),
        );
    }

    if options.accept_licenses {
        env.insert("CELLAR_ACCEPT_LICENSES".into(), "1".into());
    }
    env.extend(options.env.clone());
    env
}

fn env_key(name: &PackageName) -> String {
    name.as_str()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn source_file_name(primary: &str) -> String {
    primary
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("source")
        .to_string()
}

/// Stock normalization step: regex rewrite of a generated config file
/// so it references installed dependency roots instead of build-time
/// paths.
///
/// The replacement template may contain `${dep:<name>}` placeholders,
/// expanded from the resolved dependency install roots before the
/// rewrite.
pub struct RewriteConfigPaths {
    /// File to rewrite, relative to the staging root.
    file: PathBuf,
    pattern: String,
    template: String,
}

impl RewriteConfigPaths {
    pub fn new(
        file: impl Into<PathBuf>,
        pattern: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        RewriteConfigPaths {
            file: file.into(),
            pattern: pattern.into(),
            template: template.into(),
        }
    }
}

impl NormalizeStep for RewriteConfigPaths {
    fn apply(
        &self,
        staging_dir: &Path,
        dep_roots: &BTreeMap<PackageName, PathBuf>,
    ) -> Result<(), RecipeError> {
        let regex = Regex::new(&self.pattern)
            .map_err(|e| RecipeError::Failed(format!("invalid rewrite pattern: {e}")))?;

        let mut replacement = self.template.clone();
        for (name, root) in dep_roots {
            replacement = replacement.replace(
                &format!("${{dep:{}}}", name.as_str()),
                &root.to_string_lossy(),
            );
        }

        let path = staging_dir.join(&self.file);
        let contents = fs::read_to_string(&path)?;
        let rewritten = regex.replace_all(&contents, regex::NoExpand(&replacement));
        fs::write(&path, rewritten.as_bytes())?;
        Ok(())
    }
}
