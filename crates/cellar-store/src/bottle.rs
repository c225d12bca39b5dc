//! Bottles: precomputed artifacts substituting for from-source builds.
//!
//! A bottle feed is keyed by (identity, fingerprint, platform tag) and
//! consumed read-only. A matching bottle is installed through the same
//! atomic publish path as a local build, with `Bottled` provenance, and
//! the package's build closure never runs.
//!
//! Payloads are ready-made directory trees pinned by a deterministic
//! directory hash.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use cellar_core::{IntegrityHash, PackageId};

use crate::cellar::{Cellar, InstallRoot, Provenance};
use crate::error::StoreError;
use crate::fingerprint::{dir_hash, Fingerprint};

/// One precomputed artifact: payload location plus integrity pin.
#[derive(Debug, Clone)]
pub struct Bottle {
    pub path: PathBuf,
    pub integrity: IntegrityHash,
}

/// A read-only source of precomputed artifacts.
pub trait BottleFeed: Send + Sync {
    /// The bottle for this exact (identity, fingerprint, platform tag),
    /// if the feed carries one.
    fn bottle(&self, id: &PackageId, fingerprint: &Fingerprint, platform_tag: &str)
        -> Option<Bottle>;
}

/// The empty feed: every lookup misses.
pub struct NoBottles;

impl BottleFeed for NoBottles {
    fn bottle(&self, _: &PackageId, _: &Fingerprint, _: &str) -> Option<Bottle> {
        None
    }
}

/// Feed over local directory payloads, for seeded installs and tests.
#[derive(Default)]
pub struct LocalBottleFeed {
    entries: HashMap<(PackageId, String), (Fingerprint, Bottle)>,
}

impl LocalBottleFeed {
    pub fn new() -> Self {
        LocalBottleFeed::default()
    }

    /// Registers a payload directory, pinning its current contents.
    pub fn insert_dir(
        &mut self,
        id: PackageId,
        platform_tag: impl Into<String>,
        fingerprint: Fingerprint,
        payload: impl Into<PathBuf>,
    ) -> Result<(), StoreError> {
        let path = payload.into();
        let integrity = dir_hash(&path)?;
        self.entries.insert(
            (id, platform_tag.into()),
            (fingerprint, Bottle { path, integrity }),
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl BottleFeed for LocalBottleFeed {
    fn bottle(
        &self,
        id: &PackageId,
        fingerprint: &Fingerprint,
        platform_tag: &str,
    ) -> Option<Bottle> {
        self.entries
            .get(&(id.clone(), platform_tag.to_string()))
            .filter(|(fp, _)| fp == fingerprint)
            .map(|(_, bottle)| bottle.clone())
    }
}

/// Verifies a bottle payload and publishes it as an install root.
///
/// The payload's directory hash must match the feed record; a mismatch
/// is fatal for this node and nothing is published.
pub fn install_bottle(
    cellar: &Cellar,
    id: &PackageId,
    fingerprint: &Fingerprint,
    bottle: &Bottle,
) -> Result<InstallRoot, StoreError> {
    let actual = dir_hash(&bottle.path)?;
    if actual != bottle.integrity {
        return Err(StoreError::BottleIntegrity {
            id: id.clone(),
            expected: bottle.integrity.to_hex(),
            actual: actual.to_hex(),
        });
    }

    let staging = cellar.staging_dir()?;
    copy_tree(&bottle.path, staging.path())?;
    cellar.publish(id, fingerprint, staging.path(), Provenance::Bottled)
}

/// Copies a payload tree into the staging directory.
fn copy_tree(from: &Path, to: &Path) -> Result<(), StoreError> {
    for entry in WalkDir::new(from).sort_by_file_name() {
        let entry = entry.map_err(|e| StoreError::CorruptEntry {
            path: from.into(),
            reason: e.to_string(),
        })?;
        if entry.path() == from {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(from)
            .expect("walkdir entries live under the walk root");
        let target = to.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            #[cfg(unix)]
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
            #[cfg(not(unix))]
            fs::copy(entry.path(), &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
