//! The cellar: on-disk store of published install roots.
//!
//! Layout contract: one top-level directory per package name, one entry
//! per `(version, fingerprint-prefix)`, immutable after publish. Each
//! entry carries a small JSON manifest recording its identity,
//! fingerprint, and provenance so the index can be rebuilt from disk.
//!
//! Publish is atomic: the staged tree is renamed into place, so a
//! concurrent dependent either sees the complete install root or
//! nothing. When two workers race to publish the same fingerprint,
//! exactly one rename wins and the loser resolves to the winner's root.

use std::fs;
use std::path::{Path, PathBuf};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::warn;

use cellar_core::PackageId;

use crate::error::StoreError;
use crate::fingerprint::Fingerprint;

const MANIFEST_FILE: &str = ".cellar-manifest.json";
const STAGING_DIR: &str = ".staging";

/// How an install root came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Built locally from source.
    Built,
    /// Pre-populated from a precomputed artifact.
    Bottled,
}

/// The immutable filesystem result of one successful build.
///
/// Referenced by dependents via path lookup, never copied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRoot {
    pub id: PackageId,
    pub path: PathBuf,
    pub provenance: Provenance,
}

#[derive(Serialize, Deserialize)]
struct Manifest {
    id: PackageId,
    fingerprint: Fingerprint,
    provenance: Provenance,
}

/// The artifact cache.
///
/// The only state mutated by multiple workers concurrently; all
/// mutations go through the atomic publish/lookup contract.
pub struct Cellar {
    root: PathBuf,
    index: DashMap<Fingerprint, InstallRoot>,
}

impl Cellar {
    /// Opens (creating if needed) a cellar and re-indexes existing
    /// entries from their manifests. Entries with a missing or
    /// unreadable manifest are skipped, not fatal.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR))?;

        let index = DashMap::new();
        for name_entry in fs::read_dir(&root)? {
            let name_dir = name_entry?.path();
            if !name_dir.is_dir() || name_dir.file_name() == Some(STAGING_DIR.as_ref()) {
                continue;
            }
            for entry in fs::read_dir(&name_dir)? {
                let entry_dir = entry?.path();
                if !entry_dir.is_dir() {
                    continue;
                }
                let manifest = match read_manifest(&entry_dir) {
                    Ok(manifest) => manifest,
                    Err(err) => {
                        warn!(path = %entry_dir.display(), error = %err, "skipping unreadable cellar entry");
                        continue;
                    }
                };
                index.insert(
                    manifest.fingerprint,
                    InstallRoot {
                        id: manifest.id,
                        path: entry_dir,
                        provenance: manifest.provenance,
                    },
                );
            }
        }

        Ok(Cellar { root, index })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// A disposable holding directory on the same filesystem as the
    /// cellar, suitable for atomic rename into place.
    pub fn staging_dir(&self) -> Result<TempDir, StoreError> {
        Ok(tempfile::Builder::new()
            .prefix("stage-")
            .tempdir_in(self.root.join(STAGING_DIR))?)
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<InstallRoot> {
        self.index.get(fingerprint).map(|entry| entry.clone())
    }

    /// Atomically publishes a staged tree as the install root for
    /// `fingerprint`.
    ///
    /// Either the full install root appears or nothing does. Racing
    /// publishers for one fingerprint converge on a single root.
    pub fn publish(
        &self,
        id: &PackageId,
        fingerprint: &Fingerprint,
        staging: &Path,
        provenance: Provenance,
    ) -> Result<InstallRoot, StoreError> {
        if let Some(existing) = self.lookup(fingerprint) {
            return Ok(existing);
        }

        let manifest = Manifest {
            id: id.clone(),
            fingerprint: *fingerprint,
            provenance,
        };
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        fs::write(staging.join(MANIFEST_FILE), manifest_json)?;

        let target = self.entry_path(id, fingerprint);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        match fs::rename(staging, &target) {
            Ok(()) => {
                let root = InstallRoot {
                    id: id.clone(),
                    path: target,
                    provenance,
                };
                self.index.insert(*fingerprint, root.clone());
                Ok(root)
            }
            Err(_) if target.exists() => {
                // A concurrent publisher won the rename. Adopt its root
                // and discard our staging tree.
                let winner = read_manifest(&target)?;
                if winner.fingerprint != *fingerprint {
                    return Err(StoreError::CorruptEntry {
                        path: target,
                        reason: format!(
                            "fingerprint mismatch: manifest {}, expected {}",
                            winner.fingerprint, fingerprint
                        ),
                    });
                }
                let _ = fs::remove_dir_all(staging);
                let root = InstallRoot {
                    id: winner.id,
                    path: target,
                    provenance: winner.provenance,
                };
                self.index.insert(*fingerprint, root.clone());
                Ok(root)
            }
            Err(err) => Err(StoreError::PublishFailed {
                id: id.clone(),
                reason: err.to_string(),
            }),
        }
    }

    /// Drops every entry for one identity, removing its trees from
    /// disk. Returns the number of entries removed.
    pub fn invalidate(&self, id: &PackageId) -> Result<usize, StoreError> {
        let stale: Vec<(Fingerprint, PathBuf)> = self
            .index
            .iter()
            .filter(|entry| entry.id == *id)
            .map(|entry| (*entry.key(), entry.path.clone()))
            .collect();
        for (fingerprint, path) in &stale {
            self.index.remove(fingerprint);
            fs::remove_dir_all(path)?;
        }
        Ok(stale.len())
    }

    fn entry_path(&self, id: &PackageId, fingerprint: &Fingerprint) -> PathBuf {
        self.root
            .join(id.name.as_str())
            .join(format!("{}-{}", id.version, fingerprint.short()))
    }
}

fn read_manifest(entry_dir: &Path) -> Result<Manifest, StoreError> {
    let path = entry_dir.join(MANIFEST_FILE);
    let bytes = fs::read(&path).map_err(|e| StoreError::CorruptEntry {
        path: entry_dir.into(),
        reason: format!("unreadable manifest: {e}"),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::CorruptEntry {
        path: entry_dir.into(),
        reason: format!("invalid manifest: {e}"),
    })
}
