//! Cache fingerprints.
//!
//! A fingerprint identifies one cacheable build result: blake3 over the
//! descriptor's content hash, every resolved dependency's fingerprint,
//! and the platform-resolved build arguments. Composition is Merkle
//! style: changing a leaf dependency's content changes the fingerprint
//! of every transitive dependent and of nothing else.
//!
//! # Determinism
//!
//! Dependency pairs are sorted by name before hashing and graph-wide
//! fingerprinting walks the captured topological order, so the same
//! descriptor set always produces the same fingerprints regardless of
//! map iteration order.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use cellar_core::{BuildGraph, Descriptor, IntegrityHash, PackageId, PackageName, Platform};

use crate::error::StoreError;

/// Content+dependency hash identifying a cacheable build result.
///
/// Stored as `[u8; 32]` for blake3 portability; serialized as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Result<Self, StoreError> {
        let parsed = blake3::Hash::from_hex(hex)
            .map_err(|_| StoreError::InvalidFingerprint(hex.into()))?;
        Ok(Fingerprint(*parsed.as_bytes()))
    }

    /// Short prefix used in install-root directory names.
    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// Fingerprint of one node given its resolved inputs.
///
/// `deps` holds (name, fingerprint) pairs for every build-constraining
/// dependency; test-only dependencies do not affect the artifact and
/// are excluded by the caller.
pub fn descriptor_fingerprint(
    descriptor: &Descriptor,
    resolved_args: &[String],
    deps: &[(PackageName, Fingerprint)],
) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(descriptor.content_hash().as_bytes());

    let mut sorted: Vec<&(PackageName, Fingerprint)> = deps.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, fingerprint) in sorted {
        hasher.update(name.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(fingerprint.as_bytes());
    }

    for arg in resolved_args {
        hasher.update(arg.as_bytes());
        hasher.update(&[0]);
    }

    Fingerprint(*hasher.finalize().as_bytes())
}

/// Fingerprints every node of a resolved graph, providers first.
pub fn fingerprint_graph(
    graph: &BuildGraph,
    platform: &Platform,
) -> BTreeMap<PackageId, Fingerprint> {
    let mut fingerprints = BTreeMap::new();
    for id in graph.topo_order() {
        let descriptor = graph
            .descriptor(id)
            .expect("topo order only lists resolved nodes");
        let resolved_args = descriptor.args.resolve(platform);
        let deps: Vec<(PackageName, Fingerprint)> = graph
            .build_dependencies_of(id)
            .into_iter()
            .map(|dep| {
                let fp = fingerprints[&dep];
                (dep.name, fp)
            })
            .collect();
        fingerprints.insert(
            id.clone(),
            descriptor_fingerprint(descriptor, &resolved_args, &deps),
        );
    }
    fingerprints
}

/// Deterministic blake3 digest of a directory tree.
///
/// Walks entries sorted by file name and hashes relative paths plus
/// file contents (symlinks hash their target path). Used to pin bottle
/// payloads.
pub fn dir_hash(root: &Path) -> Result<IntegrityHash, StoreError> {
    let mut hasher = blake3::Hasher::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| StoreError::CorruptEntry {
            path: root.into(),
            reason: e.to_string(),
        })?;
        if entry.path() == root {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walkdir entries live under the walk root");
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let target = std::fs::read_link(entry.path())?;
            hasher.update(b"link:");
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_file() {
            hasher.update(&std::fs::read(entry.path())?);
        }
        hasher.update(&[0]);
    }
    Ok(IntegrityHash::from_bytes(*hasher.finalize().as_bytes()))
}
