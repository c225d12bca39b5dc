//! The immutable in-memory representation of one package formula.
//!
//! A [`Descriptor`] carries everything the orchestration core needs to
//! build a package: source locator plus integrity hash, tagged
//! dependency references, ordered patch records, a platform-conditional
//! argument table, and the build/check closures. Descriptor parsing
//! from any textual format is an external collaborator's job; this core
//! consumes the structured records directly.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::{PackageId, PackageName, Version};
use crate::platform::{ArgRule, ArgTable, PlatformPredicate};
use crate::recipe::{BuildRecipe, CheckRecipe, NormalizeStep};

/// A blake3 digest pinning fetched bytes.
///
/// Serialized as lowercase hex for readable manifests.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntegrityHash([u8; 32]);

impl IntegrityHash {
    /// Digest of a byte payload.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        IntegrityHash(*blake3::hash(bytes).as_bytes())
    }

    /// Wraps an already-computed digest.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        IntegrityHash(bytes)
    }

    pub fn from_hex(hex: &str) -> Result<Self, CoreError> {
        let parsed = blake3::Hash::from_hex(hex)
            .map_err(|_| CoreError::InvalidHash { hex: hex.into() })?;
        Ok(IntegrityHash(*parsed.as_bytes()))
    }

    pub fn to_hex(self) -> String {
        blake3::Hash::from_bytes(self.0).to_hex().to_string()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Constant-size comparison against a payload's digest.
    pub fn matches(&self, bytes: &[u8]) -> bool {
        blake3::hash(bytes) == blake3::Hash::from_bytes(self.0)
    }
}

impl fmt::Display for IntegrityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for IntegrityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntegrityHash({})", self.to_hex())
    }
}

impl Serialize for IntegrityHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for IntegrityHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        IntegrityHash::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

/// A download location with ordered fallback mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub primary: String,
    #[serde(default)]
    pub mirrors: Vec<String>,
}

impl Locator {
    pub fn new(primary: impl Into<String>) -> Self {
        Locator {
            primary: primary.into(),
            mirrors: Vec::new(),
        }
    }

    pub fn with_mirror(mut self, mirror: impl Into<String>) -> Self {
        self.mirrors.push(mirror.into());
        self
    }

    /// Primary first, then mirrors in declared order.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary.as_str()).chain(self.mirrors.iter().map(String::as_str))
    }
}

/// Source locator plus the integrity hash fetched bytes must match
/// before any build step runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub locator: Locator,
    pub integrity: IntegrityHash,
}

impl SourceSpec {
    pub fn new(locator: Locator, integrity: IntegrityHash) -> Self {
        SourceSpec { locator, integrity }
    }
}

/// One patch: locator, integrity hash, and the source subdirectory it
/// applies to (`None` = source root). Patches apply strictly in
/// declared order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub locator: Locator,
    pub integrity: IntegrityHash,
    #[serde(default)]
    pub target_dir: Option<PathBuf>,
}

impl PatchRecord {
    pub fn new(locator: Locator, integrity: IntegrityHash) -> Self {
        PatchRecord {
            locator,
            integrity,
            target_dir: None,
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.target_dir = Some(dir.into());
        self
    }
}

/// Relationship kind of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Needed only while building the consumer.
    Build,
    /// Needed while building and at run time.
    Runtime,
    /// Included at the resolver's discretion; behaves like `Runtime`
    /// once present in the graph.
    Optional,
    /// Needed only by the post-install test closure. Never constrains
    /// acyclicity or build readiness.
    Test,
}

impl DependencyKind {
    /// Whether an edge of this kind gates building the consumer.
    pub fn constrains_build(self) -> bool {
        !matches!(self, DependencyKind::Test)
    }
}

/// A reference from a consumer descriptor to a provider by name.
///
/// `when` gates the reference on platform facts; non-matching
/// references are dropped before edge creation. `version` of `None`
/// accepts whatever concrete version the resolver supplies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRef {
    pub name: PackageName,
    #[serde(default)]
    pub version: Option<Version>,
    pub kind: DependencyKind,
    #[serde(default)]
    pub when: PlatformPredicate,
}

impl DependencyRef {
    pub fn new(name: PackageName, kind: DependencyKind) -> Self {
        DependencyRef {
            name,
            version: None,
            kind,
            when: PlatformPredicate::Always,
        }
    }

    pub fn pinned(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    pub fn when(mut self, predicate: PlatformPredicate) -> Self {
        self.when = predicate;
        self
    }
}

/// Declarative record of one buildable package.
///
/// Immutable once constructed; shared via `Arc` between the graph,
/// the scheduler, and worker threads.
pub struct Descriptor {
    pub id: PackageId,
    pub source: SourceSpec,
    pub dependencies: Vec<DependencyRef>,
    pub patches: Vec<PatchRecord>,
    pub args: ArgTable,
    /// The build closure must not run concurrently with other exclusive
    /// closures (e.g. an install step that is not parallel-safe).
    pub exclusive_build: bool,
    /// Not linked into the shared prefix; the reason is surfaced in
    /// run reports.
    pub keg_only: Option<String>,
    pub recipe: Arc<dyn BuildRecipe>,
    pub check: Option<Arc<dyn CheckRecipe>>,
    pub normalize: Option<Arc<dyn NormalizeStep>>,
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("dependencies", &self.dependencies)
            .field("patches", &self.patches)
            .field("args", &self.args)
            .field("exclusive_build", &self.exclusive_build)
            .field("keg_only", &self.keg_only)
            .field("check", &self.check.is_some())
            .field("normalize", &self.normalize.is_some())
            .finish()
    }
}

impl Descriptor {
    pub fn new(id: PackageId, source: SourceSpec, recipe: Arc<dyn BuildRecipe>) -> Self {
        Descriptor {
            id,
            source,
            dependencies: Vec::new(),
            patches: Vec::new(),
            args: ArgTable::new(),
            exclusive_build: false,
            keg_only: None,
            recipe,
            check: None,
            normalize: None,
        }
    }

    pub fn with_dependency(mut self, dep: DependencyRef) -> Self {
        self.dependencies.push(dep);
        self
    }

    pub fn with_patch(mut self, patch: PatchRecord) -> Self {
        self.patches.push(patch);
        self
    }

    pub fn with_args(mut self, rule: ArgRule) -> Self {
        self.args.push(rule);
        self
    }

    pub fn exclusive_build(mut self) -> Self {
        self.exclusive_build = true;
        self
    }

    pub fn keg_only(mut self, reason: impl Into<String>) -> Self {
        self.keg_only = Some(reason.into());
        self
    }

    pub fn with_check(mut self, check: Arc<dyn CheckRecipe>) -> Self {
        self.check = Some(check);
        self
    }

    pub fn with_normalize(mut self, step: Arc<dyn NormalizeStep>) -> Self {
        self.normalize = Some(step);
        self
    }

    /// Content hash of everything that defines this package's build:
    /// identity, source and patch integrity, dependency references, and
    /// the argument table. Closures are opaque and deliberately
    /// excluded; the declared inputs above are their fingerprintable
    /// surface.
    pub fn content_hash(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.id.name.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.id.version.as_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.source.integrity.as_bytes());
        for patch in &self.patches {
            hasher.update(patch.integrity.as_bytes());
            if let Some(dir) = &patch.target_dir {
                hasher.update(dir.to_string_lossy().as_bytes());
            }
            hasher.update(&[0]);
        }
        // Vec-based types serialize deterministically.
        let deps = serde_json::to_vec(&self.dependencies)
            .expect("DependencyRef serialization should never fail");
        hasher.update(&deps);
        let args =
            serde_json::to_vec(&self.args).expect("ArgTable serialization should never fail");
        hasher.update(&args);
        hasher.update(&[self.exclusive_build as u8]);
        hasher.finalize()
    }
}

/// The resolver collaborator: fetches transitively referenced
/// descriptors by name. One concrete version per name.
pub trait DescriptorSource {
    fn descriptor(&self, name: &PackageName) -> Option<Arc<Descriptor>>;
}

/// Descriptor source backed by a plain map, for embedding and tests.
#[derive(Default)]
pub struct InMemorySource {
    by_name: HashMap<PackageName, Arc<Descriptor>>,
}

impl InMemorySource {
    pub fn new() -> Self {
        InMemorySource::default()
    }

    /// Registers a descriptor, returning the shared handle.
    ///
    /// Replaces any previous descriptor with the same name; one
    /// concrete version per name is the source's contract.
    pub fn insert(&mut self, descriptor: Descriptor) -> Arc<Descriptor> {
        let arc = Arc::new(descriptor);
        self.by_name.insert(arc.id.name.clone(), Arc::clone(&arc));
        arc
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl DescriptorSource for InMemorySource {
    fn descriptor(&self, name: &PackageName) -> Option<Arc<Descriptor>> {
        self.by_name.get(name).cloned()
    }
}
