//! Core data model for the cellar build-orchestration engine.
//!
//! This crate defines the immutable package descriptor, the typed
//! dependency references connecting descriptors, and the dependency
//! graph builder that turns a requested descriptor set into a build
//! DAG with cycle and version-conflict detection.
//!
//! # Modules
//!
//! - [`id`] -- `PackageName`/`Version`/`PackageId` identity newtypes
//! - [`platform`] -- platform facts, predicates, and arg tables
//! - [`recipe`] -- build/check closure traits and their contexts
//! - [`descriptor`] -- the declarative package record and resolver seam
//! - [`graph`] -- the build DAG and its resolution algorithm
//! - [`error`] -- resolution-time error taxonomy

pub mod descriptor;
pub mod error;
pub mod graph;
pub mod id;
pub mod platform;
pub mod recipe;

pub use descriptor::{
    DependencyKind, DependencyRef, Descriptor, DescriptorSource, InMemorySource, IntegrityHash,
    Locator, PatchRecord, SourceSpec,
};
pub use error::CoreError;
pub use graph::BuildGraph;
pub use id::{PackageId, PackageName, Version};
pub use platform::{Arch, ArgRule, ArgTable, Platform, PlatformPredicate};
pub use recipe::{BuildContext, BuildRecipe, CheckContext, CheckRecipe, NormalizeStep, RecipeError};
