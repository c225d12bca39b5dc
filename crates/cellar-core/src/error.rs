//! Resolution-time error taxonomy.
//!
//! Every error here is fatal to the whole run and surfaces before any
//! build closure executes.

use thiserror::Error;

use crate::id::{PackageId, PackageName, Version};

/// Errors produced while validating identities or resolving a
/// descriptor set into a build graph.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Name failed the package-name alphabet check.
    #[error("invalid package name: '{name}'")]
    InvalidName { name: String },

    /// A hex string was not a valid blake3 digest.
    #[error("invalid integrity hash: '{hex}'")]
    InvalidHash { hex: String },

    /// A dependency reference could not be resolved to any descriptor.
    #[error("unknown dependency '{name}' required by {requested_by}")]
    UnknownDependency {
        name: PackageName,
        requested_by: PackageId,
    },

    /// Two edges require incompatible versions of one named dependency.
    #[error(
        "version conflict on '{name}': {requested_by} wants {wanted}, resolver supplies {available}"
    )]
    VersionConflict {
        name: PackageName,
        wanted: Version,
        available: Version,
        requested_by: PackageId,
    },

    /// Build-time/runtime edges form a cycle.
    #[error("dependency cycle: {}", .members.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" -> "))]
    Cycle { members: Vec<PackageId> },

    /// Two descriptors with the same identity entered one resolution.
    #[error("duplicate descriptor for {id}")]
    DuplicateDescriptor { id: PackageId },
}
