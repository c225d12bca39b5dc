//! Artifact cache for the cellar build-orchestration engine.
//!
//! Maps (descriptor content, resolved dependency fingerprints, build
//! configuration) to published install roots, with atomic publish
//! semantics and bottle (precomputed artifact) pre-population.
//!
//! # Modules
//!
//! - [`fingerprint`] -- blake3 cache keys and graph-wide fingerprinting
//! - [`cellar`] -- the on-disk install-root store
//! - [`bottle`] -- precomputed-artifact feeds
//! - [`error`] -- store error types

pub mod bottle;
pub mod cellar;
pub mod error;
pub mod fingerprint;

pub use bottle::{install_bottle, Bottle, BottleFeed, LocalBottleFeed, NoBottles};
pub use cellar::{Cellar, InstallRoot, Provenance};
pub use error::StoreError;
pub use fingerprint::{descriptor_fingerprint, dir_hash, fingerprint_graph, Fingerprint};
