//! Build execution for the cellar orchestration engine.
//!
//! This crate drives a resolved [`cellar_core::BuildGraph`] to
//! completion: fingerprinting, cache/bottle pre-population, sandboxed
//! per-node builds on a worker pool, failure propagation, and advisory
//! post-install verification.
//!
//! # Modules
//!
//! - [`error`] -- stage-tagged build error taxonomy
//! - [`fetch`] -- locator fetching with mirror fallback
//! - [`patch`] -- patch application seam
//! - [`executor`] -- the fetch/verify/patch/build/normalize/publish pipeline
//! - [`scheduler`] -- dependency-ordered parallel dispatch
//! - [`verifier`] -- post-install acceptance tests
//! - [`report`] -- per-node run outcomes

pub mod error;
pub mod executor;
pub mod fetch;
pub mod patch;
pub mod report;
pub mod scheduler;
pub mod verifier;

pub use error::{BuildError, BuildStage};
pub use executor::{Executor, RewriteConfigPaths};
pub use fetch::{FetchError, Fetcher, FsFetcher, MemoryFetcher};
pub use patch::{Patcher, ProcessPatcher};
pub use report::{NodeOutcome, NodeReport, RunReport};
pub use scheduler::{CancelToken, NodeState, Scheduler};
pub use verifier::{TestOutcome, TestReport, Verifier};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use cellar_core::Platform;

/// Run-scoped configuration, threaded explicitly into every closure
/// invocation rather than read from ambient state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    /// Target platform; fixes predicate evaluation for the whole run.
    pub platform: Platform,

    /// Worker-pool concurrency limit.
    pub jobs: usize,

    /// Whether the operator has accepted source licenses up front
    /// (exposed to recipes as `CELLAR_ACCEPT_LICENSES=1`).
    pub accept_licenses: bool,

    /// Extra environment entries merged into every controlled recipe
    /// environment.
    pub env: BTreeMap<String, String>,
}

impl RunOptions {
    pub fn new(platform: Platform) -> Self {
        RunOptions {
            platform,
            jobs: 4,
            accept_licenses: false,
            env: BTreeMap::new(),
        }
    }

    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs;
        self
    }

    pub fn accept_licenses(mut self) -> Self {
        self.accept_licenses = true;
        self
    }
}
