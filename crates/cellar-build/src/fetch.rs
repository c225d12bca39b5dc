//! Locator fetching with ordered mirror fallback.
//!
//! The engine never interprets locator strings itself; a [`Fetcher`]
//! implementation maps each candidate to bytes. The provided
//! [`Fetcher::fetch`] walks a locator's candidates (primary first,
//! then mirrors in declared order) and returns the first success.

use std::collections::HashMap;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use cellar_core::{IntegrityHash, Locator};

use crate::error::BuildError;

#[derive(Debug, Error)]
pub enum FetchError {
    /// A single candidate could not be fetched.
    #[error("cannot fetch '{candidate}': {reason}")]
    Candidate { candidate: String, reason: String },

    /// Primary and every mirror failed.
    #[error("all candidates failed for '{primary}', last: {last}")]
    Exhausted { primary: String, last: String },
}

/// Maps locator candidates to byte payloads.
pub trait Fetcher: Send + Sync {
    /// Fetches one candidate.
    fn fetch_candidate(&self, candidate: &str) -> Result<Vec<u8>, FetchError>;

    /// Fetches a locator, falling back through mirrors in declared
    /// order.
    fn fetch(&self, locator: &Locator) -> Result<Vec<u8>, FetchError> {
        let mut last = None;
        for candidate in locator.candidates() {
            match self.fetch_candidate(candidate) {
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    debug!(candidate, error = %err, "locator candidate failed");
                    last = Some(err);
                }
            }
        }
        Err(FetchError::Exhausted {
            primary: locator.primary.clone(),
            last: last.map(|e| e.to_string()).unwrap_or_default(),
        })
    }
}

/// Fetcher over the local filesystem; candidates are paths, optionally
/// relative to a base directory.
pub struct FsFetcher {
    base: Option<PathBuf>,
}

impl FsFetcher {
    pub fn new() -> Self {
        FsFetcher { base: None }
    }

    pub fn rooted_at(base: impl Into<PathBuf>) -> Self {
        FsFetcher {
            base: Some(base.into()),
        }
    }
}

impl Default for FsFetcher {
    fn default() -> Self {
        FsFetcher::new()
    }
}

impl Fetcher for FsFetcher {
    fn fetch_candidate(&self, candidate: &str) -> Result<Vec<u8>, FetchError> {
        let path = match &self.base {
            Some(base) => base.join(candidate),
            None => PathBuf::from(candidate),
        };
        std::fs::read(&path).map_err(|e| FetchError::Candidate {
            candidate: candidate.into(),
            reason: e.to_string(),
        })
    }
}

/// In-memory fetcher keyed by candidate string, for embedding and
/// tests.
#[derive(Default)]
pub struct MemoryFetcher {
    payloads: HashMap<String, Vec<u8>>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        MemoryFetcher::default()
    }

    pub fn insert(&mut self, candidate: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.payloads.insert(candidate.into(), bytes.into());
    }
}

impl Fetcher for MemoryFetcher {
    fn fetch_candidate(&self, candidate: &str) -> Result<Vec<u8>, FetchError> {
        self.payloads
            .get(candidate)
            .cloned()
            .ok_or_else(|| FetchError::Candidate {
                candidate: candidate.into(),
                reason: "no payload registered".into(),
            })
    }
}

/// Checks fetched bytes against their declared integrity hash.
///
/// A mismatch is fatal and the bytes must never reach a build step.
pub fn verify_integrity(
    bytes: &[u8],
    expected: &IntegrityHash,
    what: &str,
) -> Result<(), BuildError> {
    if expected.matches(bytes) {
        Ok(())
    } else {
        Err(BuildError::Integrity {
            what: what.into(),
            expected: expected.to_hex(),
            actual: IntegrityHash::of_bytes(bytes).to_hex(),
        })
    }
}
