//! Store error types.

use std::path::PathBuf;

use thiserror::Error;

use cellar_core::PackageId;

/// Errors from the cellar and its bottle feeds.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An on-disk entry is missing or has an unreadable manifest.
    #[error("corrupt cellar entry at {path}: {reason}")]
    CorruptEntry { path: PathBuf, reason: String },

    /// Atomic publish could not complete and no prior winner exists.
    #[error("publish failed for {id}: {reason}")]
    PublishFailed { id: PackageId, reason: String },

    /// A bottle payload's directory hash did not match its feed record.
    #[error("bottle integrity mismatch for {id}: expected {expected}, got {actual}")]
    BottleIntegrity {
        id: PackageId,
        expected: String,
        actual: String,
    },

    #[error("invalid fingerprint: '{0}'")]
    InvalidFingerprint(String),
}
