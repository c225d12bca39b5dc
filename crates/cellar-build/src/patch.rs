//! Patch application seam.
//!
//! Patch bytes are integrity-verified by the executor before they
//! reach a [`Patcher`]. The stock implementation shells out to
//! `patch(1)`; tests substitute in-process patchers.

use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchApplyError {
    #[error("patch exited with status {0}")]
    ExitStatus(i32),

    #[error("patch process terminated by signal")]
    Terminated,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Applies verified patch bytes to a target directory.
pub trait Patcher: Send + Sync {
    fn apply(&self, patch: &[u8], target_dir: &Path) -> Result<(), PatchApplyError>;
}

/// Patcher shelling out to `patch(1)` with unified-diff input on
/// stdin.
pub struct ProcessPatcher {
    /// `-p` strip level.
    pub strip: u32,
}

impl Default for ProcessPatcher {
    fn default() -> Self {
        ProcessPatcher { strip: 1 }
    }
}

impl Patcher for ProcessPatcher {
    fn apply(&self, patch: &[u8], target_dir: &Path) -> Result<(), PatchApplyError> {
        let mut child = Command::new("patch")
            .arg(format!("-p{}", self.strip))
            .arg("--directory")
            .arg(target_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(patch)?;
        }
        let status = child.wait()?;
        if status.success() {
            Ok(())
        } else {
            match status.code() {
                Some(code) => Err(PatchApplyError::ExitStatus(code)),
                None => Err(PatchApplyError::Terminated),
            }
        }
    }
}

impl<F> Patcher for F
where
    F: Fn(&[u8], &Path) -> Result<(), PatchApplyError> + Send + Sync,
{
    fn apply(&self, patch: &[u8], target_dir: &Path) -> Result<(), PatchApplyError> {
        self(patch, target_dir)
    }
}
