// SPDX-License-Identifier: GPL-2.0-only
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors from disk overlay operations.
#[derive(Debug)]
pub enum OverlayError {
    /// The base image does not exist or is inaccessible
    NotFound(String),
    /// An overlay already exists at the destination
    AlreadyExists(String),
    /// The image tool did not finish in time and was killed
    Timeout(Duration),
    /// The image tool ran and reported failure
    Command(String),
    /// Filesystem operation failed
    Io(String),
}

impl std::fmt::Display for OverlayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverlayError::NotFound(e) => write!(f, "not found: {e}"),
            OverlayError::AlreadyExists(e) => write!(f, "already exists: {e}"),
            OverlayError::Timeout(d) => write!(f, "overlay creation timed out after {}s", d.as_secs()),
            OverlayError::Command(e) => write!(f, "image tool failed: {e}"),
            OverlayError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for OverlayError {}

/// An overlay written by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayInfo {
    pub path: PathBuf,
    pub base: PathBuf,
    /// Virtual size requested for the overlay, if any
    pub size: Option<String>,
}

/// Copy-on-write disk overlays anchored to a read-only base image.
///
/// The qemu-img implementation writes qcow2 files; tests use an in-memory
/// fake from `test_support`.
pub trait OverlayBackend {
    /// Create an overlay at `dest` backed by `base`.
    ///
    /// Refuses to overwrite an existing `dest`. On failure nothing is left
    /// behind at `dest`.
    fn create_overlay(
        &self,
        base: &Path,
        dest: &Path,
        size: Option<&str>,
    ) -> Result<OverlayInfo, OverlayError>;

    /// Remove an overlay. Returns false if there was nothing to remove.
    fn delete_overlay(&self, path: &Path) -> Result<bool, OverlayError>;
}
