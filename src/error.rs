//! Error handling for the forward-scanning engine
//!
//! Every failure is fail-fast: nothing in the scan retries a patch. Each variant
//! carries the path, region or chunk index needed to reproduce the failure
//! without rerunning the whole pipeline.

use std::path::{Path, PathBuf};

use crate::region::Region;

/// Result type for scanning and storage operations
pub type ScanResult<T> = Result<T, ScanError>;

/// Errors raised by storage, planning, blending and scanning
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Container missing, corrupt header or dtype mismatch
    #[error("storage error for {}: {reason}", .path.display())]
    Storage { path: PathBuf, reason: String },

    #[error("I/O error for {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Requested region exceeds the volume's declared shape
    #[error("region {region} is out of bounds for {} with shape {shape:?}", .path.display())]
    Bounds {
        path: PathBuf,
        region: Region,
        shape: Vec<usize>,
    },

    /// Output volume incompatible with the input volume or patch spec
    #[error("shape mismatch ({context}): expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// Some output voxel received zero total weight
    #[error("{uncovered} voxels in region {region} were never covered by a patch{} (first at {first:?})", chunk_suffix(.chunk))]
    IncompleteCoverage {
        chunk: Option<usize>,
        region: Region,
        uncovered: usize,
        first: Vec<usize>,
    },

    /// Opaque failure from the external inference call
    #[error("inference failed at patch origin {origin:?}{}: {source}", chunk_suffix(.chunk))]
    Inference {
        chunk: Option<usize>,
        origin: Vec<usize>,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("scanner cannot start from state {state}")]
    ScannerState { state: String },

    #[error("chunk {chunk} was cancelled before it started")]
    Cancelled { chunk: usize },
}

fn chunk_suffix(chunk: &Option<usize>) -> String {
    match chunk {
        Some(index) => format!(" in chunk {}", index),
        None => String::new(),
    }
}

impl ScanError {
    /// Chunk index the error is attributed to, if any
    pub fn chunk(&self) -> Option<usize> {
        match self {
            ScanError::IncompleteCoverage { chunk, .. } | ScanError::Inference { chunk, .. } => *chunk,
            ScanError::Cancelled { chunk } => Some(*chunk),
            _ => None,
        }
    }
}

/// Create a storage error
pub fn storage_error(path: impl AsRef<Path>, reason: impl Into<String>) -> ScanError {
    ScanError::Storage {
        path: path.as_ref().to_path_buf(),
        reason: reason.into(),
    }
}

/// Create a configuration error
pub fn invalid_config(reason: impl Into<String>) -> ScanError {
    ScanError::InvalidConfig {
        reason: reason.into(),
    }
}

/// Helper trait attaching a path to I/O failures
pub trait IoResultExt<T> {
    fn with_path(self, path: &Path) -> ScanResult<T>;
}

impl<T> IoResultExt<T> for Result<T, std::io::Error> {
    fn with_path(self, path: &Path) -> ScanResult<T> {
        self.map_err(|source| ScanError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}
