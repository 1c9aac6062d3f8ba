//! Canonical error taxonomy for storage backends.
//!
//! Backend implementations translate provider-level failures into these
//! variants at the boundary; anything without a canonical shape stays an
//! opaque `Io`/`Other` error and flows through the retry and result
//! machinery untouched.

use std::io;
use std::path::Path;

/// Errors surfaced by storage backends and the sync machinery built on them.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Access to the path was rejected.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Empty, absolute, or traversing (`..`) path, or a shape the backend rejects.
    #[error("invalid path: {0:?}")]
    InvalidPath(String),

    /// Operation on a backend after `close()`.
    #[error("backend is closed")]
    BackendClosed,

    /// Write on a writer after `close()`.
    #[error("writer is closed")]
    WriterClosed,

    /// Read on a reader after release.
    #[error("reader is closed")]
    ReaderClosed,

    /// Extended operation requested on a backend that cannot perform it.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// Factory lookup failed. Kept for callers that implement a registry.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    /// All retry attempts were consumed; `source()` is the last failure.
    #[error("giving up after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<StorageError>,
    },

    /// The caller's cancellation scope fired.
    #[error("operation cancelled")]
    Cancelled,

    /// Provider I/O failure without a canonical translation.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Anything else, preserved with context.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    /// Translate an `io::Error` for `path` into the canonical taxonomy.
    pub fn from_io(err: io::Error, path: &Path) -> Self {
        let display = path.display().to_string();
        match err.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound(display),
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied(display),
            _ => StorageError::Io(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }

    pub fn is_not_supported(&self) -> bool {
        matches!(self, StorageError::NotSupported(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StorageError::Cancelled)
    }
}

/// Reject empty, absolute, and traversing paths before they reach a provider.
pub fn validate_path(path: &str) -> Result<(), StorageError> {
    if path.is_empty() {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    if path.starts_with('/') || path.ends_with('/') {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    if path.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
        return Err(StorageError::InvalidPath(path.to_string()));
    }
    Ok(())
}
