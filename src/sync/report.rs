//! Result types produced by the sync, bisync, and check drivers.
//!
//! Reports are owned exclusively by the caller once a driver returns.

use std::fmt;
use std::time::Duration;

use crate::fs::error::StorageError;
use crate::sync::scan::FileInfo;

/// One per-path failure, accumulated instead of aborting the run.
#[derive(Debug)]
pub struct FileError {
    pub path: String,
    pub op: &'static str,
    pub error: StorageError,
}

impl FileError {
    pub fn new(path: impl Into<String>, op: &'static str, error: StorageError) -> Self {
        Self {
            path: path.into(),
            op,
            error,
        }
    }
}

impl fmt::Display for FileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}: {}", self.op, self.path, self.error)
    }
}

/// Outcome of a one-way sync.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub copied: usize,
    pub updated: usize,
    pub deleted: usize,
    pub skipped: usize,
    pub errors: Vec<FileError>,
    pub bytes_transferred: u64,
    pub duration: Duration,
    pub dry_run: bool,
}

impl SyncReport {
    /// Callers should check this rather than relying solely on the
    /// returned error.
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Copy/update accounting for one direction of a bisync.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectionCounts {
    pub copied: usize,
    pub updated: usize,
    pub bytes: u64,
}

/// One divergent path observed during bisync.
#[derive(Debug, Clone)]
pub struct Conflict {
    pub path: String,
    pub a: FileInfo,
    pub b: FileInfo,
    /// Resolution label, e.g. `newer-wins:b`; `None` when unresolved.
    pub resolution: Option<String>,
}

/// Outcome of a bidirectional sync.
#[derive(Debug, Default)]
pub struct BisyncReport {
    /// Transfers that landed on side B.
    pub to_b: DirectionCounts,
    /// Transfers that landed on side A.
    pub to_a: DirectionCounts,
    pub skipped: usize,
    pub conflicts: Vec<Conflict>,
    pub errors: Vec<FileError>,
    pub duration: Duration,
    pub dry_run: bool,
}

impl BisyncReport {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.to_a.bytes + self.to_b.bytes
    }
}

/// Outcome of a verification pass.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub matched: Vec<String>,
    pub differ: Vec<String>,
    pub src_only: Vec<String>,
    pub dst_only: Vec<String>,
    pub errors: Vec<FileError>,
}

impl CheckReport {
    /// True when nothing differs and neither side has extras.
    pub fn in_sync(&self) -> bool {
        self.differ.is_empty() && self.src_only.is_empty() && self.dst_only.is_empty()
    }

    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}
