//! Sync configuration and progress reporting types.

use std::collections::HashMap;
use std::sync::Arc;

use crate::sync::compare::ComparePolicy;
use crate::sync::filter::Filter;
use crate::sync::retry::RetryConfig;
use crate::sync::throttle::BandwidthLimit;

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Which source attributes a copy carries onto the destination object.
///
/// Modtime preservation is on by default: the default comparator treats
/// modtimes more than a second apart as divergent, so a copy that stamped
/// the destination with the transfer time would re-copy every unchanged
/// file on the next run.
#[derive(Debug, Clone, Copy)]
pub struct PreserveMetadata {
    pub content_type: bool,
    pub modtime: bool,
    pub custom: bool,
}

impl Default for PreserveMetadata {
    fn default() -> Self {
        Self {
            content_type: true,
            modtime: true,
            custom: false,
        }
    }
}

/// Sync lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Scanning,
    Comparing,
    Transferring,
    Deleting,
    Complete,
}

/// Snapshot handed to the progress callback. Invocations are serialized by
/// the driver; the callback must be fast and re-entrant.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    pub phase: Phase,
    pub current_file: String,
    pub files_transferred: usize,
    pub total_files: usize,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub files_deleted: usize,
    pub errors: usize,
}

pub type ProgressFn = Arc<dyn Fn(&Progress) + Send + Sync>;

/// Bare phase-boundary event, used before a driver has per-file counts.
pub(crate) fn emit_phase(progress: &Option<ProgressFn>, phase: Phase) {
    if let Some(callback) = progress {
        callback(&Progress {
            phase,
            ..Default::default()
        });
    }
}

/// One-way sync configuration. Passed by value per invocation.
#[derive(Clone, Default)]
pub struct SyncOptions {
    /// Mirror mode: delete paths present only in the destination.
    pub delete_extra: bool,
    /// Plan but do not mutate either side.
    pub dry_run: bool,
    /// Prefer hash equality when both sides expose a hash.
    pub checksum: bool,
    /// Compare by size only.
    pub size_only: bool,
    pub ignore_size: bool,
    pub ignore_time: bool,
    /// Count existing destination files as skipped, never updated.
    pub ignore_existing: bool,
    /// Abort the copy phase once this many errors accumulate; 0 = unlimited.
    pub max_errors: usize,
    /// Worker count; 0 falls back to [`DEFAULT_CONCURRENCY`].
    pub concurrency: usize,
    pub filter: Option<Filter>,
    /// Bytes/sec shared across all workers; unlimited by default.
    pub bandwidth_limit: BandwidthLimit,
    /// Retry policy wrapping each per-file copy attempt.
    pub retry: Option<RetryConfig>,
    pub preserve: PreserveMetadata,
    pub progress: Option<ProgressFn>,
}

impl SyncOptions {
    pub fn workers(&self) -> usize {
        if self.concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            self.concurrency
        }
    }

    pub fn policy(&self) -> ComparePolicy {
        ComparePolicy {
            size_only: self.size_only,
            checksum: self.checksum,
            ignore_size: self.ignore_size,
            ignore_time: self.ignore_time,
        }
    }

    /// Build options from an untyped string map. Unknown keys are ignored
    /// and malformed values fall back to their defaults; both behaviors
    /// are intentional so partially-populated maps stay usable.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut opts = Self::default();
        opts.delete_extra = parse_bool(map.get("delete_extra")).unwrap_or(opts.delete_extra);
        opts.dry_run = parse_bool(map.get("dry_run")).unwrap_or(opts.dry_run);
        opts.checksum = parse_bool(map.get("checksum")).unwrap_or(opts.checksum);
        opts.size_only = parse_bool(map.get("size_only")).unwrap_or(opts.size_only);
        opts.ignore_size = parse_bool(map.get("ignore_size")).unwrap_or(opts.ignore_size);
        opts.ignore_time = parse_bool(map.get("ignore_time")).unwrap_or(opts.ignore_time);
        opts.ignore_existing =
            parse_bool(map.get("ignore_existing")).unwrap_or(opts.ignore_existing);
        opts.max_errors = parse_usize(map.get("max_errors")).unwrap_or(opts.max_errors);
        opts.concurrency = parse_usize(map.get("concurrency")).unwrap_or(opts.concurrency);
        if let Some(rate) = parse_u64(map.get("bandwidth_limit")) {
            opts.bandwidth_limit = BandwidthLimit::new(rate);
        }
        opts
    }
}

pub(crate) fn parse_bool(value: Option<&String>) -> Option<bool> {
    match value?.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_usize(value: Option<&String>) -> Option<usize> {
    value?.trim().parse().ok()
}

pub(crate) fn parse_u64(value: Option<&String>) -> Option<u64> {
    value?.trim().parse().ok()
}
