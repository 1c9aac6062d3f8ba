//! Subtree scanner: materializes a backend subtree as comparator-visible
//! [`FileInfo`] records.

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::fs::backend::Backend;
use crate::fs::error::StorageError;
use crate::sync::filter::Filter;

/// One scanned object, path relative to the scan base in forward-slash
/// form. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub modtime: Option<DateTime<Utc>>,
    pub hash: Option<String>,
    pub is_dir: bool,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            modtime: None,
            hash: None,
            is_dir: false,
        }
    }

    pub fn with_modtime(mut self, modtime: DateTime<Utc>) -> Self {
        self.modtime = Some(modtime);
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = Some(hash.into());
        self
    }
}

/// List `base` on `backend` and stat each entry where the backend can.
/// With `want_hash`, checksums are computed for backends that support one.
/// The filter applies to files only; directory entries always survive the
/// scan and are dropped later during planning.
///
/// Scan failures are fatal: the sync drivers cannot plan against a partial
/// listing. The only tolerated race is an entry vanishing between list and
/// stat, which drops the entry.
pub async fn scan(
    backend: &dyn Backend,
    base: &str,
    filter: Option<&Filter>,
    want_hash: bool,
    cancel: &CancellationToken,
) -> Result<Vec<FileInfo>, StorageError> {
    let features = backend.features();
    let hash_supported = want_hash && !features.supported_hashes.is_empty();
    let strip = if base.is_empty() {
        String::new()
    } else {
        format!("{}/", base.trim_matches('/'))
    };

    let listed = backend.list(base, cancel).await?;
    let mut files = Vec::with_capacity(listed.len());
    for full in listed {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let rel = full
            .strip_prefix(strip.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| full.clone());

        let mut info = FileInfo::new(rel, 0);
        if features.can_stat {
            match backend.stat(&full, cancel).await {
                Ok(stat) => {
                    info.size = stat.size;
                    info.modtime = stat.modtime;
                    info.is_dir = stat.is_dir;
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) if e.is_not_supported() => {}
                Err(e) => return Err(e),
            }
        }
        if hash_supported && !info.is_dir {
            match backend.checksum(&full, cancel).await {
                Ok(hash) => info.hash = Some(hash),
                Err(e) if e.is_not_found() => continue,
                Err(e) if e.is_not_supported() => {}
                Err(e) => return Err(e),
            }
        }
        if !info.is_dir {
            if let Some(filter) = filter {
                if !filter.matches(&info) {
                    continue;
                }
            }
        }
        files.push(info);
    }
    debug!(
        backend = backend.kind(),
        base,
        files = files.len(),
        "scan complete"
    );
    Ok(files)
}
