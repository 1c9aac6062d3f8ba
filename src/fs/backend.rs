//! The storage backend contract consumed by the sync engine.
//!
//! One object-safe trait covers both the core byte-stream contract and the
//! extended operations; backends that cannot perform an extended operation
//! inherit the `NotSupported` default and advertise what they *can* do
//! through [`Features`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::fs::error::StorageError;

/// Backend capability flags, queried up front by the sync drivers to pick
/// server-side versus streaming paths.
#[derive(Debug, Clone, Default)]
pub struct Features {
    /// Same-backend server-side copy.
    pub can_copy: bool,
    /// Same-backend server-side move/rename.
    pub can_move: bool,
    /// Per-object stat (size, modtime, content type).
    pub can_stat: bool,
    /// Reader honors offset/limit without reading the whole object.
    pub can_range_read: bool,
    /// Listing restricted to a prefix without a full enumeration.
    pub can_list_prefix: bool,
    /// Readers and writers stream rather than buffering whole objects.
    pub can_stream: bool,
    /// Directory create/remove.
    pub can_mkdir: bool,
    /// Hash algorithms `checksum` can produce, e.g. `["blake3"]`.
    pub supported_hashes: Vec<&'static str>,
}

impl Features {
    /// Local filesystem feature set.
    pub fn local() -> Self {
        Self {
            can_copy: true,
            can_move: true,
            can_stat: true,
            can_range_read: true,
            can_list_prefix: true,
            can_stream: true,
            can_mkdir: true,
            supported_hashes: vec!["blake3"],
        }
    }

    /// In-memory store feature set.
    pub fn memory() -> Self {
        Self {
            can_copy: true,
            can_move: true,
            can_stat: true,
            can_range_read: true,
            can_list_prefix: true,
            can_stream: false,
            can_mkdir: false,
            supported_hashes: vec!["blake3"],
        }
    }

    pub fn supports_hash(&self, algo: &str) -> bool {
        self.supported_hashes.iter().any(|h| *h == algo)
    }
}

/// Metadata for one stored object.
#[derive(Debug, Clone, Default)]
pub struct ObjectStat {
    pub size: u64,
    pub modtime: Option<DateTime<Utc>>,
    pub is_dir: bool,
    pub content_type: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Options for `open_reader`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Byte offset to start reading from.
    pub offset: u64,
    /// Maximum number of bytes to yield; `None` reads to the end.
    pub limit: Option<u64>,
}

impl ReadOptions {
    pub fn range(offset: u64, limit: u64) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }
}

/// Options for `open_writer`.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub content_type: Option<String>,
    /// Modtime to stamp onto the finished object, when the backend can.
    pub modtime: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, String>,
}

/// A byte stream opened from a backend.
#[async_trait]
pub trait ObjectReader: Send + std::fmt::Debug {
    /// Read up to `buf.len()` bytes; `Ok(0)` means end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError>;
}

/// A byte sink opened on a backend. Nothing is observable on the backend
/// until `close()` returns; commit failures surface there.
#[async_trait]
pub trait ObjectWriter: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<(), StorageError>;

    /// Finalize the object.
    async fn close(self: Box<Self>) -> Result<(), StorageError>;
}

/// An addressable byte-object store.
///
/// Backends are assumed safe for concurrent reads and writes to distinct
/// paths; the sync drivers lean on that when fanning copies out over a
/// worker pool. Paths are forward-slash relative. The sync engine borrows
/// backends and never calls `close()` on them.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Open a byte stream over `path`. Fails with `NotFound` if absent.
    async fn open_reader(
        &self,
        path: &str,
        opts: ReadOptions,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ObjectReader>, StorageError>;

    /// Open a byte sink at `path`, replacing any existing object on commit.
    async fn open_writer(
        &self,
        path: &str,
        opts: WriteOptions,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ObjectWriter>, StorageError>;

    async fn exists(&self, path: &str, cancel: &CancellationToken) -> Result<bool, StorageError>;

    /// Delete `path`. Idempotent: a missing path is not an error.
    async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<(), StorageError>;

    /// Recursively list object paths under `prefix` (empty = everything),
    /// forward-slash relative to the backend root. Directories are not
    /// listed, only objects.
    async fn list(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, StorageError>;

    /// Release the backend. The sync engine never calls this.
    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    // Extended contract. Defaults refuse; `features()` advertises support.

    async fn stat(
        &self,
        _path: &str,
        _cancel: &CancellationToken,
    ) -> Result<ObjectStat, StorageError> {
        Err(StorageError::NotSupported("stat"))
    }

    /// blake3 hex digest of the object's content.
    async fn checksum(
        &self,
        _path: &str,
        _cancel: &CancellationToken,
    ) -> Result<String, StorageError> {
        Err(StorageError::NotSupported("checksum"))
    }

    /// Same-backend server-side copy.
    async fn copy(
        &self,
        _from: &str,
        _to: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        Err(StorageError::NotSupported("copy"))
    }

    /// Same-backend server-side move.
    async fn rename(
        &self,
        _from: &str,
        _to: &str,
        _cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        Err(StorageError::NotSupported("rename"))
    }

    async fn mkdir(&self, _path: &str, _cancel: &CancellationToken) -> Result<(), StorageError> {
        Err(StorageError::NotSupported("mkdir"))
    }

    async fn rmdir(&self, _path: &str, _cancel: &CancellationToken) -> Result<(), StorageError> {
        Err(StorageError::NotSupported("rmdir"))
    }

    fn features(&self) -> Features {
        Features::default()
    }

    /// Short provider label for logging.
    fn kind(&self) -> &'static str;
}

/// Join a base path and a relative path with forward slashes. Either side
/// may be empty.
pub fn join_path(base: &str, rel: &str) -> String {
    let base = base.trim_matches('/');
    let rel = rel.trim_matches('/');
    match (base.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{}/{}", base, rel),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("", "a.txt"), "a.txt");
        assert_eq!(join_path("base", "a.txt"), "base/a.txt");
        assert_eq!(join_path("base/", "/a.txt"), "base/a.txt");
        assert_eq!(join_path("base", ""), "base");
        assert_eq!(join_path("", ""), "");
    }

    #[test]
    fn test_default_features_refuse_everything() {
        let f = Features::default();
        assert!(!f.can_copy);
        assert!(!f.can_stat);
        assert!(f.supported_hashes.is_empty());
        assert!(!f.supports_hash("blake3"));
    }

    #[test]
    fn test_provider_features() {
        assert!(Features::local().can_mkdir);
        assert!(Features::local().supports_hash("blake3"));
        assert!(Features::memory().can_copy);
        assert!(!Features::memory().can_mkdir);
    }
}
