//! In-memory storage backend.
//!
//! Objects live in a sorted map behind an `RwLock`. The backend supports
//! the whole extended contract, which makes it the reference implementation
//! for contract tests and the cheapest pairing for sync-driver tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::fs::backend::{
    Backend, Features, ObjectReader, ObjectStat, ObjectWriter, ReadOptions, WriteOptions,
};
use crate::fs::error::{validate_path, StorageError};

#[derive(Clone)]
struct StoredObject {
    data: Arc<Vec<u8>>,
    modtime: DateTime<Utc>,
    content_type: Option<String>,
    metadata: HashMap<String, String>,
}

struct Inner {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    closed: AtomicBool,
}

impl Inner {
    fn ensure_open(&self, cancel: &CancellationToken) -> Result<(), StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::BackendClosed);
        }
        Ok(())
    }
}

/// An in-memory byte-object store.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                objects: RwLock::new(BTreeMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Store an object directly. Test and seeding convenience; real traffic
    /// goes through `open_writer`.
    pub fn insert(&self, path: &str, data: &[u8]) {
        self.insert_with_modtime(path, data, Utc::now());
    }

    pub fn insert_with_modtime(&self, path: &str, data: &[u8], modtime: DateTime<Utc>) {
        let mut objects = self.inner.objects.write().unwrap();
        objects.insert(
            path.to_string(),
            StoredObject {
                data: Arc::new(data.to_vec()),
                modtime,
                content_type: None,
                metadata: HashMap::new(),
            },
        );
    }

    /// Read an object's bytes directly. Test convenience.
    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        let objects = self.inner.objects.read().unwrap();
        objects.get(path).map(|o| o.data.as_ref().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct MemoryReader {
    data: Arc<Vec<u8>>,
    pos: usize,
    end: usize,
}

#[async_trait]
impl ObjectReader for MemoryReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let remaining = self.end - self.pos;
        let n = remaining.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

struct MemoryWriter {
    inner: Arc<Inner>,
    path: String,
    opts: WriteOptions,
    buf: Vec<u8>,
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<(), StorageError> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryWriter {
            inner,
            path,
            opts,
            buf,
        } = *self;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(StorageError::BackendClosed);
        }
        let object = StoredObject {
            data: Arc::new(buf),
            modtime: opts.modtime.unwrap_or_else(Utc::now),
            content_type: opts.content_type,
            metadata: opts.metadata,
        };
        inner.objects.write().unwrap().insert(path, object);
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn open_reader(
        &self,
        path: &str,
        opts: ReadOptions,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ObjectReader>, StorageError> {
        self.inner.ensure_open(cancel)?;
        validate_path(path)?;
        let objects = self.inner.objects.read().unwrap();
        let object = objects
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        let pos = (opts.offset as usize).min(object.data.len());
        let end = match opts.limit {
            Some(limit) => (pos + limit as usize).min(object.data.len()),
            None => object.data.len(),
        };
        Ok(Box::new(MemoryReader {
            data: Arc::clone(&object.data),
            pos,
            end,
        }))
    }

    async fn open_writer(
        &self,
        path: &str,
        opts: WriteOptions,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ObjectWriter>, StorageError> {
        self.inner.ensure_open(cancel)?;
        validate_path(path)?;
        Ok(Box::new(MemoryWriter {
            inner: Arc::clone(&self.inner),
            path: path.to_string(),
            opts,
            buf: Vec::new(),
        }))
    }

    async fn exists(&self, path: &str, cancel: &CancellationToken) -> Result<bool, StorageError> {
        self.inner.ensure_open(cancel)?;
        validate_path(path)?;
        Ok(self.inner.objects.read().unwrap().contains_key(path))
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<(), StorageError> {
        self.inner.ensure_open(cancel)?;
        validate_path(path)?;
        self.inner.objects.write().unwrap().remove(path);
        Ok(())
    }

    async fn list(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, StorageError> {
        self.inner.ensure_open(cancel)?;
        if !prefix.is_empty() {
            validate_path(prefix)?;
        }
        let objects = self.inner.objects.read().unwrap();
        let paths = objects
            .keys()
            .filter(|key| {
                prefix.is_empty()
                    || key.as_str() == prefix
                    || key.starts_with(&format!("{}/", prefix))
            })
            .cloned()
            .collect();
        Ok(paths)
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stat(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectStat, StorageError> {
        self.inner.ensure_open(cancel)?;
        validate_path(path)?;
        let objects = self.inner.objects.read().unwrap();
        let object = objects
            .get(path)
            .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
        Ok(ObjectStat {
            size: object.data.len() as u64,
            modtime: Some(object.modtime),
            is_dir: false,
            content_type: object.content_type.clone(),
            metadata: object.metadata.clone(),
        })
    }

    async fn checksum(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<String, StorageError> {
        self.inner.ensure_open(cancel)?;
        validate_path(path)?;
        let data = {
            let objects = self.inner.objects.read().unwrap();
            let object = objects
                .get(path)
                .ok_or_else(|| StorageError::NotFound(path.to_string()))?;
            Arc::clone(&object.data)
        };
        Ok(blake3::hash(&data).to_hex().to_string())
    }

    async fn copy(
        &self,
        from: &str,
        to: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        self.inner.ensure_open(cancel)?;
        validate_path(from)?;
        validate_path(to)?;
        let mut objects = self.inner.objects.write().unwrap();
        let object = objects
            .get(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?
            .clone();
        objects.insert(to.to_string(), object);
        Ok(())
    }

    async fn rename(
        &self,
        from: &str,
        to: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        self.inner.ensure_open(cancel)?;
        validate_path(from)?;
        validate_path(to)?;
        let mut objects = self.inner.objects.write().unwrap();
        let object = objects
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        objects.insert(to.to_string(), object);
        Ok(())
    }

    fn features(&self) -> Features {
        Features::memory()
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
