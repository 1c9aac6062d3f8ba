//! Local filesystem backend, rooted at a directory.
//!
//! Object paths are forward-slash relative to the root and validated before
//! touching the filesystem. Writers create missing parent directories and
//! stamp a preserved modtime on close.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::fs::backend::{
    Backend, Features, ObjectReader, ObjectStat, ObjectWriter, ReadOptions, WriteOptions,
};
use crate::fs::error::{validate_path, StorageError};

// Memory-map files below this size when hashing; larger ones stream.
const MMAP_THRESHOLD: u64 = 2 * 1024 * 1024 * 1024;

/// Storage backend over a local directory tree.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn full_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        validate_path(path)?;
        Ok(self.root.join(path))
    }

    fn check_cancel(cancel: &CancellationToken) -> Result<(), StorageError> {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LocalReader {
    file: tokio::fs::File,
    remaining: Option<u64>,
}

#[async_trait]
impl ObjectReader for LocalReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StorageError> {
        let want = match self.remaining {
            Some(0) => return Ok(0),
            Some(rem) => buf.len().min(rem as usize),
            None => buf.len(),
        };
        let n = self.file.read(&mut buf[..want]).await?;
        if let Some(rem) = self.remaining.as_mut() {
            *rem -= n as u64;
        }
        Ok(n)
    }
}

struct LocalWriter {
    file: tokio::fs::File,
    path: PathBuf,
    modtime: Option<DateTime<Utc>>,
}

#[async_trait]
impl ObjectWriter for LocalWriter {
    async fn write(&mut self, buf: &[u8]) -> Result<(), StorageError> {
        self.file.write_all(buf).await?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        let LocalWriter {
            mut file,
            path,
            modtime,
        } = *self;
        file.flush().await?;
        drop(file);
        if let Some(modtime) = modtime {
            let file = std::fs::OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| StorageError::from_io(e, &path))?;
            file.set_modified(SystemTime::from(modtime))
                .map_err(|e| StorageError::from_io(e, &path))?;
        }
        Ok(())
    }
}

/// Hash a file with blake3, memory-mapping when the file is small enough.
fn hash_local_file(path: &Path) -> Result<String, StorageError> {
    let file = std::fs::File::open(path).map_err(|e| StorageError::from_io(e, path))?;
    let len = file
        .metadata()
        .map_err(|e| StorageError::from_io(e, path))?
        .len();

    let mut hasher = blake3::Hasher::new();
    if len > 0 && len < MMAP_THRESHOLD {
        // SAFETY: the map is read-only and dropped before this fn returns;
        // concurrent truncation of a file under sync is already undefined
        // behavior at the engine level (source changing mid-copy).
        match unsafe { memmap2::Mmap::map(&file) } {
            Ok(mmap) => {
                if len > 128 * 1024 {
                    hasher.update_rayon(&mmap[..]);
                } else {
                    hasher.update(&mmap[..]);
                }
            }
            Err(_) => hash_buffered(&mut hasher, file, path)?,
        }
    } else if len > 0 {
        hash_buffered(&mut hasher, file, path)?;
    }
    Ok(hasher.finalize().to_hex().to_string())
}

fn hash_buffered(
    hasher: &mut blake3::Hasher,
    mut file: std::fs::File,
    path: &Path,
) -> Result<(), StorageError> {
    let mut buf = [0u8; 65536];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| StorageError::from_io(e, path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(())
}

/// Forward-slash render of a relative path.
fn slash_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl Backend for LocalBackend {
    async fn open_reader(
        &self,
        path: &str,
        opts: ReadOptions,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ObjectReader>, StorageError> {
        Self::check_cancel(cancel)?;
        let full = self.full_path(path)?;
        let mut file = tokio::fs::File::open(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))?;
        if opts.offset > 0 {
            file.seek(std::io::SeekFrom::Start(opts.offset))
                .await
                .map_err(|e| StorageError::from_io(e, &full))?;
        }
        Ok(Box::new(LocalReader {
            file,
            remaining: opts.limit,
        }))
    }

    async fn open_writer(
        &self,
        path: &str,
        opts: WriteOptions,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn ObjectWriter>, StorageError> {
        Self::check_cancel(cancel)?;
        let full = self.full_path(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(e, parent))?;
        }
        let file = tokio::fs::File::create(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))?;
        Ok(Box::new(LocalWriter {
            file,
            path: full,
            modtime: opts.modtime,
        }))
    }

    async fn exists(&self, path: &str, cancel: &CancellationToken) -> Result<bool, StorageError> {
        Self::check_cancel(cancel)?;
        let full = self.full_path(path)?;
        Ok(tokio::fs::try_exists(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))?)
    }

    async fn delete(&self, path: &str, cancel: &CancellationToken) -> Result<(), StorageError> {
        Self::check_cancel(cancel)?;
        let full = self.full_path(path)?;
        let result = match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&full).await,
            Ok(_) => tokio::fs::remove_file(&full).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::from_io(e, &full)),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::from_io(e, &full)),
        }
    }

    async fn list(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, StorageError> {
        Self::check_cancel(cancel)?;
        let base = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.full_path(prefix)?
        };
        match tokio::fs::metadata(&base).await {
            Ok(meta) if !meta.is_dir() => return Ok(vec![prefix.to_string()]),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::from_io(e, &base)),
        }

        let root = self.root.clone();
        let paths = tokio::task::spawn_blocking(move || {
            let mut paths = Vec::new();
            for entry in jwalk::WalkDir::new(&base)
                .skip_hidden(false)
                .follow_links(false)
            {
                let entry = entry.map_err(|e| {
                    StorageError::Other(anyhow::anyhow!("walk failed under {base:?}: {e}"))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if let Ok(rel) = path.strip_prefix(&root) {
                    paths.push(slash_path(rel));
                }
            }
            Ok::<_, StorageError>(paths)
        })
        .await
        .map_err(|e| StorageError::Other(anyhow::anyhow!("walk task failed: {e}")))??;
        Ok(paths)
    }

    async fn stat(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<ObjectStat, StorageError> {
        Self::check_cancel(cancel)?;
        let full = self.full_path(path)?;
        let meta = tokio::fs::metadata(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))?;
        let modtime = meta.modified().ok().map(DateTime::<Utc>::from);
        Ok(ObjectStat {
            size: meta.len(),
            modtime,
            is_dir: meta.is_dir(),
            content_type: None,
            metadata: Default::default(),
        })
    }

    async fn checksum(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<String, StorageError> {
        Self::check_cancel(cancel)?;
        let full = self.full_path(path)?;
        tokio::task::spawn_blocking(move || hash_local_file(&full))
            .await
            .map_err(|e| StorageError::Other(anyhow::anyhow!("hash task failed: {e}")))?
    }

    async fn copy(
        &self,
        from: &str,
        to: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        Self::check_cancel(cancel)?;
        let src = self.full_path(from)?;
        let dst = self.full_path(to)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(e, parent))?;
        }
        tokio::fs::copy(&src, &dst)
            .await
            .map_err(|e| StorageError::from_io(e, &src))?;
        Ok(())
    }

    async fn rename(
        &self,
        from: &str,
        to: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StorageError> {
        Self::check_cancel(cancel)?;
        let src = self.full_path(from)?;
        let dst = self.full_path(to)?;
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(e, parent))?;
        }
        tokio::fs::rename(&src, &dst)
            .await
            .map_err(|e| StorageError::from_io(e, &src))?;
        Ok(())
    }

    async fn mkdir(&self, path: &str, cancel: &CancellationToken) -> Result<(), StorageError> {
        Self::check_cancel(cancel)?;
        let full = self.full_path(path)?;
        tokio::fs::create_dir_all(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))?;
        Ok(())
    }

    async fn rmdir(&self, path: &str, cancel: &CancellationToken) -> Result<(), StorageError> {
        Self::check_cancel(cancel)?;
        let full = self.full_path(path)?;
        tokio::fs::remove_dir(&full)
            .await
            .map_err(|e| StorageError::from_io(e, &full))?;
        Ok(())
    }

    fn features(&self) -> Features {
        Features::local()
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}
