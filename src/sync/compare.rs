//! File comparison policies.
//!
//! `needs_update` drives the one-way and bidirectional planners;
//! `files_match` drives verification, falling back to a streaming
//! byte-wise compare when a checksum comparison was requested but neither
//! side can produce a hash.

use futures::future::try_join;
use tokio_util::sync::CancellationToken;

use crate::fs::backend::{Backend, ObjectReader, ReadOptions};
use crate::fs::error::StorageError;
use crate::sync::scan::FileInfo;

/// Modtime comparisons tolerate this much skew, absorbing filesystem
/// timestamp quantization.
pub const MODTIME_TOLERANCE_MS: i64 = 1_000;

const COMPARE_CHUNK: usize = 64 * 1024;

/// Which criteria participate in a comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComparePolicy {
    pub size_only: bool,
    pub checksum: bool,
    pub ignore_size: bool,
    pub ignore_time: bool,
}

/// True when the modtimes are both known and more than the tolerance
/// apart. An unknown modtime on either side never forces an update.
pub fn modtimes_differ(a: &FileInfo, b: &FileInfo) -> bool {
    match (a.modtime, b.modtime) {
        (Some(a), Some(b)) => (a - b).num_milliseconds().abs() > MODTIME_TOLERANCE_MS,
        _ => false,
    }
}

/// Decide whether `dst` must be overwritten with `src`.
pub fn needs_update(src: &FileInfo, dst: &FileInfo, policy: &ComparePolicy) -> bool {
    if policy.size_only {
        return src.size != dst.size;
    }
    if policy.checksum {
        if let (Some(src_hash), Some(dst_hash)) = (&src.hash, &dst.hash) {
            return src_hash != dst_hash;
        }
    }
    if !policy.ignore_size && src.size != dst.size {
        return true;
    }
    if !policy.ignore_time && modtimes_differ(src, dst) {
        return true;
    }
    false
}

async fn read_full(
    reader: &mut Box<dyn ObjectReader>,
    buf: &mut [u8],
) -> Result<usize, StorageError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Stream both objects in parallel 64 KiB chunks and compare byte-wise,
/// short-circuiting on the first mismatch or length disagreement.
pub async fn contents_equal(
    src: &dyn Backend,
    src_path: &str,
    dst: &dyn Backend,
    dst_path: &str,
    cancel: &CancellationToken,
) -> Result<bool, StorageError> {
    let mut src_reader = src.open_reader(src_path, ReadOptions::default(), cancel).await?;
    let mut dst_reader = dst.open_reader(dst_path, ReadOptions::default(), cancel).await?;
    let mut src_buf = vec![0u8; COMPARE_CHUNK];
    let mut dst_buf = vec![0u8; COMPARE_CHUNK];
    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let (src_n, dst_n) = try_join(
            read_full(&mut src_reader, &mut src_buf),
            read_full(&mut dst_reader, &mut dst_buf),
        )
        .await?;
        if src_n != dst_n || src_buf[..src_n] != dst_buf[..dst_n] {
            return Ok(false);
        }
        if src_n == 0 {
            return Ok(true);
        }
    }
}

/// Verification-time match test. Preference order: size (unless ignored),
/// then hashes when a checksum comparison was requested and both sides
/// have one, then streamed bytes for checksum mode without hashes, then
/// modtime within tolerance.
pub async fn files_match(
    src: &dyn Backend,
    src_path: &str,
    src_info: &FileInfo,
    dst: &dyn Backend,
    dst_path: &str,
    dst_info: &FileInfo,
    policy: &ComparePolicy,
    cancel: &CancellationToken,
) -> Result<bool, StorageError> {
    if !policy.ignore_size && src_info.size != dst_info.size {
        return Ok(false);
    }
    if policy.checksum {
        if let (Some(src_hash), Some(dst_hash)) = (&src_info.hash, &dst_info.hash) {
            return Ok(src_hash == dst_hash);
        }
        return contents_equal(src, src_path, dst, dst_path, cancel).await;
    }
    if !policy.ignore_time && modtimes_differ(src_info, dst_info) {
        return Ok(false);
    }
    Ok(true)
}
