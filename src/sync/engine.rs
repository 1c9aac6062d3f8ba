//! One-way sync driver.
//!
//! Three-phase pipeline: scan both sides, plan copy/update/delete action
//! sets, then execute copies through a bounded worker pool and deletions
//! sequentially. Per-file failures accumulate in the report; scan failures
//! are fatal because the driver cannot plan against a partial listing.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fs::backend::{join_path, Backend, ObjectReader, ReadOptions, WriteOptions};
use crate::fs::error::StorageError;
use crate::sync::compare::needs_update;
use crate::sync::options::{emit_phase, Phase, PreserveMetadata, Progress, ProgressFn, SyncOptions};
use crate::sync::report::{FileError, SyncReport};
use crate::sync::retry::{retry, RetryConfig};
use crate::sync::scan::{scan, FileInfo};
use crate::sync::throttle::{ThrottledReader, TokenBucket, RATE_LIMIT_CHUNK};

#[derive(Debug, Clone)]
struct CopyItem {
    path: String,
    size: u64,
    update: bool,
}

#[derive(Debug, Default)]
struct Plan {
    copies: Vec<CopyItem>,
    deletes: Vec<String>,
    skipped: usize,
}

impl Plan {
    fn new_count(&self) -> usize {
        self.copies.iter().filter(|c| !c.update).count()
    }

    fn update_count(&self) -> usize {
        self.copies.len() - self.new_count()
    }
}

fn build_plan(src_files: &[FileInfo], dst_files: &[FileInfo], opts: &SyncOptions) -> Plan {
    let policy = opts.policy();
    let mut dst_by_path: HashMap<&str, &FileInfo> = dst_files
        .iter()
        .map(|f| (f.path.as_str(), f))
        .collect();
    let mut plan = Plan::default();

    for src in src_files {
        let dst = dst_by_path.remove(src.path.as_str());
        // Directories are never enqueued; writers create parents.
        if src.is_dir {
            continue;
        }
        match dst {
            None => plan.copies.push(CopyItem {
                path: src.path.clone(),
                size: src.size,
                update: false,
            }),
            Some(dst) => {
                if opts.ignore_existing {
                    plan.skipped += 1;
                } else if needs_update(src, dst, &policy) {
                    plan.copies.push(CopyItem {
                        path: src.path.clone(),
                        size: src.size,
                        update: true,
                    });
                } else {
                    plan.skipped += 1;
                }
            }
        }
    }

    if opts.delete_extra {
        plan.deletes = dst_by_path
            .values()
            .filter(|f| !f.is_dir)
            .map(|f| f.path.clone())
            .collect();
        plan.deletes.sort();
    }
    plan
}

/// Counters and error sink shared by every worker of one invocation.
struct TransferState {
    copied: AtomicUsize,
    updated: AtomicUsize,
    deleted: AtomicUsize,
    bytes: AtomicU64,
    errors: Mutex<Vec<FileError>>,
    max_errors: usize,
    cancel: CancellationToken,
    total_files: usize,
    total_bytes: u64,
    progress_fn: Option<ProgressFn>,
    progress_lock: Mutex<()>,
}

impl TransferState {
    fn emit(&self, phase: Phase, current_file: &str) {
        let Some(callback) = &self.progress_fn else {
            return;
        };
        // One callback at a time; snapshots are taken under the same lock.
        let _guard = self.progress_lock.lock().unwrap();
        let snapshot = Progress {
            phase,
            current_file: current_file.to_string(),
            files_transferred: self.copied.load(Ordering::SeqCst)
                + self.updated.load(Ordering::SeqCst),
            total_files: self.total_files,
            bytes_transferred: self.bytes.load(Ordering::SeqCst),
            total_bytes: self.total_bytes,
            files_deleted: self.deleted.load(Ordering::SeqCst),
            errors: self.errors.lock().unwrap().len(),
        };
        callback(&snapshot);
    }

    fn record_error(&self, path: &str, op: &'static str, error: StorageError) {
        warn!(path, op, %error, "file operation failed");
        let count = {
            let mut errors = self.errors.lock().unwrap();
            errors.push(FileError::new(path, op, error));
            errors.len()
        };
        if self.max_errors > 0 && count >= self.max_errors {
            info!(errors = count, "error budget exhausted, aborting");
            self.cancel.cancel();
        }
    }
}

/// One-way sync driver over a pair of borrowed backends.
pub struct SyncEngine {
    source: Arc<dyn Backend>,
    dest: Arc<dyn Backend>,
    opts: SyncOptions,
}

impl SyncEngine {
    pub fn new(source: Arc<dyn Backend>, dest: Arc<dyn Backend>, opts: SyncOptions) -> Self {
        Self { source, dest, opts }
    }

    /// Synchronize `src_base` on the source into `dst_base` on the
    /// destination.
    ///
    /// Scan and plan failures return `Err`. Once the transfer phase starts
    /// the driver always returns a report; per-file failures (including
    /// cancellation of in-flight copies) accumulate in `errors`, and
    /// success is `report.success()`.
    pub async fn sync(
        &self,
        src_base: &str,
        dst_base: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let started = Instant::now();
        // Child scope: `max_errors` aborts through the same mechanism as
        // caller cancellation without cancelling the caller's token.
        let cancel_scope = cancel.child_token();

        emit_phase(&self.opts.progress, Phase::Scanning);
        let src_files = scan(
            self.source.as_ref(),
            src_base,
            self.opts.filter.as_ref(),
            self.opts.checksum,
            &cancel_scope,
        )
        .await
        .context("failed to scan source")?;
        let dst_files = scan(
            self.dest.as_ref(),
            dst_base,
            self.opts.filter.as_ref(),
            self.opts.checksum,
            &cancel_scope,
        )
        .await
        .context("failed to scan destination")?;

        emit_phase(&self.opts.progress, Phase::Comparing);
        let plan = build_plan(&src_files, &dst_files, &self.opts);
        info!(
            source = self.source.kind(),
            dest = self.dest.kind(),
            new = plan.new_count(),
            updates = plan.update_count(),
            deletes = plan.deletes.len(),
            skipped = plan.skipped,
            dry_run = self.opts.dry_run,
            "sync planned"
        );

        if self.opts.dry_run {
            emit_phase(&self.opts.progress, Phase::Complete);
            return Ok(SyncReport {
                copied: plan.new_count(),
                updated: plan.update_count(),
                deleted: plan.deletes.len(),
                skipped: plan.skipped,
                errors: Vec::new(),
                bytes_transferred: 0,
                duration: started.elapsed(),
                dry_run: true,
            });
        }

        let total_bytes: u64 = plan.copies.iter().map(|c| c.size).sum();
        let shared = Arc::new(TransferState {
            copied: AtomicUsize::new(0),
            updated: AtomicUsize::new(0),
            deleted: AtomicUsize::new(0),
            bytes: AtomicU64::new(0),
            errors: Mutex::new(Vec::new()),
            max_errors: self.opts.max_errors,
            cancel: cancel_scope,
            total_files: plan.copies.len(),
            total_bytes,
            progress_fn: self.opts.progress.clone(),
            progress_lock: Mutex::new(()),
        });

        self.run_transfers(src_base, dst_base, plan.copies, &shared)
            .await;
        self.run_deletes(dst_base, &plan.deletes, &shared).await;

        if cancel.is_cancelled() {
            shared.record_error(src_base, "sync", StorageError::Cancelled);
        }

        shared.emit(Phase::Complete, "");
        let errors = std::mem::take(&mut *shared.errors.lock().unwrap());
        let report = SyncReport {
            copied: shared.copied.load(Ordering::SeqCst),
            updated: shared.updated.load(Ordering::SeqCst),
            deleted: shared.deleted.load(Ordering::SeqCst),
            skipped: plan.skipped,
            errors,
            bytes_transferred: shared.bytes.load(Ordering::SeqCst),
            duration: started.elapsed(),
            dry_run: false,
        };
        info!(
            copied = report.copied,
            updated = report.updated,
            deleted = report.deleted,
            skipped = report.skipped,
            errors = report.errors.len(),
            bytes = report.bytes_transferred,
            "sync complete"
        );
        Ok(report)
    }

    async fn run_transfers(
        &self,
        src_base: &str,
        dst_base: &str,
        copies: Vec<CopyItem>,
        shared: &Arc<TransferState>,
    ) {
        if copies.is_empty() {
            return;
        }
        shared.emit(Phase::Transferring, "");
        let server_side =
            Arc::ptr_eq(&self.source, &self.dest) && self.source.features().can_copy;
        let bucket = TokenBucket::from_limit(self.opts.bandwidth_limit);
        let workers = self.opts.workers().max(1);
        let (tx, rx) = mpsc::channel::<CopyItem>(workers * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let ctx = WorkerContext {
                source: Arc::clone(&self.source),
                dest: Arc::clone(&self.dest),
                src_base: src_base.to_string(),
                dst_base: dst_base.to_string(),
                shared: Arc::clone(shared),
                bucket: bucket.clone(),
                retry: self.opts.retry.clone(),
                preserve: self.opts.preserve,
                server_side,
            };
            let rx = Arc::clone(&rx);
            handles.push(tokio::spawn(worker(worker_id, ctx, rx)));
        }

        // Single producer, plan order; workers drain it unordered.
        for item in copies {
            tokio::select! {
                _ = shared.cancel.cancelled() => break,
                sent = tx.send(item) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
        drop(tx);
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Sequential, strictly after the transfer phase.
    async fn run_deletes(&self, dst_base: &str, deletes: &[String], shared: &Arc<TransferState>) {
        if deletes.is_empty() {
            return;
        }
        shared.emit(Phase::Deleting, "");
        for path in deletes {
            if shared.cancel.is_cancelled() {
                break;
            }
            let full = join_path(dst_base, path);
            match self.dest.delete(&full, &shared.cancel).await {
                Ok(()) => {
                    shared.deleted.fetch_add(1, Ordering::SeqCst);
                    debug!(path = %full, "deleted extra");
                    shared.emit(Phase::Deleting, path);
                }
                Err(error) => shared.record_error(path, "delete", error),
            }
        }
    }
}

struct WorkerContext {
    source: Arc<dyn Backend>,
    dest: Arc<dyn Backend>,
    src_base: String,
    dst_base: String,
    shared: Arc<TransferState>,
    bucket: Option<Arc<TokenBucket>>,
    retry: Option<RetryConfig>,
    preserve: PreserveMetadata,
    server_side: bool,
}

async fn worker(
    worker_id: usize,
    ctx: WorkerContext,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<CopyItem>>>,
) {
    loop {
        let item = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = ctx.shared.cancel.cancelled() => None,
                item = rx.recv() => item,
            }
        };
        let Some(item) = item else { break };

        let src_full = join_path(&ctx.src_base, &item.path);
        let dst_full = join_path(&ctx.dst_base, &item.path);
        let result = tokio::select! {
            _ = ctx.shared.cancel.cancelled() => Err(StorageError::Cancelled),
            result = transfer_object(
                ctx.source.as_ref(),
                ctx.dest.as_ref(),
                &src_full,
                &dst_full,
                item.size,
                ctx.server_side,
                &ctx.bucket,
                &ctx.preserve,
                ctx.retry.as_ref(),
                &ctx.shared.cancel,
            ) => result,
        };

        match result {
            Ok(bytes) => {
                if item.update {
                    ctx.shared.updated.fetch_add(1, Ordering::SeqCst);
                } else {
                    ctx.shared.copied.fetch_add(1, Ordering::SeqCst);
                }
                ctx.shared.bytes.fetch_add(bytes, Ordering::SeqCst);
                debug!(worker = worker_id, path = %item.path, bytes, update = item.update, "copied");
                ctx.shared.emit(Phase::Transferring, &item.path);
            }
            Err(error) => ctx.shared.record_error(&item.path, "copy", error),
        }
    }
}

/// Copy one object, retry-wrapped when a policy is configured.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn transfer_object(
    source: &dyn Backend,
    dest: &dyn Backend,
    src_full: &str,
    dst_full: &str,
    size_hint: u64,
    server_side: bool,
    bucket: &Option<Arc<TokenBucket>>,
    preserve: &PreserveMetadata,
    retry_cfg: Option<&RetryConfig>,
    cancel: &CancellationToken,
) -> Result<u64, StorageError> {
    match retry_cfg {
        Some(cfg) => {
            retry(cfg, cancel, || {
                copy_once(
                    source, dest, src_full, dst_full, size_hint, server_side, bucket, preserve,
                    cancel,
                )
            })
            .await
        }
        None => {
            copy_once(
                source, dest, src_full, dst_full, size_hint, server_side, bucket, preserve, cancel,
            )
            .await
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn copy_once(
    source: &dyn Backend,
    dest: &dyn Backend,
    src_full: &str,
    dst_full: &str,
    size_hint: u64,
    server_side: bool,
    bucket: &Option<Arc<TokenBucket>>,
    preserve: &PreserveMetadata,
    cancel: &CancellationToken,
) -> Result<u64, StorageError> {
    if server_side {
        // No client-side bytes flow, so the rate limiter is bypassed.
        source.copy(src_full, dst_full, cancel).await?;
        return Ok(0);
    }

    let mut write_opts = WriteOptions::default();
    let wants_stat = preserve.content_type || preserve.modtime || preserve.custom;
    if wants_stat && source.features().can_stat {
        match source.stat(src_full, cancel).await {
            Ok(stat) => {
                if preserve.content_type {
                    write_opts.content_type = stat.content_type;
                }
                if preserve.modtime {
                    write_opts.modtime = stat.modtime;
                }
                if preserve.custom {
                    write_opts.metadata = stat.metadata;
                }
            }
            Err(e) if e.is_not_supported() => {}
            Err(e) => return Err(e),
        }
    }

    let reader = source
        .open_reader(src_full, ReadOptions::default(), cancel)
        .await?;
    let mut reader = ThrottledReader::new(reader, bucket.clone());
    let mut writer = dest.open_writer(dst_full, write_opts, cancel).await?;

    let chunk = size_hint.clamp(1, RATE_LIMIT_CHUNK as u64) as usize;
    let mut buf = vec![0u8; chunk];
    let mut total = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n]).await?;
        total += n as u64;
    }
    // Close last: commit failures are copy failures.
    writer.close().await?;
    Ok(total)
}
