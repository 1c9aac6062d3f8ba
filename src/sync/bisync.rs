//! Bidirectional sync driver.
//!
//! Scans both sides, classifies every path as only-on-A, only-on-B,
//! in-sync, or conflicting, and resolves conflicts per the configured
//! strategy. Paths execute sequentially in sorted order so resolution is
//! deterministic; each path's operations run to completion before the next
//! path is considered.

use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fs::backend::{join_path, Backend};
use crate::fs::error::StorageError;
use crate::sync::compare::needs_update;
use crate::sync::engine::transfer_object;
use crate::sync::options::{emit_phase, parse_bool, Phase, SyncOptions};
use crate::sync::report::{BisyncReport, Conflict, FileError};
use crate::sync::scan::{scan, FileInfo};
use crate::sync::throttle::TokenBucket;

/// How a divergent path is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictStrategy {
    /// The side with the later modtime overwrites the other.
    #[default]
    NewerWins,
    /// The larger side overwrites the other.
    LargerWins,
    /// Side A always overwrites side B.
    SourceWins,
    /// Side B always overwrites side A.
    DestWins,
    /// Keep both versions, suffixing the loser on both sides.
    KeepBoth,
    /// Record the conflict; mutate nothing.
    Skip,
    /// Record the conflict as an error; mutate nothing.
    Error,
}

impl ConflictStrategy {
    pub fn description(&self) -> &'static str {
        match self {
            Self::NewerWins => "newer file wins",
            Self::LargerWins => "larger file wins",
            Self::SourceWins => "side A wins",
            Self::DestWins => "side B wins",
            Self::KeepBoth => "keep both versions",
            Self::Skip => "skip conflicting paths",
            Self::Error => "treat conflicts as errors",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "newer_wins" | "newer" => Some(Self::NewerWins),
            "larger_wins" | "larger" => Some(Self::LargerWins),
            "source_wins" | "source" => Some(Self::SourceWins),
            "dest_wins" | "dest" => Some(Self::DestWins),
            "keep_both" => Some(Self::KeepBoth),
            "skip" => Some(Self::Skip),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Bidirectional sync configuration.
#[derive(Clone)]
pub struct BisyncOptions {
    pub conflict_strategy: ConflictStrategy,
    /// Appended to the losing path under `KeepBoth`.
    pub conflict_suffix: String,
    /// Accepted but deliberately inert: telling a deletion apart from a
    /// file that never existed needs prior-run state this engine does not
    /// keep. Enabling it logs a warning.
    pub delete_missing: bool,
    pub base: SyncOptions,
}

impl Default for BisyncOptions {
    fn default() -> Self {
        Self {
            conflict_strategy: ConflictStrategy::default(),
            conflict_suffix: ".conflict".to_string(),
            delete_missing: false,
            base: SyncOptions::default(),
        }
    }
}

impl BisyncOptions {
    /// Lenient string-map construction; see `SyncOptions::from_map`.
    pub fn from_map(map: &std::collections::HashMap<String, String>) -> Self {
        let mut opts = Self {
            base: SyncOptions::from_map(map),
            ..Default::default()
        };
        if let Some(strategy) = map
            .get("conflict_strategy")
            .and_then(|s| ConflictStrategy::from_name(s))
        {
            opts.conflict_strategy = strategy;
        }
        if let Some(suffix) = map.get("conflict_suffix") {
            if !suffix.is_empty() {
                opts.conflict_suffix = suffix.clone();
            }
        }
        opts.delete_missing = parse_bool(map.get("delete_missing")).unwrap_or(false);
        opts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Side::A => "a",
            Side::B => "b",
        }
    }
}

/// Bidirectional sync driver over a pair of borrowed backends.
pub struct BisyncEngine {
    a: Arc<dyn Backend>,
    b: Arc<dyn Backend>,
    opts: BisyncOptions,
}

impl BisyncEngine {
    pub fn new(a: Arc<dyn Backend>, b: Arc<dyn Backend>, opts: BisyncOptions) -> Self {
        Self { a, b, opts }
    }

    /// Reconcile `base_a` on side A with `base_b` on side B.
    pub async fn sync(
        &self,
        base_a: &str,
        base_b: &str,
        cancel: &CancellationToken,
    ) -> Result<BisyncReport> {
        let started = Instant::now();
        let cancel_scope = cancel.child_token();
        if self.opts.delete_missing {
            warn!("delete_missing needs prior-run state tracking and is not acted upon");
        }

        emit_phase(&self.opts.base.progress, Phase::Scanning);
        let a_files = scan(
            self.a.as_ref(),
            base_a,
            self.opts.base.filter.as_ref(),
            self.opts.base.checksum,
            &cancel_scope,
        )
        .await
        .context("failed to scan side A")?;
        let b_files = scan(
            self.b.as_ref(),
            base_b,
            self.opts.base.filter.as_ref(),
            self.opts.base.checksum,
            &cancel_scope,
        )
        .await
        .context("failed to scan side B")?;

        emit_phase(&self.opts.base.progress, Phase::Comparing);
        let mut entries: BTreeMap<String, (Option<FileInfo>, Option<FileInfo>)> = BTreeMap::new();
        for file in a_files {
            let key = file.path.clone();
            entries.entry(key).or_default().0 = Some(file);
        }
        for file in b_files {
            let key = file.path.clone();
            entries.entry(key).or_default().1 = Some(file);
        }
        info!(
            a = self.a.kind(),
            b = self.b.kind(),
            paths = entries.len(),
            strategy = self.opts.conflict_strategy.description(),
            dry_run = self.opts.base.dry_run,
            "bisync planned"
        );

        let mut run = BisyncRun {
            engine: self,
            base_a,
            base_b,
            bucket: TokenBucket::from_limit(self.opts.base.bandwidth_limit),
            server_side: Arc::ptr_eq(&self.a, &self.b) && self.a.features().can_copy,
            cancel: cancel_scope,
            report: BisyncReport {
                dry_run: self.opts.base.dry_run,
                ..Default::default()
            },
        };

        emit_phase(&self.opts.base.progress, Phase::Transferring);
        for (path, (a_info, b_info)) in entries {
            if run.cancel.is_cancelled() {
                run.report
                    .errors
                    .push(FileError::new(path, "sync", StorageError::Cancelled));
                break;
            }
            match (a_info, b_info) {
                (Some(info), None) if !info.is_dir => run.copy_missing(Side::A, &info).await,
                (None, Some(info)) if !info.is_dir => run.copy_missing(Side::B, &info).await,
                (Some(a_info), Some(b_info)) if !a_info.is_dir && !b_info.is_dir => {
                    let policy = self.opts.base.policy();
                    if needs_update(&a_info, &b_info, &policy)
                        || needs_update(&b_info, &a_info, &policy)
                    {
                        run.resolve(path, a_info, b_info).await;
                    } else {
                        run.report.skipped += 1;
                    }
                }
                _ => {}
            }
        }

        emit_phase(&self.opts.base.progress, Phase::Complete);
        let mut report = run.report;
        report.duration = started.elapsed();
        info!(
            to_b_copied = report.to_b.copied,
            to_b_updated = report.to_b.updated,
            to_a_copied = report.to_a.copied,
            to_a_updated = report.to_a.updated,
            conflicts = report.conflicts.len(),
            errors = report.errors.len(),
            "bisync complete"
        );
        Ok(report)
    }
}

struct BisyncRun<'a> {
    engine: &'a BisyncEngine,
    base_a: &'a str,
    base_b: &'a str,
    bucket: Option<Arc<TokenBucket>>,
    server_side: bool,
    cancel: CancellationToken,
    report: BisyncReport,
}

impl BisyncRun<'_> {
    fn backend(&self, side: Side) -> &dyn Backend {
        match side {
            Side::A => self.engine.a.as_ref(),
            Side::B => self.engine.b.as_ref(),
        }
    }

    fn full(&self, side: Side, rel: &str) -> String {
        match side {
            Side::A => join_path(self.base_a, rel),
            Side::B => join_path(self.base_b, rel),
        }
    }

    fn push_error(&mut self, path: &str, op: &'static str, error: StorageError) {
        warn!(path, op, %error, "bisync operation failed");
        self.report.errors.push(FileError::new(path, op, error));
        let budget = self.engine.opts.base.max_errors;
        if budget > 0 && self.report.errors.len() >= budget {
            info!(errors = self.report.errors.len(), "error budget exhausted, aborting");
            self.cancel.cancel();
        }
    }

    /// Stream one object from `from` to the opposite side, accounting
    /// bytes to the receiving direction.
    async fn transfer(
        &mut self,
        from: Side,
        src_rel: &str,
        dst_rel: &str,
        size: u64,
    ) -> Result<u64, StorageError> {
        let src_full = self.full(from, src_rel);
        let dst_full = self.full(from.other(), dst_rel);
        let bytes = transfer_object(
            self.backend(from),
            self.backend(from.other()),
            &src_full,
            &dst_full,
            size,
            self.server_side,
            &self.bucket,
            &self.engine.opts.base.preserve,
            self.engine.opts.base.retry.as_ref(),
            &self.cancel,
        )
        .await?;
        match from.other() {
            Side::A => self.report.to_a.bytes += bytes,
            Side::B => self.report.to_b.bytes += bytes,
        }
        Ok(bytes)
    }

    fn count(&mut self, to: Side, update: bool) {
        let counts = match to {
            Side::A => &mut self.report.to_a,
            Side::B => &mut self.report.to_b,
        };
        if update {
            counts.updated += 1;
        } else {
            counts.copied += 1;
        }
    }

    /// Path present on one side only: copy it across.
    async fn copy_missing(&mut self, present_on: Side, info: &FileInfo) {
        if self.engine.opts.base.dry_run {
            self.count(present_on.other(), false);
            return;
        }
        match self.transfer(present_on, &info.path, &info.path, info.size).await {
            Ok(_) => {
                debug!(path = %info.path, from = present_on.label(), "copied missing");
                self.count(present_on.other(), false);
            }
            Err(error) => self.push_error(&info.path, "copy", error),
        }
    }

    fn pick_winner(&self, a: &FileInfo, b: &FileInfo) -> Side {
        match self.engine.opts.conflict_strategy {
            ConflictStrategy::NewerWins | ConflictStrategy::KeepBoth => match (a.modtime, b.modtime)
            {
                (Some(at), Some(bt)) if bt > at => Side::B,
                (None, Some(_)) => Side::B,
                _ => Side::A,
            },
            ConflictStrategy::LargerWins => {
                if b.size > a.size {
                    Side::B
                } else {
                    Side::A
                }
            }
            ConflictStrategy::DestWins => Side::B,
            _ => Side::A,
        }
    }

    async fn resolve(&mut self, path: String, a_info: FileInfo, b_info: FileInfo) {
        let strategy = self.engine.opts.conflict_strategy;
        let mut conflict = Conflict {
            path: path.clone(),
            a: a_info.clone(),
            b: b_info.clone(),
            resolution: None,
        };

        match strategy {
            ConflictStrategy::Skip => {
                conflict.resolution = Some("skip".to_string());
                self.report.conflicts.push(conflict);
            }
            ConflictStrategy::Error => {
                conflict.resolution = Some("error".to_string());
                self.report.conflicts.push(conflict);
                self.push_error(
                    &path,
                    "conflict",
                    StorageError::Other(anyhow!("path diverged on both sides")),
                );
            }
            ConflictStrategy::KeepBoth => {
                let winner = self.pick_winner(&a_info, &b_info);
                let resolved = self
                    .keep_both(&path, winner, &a_info, &b_info)
                    .await;
                if resolved {
                    conflict.resolution = Some("keep-both".to_string());
                }
                self.report.conflicts.push(conflict);
            }
            _ => {
                let winner = self.pick_winner(&a_info, &b_info);
                let label = match strategy {
                    ConflictStrategy::NewerWins => format!("newer-wins:{}", winner.label()),
                    ConflictStrategy::LargerWins => format!("larger-wins:{}", winner.label()),
                    ConflictStrategy::SourceWins => "source-wins".to_string(),
                    _ => "dest-wins".to_string(),
                };
                let size = match winner {
                    Side::A => a_info.size,
                    Side::B => b_info.size,
                };
                if self.engine.opts.base.dry_run {
                    self.count(winner.other(), true);
                    conflict.resolution = Some(label);
                    self.report.conflicts.push(conflict);
                    return;
                }
                match self.transfer(winner, &path, &path, size).await {
                    Ok(_) => {
                        debug!(path = %path, resolution = %label, "conflict resolved");
                        self.count(winner.other(), true);
                        conflict.resolution = Some(label);
                    }
                    Err(error) => self.push_error(&path, "conflict", error),
                }
                self.report.conflicts.push(conflict);
            }
        }
    }

    /// `KeepBoth`: the loser's content survives as `path + suffix` on both
    /// sides, then the winner's content lands at `path` on both sides. An
    /// existing suffixed path is overwritten.
    async fn keep_both(
        &mut self,
        path: &str,
        winner: Side,
        a_info: &FileInfo,
        b_info: &FileInfo,
    ) -> bool {
        let loser = winner.other();
        let suffixed = format!("{}{}", path, self.engine.opts.conflict_suffix);
        let (winner_size, loser_size) = match winner {
            Side::A => (a_info.size, b_info.size),
            Side::B => (b_info.size, a_info.size),
        };

        if self.engine.opts.base.dry_run {
            self.count(winner, false);
            self.count(loser, true);
            return true;
        }

        // Loser content becomes visible as the suffixed path everywhere.
        if let Err(error) = self.transfer(loser, path, &suffixed, loser_size).await {
            self.push_error(path, "conflict", error);
            return false;
        }
        self.count(winner, false);

        let loser_backend = self.backend(loser);
        let loser_path = self.full(loser, path);
        let loser_suffixed = self.full(loser, &suffixed);
        let renamed = if loser_backend.features().can_move {
            loser_backend
                .rename(&loser_path, &loser_suffixed, &self.cancel)
                .await
        } else {
            match transfer_object(
                loser_backend,
                loser_backend,
                &loser_path,
                &loser_suffixed,
                loser_size,
                false,
                &self.bucket,
                &self.engine.opts.base.preserve,
                self.engine.opts.base.retry.as_ref(),
                &self.cancel,
            )
            .await
            {
                Ok(_) => loser_backend.delete(&loser_path, &self.cancel).await,
                Err(error) => Err(error),
            }
        };
        if let Err(error) = renamed {
            self.push_error(path, "conflict", error);
            return false;
        }

        // Winner content into place on the losing side.
        match self.transfer(winner, path, path, winner_size).await {
            Ok(_) => {
                debug!(path, winner = winner.label(), "kept both versions");
                self.count(loser, true);
                true
            }
            Err(error) => {
                self.push_error(path, "conflict", error);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_strategy_from_name() {
        assert_eq!(
            ConflictStrategy::from_name("newer-wins"),
            Some(ConflictStrategy::NewerWins)
        );
        assert_eq!(
            ConflictStrategy::from_name("KEEP_BOTH"),
            Some(ConflictStrategy::KeepBoth)
        );
        assert_eq!(ConflictStrategy::from_name("whatever"), None);
    }

    #[test]
    fn test_options_from_map() {
        let mut map = std::collections::HashMap::new();
        map.insert("conflict_strategy".to_string(), "larger_wins".to_string());
        map.insert("conflict_suffix".to_string(), ".theirs".to_string());
        map.insert("checksum".to_string(), "true".to_string());

        let opts = BisyncOptions::from_map(&map);
        assert_eq!(opts.conflict_strategy, ConflictStrategy::LargerWins);
        assert_eq!(opts.conflict_suffix, ".theirs");
        assert!(opts.base.checksum);
    }

    #[test]
    fn test_default_suffix() {
        assert_eq!(BisyncOptions::default().conflict_suffix, ".conflict");
    }

    #[tokio::test]
    async fn test_pick_winner_rules() {
        let engine = BisyncEngine::new(
            Arc::new(crate::fs::memory::MemoryBackend::new()),
            Arc::new(crate::fs::memory::MemoryBackend::new()),
            BisyncOptions::default(),
        );
        let run = BisyncRun {
            engine: &engine,
            base_a: "",
            base_b: "",
            bucket: None,
            server_side: false,
            cancel: CancellationToken::new(),
            report: BisyncReport::default(),
        };

        let now = Utc::now();
        let older = FileInfo::new("f", 10).with_modtime(now - chrono::Duration::hours(1));
        let newer = FileInfo::new("f", 5).with_modtime(now);

        // Default strategy is newer-wins.
        assert_eq!(run.pick_winner(&older, &newer), Side::B);
        assert_eq!(run.pick_winner(&newer, &older), Side::A);
        // Missing modtime loses to a known one.
        assert_eq!(run.pick_winner(&FileInfo::new("f", 1), &newer), Side::B);
        // Tie goes to A.
        assert_eq!(run.pick_winner(&newer, &newer), Side::A);
    }
}
