//! Verification / diff between two backend subtrees.
//!
//! Reuses the scanner and comparator to categorize every path as matching,
//! differing, or present on one side only. No mutation happens on either
//! backend.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::fs::backend::{join_path, Backend};
use crate::sync::compare::files_match;
use crate::sync::options::{emit_phase, Phase, SyncOptions};
use crate::sync::report::{CheckReport, FileError};
use crate::sync::scan::scan;

/// Verification driver over a pair of borrowed backends.
pub struct Checker {
    source: Arc<dyn Backend>,
    dest: Arc<dyn Backend>,
    opts: SyncOptions,
}

impl Checker {
    pub fn new(source: Arc<dyn Backend>, dest: Arc<dyn Backend>, opts: SyncOptions) -> Self {
        Self { source, dest, opts }
    }

    /// Compare `src_base` against `dst_base` and report per-path verdicts.
    /// Per-path comparison failures land in `errors`; scan failures are
    /// fatal.
    pub async fn check(
        &self,
        src_base: &str,
        dst_base: &str,
        cancel: &CancellationToken,
    ) -> Result<CheckReport> {
        let cancel_scope = cancel.child_token();
        let policy = self.opts.policy();

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
        let mut dst_by_path: BTreeMap<&str, &crate::sync::scan::FileInfo> = dst_files
            .iter()
            .filter(|f| !f.is_dir)
            .map(|f| (f.path.as_str(), f))
            .collect();

        let mut report = CheckReport::default();
        for src in src_files.iter().filter(|f| !f.is_dir) {
            match dst_by_path.remove(src.path.as_str()) {
                None => report.src_only.push(src.path.clone()),
                Some(dst) => {
                    let src_full = join_path(src_base, &src.path);
                    let dst_full = join_path(dst_base, &dst.path);
                    let verdict = files_match(
                        self.source.as_ref(),
                        &src_full,
                        src,
                        self.dest.as_ref(),
                        &dst_full,
                        dst,
                        &policy,
                        &cancel_scope,
                    )
                    .await;
                    match verdict {
                        Ok(true) => report.matched.push(src.path.clone()),
                        Ok(false) => {
                            debug!(path = %src.path, "content differs");
                            report.differ.push(src.path.clone());
                        }
                        Err(error) => {
                            report
                                .errors
                                .push(FileError::new(src.path.clone(), "check", error))
                        }
                    }
                }
            }
        }
        report.dst_only = dst_by_path.keys().map(|p| p.to_string()).collect();
        report.matched.sort();
        report.differ.sort();
        report.src_only.sort();

        emit_phase(&self.opts.progress, Phase::Complete);
        info!(
            matched = report.matched.len(),
            differ = report.differ.len(),
            src_only = report.src_only.len(),
            dst_only = report.dst_only.len(),
            errors = report.errors.len(),
            "check complete"
        );
        Ok(report)
    }
}
