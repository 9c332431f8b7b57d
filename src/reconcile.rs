//! Bulk reconciliation - brings the destination up to date with one full walk
//!
//! The walk copies every eligible source file that is missing from the
//! destination or strictly newer than its destination copy. Failures are
//! contained to the file that caused them, so a run over a flaky share is
//! expected to finish with partial results rather than abort.

use crate::filter::PathFilter;
use crate::progress::{format_runtime, ProgressReporter, TimerRegistry};
use crate::reachability::ReachabilityCheck;
use crate::roots::SyncRoots;
use crate::transfer::{RetryingCopier, TransferStatus};
use crate::walk::SourceWalker;
use anyhow::{Context, Result};
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How a reconciliation run ended
#[derive(Debug, Clone)]
pub enum ReconcileOutcome {
    /// Destination already populated and the caller asked to keep it
    Skipped,
    /// The source could not be confirmed, nothing was touched
    SourceUnreachable,
    Completed(ReconcileSummary),
}

/// Results from one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub total_files: u64,
    pub processed_files: u64,
    pub copied_files: u64,
    pub up_to_date_files: u64,
    pub failed_files: u64,
    /// Copies abandoned on timeout; their destination state is unknown
    pub indeterminate_files: u64,
    pub duration: Duration,
}

enum FileResult {
    Copied,
    UpToDate,
    Indeterminate,
    Failed,
}

/// Walks the source tree and copies whatever the destination is missing
#[derive(Clone)]
pub struct BulkReconciler {
    roots: SyncRoots,
    filter: PathFilter,
    copier: RetryingCopier,
    probe: Arc<dyn ReachabilityCheck>,
    timers: TimerRegistry,
}

impl BulkReconciler {
    pub fn new(
        roots: SyncRoots,
        filter: PathFilter,
        copier: RetryingCopier,
        probe: Arc<dyn ReachabilityCheck>,
        timers: TimerRegistry,
    ) -> Self {
        Self {
            roots,
            filter,
            copier,
            probe,
            timers,
        }
    }

    /// Run a full reconciliation
    ///
    /// With `skip_if_dest_non_empty` an already populated destination is left
    /// alone.
    pub async fn run(&self, skip_if_dest_non_empty: bool) -> Result<ReconcileOutcome> {
        let destination = self.roots.destination();

        if skip_if_dest_non_empty && dir_has_entries(destination).await {
            info!("Local directory exists and is not empty, skipping initial sync");
            return Ok(ReconcileOutcome::Skipped);
        }

        info!("Starting initial synchronization...");
        tokio::fs::create_dir_all(destination)
            .await
            .with_context(|| format!("Failed to create destination: {}", destination.display()))?;

        let reachable = self
            .timers
            .time("Checking remote connection", self.probe.is_reachable())
            .await;
        if !reachable {
            error!("Remote directory not accessible, cannot perform initial sync");
            return Ok(ReconcileOutcome::SourceUnreachable);
        }

        let summary = self.reconcile_tree(self.roots.source()).await;

        info!(
            "Initial sync completed! Total time: {} ({} copied, {} up to date, {} failed, {} indeterminate)",
            format_runtime(summary.duration),
            summary.copied_files,
            summary.up_to_date_files,
            summary.failed_files,
            summary.indeterminate_files
        );

        Ok(ReconcileOutcome::Completed(summary))
    }

    /// Reconcile one source subdirectory, given relative to the source root
    pub async fn mirror_subtree(&self, relative: &Path) -> ReconcileSummary {
        let start = self.roots.source_path(relative);
        info!("Mirroring directory: {}", start.display());
        self.reconcile_tree(&start).await
    }

    async fn reconcile_tree(&self, start: &Path) -> ReconcileSummary {
        let started = Instant::now();

        info!("Calculating total files...");
        let total_files = self
            .timers
            .time(
                "Calculating total files",
                SourceWalker::new(self.filter.clone(), start, self.io_timeout()).count_files(),
            )
            .await;
        info!("Found {} files to sync", total_files);

        let mut summary = ReconcileSummary {
            total_files,
            ..Default::default()
        };
        let mut reporter = ProgressReporter::new(total_files, &self.timers);
        let mut walker = SourceWalker::new(self.filter.clone(), start, self.io_timeout());

        while let Some(listing) = walker.next_dir().await {
            let Some(relative_dir) = self.roots.relative_to_source(&listing.dir) else {
                continue;
            };
            let dest_dir = self.roots.dest_path(relative_dir);

            if let Err(e) = tokio::fs::create_dir_all(&dest_dir).await {
                warn!("Failed to create directory {}: {}", dest_dir.display(), e);
            }

            for file in &listing.files {
                let label = file
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();

                let result = self.sync_file(file).await;
                match result {
                    FileResult::Copied => summary.copied_files += 1,
                    FileResult::UpToDate => summary.up_to_date_files += 1,
                    FileResult::Indeterminate => summary.indeterminate_files += 1,
                    FileResult::Failed => summary.failed_files += 1,
                }

                reporter.record(&label, matches!(result, FileResult::UpToDate));
            }
        }

        summary.processed_files = reporter.finish().processed;
        summary.duration = started.elapsed();
        summary
    }

    /// Limit on any single source-side stat or directory read
    fn io_timeout(&self) -> Duration {
        self.copier.policy().timeout
    }

    async fn sync_file(&self, src: &Path) -> FileResult {
        let Some(relative) = self.roots.relative_to_source(src) else {
            return FileResult::Failed;
        };
        let dst = self.roots.dest_path(relative);

        match needs_copy(src, &dst, self.io_timeout()).await {
            Ok(false) => {
                debug!("Up to date: {}", relative.display());
                FileResult::UpToDate
            }
            Ok(true) => match self.copier.copy(src, &dst).await {
                Ok(outcome) if outcome.status == TransferStatus::Completed => {
                    debug!("Copied: {} -> {}", src.display(), dst.display());
                    FileResult::Copied
                }
                Ok(_) => FileResult::Indeterminate,
                Err(e) => {
                    error!(
                        "Failed to sync file: {} -> {}, Error: {}",
                        src.display(),
                        dst.display(),
                        e
                    );
                    FileResult::Failed
                }
            },
            Err(e) => {
                error!("Failed to compare {}: {}", src.display(), e);
                FileResult::Failed
            }
        }
    }
}

/// True when `dst` is missing or `src` was modified strictly later
///
/// Each stat is bounded by `limit`; one that runs over fails with
/// [`io::ErrorKind::TimedOut`].
pub async fn needs_copy(src: &Path, dst: &Path, limit: Duration) -> io::Result<bool> {
    let dst_modified = match within(limit, dst, tokio::fs::metadata(dst)).await {
        Ok(metadata) => metadata.modified()?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };
    let src_modified = within(limit, src, tokio::fs::metadata(src))
        .await?
        .modified()?;

    Ok(src_modified > dst_modified)
}

async fn within<T>(
    limit: Duration,
    path: &Path,
    operation: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!(
                "{} did not respond within {:.1}s",
                path.display(),
                limit.as_secs_f64()
            ),
        )),
    }
}

async fn dir_has_entries(dir: &Path) -> bool {
    match tokio::fs::read_dir(dir).await {
        Ok(mut entries) => matches!(entries.next_entry().await, Ok(Some(_))),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;
    use tempfile::tempdir;

    const LIMIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_needs_copy() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&src, b"a").unwrap();

        assert!(needs_copy(&src, &dst, LIMIT).await.unwrap());

        fs::write(&dst, b"a").unwrap();
        set_file_mtime(&src, FileTime::from_unix_time(1_000, 0)).unwrap();
        set_file_mtime(&dst, FileTime::from_unix_time(1_000, 0)).unwrap();
        assert!(!needs_copy(&src, &dst, LIMIT).await.unwrap());

        set_file_mtime(&dst, FileTime::from_unix_time(2_000, 0)).unwrap();
        assert!(!needs_copy(&src, &dst, LIMIT).await.unwrap());

        set_file_mtime(&src, FileTime::from_unix_time(3_000, 0)).unwrap();
        assert!(needs_copy(&src, &dst, LIMIT).await.unwrap());
    }

    #[tokio::test]
    async fn test_stalled_stat_times_out() {
        let path = Path::new("/stalled/share/f.txt");
        let result: io::Result<()> =
            within(Duration::from_millis(20), path, std::future::pending()).await;

        let err = result.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(err.to_string().contains("/stalled/share/f.txt"));
    }

    #[tokio::test]
    async fn test_dir_has_entries() {
        let dir = tempdir().unwrap();
        assert!(!dir_has_entries(dir.path()).await);
        assert!(!dir_has_entries(&dir.path().join("missing")).await);

        fs::write(dir.path().join("f"), b"").unwrap();
        assert!(dir_has_entries(dir.path()).await);
    }
}
