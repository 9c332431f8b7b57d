//! Live change events and how they are applied to the destination
//!
//! Each event is planned into a [`FileSyncTask`] (after filtering) and then
//! executed through the retrying copier. Events are consumed one at a time, so
//! two events for the same path are applied in arrival order.

use crate::filter::PathFilter;
use crate::progress::TimerRegistry;
use crate::reconcile::{BulkReconciler, ReconcileSummary};
use crate::roots::SyncRoots;
use crate::transfer::{RetryingCopier, TransferError, TransferOutcome, TransferStatus};
use crate::watcher::SourceWatcher;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// A change observed under the source root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Created { path: PathBuf, is_dir: bool },
    Modified { path: PathBuf, is_dir: bool },
    Moved { from: PathBuf, to: PathBuf, is_dir: bool },
    Deleted { path: PathBuf, is_dir: bool },
}

/// What a task does to the destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Create,
    Modify,
    Move,
    Delete,
}

impl SyncAction {
    fn verb(&self) -> &'static str {
        match self {
            SyncAction::Create => "Created",
            SyncAction::Modify => "Modified",
            SyncAction::Move => "Moved",
            SyncAction::Delete => "Deleted",
        }
    }
}

/// One unit of destination work derived from an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSyncTask {
    pub relative_path: PathBuf,
    pub action: SyncAction,
    pub source_path: PathBuf,
    pub dest_path: PathBuf,
    /// Pre-move relative path, for moves that started inside the source root
    pub previous_relative_path: Option<PathBuf>,
    pub is_dir: bool,
}

/// Result of handling one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Filtered out, a directory-only create/modify, or outside the source root
    Ignored,
    Copied,
    Renamed,
    /// A directory moved in from elsewhere was mirrored file by file
    MirroredDirectory(ReconcileSummary),
    Deleted,
    /// Nothing at the destination to delete
    Unchanged,
    /// The transfer was abandoned; destination state unknown
    TimedOut,
    Failed(String),
}

/// Applies live events to the destination tree
#[derive(Clone)]
pub struct EventSyncer {
    roots: SyncRoots,
    filter: PathFilter,
    copier: RetryingCopier,
    reconciler: BulkReconciler,
    timers: TimerRegistry,
}

impl EventSyncer {
    pub fn new(
        roots: SyncRoots,
        filter: PathFilter,
        copier: RetryingCopier,
        reconciler: BulkReconciler,
        timers: TimerRegistry,
    ) -> Self {
        Self {
            roots,
            filter,
            copier,
            reconciler,
            timers,
        }
    }

    /// Turn an event into a task, or `None` when it should not touch the destination
    pub fn plan(&self, event: &SyncEvent) -> Option<FileSyncTask> {
        match event {
            SyncEvent::Created { path, is_dir } | SyncEvent::Modified { path, is_dir } => {
                if *is_dir || self.filter.should_ignore(path) {
                    return None;
                }
                let action = if matches!(event, SyncEvent::Created { .. }) {
                    SyncAction::Create
                } else {
                    SyncAction::Modify
                };
                self.task(path, action, None, false)
            }
            SyncEvent::Moved { from, to, is_dir } => {
                if self.filter.should_ignore(from) || self.filter.should_ignore(to) {
                    return None;
                }
                if self.roots.relative_to_source(to).is_none() {
                    // Moved out of the tree
                    return self.task(from, SyncAction::Delete, None, *is_dir);
                }
                let previous = self
                    .roots
                    .relative_to_source(from)
                    .map(Path::to_path_buf);
                self.task(to, SyncAction::Move, previous, *is_dir)
            }
            SyncEvent::Deleted { path, is_dir } => {
                if self.filter.should_ignore(path) {
                    return None;
                }
                self.task(path, SyncAction::Delete, None, *is_dir)
            }
        }
    }

    fn task(
        &self,
        path: &Path,
        action: SyncAction,
        previous_relative_path: Option<PathBuf>,
        is_dir: bool,
    ) -> Option<FileSyncTask> {
        let Some(relative) = self.roots.relative_to_source(path) else {
            warn!("Event outside source root: {}", path.display());
            return None;
        };
        if relative.as_os_str().is_empty() {
            debug!("Ignoring event on the source root itself");
            return None;
        }

        Some(FileSyncTask {
            relative_path: relative.to_path_buf(),
            action,
            source_path: path.to_path_buf(),
            dest_path: self.roots.dest_path(relative),
            previous_relative_path,
            is_dir,
        })
    }

    /// Apply one event; failures are logged and reported, never propagated
    pub async fn handle(&self, event: SyncEvent) -> EventOutcome {
        match self.plan(&event) {
            Some(task) => self.execute(task).await,
            None => {
                debug!("Skipping event: {:?}", event);
                EventOutcome::Ignored
            }
        }
    }

    /// Consume events in arrival order until the source ends or shutdown
    ///
    /// An event already being applied is finished before shutdown is observed.
    pub async fn process_events(
        &self,
        source: &mut SourceWatcher,
        mut shutdown: broadcast::Receiver<()>,
    ) -> u64 {
        let mut handled = 0;
        loop {
            let event = tokio::select! {
                _ = shutdown.recv() => break,
                event = source.next_event() => event,
            };
            let Some(event) = event else {
                break;
            };

            let outcome = self.handle(event).await;
            debug!("Event handled: {:?}", outcome);
            handled += 1;
        }
        handled
    }

    async fn execute(&self, task: FileSyncTask) -> EventOutcome {
        match task.action {
            SyncAction::Create | SyncAction::Modify => self.copy_file(&task).await,
            SyncAction::Move => self.apply_move(&task).await,
            SyncAction::Delete => self.apply_delete(&task).await,
        }
    }

    async fn copy_file(&self, task: &FileSyncTask) -> EventOutcome {
        let label = format!("{} file: {}", task.action.verb(), file_label(&task.source_path));
        let result = self
            .timers
            .time(label, self.copier.copy(&task.source_path, &task.dest_path))
            .await;

        match settle(result, "Sync") {
            Ok(()) => {
                info!(
                    "File {}: {} -> {}",
                    task.action.verb().to_lowercase(),
                    task.source_path.display(),
                    task.dest_path.display()
                );
                EventOutcome::Copied
            }
            Err(outcome) => outcome,
        }
    }

    async fn apply_move(&self, task: &FileSyncTask) -> EventOutcome {
        let previous_dest = task
            .previous_relative_path
            .as_deref()
            .map(|rel| self.roots.dest_path(rel));

        if let Some(previous_dest) = previous_dest.filter(|p| entry_exists(p)) {
            let label = format!(
                "Moving file: {} -> {}",
                file_label(&previous_dest),
                file_label(&task.dest_path)
            );
            let result = self
                .timers
                .time(label, self.copier.rename(&previous_dest, &task.dest_path))
                .await;

            return match settle(result, "Move") {
                Ok(()) => {
                    info!(
                        "File moved: {} -> {}",
                        previous_dest.display(),
                        task.dest_path.display()
                    );
                    EventOutcome::Renamed
                }
                Err(outcome) => outcome,
            };
        }

        if task.is_dir || task.source_path.is_dir() {
            let summary = self.reconciler.mirror_subtree(&task.relative_path).await;
            return EventOutcome::MirroredDirectory(summary);
        }

        let label = format!("Copying file: {}", file_label(&task.source_path));
        let result = self
            .timers
            .time(label, self.copier.copy(&task.source_path, &task.dest_path))
            .await;

        match settle(result, "Copy") {
            Ok(()) => {
                info!(
                    "File copied: {} -> {}",
                    task.source_path.display(),
                    task.dest_path.display()
                );
                EventOutcome::Copied
            }
            Err(outcome) => outcome,
        }
    }

    async fn apply_delete(&self, task: &FileSyncTask) -> EventOutcome {
        if !entry_exists(&task.dest_path) {
            debug!("Nothing to delete at {}", task.dest_path.display());
            return EventOutcome::Unchanged;
        }

        let label = format!("Deleting: {}", file_label(&task.dest_path));
        let result = self
            .timers
            .time(label, self.copier.remove(&task.dest_path))
            .await;

        match settle(result, "Delete") {
            Ok(()) => {
                info!("Deleted: {}", task.dest_path.display());
                EventOutcome::Deleted
            }
            Err(outcome) => outcome,
        }
    }
}

/// Map a transfer result to `Ok` on completion or the outcome to report
fn settle(
    result: Result<TransferOutcome, TransferError>,
    what: &str,
) -> Result<(), EventOutcome> {
    match result {
        Ok(outcome) if outcome.status == TransferStatus::Completed => Ok(()),
        Ok(_) => Err(EventOutcome::TimedOut),
        Err(e) => {
            error!("{} failed: {}", what, e);
            Err(EventOutcome::Failed(e.to_string()))
        }
    }
}

fn entry_exists(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok()
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
