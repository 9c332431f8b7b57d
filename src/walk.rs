//! Pruned traversal of the source tree

use crate::filter::PathFilter;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Listings buffered ahead of the consumer
const LISTING_BUFFER: usize = 64;

/// Files found directly inside one visited directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Top-down, name-ordered walk of a directory tree.
///
/// The traversal runs on a blocking worker and hands over one listing per
/// directory. Directories rejected by the filter are never opened, so nothing
/// below an ignored directory is evaluated. Symlinked directories are not
/// followed; symlinks to files are reported as files.
///
/// A worker that produces nothing for `stall_timeout` is abandoned and the
/// walk ends early, which keeps a dead share from hanging the caller.
pub struct SourceWalker {
    listings: mpsc::Receiver<DirListing>,
    stall_timeout: Duration,
    stalled: bool,
}

impl SourceWalker {
    pub fn new(filter: PathFilter, root: &Path, stall_timeout: Duration) -> Self {
        let (sender, listings) = mpsc::channel(LISTING_BUFFER);
        let root = root.to_path_buf();
        tokio::task::spawn_blocking(move || walk_tree(&filter, &root, &sender));

        Self {
            listings,
            stall_timeout,
            stalled: false,
        }
    }

    /// Visit the next directory, or `None` once the tree is exhausted
    pub async fn next_dir(&mut self) -> Option<DirListing> {
        if self.stalled {
            return None;
        }

        match timeout(self.stall_timeout, self.listings.recv()).await {
            Ok(listing) => listing,
            Err(_) => {
                warn!(
                    "Source walk stalled for {:.1}s, stopping early",
                    self.stall_timeout.as_secs_f64()
                );
                self.stalled = true;
                self.listings.close();
                None
            }
        }
    }

    /// Count every file the walk would yield
    pub async fn count_files(mut self) -> u64 {
        let mut total = 0;
        while let Some(listing) = self.next_dir().await {
            total += listing.files.len() as u64;
        }
        total
    }
}

/// Blocking side of the walk. Returns once the tree is done or the receiver
/// has gone away.
fn walk_tree(filter: &PathFilter, root: &Path, listings: &mpsc::Sender<DirListing>) {
    let entries = WalkDir::new(root)
        .follow_links(false)
        .sort_by(files_first)
        .into_iter()
        .filter_entry(|entry| {
            let ignored = filter.should_ignore(entry.path());
            if ignored {
                debug!("Ignoring {}", entry.path().display());
            }
            !ignored
        });

    let mut current: Option<DirListing> = None;

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(root);
                warn!("Cannot read {}: {}", path.display(), e);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            if let Some(done) = current.take() {
                if listings.blocking_send(done).is_err() {
                    return;
                }
            }
            current = Some(DirListing {
                dir: entry.into_path(),
                files: Vec::new(),
            });
        } else if is_file_like(&entry) {
            // Files sort ahead of subdirectories, so the open listing is the parent
            if let Some(listing) = current.as_mut() {
                listing.files.push(entry.into_path());
            }
        }
    }

    if let Some(done) = current {
        let _ = listings.blocking_send(done);
    }
}

/// Files before directories, then by name
fn files_first(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.file_type()
        .is_dir()
        .cmp(&b.file_type().is_dir())
        .then_with(|| a.file_name().cmp(b.file_name()))
}

fn is_file_like(entry: &DirEntry) -> bool {
    let file_type = entry.file_type();
    if file_type.is_file() {
        return true;
    }
    if !file_type.is_symlink() {
        return false;
    }

    match std::fs::metadata(entry.path()) {
        Ok(target) if target.is_file() => true,
        Ok(_) => {
            debug!("Not following symlinked directory {}", entry.path().display());
            false
        }
        Err(e) => {
            warn!("Dangling symlink {}: {}", entry.path().display(), e);
            false
        }
    }
}
