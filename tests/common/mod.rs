//! Common test utilities and helpers for treemirror tests
#![allow(dead_code)]

use assert_fs::prelude::*;
use assert_fs::TempDir;
use async_trait::async_trait;
use filetime::{set_file_mtime, FileTime};
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use treemirror::events::EventSyncer;
use treemirror::progress::TimerRegistry;
use treemirror::{
    BulkReconciler, FsTransfer, PathFilter, ReachabilityCheck, RetryingCopier, SyncRoots,
    Transfer, TransferPolicy,
};

/// Transfer that performs real filesystem work and records every call
#[derive(Default)]
pub struct RecordingTransfer {
    inner: FsTransfer,
    pub copies: AtomicUsize,
    pub renames: AtomicUsize,
    pub removes: AtomicUsize,
    pub copied_from: Mutex<Vec<PathBuf>>,
}

impl RecordingTransfer {
    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    pub fn renames(&self) -> usize {
        self.renames.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }

    pub fn copied_from(&self) -> Vec<PathBuf> {
        self.copied_from.lock().unwrap().clone()
    }
}

impl Transfer for RecordingTransfer {
    fn copy(&self, src: &Path, dst: &Path) -> io::Result<()> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        self.copied_from.lock().unwrap().push(src.to_path_buf());
        self.inner.copy(src, dst)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.renames.fetch_add(1, Ordering::SeqCst);
        self.inner.rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.removes.fetch_add(1, Ordering::SeqCst);
        self.inner.remove(path)
    }
}

/// How [`FaultyTransfer`] misbehaves on its target file
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    /// Every copy attempt fails outright
    Fail,
    /// Every copy attempt blocks for this long, then fails
    Stall(Duration),
}

/// Real filesystem transfer that misbehaves whenever it copies one named file
pub struct FaultyTransfer {
    inner: RecordingTransfer,
    target: OsString,
    fault: Fault,
    faulted: AtomicUsize,
}

impl FaultyTransfer {
    pub fn new(target: &str, fault: Fault) -> Self {
        Self {
            inner: RecordingTransfer::default(),
            target: OsString::from(target),
            fault,
            faulted: AtomicUsize::new(0),
        }
    }

    /// Copy attempts that hit the fault
    pub fn faulted(&self) -> usize {
        self.faulted.load(Ordering::SeqCst)
    }

    /// Copies that went through to the filesystem
    pub fn copied_from(&self) -> Vec<PathBuf> {
        self.inner.copied_from()
    }
}

impl Transfer for FaultyTransfer {
    fn copy(&self, src: &Path, dst: &Path) -> io::Result<()> {
        if src.file_name() != Some(self.target.as_os_str()) {
            return self.inner.copy(src, dst);
        }

        self.faulted.fetch_add(1, Ordering::SeqCst);
        match self.fault {
            Fault::Fail => Err(io::Error::other("injected failure")),
            Fault::Stall(duration) => {
                std::thread::sleep(duration);
                Err(io::Error::new(io::ErrorKind::TimedOut, "injected stall"))
            }
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        self.inner.rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.inner.remove(path)
    }
}

/// Reachability answer controlled by the test
pub struct SwitchProbe {
    reachable: AtomicBool,
}

impl SwitchProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: AtomicBool::new(reachable),
        }
    }

    pub fn set(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReachabilityCheck for SwitchProbe {
    async fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// A source and destination pair in a scratch directory
pub struct MirrorFixture {
    pub temp_dir: TempDir,
    pub roots: SyncRoots,
    pub transfer: Arc<RecordingTransfer>,
    pub probe: Arc<SwitchProbe>,
}

impl MirrorFixture {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        temp_dir.child("source").create_dir_all().unwrap();

        let roots = SyncRoots::new(temp_dir.child("source").path(), temp_dir.child("dest").path())
            .expect("Failed to build roots");

        Self {
            temp_dir,
            roots,
            transfer: Arc::new(RecordingTransfer::default()),
            probe: Arc::new(SwitchProbe::new(true)),
        }
    }

    pub fn source(&self) -> &Path {
        self.roots.source()
    }

    pub fn dest(&self) -> &Path {
        self.roots.destination()
    }

    /// Write a source file and pin its mtime to `mtime` seconds since the epoch
    pub fn source_file(&self, relative: &str, contents: &str, mtime: i64) -> PathBuf {
        write_with_mtime(&self.source().join(relative), contents, mtime)
    }

    pub fn dest_file(&self, relative: &str, contents: &str, mtime: i64) -> PathBuf {
        write_with_mtime(&self.dest().join(relative), contents, mtime)
    }

    pub fn policy() -> TransferPolicy {
        TransferPolicy {
            timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            force_permissions: true,
        }
    }

    pub fn reconciler(&self) -> BulkReconciler {
        self.reconciler_with(self.transfer.clone(), Self::policy())
    }

    /// Reconciler over the fixture roots with a caller-supplied transfer
    pub fn reconciler_with(
        &self,
        transfer: Arc<dyn Transfer>,
        policy: TransferPolicy,
    ) -> BulkReconciler {
        let filter = PathFilter::new(self.roots.clone(), &["build".to_string()]);
        let copier = RetryingCopier::new(transfer, policy);
        BulkReconciler::new(
            self.roots.clone(),
            filter,
            copier,
            self.probe.clone(),
            TimerRegistry::new(false),
        )
    }

    pub fn syncer(&self) -> EventSyncer {
        let filter = PathFilter::new(self.roots.clone(), &["build".to_string()]);
        let copier = RetryingCopier::new(self.transfer.clone(), Self::policy());
        EventSyncer::new(
            self.roots.clone(),
            filter,
            copier,
            self.reconciler(),
            TimerRegistry::new(false),
        )
    }
}

pub fn write_with_mtime(path: &Path, contents: &str, mtime: i64) -> PathBuf {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("Failed to create parent dir");
    }
    std::fs::write(path, contents).expect("Failed to write file");
    set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).expect("Failed to set mtime");
    path.to_path_buf()
}

pub fn mtime_of(path: &Path) -> i64 {
    let metadata = std::fs::metadata(path).expect("Failed to stat file");
    FileTime::from_last_modification_time(&metadata).unix_seconds()
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

/// Assertion helpers for test validation
pub fn assert_contains_all(text: &str, expected: &[&str]) {
    for item in expected {
        assert!(
            text.contains(item),
            "Expected text to contain '{}', but it didn't. Text: {}",
            item,
            text
        );
    }
}
