//! Bounded, retried file transfers
//!
//! Every copy, rename and remove against the destination goes through
//! [`RetryingCopier`]. Each attempt runs on a blocking worker joined against a
//! deadline. A worker that misses its deadline is abandoned rather than
//! cancelled, so the call reports [`TransferStatus::TimedOut`] and the
//! destination entry must be treated as indeterminate until a later pass
//! touches it again.

use crate::config::Config;
use anyhow::Result;
use filetime::FileTime;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, warn};

/// Filesystem primitives used by the copier
///
/// Implementations must be blocking and self-contained; they run on worker
/// threads that may outlive the call that started them.
pub trait Transfer: Send + Sync + 'static {
    /// Copy `src` over `dst`, preserving modification time.
    fn copy(&self, src: &Path, dst: &Path) -> io::Result<()>;

    /// Rename an entry within the destination tree.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    /// Remove a file, or a directory and everything below it.
    fn remove(&self, path: &Path) -> io::Result<()>;
}

/// Production transfer backed by `std::fs`
#[derive(Debug, Default)]
pub struct FsTransfer {
    partial_seq: AtomicU64,
}

impl FsTransfer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sibling of `dst` used while the copy is in flight.
    ///
    /// The name stays within [`MAX_NAME_BYTES`] however long `dst`'s own name
    /// is; the destination name is shortened to make room for the suffix.
    fn partial_path(&self, dst: &Path) -> PathBuf {
        let seq = self.partial_seq.fetch_add(1, Ordering::Relaxed);
        let suffix = format!(".{}-{}.partial", std::process::id(), seq);
        let name = dst
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let budget = MAX_NAME_BYTES.saturating_sub(1 + suffix.len());

        dst.with_file_name(format!(".{}{}", truncate_to_boundary(&name, budget), suffix))
    }
}

/// Longest single path component most filesystems accept
const MAX_NAME_BYTES: usize = 255;

fn truncate_to_boundary(name: &str, max_bytes: usize) -> &str {
    if name.len() <= max_bytes {
        return name;
    }
    let mut end = max_bytes;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

impl Transfer for FsTransfer {
    fn copy(&self, src: &Path, dst: &Path) -> io::Result<()> {
        let metadata = fs::metadata(src)?;
        let partial = self.partial_path(dst);

        let result = fs::copy(src, &partial).and_then(|_| {
            let mtime = FileTime::from_last_modification_time(&metadata);
            let atime = FileTime::from_last_access_time(&metadata);
            filetime::set_file_times(&partial, atime, mtime)?;
            fs::rename(&partial, dst)
        });

        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        let result = match fs::symlink_metadata(path) {
            Ok(metadata) if metadata.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(e) => Err(e),
        };

        match result {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// One destination-side operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOp {
    Copy { src: PathBuf, dst: PathBuf },
    Rename { from: PathBuf, to: PathBuf },
    Remove { path: PathBuf },
}

impl TransferOp {
    fn apply(&self, transfer: &dyn Transfer) -> io::Result<()> {
        match self {
            TransferOp::Copy { src, dst } => transfer.copy(src, dst),
            TransferOp::Rename { from, to } => transfer.rename(from, to),
            TransferOp::Remove { path } => transfer.remove(path),
        }
    }

    /// Directory that has to exist before the operation can succeed
    fn target_parent(&self) -> Option<&Path> {
        match self {
            TransferOp::Copy { dst, .. } => dst.parent(),
            TransferOp::Rename { to, .. } => to.parent(),
            TransferOp::Remove { .. } => None,
        }
    }

    fn touched_paths(&self) -> Vec<&Path> {
        match self {
            TransferOp::Copy { dst, .. } => vec![dst],
            TransferOp::Rename { from, to } => vec![from, to],
            TransferOp::Remove { path } => vec![path],
        }
    }

    pub fn describe(&self) -> String {
        match self {
            TransferOp::Copy { src, dst } => {
                format!("copy {} -> {}", src.display(), dst.display())
            }
            TransferOp::Rename { from, to } => {
                format!("rename {} -> {}", from.display(), to.display())
            }
            TransferOp::Remove { path } => format!("remove {}", path.display()),
        }
    }
}

/// Timeout and retry policy for transfers
#[derive(Debug, Clone)]
pub struct TransferPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub force_permissions: bool,
}

impl TransferPolicy {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            timeout: config.transfer_timeout()?,
            max_retries: config.transfer.max_retries.max(1),
            retry_delay: config.retry_delay()?,
            force_permissions: config.transfer.force_permissions,
        })
    }
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            force_permissions: true,
        }
    }
}

/// How a transfer call ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// The operation finished and the destination is current
    Completed,
    /// The worker missed its deadline and was abandoned; the destination
    /// entry is in an unknown state
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub status: TransferStatus,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl TransferOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == TransferStatus::Completed
    }
}

/// Classification of a failed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferErrorKind {
    /// Destination stayed unwritable after forcing permissions
    Permission,
    /// Any other I/O failure
    Failure,
}

/// A transfer that failed on every attempt
#[derive(Debug, Error)]
#[error("{op} failed after {attempts} attempt(s): {source}")]
pub struct TransferError {
    pub op: String,
    pub attempts: u32,
    pub elapsed: Duration,
    #[source]
    pub source: io::Error,
}

impl TransferError {
    pub fn kind(&self) -> TransferErrorKind {
        if self.source.kind() == io::ErrorKind::PermissionDenied {
            TransferErrorKind::Permission
        } else {
            TransferErrorKind::Failure
        }
    }
}

/// Executes transfers with a timeout per attempt and a fixed retry delay
#[derive(Clone)]
pub struct RetryingCopier {
    transfer: Arc<dyn Transfer>,
    policy: TransferPolicy,
}

impl RetryingCopier {
    pub fn new(transfer: Arc<dyn Transfer>, policy: TransferPolicy) -> Self {
        Self { transfer, policy }
    }

    pub fn policy(&self) -> &TransferPolicy {
        &self.policy
    }

    pub async fn copy(&self, src: &Path, dst: &Path) -> Result<TransferOutcome, TransferError> {
        self.execute(TransferOp::Copy {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        })
        .await
    }

    pub async fn rename(&self, from: &Path, to: &Path) -> Result<TransferOutcome, TransferError> {
        self.execute(TransferOp::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        })
        .await
    }

    pub async fn remove(&self, path: &Path) -> Result<TransferOutcome, TransferError> {
        self.execute(TransferOp::Remove {
            path: path.to_path_buf(),
        })
        .await
    }

    /// Run `op` until it succeeds, times out, or runs out of attempts
    pub async fn execute(&self, op: TransferOp) -> Result<TransferOutcome, TransferError> {
        let started = Instant::now();
        let max_attempts = self.policy.max_retries.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;

            match self.run_attempt(&op).await {
                Some(Ok(())) => {
                    return Ok(TransferOutcome {
                        status: TransferStatus::Completed,
                        attempts,
                        elapsed: started.elapsed(),
                    });
                }
                None => {
                    error!(
                        "Transfer timed out after {:.1}s, destination state unknown: {}",
                        self.policy.timeout.as_secs_f64(),
                        op.describe()
                    );
                    return Ok(TransferOutcome {
                        status: TransferStatus::TimedOut,
                        attempts,
                        elapsed: started.elapsed(),
                    });
                }
                Some(Err(e)) => {
                    warn!(
                        "Operation failed (attempt {}/{}): {}: {}",
                        attempts,
                        max_attempts,
                        op.describe(),
                        e
                    );

                    if attempts >= max_attempts {
                        return Err(TransferError {
                            op: op.describe(),
                            attempts,
                            elapsed: started.elapsed(),
                            source: e,
                        });
                    }

                    sleep(self.policy.retry_delay).await;
                }
            }
        }
    }

    /// One attempt on a blocking worker; `None` when the deadline passed
    async fn run_attempt(&self, op: &TransferOp) -> Option<io::Result<()>> {
        let transfer = Arc::clone(&self.transfer);
        let force_permissions = self.policy.force_permissions;
        let worker_op = op.clone();

        let worker = tokio::task::spawn_blocking(move || {
            attempt(transfer.as_ref(), &worker_op, force_permissions)
        });

        match timeout(self.policy.timeout, worker).await {
            Ok(Ok(result)) => Some(result),
            Ok(Err(join_error)) => Some(Err(io::Error::other(format!(
                "transfer worker failed: {}",
                join_error
            )))),
            // Dropping the handle detaches the worker
            Err(_) => None,
        }
    }
}

fn attempt(transfer: &dyn Transfer, op: &TransferOp, force_permissions: bool) -> io::Result<()> {
    if let Some(parent) = op.target_parent() {
        ensure_dir(parent)?;
    }

    match op.apply(transfer) {
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied && force_permissions => {
            warn!("Permission error during {}: {}", op.describe(), e);
            for path in op.touched_paths() {
                widen_permissions(path);
            }
            op.apply(transfer)
        }
        other => other,
    }
}

/// Create `dir` and its parents with a permissive mode
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    if dir.is_dir() {
        return Ok(());
    }

    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o777);
    }
    builder.create(dir)?;

    debug!("Directory created: {}", dir.display());
    Ok(())
}

/// Make `path` and its parent directory writable, ignoring failures
fn widen_permissions(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Err(e) = set_mode(parent, 0o777) {
            debug!("Could not widen {}: {}", parent.display(), e);
        }
    }

    match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => {
            if let Err(e) = set_mode(path, 0o777) {
                debug!("Could not widen {}: {}", path.display(), e);
            }
        }
        Ok(metadata) if metadata.is_file() => {
            if let Err(e) = set_mode(path, 0o666) {
                debug!("Could not widen {}: {}", path.display(), e);
            }
        }
        _ => {}
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(path: &Path, _mode: u32) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(false);
    fs::set_permissions(path, permissions)
}
