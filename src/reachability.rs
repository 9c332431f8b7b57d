//! Source reachability probing
//!
//! The source root may live on a network share that comes and goes. A probe is
//! a sequence of explicit steps: a direct existence check, a best-effort share
//! mapping (which may mount something as a side effect), and a coarse host
//! liveness check that is logged but never counts as reachable.

use crate::config::Config;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Command as AsyncCommand;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Last observed reachability of the source root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReachabilityState {
    pub accessible: bool,
    pub last_checked: Option<DateTime<Local>>,
}

/// Anything that can tell whether the source is currently usable
#[async_trait]
pub trait ReachabilityCheck: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Reachability probe for one source root
pub struct ReachabilityProbe {
    source: PathBuf,
    host: Option<String>,
    share_port: u16,
    connect_timeout: Duration,
    mount_command: Vec<String>,
    mount_point: Option<PathBuf>,
    state: Mutex<ReachabilityState>,
}

impl ReachabilityProbe {
    pub fn new(source: &Path, config: &Config) -> Result<Self> {
        let host = config
            .reachability
            .host
            .clone()
            .or_else(|| host_from_share_path(source));

        Ok(Self {
            source: source.to_path_buf(),
            host,
            share_port: config.reachability.share_port,
            connect_timeout: config.connect_timeout()?,
            mount_command: config.reachability.mount_command.clone(),
            mount_point: config.reachability.mount_point.as_ref().map(PathBuf::from),
            state: Mutex::new(ReachabilityState {
                accessible: false,
                last_checked: None,
            }),
        })
    }

    /// Step one: the source root exists as given
    ///
    /// A stat that hangs on a dead mount counts as unreachable once the
    /// connect timeout passes.
    pub async fn probe_direct(&self) -> bool {
        exists_within(
            tokio::fs::try_exists(&self.source),
            self.connect_timeout,
            &self.source,
        )
        .await
    }

    /// Step two: map the share and check it through the mount point
    ///
    /// Runs the configured mount command, which may leave an OS mount behind.
    /// Failure is never fatal.
    pub async fn probe_via_mount(&self) -> bool {
        let (Some(program), Some(mount_point)) = (self.mount_command.first(), &self.mount_point)
        else {
            return false;
        };

        let source = self.source.to_string_lossy();
        let args: Vec<String> = self.mount_command[1..]
            .iter()
            .map(|arg| arg.replace("{source}", &source))
            .collect();

        debug!("Mapping share: {} {}", program, args.join(" "));

        let output = AsyncCommand::new(program)
            .args(&args)
            .kill_on_drop(true)
            .output();

        match timeout(self.connect_timeout, output).await {
            Ok(Ok(output)) if !output.status.success() => {
                debug!(
                    "Share mapping exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Failed to map network share: {}", e),
            Err(_) => warn!(
                "Share mapping timed out after {}s",
                self.connect_timeout.as_secs_f64()
            ),
        }

        exists_within(
            tokio::fs::try_exists(mount_point),
            self.connect_timeout,
            mount_point,
        )
        .await
    }

    /// Step three: TCP connect to the file-sharing port of the source host
    ///
    /// A live host does not mean the share is mountable, so callers must not
    /// treat success as reachability.
    pub async fn probe_host(&self) -> bool {
        let Some(host) = &self.host else {
            return false;
        };

        let connect = TcpStream::connect((host.as_str(), self.share_port));
        match timeout(self.connect_timeout, connect).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Host {}:{} refused: {}", host, self.share_port, e);
                false
            }
            Err(_) => {
                debug!("Host {}:{} did not answer", host, self.share_port);
                false
            }
        }
    }

    /// Snapshot of the last probe result
    pub fn state(&self) -> ReachabilityState {
        match self.state.lock() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn record(&self, accessible: bool) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.accessible = accessible;
        state.last_checked = Some(Local::now());
    }
}

#[async_trait]
impl ReachabilityCheck for ReachabilityProbe {
    async fn is_reachable(&self) -> bool {
        if self.probe_direct().await {
            self.record(true);
            return true;
        }

        if self.probe_via_mount().await {
            info!("Source reachable through mapped share");
            self.record(true);
            return true;
        }

        // Polled every second during an outage; the supervisor owns the warnings
        if self.probe_host().await {
            debug!(
                "Host {} is alive but {} is not accessible",
                self.host.as_deref().unwrap_or_default(),
                self.source.display()
            );
        } else {
            debug!("Remote directory not accessible: {}", self.source.display());
        }

        self.record(false);
        false
    }
}

async fn exists_within<F>(check: F, limit: Duration, path: &Path) -> bool
where
    F: Future<Output = std::io::Result<bool>>,
{
    match timeout(limit, check).await {
        Ok(Ok(exists)) => exists,
        Ok(Err(e)) => {
            debug!("Existence check of {} failed: {}", path.display(), e);
            false
        }
        Err(_) => {
            debug!(
                "Existence check of {} did not finish within {:.1}s",
                path.display(),
                limit.as_secs_f64()
            );
            false
        }
    }
}

/// Extract the host of a UNC-style path (`\\host\share` or `//host/share`)
pub fn host_from_share_path(path: &Path) -> Option<String> {
    let raw = path.to_string_lossy();
    let rest = raw
        .strip_prefix(r"\\")
        .or_else(|| raw.strip_prefix("//"))?;

    let host = rest.split(['\\', '/']).next()?;
    if host.is_empty() || host == "?" || host == "." {
        None
    } else {
        Some(host.to_string())
    }
}
