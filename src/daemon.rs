//! Mirror daemon - drives a full run from reachability gate to shutdown
//!
//! A run checks that the source can be reached, performs the initial
//! reconciliation, and then (unless monitoring is disabled) applies live
//! changes while supervising connectivity until Ctrl+C or an explicit
//! shutdown message.

use crate::config::Config;
use crate::events::EventSyncer;
use crate::filter::PathFilter;
use crate::progress::{format_runtime, TimerRegistry};
use crate::reachability::{ReachabilityCheck, ReachabilityProbe};
use crate::reconcile::{BulkReconciler, ReconcileOutcome};
use crate::roots::SyncRoots;
use crate::supervisor::{OutageSupervisor, SupervisorStats};
use crate::transfer::{FsTransfer, RetryingCopier, Transfer, TransferPolicy};
use crate::watcher::SourceWatcher;
use anyhow::{bail, Context, Result};
use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// How the initial reconciliation treats an existing destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialSync {
    /// Reconcile regardless of what the destination holds
    Full,
    /// Leave a non-empty destination untouched
    SkipIfPopulated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub initial_sync: InitialSync,
    /// Keep applying live changes after the initial reconciliation
    pub watch: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            initial_sync: InitialSync::Full,
            watch: true,
        }
    }
}

/// What a finished run did
#[derive(Debug, Clone)]
pub struct RunReport {
    /// `None` when the reconciliation itself failed
    pub reconcile: Option<ReconcileOutcome>,
    pub events_handled: u64,
    /// `None` when monitoring was disabled
    pub supervisor: Option<SupervisorStats>,
    pub runtime: Duration,
}

/// Owns every component of one mirror between a source and a destination
pub struct MirrorDaemon {
    roots: SyncRoots,
    probe: Arc<dyn ReachabilityCheck>,
    reconciler: BulkReconciler,
    syncer: EventSyncer,
    timers: TimerRegistry,
    poll_interval: Duration,
    reconnect_window: Duration,
    shutdown_sender: broadcast::Sender<()>,
}

impl MirrorDaemon {
    /// Build a daemon over the local filesystem with the configured probe
    pub fn new(config: &Config, roots: SyncRoots) -> Result<Self> {
        let probe = ReachabilityProbe::new(roots.source(), config)
            .context("Failed to set up reachability probe")?;
        Self::with_components(config, roots, Arc::new(FsTransfer::new()), Arc::new(probe))
    }

    /// Build a daemon around a caller-supplied transfer backend and probe
    pub fn with_components(
        config: &Config,
        roots: SyncRoots,
        transfer: Arc<dyn Transfer>,
        probe: Arc<dyn ReachabilityCheck>,
    ) -> Result<Self> {
        let policy = TransferPolicy::from_config(config)?;
        let poll_interval = config.poll_interval()?;
        let reconnect_window = config.reconnect_window()?;

        let timers = TimerRegistry::new(config.display.console_progress);
        let filter = PathFilter::new(roots.clone(), &config.filter.ignored_segments);
        let copier = RetryingCopier::new(transfer, policy);
        let reconciler = BulkReconciler::new(
            roots.clone(),
            filter.clone(),
            copier.clone(),
            probe.clone(),
            timers.clone(),
        );
        let syncer = EventSyncer::new(
            roots.clone(),
            filter,
            copier,
            reconciler.clone(),
            timers.clone(),
        );

        let (shutdown_sender, _) = broadcast::channel(1);

        Ok(Self {
            roots,
            probe,
            reconciler,
            syncer,
            timers,
            poll_interval,
            reconnect_window,
            shutdown_sender,
        })
    }

    /// Sender that stops a running monitor when a message is sent on it
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }

    /// Perform one run
    ///
    /// Fails only when the source cannot be reached at startup or the
    /// filesystem subscription cannot be established.
    pub async fn run(&self, options: RunOptions) -> Result<RunReport> {
        info!(
            "Program started at {}",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        info!(
            "Mirroring {} -> {}",
            self.roots.source().display(),
            self.roots.destination().display()
        );

        let reachable = self
            .timers
            .time("Checking remote connection", self.probe.is_reachable())
            .await;
        if !reachable {
            error!("Remote directory not accessible, exiting");
            bail!(
                "Source directory is not accessible: {}",
                self.roots.source().display()
            );
        }

        let skip_if_populated = options.initial_sync == InitialSync::SkipIfPopulated;
        let reconcile = match self.reconciler.run(skip_if_populated).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!("Initial sync failed: {:#}", e);
                None
            }
        };

        if !options.watch {
            info!("Monitoring disabled, exiting without monitoring");
            return Ok(self.finish(reconcile, 0, None));
        }

        // Subscribe before anything can send
        let consumer_shutdown = self.shutdown_sender.subscribe();
        let supervisor_shutdown = self.shutdown_sender.subscribe();

        let sender = self.shutdown_sender.clone();
        let signal = tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Stopping file monitoring...");
                    let _ = sender.send(());
                }
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        });

        let source = self.roots.source().to_path_buf();
        let started = self
            .timers
            .time("Starting file monitoring", async { SourceWatcher::new(&source) })
            .await;
        let mut watcher = match started {
            Ok(watcher) => watcher,
            Err(e) => {
                signal.abort();
                return Err(e.context("Failed to start file monitoring"));
            }
        };
        info!("Started monitoring, press Ctrl+C to stop...");

        let syncer = self.syncer.clone();
        let consumer = tokio::spawn(async move {
            syncer.process_events(&mut watcher, consumer_shutdown).await
        });

        let supervisor = OutageSupervisor::new(
            self.probe.clone(),
            self.poll_interval,
            self.reconnect_window,
            self.timers.clone(),
        );
        let stats = supervisor.run(supervisor_shutdown).await;

        // Covers a supervisor that ended because every sender was dropped
        let _ = self.shutdown_sender.send(());
        signal.abort();

        let events_handled = match consumer.await {
            Ok(handled) => handled,
            Err(e) => {
                error!("Event consumer stopped abnormally: {}", e);
                0
            }
        };
        debug!("Event consumer finished after {} events", events_handled);

        Ok(self.finish(reconcile, events_handled, Some(stats)))
    }

    fn finish(
        &self,
        reconcile: Option<ReconcileOutcome>,
        events_handled: u64,
        supervisor: Option<SupervisorStats>,
    ) -> RunReport {
        let runtime = self.timers.run_elapsed();
        info!("Total runtime: {}", format_runtime(runtime));

        RunReport {
            reconcile,
            events_handled,
            supervisor,
            runtime,
        }
    }
}
