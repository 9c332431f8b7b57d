//! Connectivity supervision while the mirror is being monitored
//!
//! Polls the source reachability once per interval. After a failed poll it
//! enters a bounded reconnection wait; when the wait runs out without the
//! source coming back it simply starts over, so supervision never ends on its
//! own.

use crate::progress::TimerRegistry;
use crate::reachability::ReachabilityCheck;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Counters from one supervision run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub checks: u64,
    pub outages: u64,
    pub recoveries: u64,
}

enum Reconnect {
    Recovered,
    Expired,
    Shutdown,
}

/// Watches source reachability until shutdown
pub struct OutageSupervisor {
    probe: Arc<dyn ReachabilityCheck>,
    poll_interval: Duration,
    reconnect_window: Duration,
    timers: TimerRegistry,
}

impl OutageSupervisor {
    pub fn new(
        probe: Arc<dyn ReachabilityCheck>,
        poll_interval: Duration,
        reconnect_window: Duration,
        timers: TimerRegistry,
    ) -> Self {
        Self {
            probe,
            poll_interval,
            reconnect_window,
            timers,
        }
    }

    /// Poll until a shutdown message arrives or its sender is dropped
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> SupervisorStats {
        let mut stats = SupervisorStats::default();
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Supervisor received shutdown");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let reachable = tokio::select! {
                _ = shutdown.recv() => break,
                reachable = self.probe.is_reachable() => reachable,
            };
            stats.checks += 1;

            if reachable {
                continue;
            }

            stats.outages += 1;
            warn!("Remote directory became inaccessible! Waiting for reconnection...");

            match self.await_reconnect(&mut shutdown, &mut stats).await {
                Reconnect::Recovered => {
                    stats.recoveries += 1;
                    info!("Remote directory connection restored");
                }
                Reconnect::Expired => {
                    warn!(
                        "Could not reconnect within {}s, will keep trying",
                        self.reconnect_window.as_secs()
                    );
                }
                Reconnect::Shutdown => break,
            }

            ticker.reset();
        }

        info!(
            "Connection monitoring stopped: {} checks, {} outages, {} recoveries",
            stats.checks, stats.outages, stats.recoveries
        );
        stats
    }

    async fn await_reconnect(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
        stats: &mut SupervisorStats,
    ) -> Reconnect {
        let _timer = self.timers.start("Waiting for reconnection");
        let deadline = Instant::now() + self.reconnect_window;

        loop {
            tokio::select! {
                _ = shutdown.recv() => return Reconnect::Shutdown,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let reachable = tokio::select! {
                _ = shutdown.recv() => return Reconnect::Shutdown,
                reachable = self.probe.is_reachable() => reachable,
            };
            stats.checks += 1;

            if reachable {
                return Reconnect::Recovered;
            }
            if Instant::now() >= deadline {
                return Reconnect::Expired;
            }
        }
    }
}
