//! Progress telemetry and operation timers
//!
//! Bulk reconciliation reports percent complete, a linear estimate of the
//! remaining time and throughput on one overwriting console line. Long
//! operations can additionally be wrapped in named timers that draw their own
//! elapsed-time line. Neither influences the operation being annotated.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;

const TIMER_REFRESH: Duration = Duration::from_millis(100);

/// Counters for one bulk reconciliation run
#[derive(Debug, Clone)]
pub struct ProgressCounters {
    pub total_files: u64,
    pub processed_files: u64,
    pub started: Instant,
}

impl ProgressCounters {
    pub fn new(total_files: u64) -> Self {
        Self {
            total_files,
            processed_files: 0,
            started: Instant::now(),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.snapshot_at(self.started.elapsed())
    }

    /// Derive telemetry as if `elapsed` had passed since the run started
    pub fn snapshot_at(&self, elapsed: Duration) -> ProgressSnapshot {
        let processed = self.processed_files;
        let total = self.total_files;

        let percent = if total == 0 {
            100
        } else {
            ((processed.min(total) * 100) / total) as u8
        };

        let remaining = if processed == 0 {
            Duration::ZERO
        } else {
            let per_file = elapsed.as_secs_f64() / processed as f64;
            let estimated_total = per_file * total.max(processed) as f64;
            Duration::from_secs_f64((estimated_total - elapsed.as_secs_f64()).max(0.0))
        };

        let rate = if elapsed.is_zero() {
            0.0
        } else {
            processed as f64 / elapsed.as_secs_f64()
        };

        ProgressSnapshot {
            processed,
            total,
            percent,
            elapsed,
            remaining,
            rate,
        }
    }
}

/// Point-in-time telemetry derived from [`ProgressCounters`]
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub total: u64,
    pub percent: u8,
    pub elapsed: Duration,
    /// Linear estimate: elapsed / processed * remaining files
    pub remaining: Duration,
    /// Files per second
    pub rate: f64,
}

/// Drives the single-line console display for a bulk run
pub struct ProgressReporter {
    counters: ProgressCounters,
    bar: ProgressBar,
    timers: TimerRegistry,
}

impl ProgressReporter {
    pub fn new(total_files: u64, timers: &TimerRegistry) -> Self {
        let bar = timers.add_line(ProgressBar::new(total_files));

        Self {
            counters: ProgressCounters::new(total_files),
            bar,
            timers: timers.clone(),
        }
    }

    pub fn counters(&self) -> &ProgressCounters {
        &self.counters
    }

    /// Count one processed file (copied, up to date or failed)
    pub fn record(&mut self, current: &str, skipped: bool) -> ProgressSnapshot {
        self.counters.processed_files += 1;
        let snapshot = self.counters.snapshot();

        let current = if skipped {
            format!("{} (skipped)", current)
        } else {
            current.to_string()
        };

        debug!(
            "Processed {}/{} ({}%): {}",
            snapshot.processed, snapshot.total, snapshot.percent, current
        );
        self.bar.set_position(snapshot.processed);
        self.bar.set_message(format!(
            "Progress: {}/{} ({}%) | Current: {} | Remaining: {} | Speed: {:.1} files/s | Total: {:.1}s",
            snapshot.processed,
            snapshot.total,
            snapshot.percent,
            current,
            format_runtime(snapshot.remaining),
            snapshot.rate,
            self.timers.run_elapsed().as_secs_f64()
        ));

        snapshot
    }

    /// Print the completion line and hand back the final numbers
    pub fn finish(self) -> ProgressSnapshot {
        let snapshot = self.counters.snapshot();
        let total_elapsed = self.timers.run_elapsed();
        let average = if total_elapsed.is_zero() {
            0.0
        } else {
            snapshot.processed as f64 / total_elapsed.as_secs_f64()
        };

        self.bar.finish_with_message(format!(
            "Progress: {}/{} (100%) | Completed! | Total time: {} | Average speed: {:.1} files/s",
            snapshot.processed,
            snapshot.total,
            format_runtime(total_elapsed),
            average
        ));

        snapshot
    }
}

/// Registry of named, concurrently running operation timers
///
/// Owned by the daemon and cloned into whatever needs to time an operation.
#[derive(Clone)]
pub struct TimerRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    multi: MultiProgress,
    console: bool,
    run_started: Instant,
    next_id: AtomicU64,
    active: Mutex<HashMap<u64, String>>,
}

impl TimerRegistry {
    pub fn new(console: bool) -> Self {
        let multi = if console {
            MultiProgress::new()
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        };

        Self {
            inner: Arc::new(RegistryInner {
                multi,
                console,
                run_started: Instant::now(),
                next_id: AtomicU64::new(1),
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Time since the registry, and with it the run, was created
    pub fn run_elapsed(&self) -> Duration {
        self.inner.run_started.elapsed()
    }

    /// Names of the timers currently running, ordered by id
    pub fn active(&self) -> Vec<(u64, String)> {
        let active = match self.inner.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut timers: Vec<_> = active.iter().map(|(id, n)| (*id, n.clone())).collect();
        timers.sort_by_key(|(id, _)| *id);
        timers
    }

    /// Start a timer; it refreshes its own console line until stopped
    pub fn start(&self, name: impl Into<String>) -> OperationTimer {
        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut active) = self.inner.active.lock() {
            active.insert(id, name.clone());
        }

        let bar = self.add_line(ProgressBar::new_spinner());
        let started = Instant::now();

        let task = if self.inner.console {
            let bar = bar.clone();
            let name = name.clone();
            let registry = self.clone();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(TIMER_REFRESH);
                loop {
                    ticker.tick().await;
                    bar.set_message(timer_line(&name, started.elapsed(), registry.run_elapsed()));
                }
            }))
        } else {
            None
        };

        debug!("Timer {} started: {}", id, name);

        OperationTimer {
            id,
            name,
            started,
            bar,
            task,
            registry: self.clone(),
            finished: false,
        }
    }

    /// Run `operation` inside a named timer
    pub async fn time<F: Future>(&self, name: impl Into<String>, operation: F) -> F::Output {
        let timer = self.start(name);
        let output = operation.await;
        timer.stop();
        output
    }

    fn add_line(&self, bar: ProgressBar) -> ProgressBar {
        if !self.inner.console {
            return ProgressBar::hidden();
        }

        let style =
            ProgressStyle::with_template("{msg}").unwrap_or_else(|_| ProgressStyle::default_bar());
        self.inner.multi.add(bar.with_style(style))
    }

    fn release(&self, id: u64) {
        if let Ok(mut active) = self.inner.active.lock() {
            active.remove(&id);
        }
    }
}

/// A running named timer; stops when dropped
pub struct OperationTimer {
    id: u64,
    name: String,
    started: Instant,
    bar: ProgressBar,
    task: Option<JoinHandle<()>>,
    registry: TimerRegistry,
    finished: bool,
}

impl OperationTimer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Stop the timer, leave its final line on screen and return the elapsed time
    pub fn stop(mut self) -> Duration {
        self.finish()
    }

    fn finish(&mut self) -> Duration {
        let elapsed = self.started.elapsed();
        if self.finished {
            return elapsed;
        }
        self.finished = true;

        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.bar.finish_with_message(timer_line(
            &self.name,
            elapsed,
            self.registry.run_elapsed(),
        ));
        self.registry.release(self.id);

        debug!("Timer {} stopped after {:.1}s: {}", self.id, elapsed.as_secs_f64(), self.name);
        elapsed
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        self.finish();
    }
}

fn timer_line(name: &str, elapsed: Duration, total: Duration) -> String {
    format!(
        "{}........{:.1}s [Total: {:.1}s]",
        name,
        elapsed.as_secs_f64(),
        total.as_secs_f64()
    )
}

/// Format a duration as "1d 2h 3m 4s", dropping leading zero units
pub fn format_runtime(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
