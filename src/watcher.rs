//! Filesystem change notifications for the source tree
//!
//! Wraps a recursive `notify` watcher. Raw notifications are translated into
//! [`SyncEvent`]s on a tokio task so that the two halves of a rename can be
//! paired before anything is emitted.

use crate::events::SyncEvent;
use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How long the first half of a rename waits for its partner
pub const RENAME_PAIRING_WINDOW: Duration = Duration::from_millis(500);

struct PendingFrom {
    tracker: Option<usize>,
    path: PathBuf,
    deadline: Instant,
}

/// Stateful notify-to-[`SyncEvent`] translation
pub struct EventTranslator {
    window: Duration,
    pending: Vec<PendingFrom>,
}

impl Default for EventTranslator {
    fn default() -> Self {
        Self::new(RENAME_PAIRING_WINDOW)
    }
}

impl EventTranslator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Vec::new(),
        }
    }

    /// Translate one notification received at `now`
    pub fn translate(&mut self, event: Event, now: Instant) -> Vec<SyncEvent> {
        let tracker = event.attrs.tracker();

        match event.kind {
            EventKind::Create(kind) => event
                .paths
                .into_iter()
                .map(|path| {
                    let is_dir = kind == CreateKind::Folder || path.is_dir();
                    SyncEvent::Created { path, is_dir }
                })
                .collect(),

            EventKind::Remove(kind) => event
                .paths
                .into_iter()
                .map(|path| SyncEvent::Deleted {
                    path,
                    is_dir: kind == RemoveKind::Folder,
                })
                .collect(),

            EventKind::Modify(ModifyKind::Name(mode)) => self.rename(mode, tracker, event.paths, now),

            EventKind::Modify(_) => event
                .paths
                .into_iter()
                .map(|path| {
                    let is_dir = path.is_dir();
                    SyncEvent::Modified { path, is_dir }
                })
                .collect(),

            EventKind::Access(_) => Vec::new(),

            EventKind::Any | EventKind::Other => {
                debug!("Dropping unclassified event: {:?}", event);
                Vec::new()
            }
        }
    }

    fn rename(
        &mut self,
        mode: RenameMode,
        tracker: Option<usize>,
        paths: Vec<PathBuf>,
        now: Instant,
    ) -> Vec<SyncEvent> {
        match mode {
            RenameMode::Both => {
                let mut paths = paths.into_iter();
                let (Some(from), Some(to)) = (paths.next(), paths.next()) else {
                    return Vec::new();
                };
                self.pending
                    .retain(|p| p.path != from && (tracker.is_none() || p.tracker != tracker));
                let is_dir = to.is_dir();
                vec![SyncEvent::Moved { from, to, is_dir }]
            }

            RenameMode::From => {
                for path in paths {
                    self.pending.push(PendingFrom {
                        tracker,
                        path,
                        deadline: now + self.window,
                    });
                }
                Vec::new()
            }

            RenameMode::To => {
                if let Some(index) = tracker.and_then(|t| {
                    self.pending.iter().position(|p| p.tracker == Some(t))
                }) {
                    // The matching Both notification carries the move
                    self.pending.remove(index);
                    return Vec::new();
                }
                paths
                    .into_iter()
                    .map(|path| {
                        let is_dir = path.is_dir();
                        SyncEvent::Created { path, is_dir }
                    })
                    .collect()
            }

            RenameMode::Any | RenameMode::Other => paths
                .into_iter()
                .map(|path| {
                    if path.exists() {
                        let is_dir = path.is_dir();
                        SyncEvent::Created { path, is_dir }
                    } else {
                        SyncEvent::Deleted {
                            path,
                            is_dir: false,
                        }
                    }
                })
                .collect(),
        }
    }

    /// Emit unpaired rename sources whose window has passed as deletions
    pub fn flush_expired(&mut self, now: Instant) -> Vec<SyncEvent> {
        let (expired, pending): (Vec<_>, Vec<_>) =
            self.pending.drain(..).partition(|p| p.deadline <= now);
        self.pending = pending;

        expired
            .into_iter()
            .map(|p| SyncEvent::Deleted {
                path: p.path,
                is_dir: false,
            })
            .collect()
    }

    /// Earliest moment a pending rename source expires
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|p| p.deadline).min()
    }
}

/// Live subscription to changes under the source root
///
/// Dropping the watcher stops the subscription.
pub struct SourceWatcher {
    watcher: Option<RecommendedWatcher>,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    translator: Option<JoinHandle<()>>,
}

impl SourceWatcher {
    /// Start watching `root` recursively. Must be called inside a tokio runtime.
    pub fn new(root: &Path) -> Result<Self> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = raw_tx.send(res);
            },
            notify::Config::default(),
        )
        .context("Failed to create filesystem watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        let translator = tokio::spawn(translate_events(raw_rx, tx, EventTranslator::default()));

        info!("Monitoring changes in {}", root.display());

        Ok(Self {
            watcher: Some(watcher),
            events: rx,
            translator: Some(translator),
        })
    }

    /// A source fed from a channel instead of the filesystem
    pub fn from_receiver(events: mpsc::UnboundedReceiver<SyncEvent>) -> Self {
        Self {
            watcher: None,
            events,
            translator: None,
        }
    }

    /// Next event in delivery order; `None` once the subscription has ended
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.watcher.take();
        if let Some(translator) = self.translator.take() {
            translator.abort();
        }
    }
}

async fn translate_events(
    mut raw: mpsc::UnboundedReceiver<notify::Result<Event>>,
    out: mpsc::UnboundedSender<SyncEvent>,
    mut translator: EventTranslator,
) {
    loop {
        let received = match translator.next_deadline() {
            Some(deadline) => match tokio::time::timeout_at(deadline, raw.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    if !forward(&out, translator.flush_expired(Instant::now())) {
                        return;
                    }
                    continue;
                }
            },
            None => raw.recv().await,
        };

        let now = Instant::now();
        let mut events = translator.flush_expired(now);

        match received {
            Some(Ok(event)) => events.extend(translator.translate(event, now)),
            Some(Err(e)) => warn!("Watch error: {}", e),
            None => {
                events.extend(translator.flush_expired(now + RENAME_PAIRING_WINDOW));
                forward(&out, events);
                return;
            }
        }

        if !forward(&out, events) {
            return;
        }
    }
}

fn forward(out: &mpsc::UnboundedSender<SyncEvent>, events: Vec<SyncEvent>) -> bool {
    events.into_iter().all(|event| out.send(event).is_ok())
}
