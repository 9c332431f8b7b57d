//! treemirror - one-way directory mirroring from an intermittently reachable source
//!
//! treemirror keeps a local destination tree in step with a source tree that
//! may live on a network share. A run reconciles the whole tree once and then
//! applies live changes while it watches the source connection.
//!
//! ## Core Features
//!
//! - **Bulk Reconciliation**: Copy-if-stale walk with live progress
//! - **Live Mirroring**: Create, modify, move and delete events applied in order
//! - **Resilient Transfers**: Per-attempt timeouts, bounded retries and permission recovery
//! - **Outage Supervision**: Bounded reconnection windows for flaky shares
//! - **Configuration Management**: YAML-based configuration with XDG compliance
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`daemon`]: Run orchestration
//! - [`transfer`]: Retrying copy, rename and remove

pub mod config;
pub mod daemon;
pub mod events;
pub mod filter;
pub mod health;
pub mod progress;
pub mod reachability;
pub mod reconcile;
pub mod roots;
pub mod supervisor;
pub mod transfer;
pub mod walk;
pub mod watcher;

pub use config::Config;
pub use daemon::{InitialSync, MirrorDaemon, RunOptions, RunReport};
pub use events::{EventOutcome, EventSyncer, SyncEvent};
pub use filter::PathFilter;
pub use health::HealthCheck;
pub use reachability::{ReachabilityCheck, ReachabilityProbe};
pub use reconcile::{BulkReconciler, ReconcileOutcome, ReconcileSummary};
pub use roots::SyncRoots;
pub use transfer::{FsTransfer, RetryingCopier, Transfer, TransferPolicy};
