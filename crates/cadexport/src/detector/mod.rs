//! Change detection for the shared jobs table.
//!
//! Other processes write to the same database, so the service has to notice
//! inserts, updates and deletes it did not make itself. Two strategies:
//!
//! - [`NotifyDetector`] tails a push-style [`NotificationSource`] (by
//!   default the trigger-fed `job_changes` table) and debounces per id.
//! - [`WatchDetector`] observes the database files and diffs snapshots,
//!   falling back to a periodic rescan when observation is unavailable.
//!
//! Both feed the same [`DetectorContext`]: changes are broadcast, and newly
//! seen pending jobs are queued.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::broadcast::Broadcaster;
use crate::config::{DetectorConfig, DetectorMode};
use crate::db::Database;
use crate::error::DetectorError;
use crate::model::{ChangeEvent, JobStatus};
use crate::queue::JobQueue;
use crate::store::JobStore;

mod diff;
mod feed;
mod notify;
mod watch;

pub use diff::{Fingerprint, StateCache};
pub use feed::SqliteChangeFeed;
pub use notify::NotifyDetector;
pub use watch::WatchDetector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "INSERT" => Some(ChangeOp::Insert),
            "UPDATE" => Some(ChangeOp::Update),
            "DELETE" => Some(ChangeOp::Delete),
            _ => None,
        }
    }
}

/// A change announced by a notification source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub op: ChangeOp,
    pub job_id: String,
}

/// Something that can push change notifications.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn NotificationStream>, DetectorError>;
}

#[async_trait]
pub trait NotificationStream: Send {
    /// Next notification; `Ok(None)` when the channel closed.
    ///
    /// Must be cancel safe: dropping the future loses nothing.
    async fn next(&mut self) -> Result<Option<Notification>, DetectorError>;
}

/// Where detected changes go.
#[derive(Clone)]
pub struct DetectorContext {
    store: Arc<dyn JobStore>,
    broadcaster: Arc<Broadcaster>,
    queue: JobQueue,
}

impl DetectorContext {
    pub fn new(store: Arc<dyn JobStore>, broadcaster: Arc<Broadcaster>, queue: JobQueue) -> Self {
        Self {
            store,
            broadcaster,
            queue,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    async fn publish(&self, event: ChangeEvent) {
        if let ChangeEvent::Insert(job) = &event {
            if job.status == JobStatus::Pending {
                if let Err(e) = self.queue.add(&job.id, None) {
                    error!(job_id = %job.id, error = %e, "Failed to queue detected job");
                }
            }
        }
        self.broadcaster.emit(&event).await;
    }
}

/// The configured detection strategy.
pub enum ChangeDetector {
    Notify(NotifyDetector),
    Watch(WatchDetector),
}

impl ChangeDetector {
    pub fn from_config(config: &DetectorConfig, db: &Database, ctx: DetectorContext) -> Self {
        match config.mode {
            DetectorMode::Notify => {
                let feed = SqliteChangeFeed::new(db.clone(), config.notify_poll());
                ChangeDetector::Notify(NotifyDetector::new(Arc::new(feed), ctx, config.clone()))
            }
            DetectorMode::Watch => ChangeDetector::Watch(WatchDetector::new(
                db.path().map(Path::to_path_buf),
                ctx,
                config.clone(),
            )),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        match self {
            ChangeDetector::Notify(detector) => detector.run(cancel).await,
            ChangeDetector::Watch(detector) => detector.run(cancel).await,
        }
    }
}
