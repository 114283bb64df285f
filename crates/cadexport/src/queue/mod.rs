//! The serialized export queue.
//!
//! A single worker drains a sorted list of (job, format) items and drives
//! the export tool for one item at a time. The queue also owns the job
//! lifecycle operations that touch both the store and the list: submit,
//! cancel, resubmit and delete.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bridge::ConversionTool;
use crate::broadcast::Broadcaster;
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::model::{normalize_formats, ChangeEvent, Job, JobStatus, NewJob, SUPPORTED_FORMATS};
use crate::store::{JobStore, JobUpdate};

mod item;
mod progress;
mod settle;
mod worker;

pub use item::{ItemView, WorkItem};

use item::WorkList;
use progress::ProgressBook;

#[derive(Debug, Default)]
struct QueueState {
    items: WorkList,
    current: Option<WorkItem>,
}

struct Inner {
    store: Arc<dyn JobStore>,
    tool: Arc<dyn ConversionTool>,
    broadcaster: Arc<Broadcaster>,
    config: QueueConfig,
    alternate_extensions: Vec<String>,
    state: Mutex<QueueState>,
    progress: Mutex<ProgressBook>,
    /// Serializes queue position assignment.
    positions: Mutex<()>,
    wake: Notify,
}

/// Point-in-time view of the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub length: usize,
    pub processing: bool,
    pub current: Option<ItemView>,
    pub upcoming: Vec<ItemView>,
}

/// Job counts by status plus the queue length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub concluded: u64,
    pub concluded_with_errors: u64,
    pub error: u64,
    pub cancelled: u64,
    pub queued_items: usize,
}

#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new(
        store: Arc<dyn JobStore>,
        tool: Arc<dyn ConversionTool>,
        broadcaster: Arc<Broadcaster>,
        config: QueueConfig,
        alternate_extensions: Vec<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                tool,
                broadcaster,
                config,
                alternate_extensions,
                state: Mutex::new(QueueState::default()),
                progress: Mutex::new(ProgressBook::default()),
                positions: Mutex::new(()),
                wake: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn book(&self) -> MutexGuard<'_, ProgressBook> {
        self.inner
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    /// Spawns the worker. It stops when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move { queue.run_worker(cancel).await })
    }

    /// Queues the outstanding exports of `job_id`.
    ///
    /// `formats` overrides the job's requested formats. Formats that already
    /// have an artifact are skipped, as are exports already queued. A job
    /// that is currently being exported is left alone. Returns the number
    /// of items added.
    pub fn add(&self, job_id: &str, formats: Option<&[String]>) -> Result<usize, QueueError> {
        let Some(job) = self.inner.store.get(job_id)? else {
            debug!(job_id, "Not queueing unknown job");
            return Ok(0);
        };

        let wanted = match formats {
            Some(list) if !list.is_empty() => normalize_formats(list),
            _ => job.effective_formats(&self.inner.config.default_formats),
        };
        let position = match job.queue_position {
            Some(p) => p,
            None => self.inner.store.count_active()? as i64,
        };

        let added = {
            let mut state = self.state();
            if state.current.as_ref().is_some_and(|c| c.job_id == job_id) {
                info!(job_id, "Job is being exported; ignoring add");
                return Ok(0);
            }
            wanted
                .iter()
                .filter(|f| !job.has_artifact(f))
                .filter(|f| {
                    state.items.insert(WorkItem::new(
                        job_id,
                        f,
                        position,
                        self.inner.config.is_heavy(f),
                    ))
                })
                .count()
        };

        self.book().forget(job_id);
        if added > 0 {
            debug!(job_id, added, position, "Queued exports");
            self.inner.wake.notify_one();
        }
        Ok(added)
    }

    /// Drops every queued item of `job_id`. The running item is unaffected.
    pub fn remove(&self, job_id: &str) -> bool {
        let removed = self.state().items.remove_job(job_id);
        if removed.is_empty() {
            return false;
        }
        if !self.is_current(job_id) {
            self.book().forget(job_id);
        }
        debug!(job_id, removed = removed.len(), "Removed queued exports");
        true
    }

    pub fn status(&self) -> QueueSnapshot {
        let state = self.state();
        QueueSnapshot {
            length: state.items.len(),
            processing: state.current.is_some(),
            current: state.current.as_ref().map(ItemView::from),
            upcoming: state
                .items
                .iter()
                .take(self.inner.config.status_preview_limit)
                .map(ItemView::from)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state();
        state.items.is_empty() && state.current.is_none()
    }

    fn is_current(&self, job_id: &str) -> bool {
        self.state()
            .current
            .as_ref()
            .is_some_and(|c| c.job_id == job_id)
    }

    fn has_queued(&self, job_id: &str) -> bool {
        self.state().items.contains_job(job_id)
    }

    /// Re-queues pending jobs left in the store, oldest position first.
    pub fn recover(&self) -> Result<usize, QueueError> {
        let pending = self
            .inner
            .store
            .pending_in_queue_order(self.inner.config.recovery_limit)?;
        let mut queued = 0;
        for job in &pending {
            if self.add(&job.id, None)? > 0 {
                queued += 1;
            }
        }
        info!(jobs = queued, "Recovered pending jobs into the queue");
        Ok(queued)
    }

    fn next_position(&self) -> Result<(MutexGuard<'_, ()>, i64), QueueError> {
        let guard = self
            .inner
            .positions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let position = self.inner.store.count_active()? as i64 + 1;
        Ok((guard, position))
    }

    fn validate(&self, new: &NewJob) -> Result<Vec<String>, QueueError> {
        for (field, value) in [
            ("sourceFile", &new.source_file),
            ("computerOfOrigin", &new.computer_of_origin),
            ("destinationPath", &new.destination_path),
        ] {
            if value.trim().is_empty() {
                return Err(QueueError::InvalidSubmission(format!(
                    "{} must not be empty",
                    field
                )));
            }
        }

        let formats = normalize_formats(&new.requested_formats);
        if let Some(bad) = formats
            .iter()
            .find(|f| !SUPPORTED_FORMATS.contains(&f.as_str()))
        {
            return Err(QueueError::InvalidSubmission(format!(
                "unsupported format '{}' (expected one of {})",
                bad,
                SUPPORTED_FORMATS.join(", ")
            )));
        }
        if formats.is_empty() {
            return Ok(normalize_formats(&self.inner.config.default_formats));
        }
        Ok(formats)
    }

    fn insert_new(
        &self,
        new: NewJob,
        formats: Vec<String>,
        position: i64,
    ) -> Result<Job, QueueError> {
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            source_file: new.source_file.trim().to_string(),
            computer_of_origin: new.computer_of_origin.trim().to_string(),
            destination_path: new.destination_path.trim().to_string(),
            original_path: new.original_path.filter(|p| !p.trim().is_empty()),
            working_dir: new.working_dir.filter(|p| !p.trim().is_empty()),
            status: JobStatus::Pending,
            requested_formats: formats,
            produced_artifacts: vec![],
            queue_position: Some(position),
            progress_percent: 0,
            errors: vec![],
            attempts: 0,
            created_at: now,
            updated_at: now,
            cancelled_at: None,
        };
        self.inner.store.insert(&job)?;
        Ok(job)
    }

    /// Queues a freshly stored job and announces it.
    async fn announce_new(&self, job: &Job) {
        if let Err(e) = self.add(&job.id, None) {
            warn!(job_id = %job.id, error = %e, "Stored job could not be queued; recovery will pick it up");
        }
        self.inner
            .broadcaster
            .emit(&ChangeEvent::Insert(job.clone()))
            .await;
    }

    /// Creates a pending job, queues it and announces it.
    pub async fn submit(&self, new: NewJob) -> Result<Job, QueueError> {
        let formats = self.validate(&new)?;
        let job = {
            let (_guard, position) = self.next_position()?;
            self.insert_new(new, formats, position)?
        };
        info!(job_id = %job.id, source = %job.source_file, formats = ?job.requested_formats, "Job submitted");

        self.add(&job.id, None)?;
        self.inner
            .broadcaster
            .emit(&ChangeEvent::Insert(job.clone()))
            .await;
        Ok(job)
    }

    /// Submits several jobs, one result per entry in input order.
    ///
    /// A rejected entry does not stop the others. Accepted entries get
    /// consecutive queue positions. Only an empty or oversized batch fails
    /// as a whole.
    pub async fn submit_batch(
        &self,
        batch: Vec<NewJob>,
    ) -> Result<Vec<Result<Job, QueueError>>, QueueError> {
        if batch.is_empty() {
            return Err(QueueError::InvalidSubmission("batch is empty".to_string()));
        }
        if batch.len() > self.inner.config.max_batch {
            return Err(QueueError::InvalidSubmission(format!(
                "batch of {} exceeds the limit of {}",
                batch.len(),
                self.inner.config.max_batch
            )));
        }

        let results: Vec<Result<Job, QueueError>> = {
            let (_guard, mut position) = self.next_position()?;
            batch
                .into_iter()
                .map(|new| -> Result<Job, QueueError> {
                    let formats = self.validate(&new)?;
                    let job = self.insert_new(new, formats, position)?;
                    position += 1;
                    Ok(job)
                })
                .collect()
        };

        for (index, result) in results.iter().enumerate() {
            match result {
                Ok(job) => self.announce_new(job).await,
                Err(e) => warn!(index, error = %e, "Batch entry rejected"),
            }
        }
        let accepted = results.iter().filter(|r| r.is_ok()).count();
        info!(accepted, rejected = results.len() - accepted, "Batch submitted");
        Ok(results)
    }

    /// Cancels a pending or processing job.
    ///
    /// An export already running for the job finishes, and its result is
    /// discarded.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, QueueError> {
        let job = self.require(job_id)?;
        if !job.status.is_active() {
            return Err(QueueError::InvalidTransition {
                id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Cancelled,
            });
        }

        self.remove(job_id);
        let update = JobUpdate::status(JobStatus::Cancelled).with_cancelled_at(Some(Utc::now()));
        self.inner.store.update(job_id, &update)?;
        let job = self.require(job_id)?;
        info!(job_id, "Job cancelled");

        self.inner
            .broadcaster
            .emit(&ChangeEvent::Update(job.clone()))
            .await;
        Ok(job)
    }

    /// Moves a settled or cancelled job back to pending for the formats it
    /// has not produced yet, heavy formats last.
    pub async fn resubmit(&self, job_id: &str) -> Result<Job, QueueError> {
        let job = self.require(job_id)?;
        if job.status == JobStatus::Processing {
            return Err(QueueError::InvalidTransition {
                id: job_id.to_string(),
                from: job.status,
                to: JobStatus::Pending,
            });
        }

        let mut remaining = job.outstanding_formats(&self.inner.config.default_formats);
        if remaining.is_empty() {
            return Err(QueueError::NothingToResubmit(job_id.to_string()));
        }
        remaining.sort_by_key(|f| self.inner.config.is_heavy(f));

        {
            let (_guard, position) = self.next_position()?;
            let update = JobUpdate::status(JobStatus::Pending)
                .with_errors(vec![])
                .with_cancelled_at(None)
                .with_queue_position(Some(position));
            self.inner.store.update(job_id, &update)?;
        }
        self.remove(job_id);
        self.add(job_id, Some(&remaining))?;

        let job = self.require(job_id)?;
        info!(job_id, formats = ?remaining, "Job resubmitted");
        self.inner
            .broadcaster
            .emit(&ChangeEvent::Update(job.clone()))
            .await;
        Ok(job)
    }

    /// Removes a job from the queue and the store. Returns whether it existed.
    pub async fn delete(&self, job_id: &str) -> Result<bool, QueueError> {
        self.remove(job_id);
        let existed = self.inner.store.delete(job_id)?;
        if existed {
            info!(job_id, "Job deleted");
            self.inner
                .broadcaster
                .emit(&ChangeEvent::Delete(job_id.to_string()))
                .await;
        } else {
            warn!(job_id, "Delete requested for unknown job");
        }
        Ok(existed)
    }

    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        let store = &self.inner.store;
        Ok(QueueStats {
            total: store.count_by_status(None)?,
            pending: store.count_by_status(Some(JobStatus::Pending))?,
            processing: store.count_by_status(Some(JobStatus::Processing))?,
            concluded: store.count_by_status(Some(JobStatus::Concluded))?,
            concluded_with_errors: store
                .count_by_status(Some(JobStatus::ConcludedWithErrors))?,
            error: store.count_by_status(Some(JobStatus::Error))?,
            cancelled: store.count_by_status(Some(JobStatus::Cancelled))?,
            queued_items: self.state().items.len(),
        })
    }

    fn require(&self, job_id: &str) -> Result<Job, QueueError> {
        self.inner
            .store
            .get(job_id)?
            .ok_or_else(|| QueueError::RecordNotFound(job_id.to_string()))
    }
}
