//! Persistence seam for jobs.
//!
//! `JobStore` is what the queue, detector and fan-out layers talk to.
//! `LocalCache` is the narrower write surface the sync client mirrors into.
//! Both are synchronous: SQLite calls are sub-millisecond and serialized
//! behind the `Database` mutex.

use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::model::{Artifact, Job, JobStatus};

mod sqlite;

pub use sqlite::SqliteJobStore;

/// Partial update of a job. `updated_at` is always refreshed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    /// Never lowers the stored progress.
    pub progress: Option<u8>,
    pub produced_artifacts: Option<Vec<Artifact>>,
    pub errors: Option<Vec<String>>,
    pub attempts: Option<u32>,
    pub queue_position: Option<Option<i64>>,
    pub cancelled_at: Option<Option<DateTime<Utc>>>,
    /// Leave the record alone if it is currently in this status.
    pub unless_status: Option<JobStatus>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress.min(100));
        self
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.produced_artifacts = Some(artifacts);
        self
    }

    pub fn with_errors(mut self, errors: Vec<String>) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_queue_position(mut self, position: Option<i64>) -> Self {
        self.queue_position = Some(position);
        self
    }

    pub fn with_cancelled_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.cancelled_at = Some(at);
        self
    }

    pub fn unless(mut self, status: JobStatus) -> Self {
        self.unless_status = Some(status);
        self
    }
}

pub trait JobStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Newest first.
    fn list(
        &self,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>, StoreError>;

    fn insert(&self, job: &Job) -> Result<(), StoreError>;

    /// Returns whether the record was written: `false` when it is missing
    /// or its status matches `update.unless_status`.
    fn update(&self, id: &str, update: &JobUpdate) -> Result<bool, StoreError>;

    /// Returns whether the record existed.
    fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// Counts jobs in `status`, or all jobs when `None`.
    fn count_by_status(&self, status: Option<JobStatus>) -> Result<u64, StoreError>;

    /// Counts pending plus processing jobs.
    fn count_active(&self) -> Result<u64, StoreError>;

    /// Pending jobs in queue order, used to rebuild the queue on startup.
    fn pending_in_queue_order(&self, limit: u32) -> Result<Vec<Job>, StoreError>;
}

pub trait LocalCache: Send + Sync {
    /// Writes every record in one transaction.
    fn upsert_all(&self, jobs: &[Job]) -> Result<(), StoreError>;

    fn remove(&self, id: &str) -> Result<(), StoreError>;
}
