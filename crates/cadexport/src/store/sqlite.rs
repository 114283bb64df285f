use chrono::{DateTime, SecondsFormat, Utc};

use super::{JobStore, JobUpdate, LocalCache};
use crate::db::job_repo::{self, JobFilter, JobPatch, JobRow};
use crate::db::Database;
use crate::error::StoreError;
use crate::model::{Artifact, Job, JobStatus};

/// `JobStore` backed by the SQLite `jobs` table.
#[derive(Clone)]
pub struct SqliteJobStore {
    db: Database,
}

impl SqliteJobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(id: &str, column: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            column,
            reason: e.to_string(),
        })
}

fn encode<T: serde::Serialize>(column: &'static str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|source| StoreError::Encode { column, source })
}

fn decode<T: serde::de::DeserializeOwned>(
    id: &str,
    column: &'static str,
    raw: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        id: id.to_string(),
        column,
        reason: e.to_string(),
    })
}

fn to_row(job: &Job) -> Result<JobRow, StoreError> {
    Ok(JobRow {
        id: job.id.clone(),
        source_file: job.source_file.clone(),
        computer_of_origin: job.computer_of_origin.clone(),
        destination_path: job.destination_path.clone(),
        original_path: job.original_path.clone(),
        working_dir: job.working_dir.clone(),
        status: job.status.as_str().to_string(),
        requested_formats: encode("requested_formats", &job.requested_formats)?,
        produced_artifacts: encode("produced_artifacts", &job.produced_artifacts)?,
        queue_position: job.queue_position,
        progress: i64::from(job.progress_percent.min(100)),
        errors: encode("errors", &job.errors)?,
        attempts: i64::from(job.attempts),
        created_at: timestamp(&job.created_at),
        updated_at: timestamp(&job.updated_at),
        cancelled_at: job.cancelled_at.as_ref().map(timestamp),
    })
}

fn from_row(row: JobRow) -> Result<Job, StoreError> {
    let status = row
        .status
        .parse::<JobStatus>()
        .map_err(|reason| StoreError::Corrupt {
            id: row.id.clone(),
            column: "status",
            reason,
        })?;
    let requested_formats: Vec<String> =
        decode(&row.id, "requested_formats", &row.requested_formats)?;
    let produced_artifacts: Vec<Artifact> =
        decode(&row.id, "produced_artifacts", &row.produced_artifacts)?;
    let errors: Vec<String> = decode(&row.id, "errors", &row.errors)?;
    let created_at = parse_timestamp(&row.id, "created_at", &row.created_at)?;
    let updated_at = parse_timestamp(&row.id, "updated_at", &row.updated_at)?;
    let cancelled_at = match row.cancelled_at {
        Some(ref raw) => Some(parse_timestamp(&row.id, "cancelled_at", raw)?),
        None => None,
    };

    Ok(Job {
        id: row.id,
        source_file: row.source_file,
        computer_of_origin: row.computer_of_origin,
        destination_path: row.destination_path,
        original_path: row.original_path,
        working_dir: row.working_dir,
        status,
        requested_formats,
        produced_artifacts,
        queue_position: row.queue_position,
        progress_percent: row.progress.clamp(0, 100) as u8,
        errors,
        attempts: row.attempts.max(0) as u32,
        created_at,
        updated_at,
        cancelled_at,
    })
}

fn to_patch(update: &JobUpdate) -> Result<JobPatch, StoreError> {
    Ok(JobPatch {
        status: update.status.map(|s| s.as_str().to_string()),
        progress: update.progress.map(|p| i64::from(p.min(100))),
        produced_artifacts: update
            .produced_artifacts
            .as_ref()
            .map(|a| encode("produced_artifacts", a))
            .transpose()?,
        errors: update
            .errors
            .as_ref()
            .map(|e| encode("errors", e))
            .transpose()?,
        attempts: update.attempts.map(i64::from),
        queue_position: update.queue_position,
        cancelled_at: update
            .cancelled_at
            .map(|at| at.as_ref().map(timestamp)),
        updated_at: timestamp(&Utc::now()),
        unless_status: update.unless_status.map(|s| s.as_str().to_string()),
    })
}

fn rows_to_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
    rows.into_iter().map(from_row).collect()
}

impl JobStore for SqliteJobStore {
    fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        job_repo::find_by_id(&self.db, id)?.map(from_row).transpose()
    }

    fn list(
        &self,
        status: Option<JobStatus>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Job>, StoreError> {
        let filter = JobFilter {
            status: status.map(|s| s.as_str().to_string()),
            limit: Some(u64::from(limit)),
            offset: Some(u64::from(offset)),
        };
        rows_to_jobs(job_repo::query(&self.db, &filter)?)
    }

    fn insert(&self, job: &Job) -> Result<(), StoreError> {
        job_repo::insert(&self.db, &to_row(job)?)?;
        Ok(())
    }

    fn update(&self, id: &str, update: &JobUpdate) -> Result<bool, StoreError> {
        Ok(job_repo::apply_patch(&self.db, id, &to_patch(update)?)?)
    }

    fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(job_repo::delete(&self.db, id)?)
    }

    fn count_by_status(&self, status: Option<JobStatus>) -> Result<u64, StoreError> {
        Ok(job_repo::count_by_status(
            &self.db,
            status.as_ref().map(JobStatus::as_str),
        )?)
    }

    fn count_active(&self) -> Result<u64, StoreError> {
        Ok(job_repo::count_active(&self.db)?)
    }

    fn pending_in_queue_order(&self, limit: u32) -> Result<Vec<Job>, StoreError> {
        rows_to_jobs(job_repo::pending_in_queue_order(
            &self.db,
            u64::from(limit),
        )?)
    }
}

impl LocalCache for SqliteJobStore {
    fn upsert_all(&self, jobs: &[Job]) -> Result<(), StoreError> {
        let rows = jobs.iter().map(to_row).collect::<Result<Vec<_>, _>>()?;
        job_repo::upsert_all(&self.db, &rows)?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        job_repo::delete(&self.db, id)?;
        Ok(())
    }
}
