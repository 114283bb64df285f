//! Job repository: CRUD operations for the `jobs` table.

use rusqlite::{params, Row};

use super::{Database, DatabaseError};

/// Statuses that count toward queue position assignment.
const ACTIVE_STATUSES: [&str; 2] = ["pending", "processing"];

/// A raw job row from the database. JSON columns stay encoded here.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: String,
    pub source_file: String,
    pub computer_of_origin: String,
    pub destination_path: String,
    pub original_path: Option<String>,
    pub working_dir: Option<String>,
    pub status: String,
    pub requested_formats: String,
    pub produced_artifacts: String,
    pub queue_position: Option<i64>,
    pub progress: i64,
    pub errors: String,
    pub attempts: i64,
    pub created_at: String,
    pub updated_at: String,
    pub cancelled_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            source_file: row.get("source_file")?,
            computer_of_origin: row.get("computer_of_origin")?,
            destination_path: row.get("destination_path")?,
            original_path: row.get("original_path")?,
            working_dir: row.get("working_dir")?,
            status: row.get("status")?,
            requested_formats: row.get("requested_formats")?,
            produced_artifacts: row.get("produced_artifacts")?,
            queue_position: row.get("queue_position")?,
            progress: row.get("progress")?,
            errors: row.get("errors")?,
            attempts: row.get("attempts")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            cancelled_at: row.get("cancelled_at")?,
        })
    }
}

/// Partial update of a job row. `None` leaves the column untouched.
///
/// `progress` never lowers the stored value. With `unless_status` set, the
/// patch is skipped for a row currently in that status.
#[derive(Debug, Default, Clone)]
pub struct JobPatch {
    pub status: Option<String>,
    pub progress: Option<i64>,
    pub produced_artifacts: Option<String>,
    pub errors: Option<String>,
    pub attempts: Option<i64>,
    pub queue_position: Option<Option<i64>>,
    pub cancelled_at: Option<Option<String>>,
    pub updated_at: String,
    pub unless_status: Option<String>,
}

/// Query filter parameters for job listing.
#[derive(Debug, Default, Clone)]
pub struct JobFilter {
    pub status: Option<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

const INSERT_SQL: &str = "INSERT INTO jobs (id, source_file, computer_of_origin, destination_path,
     original_path, working_dir, status, requested_formats, produced_artifacts, queue_position,
     progress, errors, attempts, created_at, updated_at, cancelled_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)";

fn row_params(job: &JobRow) -> [&dyn rusqlite::types::ToSql; 16] {
    [
        &job.id,
        &job.source_file,
        &job.computer_of_origin,
        &job.destination_path,
        &job.original_path,
        &job.working_dir,
        &job.status,
        &job.requested_formats,
        &job.produced_artifacts,
        &job.queue_position,
        &job.progress,
        &job.errors,
        &job.attempts,
        &job.created_at,
        &job.updated_at,
        &job.cancelled_at,
    ]
}

/// Inserts a new job row.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(INSERT_SQL, row_params(job).as_slice())?;
        Ok(())
    })
}

/// Inserts or fully replaces the given rows inside a single transaction.
pub fn upsert_all(db: &Database, jobs: &[JobRow]) -> Result<(), DatabaseError> {
    if jobs.is_empty() {
        return Ok(());
    }
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        {
            let sql = format!(
                "{} ON CONFLICT(id) DO UPDATE SET source_file=excluded.source_file,
                 computer_of_origin=excluded.computer_of_origin,
                 destination_path=excluded.destination_path, original_path=excluded.original_path,
                 working_dir=excluded.working_dir, status=excluded.status,
                 requested_formats=excluded.requested_formats,
                 produced_artifacts=excluded.produced_artifacts,
                 queue_position=excluded.queue_position, progress=excluded.progress,
                 errors=excluded.errors, attempts=excluded.attempts,
                 created_at=excluded.created_at, updated_at=excluded.updated_at,
                 cancelled_at=excluded.cancelled_at",
                INSERT_SQL
            );
            let mut stmt = tx.prepare(&sql)?;
            for job in jobs {
                stmt.execute(row_params(job).as_slice())?;
            }
        }
        tx.commit()?;
        Ok(())
    })
}

/// Applies a partial update. Returns whether a row matched.
pub fn apply_patch(db: &Database, id: &str, patch: &JobPatch) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let mut sets = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();
        param_values.push(Box::new(id.to_string()));

        if let Some(ref status) = patch.status {
            param_values.push(Box::new(status.clone()));
            sets.push(format!("status = ?{}", param_values.len()));
        }
        if let Some(progress) = patch.progress {
            param_values.push(Box::new(progress));
            sets.push(format!("progress = MAX(progress, ?{})", param_values.len()));
        }
        if let Some(ref artifacts) = patch.produced_artifacts {
            param_values.push(Box::new(artifacts.clone()));
            sets.push(format!("produced_artifacts = ?{}", param_values.len()));
        }
        if let Some(ref errors) = patch.errors {
            param_values.push(Box::new(errors.clone()));
            sets.push(format!("errors = ?{}", param_values.len()));
        }
        if let Some(attempts) = patch.attempts {
            param_values.push(Box::new(attempts));
            sets.push(format!("attempts = ?{}", param_values.len()));
        }
        if let Some(position) = patch.queue_position {
            param_values.push(Box::new(position));
            sets.push(format!("queue_position = ?{}", param_values.len()));
        }
        if let Some(ref cancelled_at) = patch.cancelled_at {
            param_values.push(Box::new(cancelled_at.clone()));
            sets.push(format!("cancelled_at = ?{}", param_values.len()));
        }
        param_values.push(Box::new(patch.updated_at.clone()));
        sets.push(format!("updated_at = ?{}", param_values.len()));

        let mut sql = format!("UPDATE jobs SET {} WHERE id = ?1", sets.join(", "));
        if let Some(ref guard) = patch.unless_status {
            param_values.push(Box::new(guard.clone()));
            sql.push_str(&format!(" AND status <> ?{}", param_values.len()));
        }
        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let changed = conn.execute(&sql, params_ref.as_slice())?;
        Ok(changed > 0)
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM jobs WHERE id = ?1")?;
        let mut rows = stmt.query_map(params![id], JobRow::from_row)?;
        match rows.next() {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(e)) => Err(DatabaseError::Sqlite(e)),
            None => Ok(None),
        }
    })
}

/// Lists jobs, newest first.
pub fn query(db: &Database, filter: &JobFilter) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let limit = filter.limit.unwrap_or(100) as i64;
        let offset = filter.offset.unwrap_or(0) as i64;

        let rows = match filter.status {
            Some(ref status) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM jobs WHERE status = ?1
                     ORDER BY created_at DESC, id ASC LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt
                    .query_map(params![status, limit, offset], JobRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM jobs ORDER BY created_at DESC, id ASC LIMIT ?1 OFFSET ?2",
                )?;
                let rows = stmt
                    .query_map(params![limit, offset], JobRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };

        Ok(rows)
    })
}

/// Lists pending jobs in queue order, for startup recovery.
pub fn pending_in_queue_order(db: &Database, limit: u64) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status = 'pending'
             ORDER BY COALESCE(queue_position, 0) ASC, created_at ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], JobRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts jobs with the given status, or all jobs.
pub fn count_by_status(db: &Database, status: Option<&str>) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = match status {
            Some(status) => conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE status = ?1",
                params![status],
                |r| r.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))?,
        };
        Ok(count)
    })
}

/// Counts pending plus processing jobs.
pub fn count_active(db: &Database) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status IN (?1, ?2)",
            params![ACTIVE_STATUSES[0], ACTIVE_STATUSES[1]],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Deletes a job row. Returns whether a row existed.
pub fn delete(db: &Database, id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    })
}
