//! Change feed repository for the trigger-maintained `job_changes` table.
//!
//! The triggers in `002_create_job_changes.sql` append one row per insert,
//! update and delete on `jobs` and discard rows older than ten minutes.

use rusqlite::params;

use super::{Database, DatabaseError};

/// One row of the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRow {
    pub seq: i64,
    pub op: String,
    pub job_id: String,
}

/// Highest sequence number currently in the feed, 0 when empty.
pub fn latest_seq(db: &Database) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        let seq: i64 =
            conn.query_row("SELECT COALESCE(MAX(seq), 0) FROM job_changes", [], |r| {
                r.get(0)
            })?;
        Ok(seq)
    })
}

/// Fetches changes strictly after `seq`, oldest first.
pub fn fetch_after(db: &Database, seq: i64, limit: u32) -> Result<Vec<ChangeRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT seq, op, job_id FROM job_changes WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![seq, limit], |r| {
                Ok(ChangeRow {
                    seq: r.get(0)?,
                    op: r.get(1)?,
                    job_id: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
