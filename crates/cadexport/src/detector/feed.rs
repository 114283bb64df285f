//! Notification source backed by the trigger-fed `job_changes` table.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;

use super::{ChangeOp, Notification, NotificationSource, NotificationStream};
use crate::db::{change_repo, Database};
use crate::error::DetectorError;

const FETCH_BATCH: u32 = 256;

/// Tails `job_changes` by sequence number.
///
/// Every process writing to the database fires the same triggers, so this
/// sees changes made by other writers too.
pub struct SqliteChangeFeed {
    db: Database,
    poll: Duration,
}

impl SqliteChangeFeed {
    pub fn new(db: Database, poll: Duration) -> Self {
        Self { db, poll }
    }
}

#[async_trait]
impl NotificationSource for SqliteChangeFeed {
    async fn subscribe(&self) -> Result<Box<dyn NotificationStream>, DetectorError> {
        let cursor = change_repo::latest_seq(&self.db).map_err(channel_error)?;
        Ok(Box::new(FeedStream {
            db: self.db.clone(),
            poll: self.poll,
            cursor,
            buffer: VecDeque::new(),
        }))
    }
}

struct FeedStream {
    db: Database,
    poll: Duration,
    cursor: i64,
    buffer: VecDeque<Notification>,
}

#[async_trait]
impl NotificationStream for FeedStream {
    async fn next(&mut self) -> Result<Option<Notification>, DetectorError> {
        loop {
            if let Some(notification) = self.buffer.pop_front() {
                return Ok(Some(notification));
            }

            let rows =
                change_repo::fetch_after(&self.db, self.cursor, FETCH_BATCH).map_err(channel_error)?;
            if rows.is_empty() {
                tokio::time::sleep(self.poll).await;
                continue;
            }

            for row in rows {
                self.cursor = row.seq;
                match ChangeOp::parse(&row.op) {
                    Some(op) => self.buffer.push_back(Notification {
                        op,
                        job_id: row.job_id,
                    }),
                    None => tracing::debug!(seq = row.seq, op = %row.op, "Skipping unknown change op"),
                }
            }
        }
    }
}

fn channel_error(e: crate::db::DatabaseError) -> DetectorError {
    DetectorError::Channel(e.to_string())
}
