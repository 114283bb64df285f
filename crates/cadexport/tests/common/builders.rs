//! Builders and recording doubles for test data.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use cadexport::model::Incoming;
use cadexport::{
    Job, JobStatus, LocalCache, NewJob, SendError, Session, SessionId, StoreError,
};

/// Builder for `NewJob` submissions.
pub struct NewJobBuilder {
    job: NewJob,
}

impl NewJobBuilder {
    pub fn new(source_file: &str) -> Self {
        Self {
            job: NewJob {
                source_file: source_file.to_string(),
                computer_of_origin: "PC-ENG-01".to_string(),
                destination_path: String::new(),
                original_path: None,
                working_dir: None,
                requested_formats: vec![],
            },
        }
    }

    pub fn formats(mut self, formats: &[&str]) -> Self {
        self.job.requested_formats = formats.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn working_dir(mut self, dir: &std::path::Path) -> Self {
        self.job.working_dir = Some(dir.to_string_lossy().into_owned());
        self
    }

    pub fn destination(mut self, dir: &std::path::Path) -> Self {
        self.job.destination_path = dir.to_string_lossy().into_owned();
        self
    }

    pub fn original_path(mut self, path: &std::path::Path) -> Self {
        self.job.original_path = Some(path.to_string_lossy().into_owned());
        self
    }

    pub fn build(self) -> NewJob {
        self.job
    }
}

/// Builder for records inserted straight into the store, as another
/// process would.
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new(id: &str) -> Self {
        let at = base_time();
        Self {
            job: Job {
                id: id.to_string(),
                source_file: format!("{}.ipt", id),
                computer_of_origin: "PC-ENG-02".to_string(),
                destination_path: "/exports".to_string(),
                original_path: None,
                working_dir: None,
                status: JobStatus::Pending,
                requested_formats: vec!["pdf".to_string()],
                produced_artifacts: vec![],
                queue_position: Some(1),
                progress_percent: 0,
                errors: vec![],
                attempts: 0,
                created_at: at,
                updated_at: at,
                cancelled_at: None,
            },
        }
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.job.status = status;
        self
    }

    pub fn position(mut self, position: i64) -> Self {
        self.job.queue_position = Some(position);
        self
    }

    pub fn updated_secs_later(mut self, secs: i64) -> Self {
        self.job.updated_at = self.job.created_at + Duration::seconds(secs);
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

pub fn base_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-05-04T09:30:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// Session that keeps every frame it receives.
pub struct RecordingSession {
    id: SessionId,
    frames: Mutex<Vec<String>>,
}

impl RecordingSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::new(),
            frames: Mutex::new(Vec::new()),
        })
    }

    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().unwrap().clone()
    }

    pub fn decoded(&self) -> Vec<Incoming> {
        self.frames()
            .iter()
            .map(|f| Incoming::parse(f).unwrap())
            .collect()
    }

    /// Every job state this session saw for `job_id`, in order.
    pub fn states_of(&self, job_id: &str) -> Vec<Job> {
        self.decoded()
            .into_iter()
            .filter_map(|frame| match frame {
                Incoming::Insert(job) | Incoming::Update(job) if job.id == job_id => Some(job),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Session for RecordingSession {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn send_text(&self, text: &str) -> Result<(), SendError> {
        self.frames.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Session that accepts its snapshot and then fails every send.
pub struct BrokenSession {
    id: SessionId,
    sends: Mutex<usize>,
}

impl BrokenSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::new(),
            sends: Mutex::new(0),
        })
    }
}

#[async_trait]
impl Session for BrokenSession {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn send_text(&self, _text: &str) -> Result<(), SendError> {
        let mut sends = self.sends.lock().unwrap();
        *sends += 1;
        if *sends == 1 {
            Ok(())
        } else {
            Err(SendError::Transport("connection reset".to_string()))
        }
    }
}

/// Session that takes `delay` to accept every frame.
pub struct SlowSession {
    id: SessionId,
    delay: std::time::Duration,
}

impl SlowSession {
    pub fn new(delay: std::time::Duration) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId::new(),
            delay,
        })
    }
}

#[async_trait]
impl Session for SlowSession {
    fn id(&self) -> SessionId {
        self.id
    }

    async fn send_text(&self, _text: &str) -> Result<(), SendError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Local cache that records each batch write.
#[derive(Default)]
pub struct RecordingCache {
    pub writes: Mutex<Vec<Vec<Job>>>,
    pub removed: Mutex<Vec<String>>,
}

impl LocalCache for RecordingCache {
    fn upsert_all(&self, jobs: &[Job]) -> Result<(), StoreError> {
        self.writes.lock().unwrap().push(jobs.to_vec());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }
}
