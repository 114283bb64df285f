//! Test harness for isolated queue execution.
//!
//! The `TestHarness` struct provides:
//! - A temp directory holding the database, input drawings and exports
//! - A `JobQueue` over `SqliteJobStore` with millisecond timings
//! - A `FakeTool` standing in for the export tool

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cadexport::bridge::ProgressFn;
use cadexport::config::{BroadcastConfig, QueueConfig};
use cadexport::db::Database;
use cadexport::{
    BridgeError, Broadcaster, ConversionOutput, ConversionRequest, ConversionTool, Job, JobQueue,
    JobStatus, JobStore, SqliteJobStore,
};

/// What one scripted tool run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Writes `<stem>.<format>` into the output directory.
    Produce,
    /// Exits non-zero.
    Fail,
    /// Exits cleanly without writing anything.
    NoArtifact,
}

/// Scripted export tool.
///
/// Outcomes are queued per format; formats without a script produce their
/// file. Every run reports the configured progress values, then waits
/// `delay`. While running it records how many tool calls overlap and how
/// many jobs the store shows as processing.
pub struct FakeTool {
    store: Arc<dyn JobStore>,
    plans: Mutex<HashMap<String, VecDeque<Outcome>>>,
    progress: Mutex<Vec<u8>>,
    delay: Mutex<Duration>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    max_processing: AtomicUsize,
    calls: Mutex<Vec<(String, String)>>,
}

impl FakeTool {
    pub fn new(store: Arc<dyn JobStore>, delay: Duration) -> Self {
        Self {
            store,
            plans: Mutex::new(HashMap::new()),
            progress: Mutex::new(Vec::new()),
            delay: Mutex::new(delay),
            running: AtomicUsize::new(0),
            max_running: AtomicUsize::new(0),
            max_processing: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, format: &str, outcomes: &[Outcome]) {
        self.plans
            .lock()
            .unwrap()
            .entry(format.to_string())
            .or_default()
            .extend(outcomes.iter().copied());
    }

    pub fn fail_always(&self, format: &str, times: usize) {
        self.script(format, &vec![Outcome::Fail; times]);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn report_progress(&self, values: &[u8]) {
        *self.progress.lock().unwrap() = values.to_vec();
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, job_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, format)| format)
            .collect()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn max_processing(&self) -> usize {
        self.max_processing.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConversionTool for FakeTool {
    async fn run(
        &self,
        request: &ConversionRequest,
        on_progress: &ProgressFn,
    ) -> Result<ConversionOutput, BridgeError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let processing = self
            .store
            .count_by_status(Some(JobStatus::Processing))
            .unwrap_or(0) as usize;
        self.max_processing.fetch_max(processing, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((request.job_id.clone(), request.format.clone()));

        let values = self.progress.lock().unwrap().clone();
        for pct in values {
            on_progress(pct);
        }
        let delay = *self.delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        let outcome = self
            .plans
            .lock()
            .unwrap()
            .get_mut(&request.format)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Outcome::Produce);

        let result = match outcome {
            Outcome::Produce => {
                let dir = PathBuf::from(&request.output_dir);
                std::fs::create_dir_all(&dir).map_err(BridgeError::Spawn)?;
                let stem = request
                    .input
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "out".to_string());
                let path = dir.join(format!("{}.{}", stem, request.format));
                std::fs::write(&path, b"exported").map_err(BridgeError::Spawn)?;
                Ok(ConversionOutput {
                    artifact: Some(path),
                })
            }
            Outcome::Fail => Err(BridgeError::ToolFailed {
                code: Some(1),
                output: "export aborted".to_string(),
            }),
            Outcome::NoArtifact => Ok(ConversionOutput { artifact: None }),
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Millisecond timings so retries and idle polls do not slow tests down.
pub fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        retry_cooldown_ms: 20,
        idle_poll_ms: 10,
        ..QueueConfig::default()
    }
}

/// Test harness providing an isolated queue over a temp database.
pub struct TestHarness {
    temp_dir: TempDir,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub db: Database,
    pub store: Arc<dyn JobStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub tool: Arc<FakeTool>,
    pub queue: JobQueue,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(fast_queue_config())
    }

    pub fn with_config(config: QueueConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();

        let input_dir = base.join("drawings");
        let output_dir = base.join("exports");
        std::fs::create_dir_all(&input_dir).expect("Failed to create input dir");
        std::fs::create_dir_all(&output_dir).expect("Failed to create output dir");

        let db = Database::open(&base.join("cadexport.db")).expect("Failed to open database");
        let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(db.clone()));
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&store),
            BroadcastConfig::default(),
        ));
        let tool = Arc::new(FakeTool::new(
            Arc::clone(&store),
            Duration::from_millis(5),
        ));
        let queue = JobQueue::new(
            Arc::clone(&store),
            tool.clone(),
            Arc::clone(&broadcaster),
            config,
            vec!["ipt".to_string(), "iam".to_string(), "idw".to_string()],
        );

        Self {
            temp_dir,
            input_dir,
            output_dir,
            db,
            store,
            broadcaster,
            tool,
            queue,
            cancel: CancellationToken::new(),
            worker: None,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes a drawing into the input directory.
    pub fn write_drawing(&self, filename: &str) -> PathBuf {
        let path = self.input_dir.join(filename);
        std::fs::write(&path, b"drawing").expect("Failed to write drawing");
        path
    }

    /// A submission whose input exists and whose exports land in `output_dir`.
    pub fn drawing_job(&self, filename: &str, formats: &[&str]) -> cadexport::NewJob {
        self.write_drawing(filename);
        super::NewJobBuilder::new(filename)
            .formats(formats)
            .working_dir(&self.input_dir)
            .destination(&self.output_dir)
            .build()
    }

    pub fn start_worker(&mut self) {
        if self.worker.is_none() {
            self.worker = Some(self.queue.start(self.cancel.clone()));
        }
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(worker) = self.worker.take() {
            worker.await.expect("worker panicked");
        }
    }

    pub fn job(&self, id: &str) -> Job {
        self.store
            .get(id)
            .expect("store read failed")
            .expect("job missing")
    }

    /// Polls the store until the job reaches one of `statuses`.
    pub async fn wait_for_status(&self, id: &str, statuses: &[JobStatus]) -> Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let job = self.job(id);
            if statuses.contains(&job.status) {
                return job;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "job {} stuck in {} waiting for {:?}",
                    id, job.status, statuses
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Waits until a job is settled and the queue is idle.
    pub async fn wait_settled(&self, id: &str) -> Job {
        let job = self
            .wait_for_status(
                id,
                &[
                    JobStatus::Concluded,
                    JobStatus::ConcludedWithErrors,
                    JobStatus::Error,
                ],
            )
            .await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !self.queue.is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "queue never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        job
    }
}
