use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::settle::{is_error_for, settle};
use super::{JobQueue, WorkItem};
use crate::bridge::{resolve_input, ConversionOutput, ConversionRequest};
use crate::error::QueueError;
use crate::model::{Artifact, ChangeEvent, Job, JobStatus};
use crate::store::JobUpdate;

/// How one export attempt ended.
enum Attempt {
    Produced(Artifact),
    Failed { reason: String, retryable: bool },
    /// Shutdown arrived while the tool was running.
    Interrupted,
}

impl JobQueue {
    pub(super) async fn run_worker(self, cancel: CancellationToken) {
        info!("Export worker started");
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let Some(item) = self.claim_next() else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = self.inner.wake.notified() => {}
                    _ = tokio::time::sleep(self.inner.config.idle_poll()) => {}
                }
                continue;
            };

            let span = info_span!("export", job_id = %item.job_id, format = %item.format, attempt = item.attempt);
            self.process(item, &cancel).instrument(span).await;
            self.release_current();
        }
        self.park_queued_jobs().await;
        info!("Export worker stopped");
    }

    /// Jobs with items still queued at shutdown go back to pending so the
    /// next start recovers them.
    async fn park_queued_jobs(&self) {
        let mut ids: Vec<String> = self
            .state()
            .items
            .iter()
            .map(|item| item.job_id.clone())
            .collect();
        ids.dedup();
        for id in ids {
            if let Ok(Some(job)) = self.inner.store.get(&id) {
                if job.status == JobStatus::Processing {
                    self.write_and_emit(&id, &JobUpdate::status(JobStatus::Pending))
                        .await;
                }
            }
        }
    }

    fn claim_next(&self) -> Option<WorkItem> {
        let mut state = self.state();
        let item = state.items.pop_front()?;
        state.current = Some(item.clone());
        Some(item)
    }

    fn release_current(&self) {
        self.state().current = None;
    }

    fn requeue(&self, item: WorkItem) {
        self.state().items.insert(item);
        self.inner.wake.notify_one();
    }

    async fn process(&self, item: WorkItem, cancel: &CancellationToken) {
        let job = match self.inner.store.get(&item.job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!("Job no longer exists; dropping export");
                return;
            }
            Err(e) => {
                error!(error = %e, "Failed to load job; dropping export");
                return;
            }
        };
        if job.status == JobStatus::Cancelled {
            debug!("Job was cancelled; dropping export");
            return;
        }

        self.demote_stray_processing(&job.id).await;

        let formats = job.effective_formats(&self.inner.config.default_formats);
        let aggregate = self
            .book()
            .begin(&job.id, &formats, |f| job.has_artifact(f));
        let started = JobUpdate::status(JobStatus::Processing)
            .with_progress(aggregate.min(99))
            .with_attempts(job.attempts + 1);
        if self.write_and_emit(&job.id, &started).await.is_none() {
            info!("Job was cancelled or deleted while being claimed; dropping export");
            self.forget_unless_queued(&job.id);
            return;
        }

        let attempt = match resolve_input(&job, &self.inner.alternate_extensions) {
            Ok(resolved) => {
                info!(input = ?resolved, "Resolved input");
                let request = ConversionRequest {
                    job_id: job.id.clone(),
                    input: resolved.into_path(),
                    output_dir: job.destination_path.clone(),
                    format: item.format.clone(),
                    heavy: self.inner.config.is_heavy(&item.format),
                };
                self.run_tool(&request, cancel).await
            }
            Err(e) => Attempt::Failed {
                reason: e.to_string(),
                retryable: false,
            },
        };

        if let Attempt::Interrupted = attempt {
            info!("Shutdown during export; returning job to pending");
            self.write_and_emit(&job.id, &JobUpdate::status(JobStatus::Pending))
                .await;
            return;
        }

        let Some(job) = self.reload_for_result(&item.job_id) else {
            return;
        };

        let mut artifacts = job.produced_artifacts.clone();
        let mut errors = job.errors.clone();

        match attempt {
            Attempt::Produced(artifact) => {
                info!(artifact = %artifact.path, "Export produced");
                artifacts.retain(|a| !a.format.eq_ignore_ascii_case(&item.format));
                artifacts.push(artifact);
                errors.retain(|e| !is_error_for(e, &item.format));
                self.book().complete(&job.id, &item.format);
            }
            Attempt::Failed { reason, retryable } => {
                if retryable && item.attempt < self.inner.config.retry_ceiling {
                    self.retry_later(item, &reason, cancel).await;
                    return;
                }

                let mut failed = vec![item.format.clone()];
                if retryable {
                    let exhausted = QueueError::RetryExhausted {
                        format: item.format.clone(),
                        attempts: item.attempt,
                    };
                    error!(reason = %reason, "{}", exhausted);
                    errors.retain(|e| !is_error_for(e, &item.format));
                    errors.push(exhausted.to_string());
                } else {
                    error!(reason = %reason, "Export cannot proceed; failing remaining formats");
                    failed.extend(
                        self.state()
                            .items
                            .remove_job(&job.id)
                            .into_iter()
                            .map(|i| i.format),
                    );
                    for format in &failed {
                        errors.retain(|e| !is_error_for(e, format));
                        errors.push(format!("{}: {}", format, reason));
                    }
                }
            }
            Attempt::Interrupted => return,
        }

        self.settle_job(&job, &formats, artifacts, errors).await;
    }

    /// Runs the tool, pumping progress estimates into the store as they arrive.
    async fn run_tool(&self, request: &ConversionRequest, cancel: &CancellationToken) -> Attempt {
        let (tx, mut rx) = mpsc::unbounded_channel::<u8>();
        let on_progress = move |pct: u8| {
            let _ = tx.send(pct);
        };

        let run = self.inner.tool.run(request, &on_progress);
        tokio::pin!(run);

        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                Some(pct) = rx.recv() => self.record_progress(&request.job_id, &request.format, pct).await,
                _ = cancel.cancelled() => return Attempt::Interrupted,
            }
        };
        while let Ok(pct) = rx.try_recv() {
            self.record_progress(&request.job_id, &request.format, pct)
                .await;
        }

        match result {
            Ok(ConversionOutput {
                artifact: Some(path),
            }) => Attempt::Produced(Artifact::from_file(&path, &request.format)),
            Ok(ConversionOutput { artifact: None }) => Attempt::Failed {
                reason: "export tool reported success but produced no file".to_string(),
                retryable: true,
            },
            Err(e) => Attempt::Failed {
                reason: e.to_string(),
                retryable: e.is_retryable(),
            },
        }
    }

    async fn record_progress(&self, job_id: &str, format: &str, pct: u8) {
        let Some(aggregate) = self.book().record(job_id, format, pct) else {
            return;
        };
        let update = JobUpdate::default().with_progress(aggregate.min(99));
        self.write_and_emit(job_id, &update).await;
    }

    /// Waits out the cooldown, then puts the next attempt back in the queue
    /// unless the job was cancelled or deleted meanwhile.
    async fn retry_later(&self, item: WorkItem, reason: &str, cancel: &CancellationToken) {
        warn!(
            reason,
            cooldown_ms = self.inner.config.retry_cooldown_ms,
            "Export attempt failed; will retry"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                self.write_and_emit(&item.job_id, &JobUpdate::status(JobStatus::Pending)).await;
                return;
            }
            _ = tokio::time::sleep(self.inner.config.retry_cooldown()) => {}
        }

        match self.inner.store.get(&item.job_id) {
            Ok(Some(job)) if job.status != JobStatus::Cancelled => {
                self.requeue(item.next_attempt());
                self.write_and_emit(&item.job_id, &JobUpdate::status(JobStatus::Processing))
                    .await;
            }
            Ok(_) => {
                debug!("Job cancelled or deleted during cooldown; not retrying");
                self.book().forget(&item.job_id);
            }
            Err(e) => error!(error = %e, "Failed to reload job after cooldown"),
        }
    }

    /// Re-reads the job after the tool returned. `None` means the result
    /// must be discarded.
    fn reload_for_result(&self, job_id: &str) -> Option<Job> {
        match self.inner.store.get(job_id) {
            Ok(Some(job)) if job.status == JobStatus::Cancelled => {
                info!("Job cancelled during export; discarding result");
                self.forget_unless_queued(job_id);
                None
            }
            Ok(Some(job)) => Some(job),
            Ok(None) => {
                let err = QueueError::RecordNotFound(job_id.to_string());
                warn!(error = %err, "Discarding export result");
                self.remove(job_id);
                self.book().forget(job_id);
                None
            }
            Err(e) => {
                error!(error = %e, "Failed to reload job; discarding export result");
                None
            }
        }
    }

    async fn settle_job(
        &self,
        job: &Job,
        formats: &[String],
        artifacts: Vec<Artifact>,
        errors: Vec<String>,
    ) {
        let remaining = self.has_queued(&job.id);
        let settlement = settle(formats, &artifacts, errors, remaining);

        let progress = if settlement.status == JobStatus::Concluded {
            100
        } else {
            self.book()
                .aggregate(&job.id)
                .unwrap_or(job.progress_percent)
                .min(99)
        };
        if !remaining {
            self.book().forget(&job.id);
        }

        info!(status = %settlement.status, errors = settlement.errors.len(), "Export settled");
        let update = JobUpdate::status(settlement.status)
            .with_artifacts(artifacts)
            .with_errors(settlement.errors)
            .with_progress(progress);
        self.write_and_emit(&job.id, &update).await;
    }

    /// Any job other than `current_id` found in `Processing` is moved back
    /// to `Pending`.
    async fn demote_stray_processing(&self, current_id: &str) {
        let strays = match self
            .inner
            .store
            .list(Some(JobStatus::Processing), 100, 0)
        {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to check for stray processing jobs");
                return;
            }
        };

        for stray in strays.iter().filter(|j| j.id != current_id) {
            warn!(stray = %stray.id, "Another job was left processing; returning it to pending");
            self.write_and_emit(&stray.id, &JobUpdate::status(JobStatus::Pending))
                .await;
        }
    }

    fn forget_unless_queued(&self, job_id: &str) {
        if !self.has_queued(job_id) {
            self.book().forget(job_id);
        }
    }

    /// Applies `update` and broadcasts the resulting record. A cancelled
    /// record is never written; `None` means nothing was written.
    async fn write_and_emit(&self, job_id: &str, update: &JobUpdate) -> Option<Job> {
        let update = update.clone().unless(JobStatus::Cancelled);
        let written = self
            .inner
            .store
            .update(job_id, &update)
            .and_then(|found| {
                if found {
                    self.inner.store.get(job_id)
                } else {
                    Ok(None)
                }
            });
        match written {
            Ok(Some(job)) => {
                self.inner
                    .broadcaster
                    .emit(&ChangeEvent::Update(job.clone()))
                    .await;
                Some(job)
            }
            Ok(None) => {
                debug!(job_id, "Job vanished or was cancelled before update");
                None
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to persist job update");
                None
            }
        }
    }
}
