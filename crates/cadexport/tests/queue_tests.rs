//! Integration tests for the export queue and its worker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;

use cadexport::{JobStatus, JobStore, QueueError};
use common::{JobBuilder, Outcome, RecordingSession, SlowSession, TestHarness};

#[tokio::test]
async fn test_only_one_job_processing_at_a_time() {
    let mut harness = TestHarness::new();
    let submissions: Vec<_> = (0..8)
        .map(|i| harness.drawing_job(&format!("part-{i}.ipt"), &["pdf", "dwf"]))
        .collect();

    let jobs = join_all(submissions.into_iter().map(|new| harness.queue.submit(new))).await;
    let jobs: Vec<_> = jobs.into_iter().map(|j| j.unwrap()).collect();

    harness.start_worker();
    for job in &jobs {
        let done = harness.wait_settled(&job.id).await;
        assert_eq!(done.status, JobStatus::Concluded);
    }

    assert_eq!(harness.tool.max_running(), 1);
    assert_eq!(harness.tool.max_processing(), 1);
    assert_eq!(harness.tool.calls().len(), 16);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_stray_processing_job_is_returned_to_pending() {
    let mut harness = TestHarness::new();
    let stray = JobBuilder::new("crashed")
        .status(JobStatus::Processing)
        .position(99)
        .build();
    harness.store.insert(&stray).unwrap();

    let job = harness
        .queue
        .submit(harness.drawing_job("bracket.ipt", &["pdf"]))
        .await
        .unwrap();
    harness.start_worker();
    harness.wait_settled(&job.id).await;

    assert_eq!(harness.job("crashed").status, JobStatus::Pending);
    assert_eq!(harness.tool.max_processing(), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_progress_is_monotonic_and_full_only_when_concluded() {
    let mut harness = TestHarness::new();
    let watcher = RecordingSession::new();
    harness.broadcaster.subscribe(watcher.clone()).await.unwrap();
    harness.tool.report_progress(&[10, 40, 30, 80]);

    let job = harness
        .queue
        .submit(harness.drawing_job("housing.iam", &["pdf", "dwf"]))
        .await
        .unwrap();
    harness.start_worker();
    let done = harness.wait_settled(&job.id).await;
    assert_eq!(done.status, JobStatus::Concluded);
    assert_eq!(done.progress_percent, 100);

    let states = watcher.states_of(&job.id);
    assert!(states.len() > 3);
    for pair in states.windows(2) {
        assert!(
            pair[0].progress_percent <= pair[1].progress_percent,
            "progress went back from {} to {}",
            pair[0].progress_percent,
            pair[1].progress_percent
        );
    }
    for state in &states {
        assert_eq!(
            state.progress_percent == 100,
            state.status == JobStatus::Concluded,
            "progress {} with status {}",
            state.progress_percent,
            state.status
        );
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn test_failing_heavy_format_concludes_with_errors() {
    let mut harness = TestHarness::new();
    harness.tool.report_progress(&[40]);
    harness.tool.fail_always("dwg", 3);

    let job = harness
        .queue
        .submit(harness.drawing_job("J1.ipt", &["pdf", "dwg"]))
        .await
        .unwrap();
    harness.start_worker();
    let done = harness.wait_settled(&job.id).await;

    assert_eq!(done.status, JobStatus::ConcludedWithErrors);
    assert_eq!(done.produced_artifacts.len(), 1);
    assert_eq!(done.produced_artifacts[0].format, "pdf");
    assert_eq!(done.errors, vec!["dwg: failed after 3 attempts".to_string()]);
    // pdf pinned at 100, dwg stuck at its best estimate of 40.
    assert_eq!(done.progress_percent, (100 + 40) / 2);
    assert_eq!(done.attempts, 4);
    assert_eq!(
        harness.tool.calls_for(&job.id),
        vec!["pdf", "dwg", "dwg", "dwg"]
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_every_format_failing_is_error() {
    let mut harness = TestHarness::new();
    harness.tool.fail_always("pdf", 3);

    let job = harness
        .queue
        .submit(harness.drawing_job("shaft.ipt", &["pdf"]))
        .await
        .unwrap();
    harness.start_worker();
    let done = harness.wait_settled(&job.id).await;

    assert_eq!(done.status, JobStatus::Error);
    assert_eq!(done.errors, vec!["pdf: failed after 3 attempts".to_string()]);
    assert!(done.produced_artifacts.is_empty());
    assert!(done.progress_percent < 100);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_missing_artifact_counts_as_failed_attempt() {
    let mut harness = TestHarness::new();
    harness.tool.script("pdf", &[Outcome::NoArtifact, Outcome::Produce]);

    let job = harness
        .queue
        .submit(harness.drawing_job("cover.idw", &["pdf"]))
        .await
        .unwrap();
    harness.start_worker();
    let done = harness.wait_settled(&job.id).await;

    assert_eq!(done.status, JobStatus::Concluded);
    assert!(done.errors.is_empty());
    assert_eq!(harness.tool.calls_for(&job.id).len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_missing_input_fails_without_retry() {
    let mut harness = TestHarness::new();
    let new = common::NewJobBuilder::new("ghost.ipt")
        .formats(&["pdf", "dwf"])
        .working_dir(&harness.input_dir)
        .destination(&harness.output_dir)
        .build();

    let job = harness.queue.submit(new).await.unwrap();
    harness.start_worker();
    let done = harness.wait_settled(&job.id).await;

    assert_eq!(done.status, JobStatus::Error);
    assert_eq!(done.errors.len(), 2);
    for format in ["pdf", "dwf"] {
        let prefix = format!("{}: Input file not found", format);
        assert_eq!(
            done.errors.iter().filter(|e| e.starts_with(&prefix)).count(),
            1
        );
    }
    assert!(harness.tool.calls().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_resubmit_requeues_only_outstanding_formats() {
    let mut harness = TestHarness::new();
    harness.tool.fail_always("dwg", 3);

    let job = harness
        .queue
        .submit(harness.drawing_job("flange.ipt", &["pdf", "dwg"]))
        .await
        .unwrap();
    harness.start_worker();
    let first = harness.wait_settled(&job.id).await;
    assert_eq!(first.status, JobStatus::ConcludedWithErrors);
    let pdf_before = first.produced_artifacts[0].clone();

    let resubmitted = harness.queue.resubmit(&job.id).await.unwrap();
    assert!(resubmitted.errors.is_empty());

    let done = harness.wait_settled(&job.id).await;
    assert_eq!(done.status, JobStatus::Concluded);
    assert_eq!(done.progress_percent, 100);
    assert_eq!(done.produced_artifacts.len(), 2);
    assert_eq!(
        done.produced_artifacts
            .iter()
            .filter(|a| a.format == "pdf")
            .collect::<Vec<_>>(),
        vec![&pdf_before]
    );
    assert_eq!(
        harness.tool.calls_for(&job.id),
        vec!["pdf", "dwg", "dwg", "dwg", "dwg"]
    );

    let again = harness.queue.resubmit(&job.id).await;
    assert!(matches!(again, Err(QueueError::NothingToResubmit(_))));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_remove_reports_whether_items_were_queued() {
    let harness = TestHarness::new();
    let job = harness
        .queue
        .submit(harness.drawing_job("plate.ipt", &["pdf", "dwg"]))
        .await
        .unwrap();

    assert!(!harness.queue.remove("not-a-job"));
    assert!(harness.queue.remove(&job.id));

    let snapshot = harness.queue.status();
    assert!(snapshot.upcoming.iter().all(|item| item.job_id != job.id));
    assert_eq!(snapshot.length, 0);
    assert!(!harness.queue.remove(&job.id));
}

#[tokio::test]
async fn test_status_lists_heavy_formats_last() {
    let harness = TestHarness::new();
    let first = harness
        .queue
        .submit(harness.drawing_job("a.ipt", &["dwg", "pdf"]))
        .await
        .unwrap();
    let second = harness
        .queue
        .submit(harness.drawing_job("b.ipt", &["pdf"]))
        .await
        .unwrap();

    let snapshot = harness.queue.status();
    assert_eq!(snapshot.length, 3);
    assert!(!snapshot.processing);
    let order: Vec<(String, String)> = snapshot
        .upcoming
        .iter()
        .map(|i| (i.job_id.clone(), i.format.clone()))
        .collect();
    assert_eq!(
        order,
        vec![
            (first.id.clone(), "pdf".to_string()),
            (first.id.clone(), "dwg".to_string()),
            (second.id.clone(), "pdf".to_string()),
        ]
    );
    assert_eq!(first.queue_position, Some(1));
    assert_eq!(second.queue_position, Some(2));

    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["upcoming"][0]["label"], format!("{}:pdf", first.id));
}

#[tokio::test]
async fn test_add_is_idempotent_and_ignores_unknown_jobs() {
    let harness = TestHarness::new();
    let job = harness
        .queue
        .submit(harness.drawing_job("hinge.ipt", &["pdf", "dwf"]))
        .await
        .unwrap();

    assert_eq!(harness.queue.add(&job.id, None).unwrap(), 0);
    assert_eq!(harness.queue.add("missing", None).unwrap(), 0);
    assert_eq!(harness.queue.status().length, 2);
}

#[tokio::test]
async fn test_cancel_pending_job() {
    let harness = TestHarness::new();
    let session = RecordingSession::new();
    harness.broadcaster.subscribe(session.clone()).await.unwrap();

    let job = harness
        .queue
        .submit(harness.drawing_job("lever.ipt", &["pdf"]))
        .await
        .unwrap();
    let cancelled = harness.queue.cancel(&job.id).await.unwrap();

    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
    assert!(harness.queue.is_empty());
    assert_eq!(
        session.states_of(&job.id).last().map(|j| j.status),
        Some(JobStatus::Cancelled)
    );

    let again = harness.queue.cancel(&job.id).await;
    assert!(matches!(
        again,
        Err(QueueError::InvalidTransition {
            from: JobStatus::Cancelled,
            to: JobStatus::Cancelled,
            ..
        })
    ));
}

#[tokio::test]
async fn test_cancel_while_worker_claims_job_sticks() {
    let mut harness = TestHarness::new();
    harness
        .store
        .insert(
            &JobBuilder::new("crashed")
                .status(JobStatus::Processing)
                .position(99)
                .build(),
        )
        .unwrap();
    let job = harness
        .queue
        .submit(harness.drawing_job("linkage.ipt", &["pdf"]))
        .await
        .unwrap();

    // Broadcasting the stray correction keeps the worker busy between
    // reading the job and marking it processing.
    harness
        .broadcaster
        .subscribe(SlowSession::new(Duration::from_millis(300)))
        .await
        .unwrap();
    harness.start_worker();
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.queue.cancel(&job.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;

    let after = harness.job(&job.id);
    assert_eq!(after.status, JobStatus::Cancelled);
    assert!(after.produced_artifacts.is_empty());
    assert!(harness.tool.calls_for(&job.id).is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_cancel_during_export_discards_result() {
    let mut harness = TestHarness::new();
    harness.tool.set_delay(Duration::from_millis(300));
    let job = harness
        .queue
        .submit(harness.drawing_job("spindle.ipt", &["pdf", "dwf"]))
        .await
        .unwrap();

    harness.start_worker();
    harness
        .wait_for_status(&job.id, &[JobStatus::Processing])
        .await;
    harness.queue.cancel(&job.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;

    let after = harness.job(&job.id);
    assert_eq!(after.status, JobStatus::Cancelled);
    assert!(after.produced_artifacts.is_empty());
    assert!(after.errors.is_empty());
    assert_eq!(harness.tool.calls_for(&job.id).len(), 1);
    assert!(harness.queue.is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_tool_reporting_full_progress_does_not_reach_100_on_failure() {
    let mut harness = TestHarness::new();
    harness.tool.report_progress(&[100]);
    harness.tool.fail_always("pdf", 3);

    let job = harness
        .queue
        .submit(harness.drawing_job("flange.ipt", &["pdf"]))
        .await
        .unwrap();
    harness.start_worker();
    let done = harness.wait_settled(&job.id).await;

    assert_eq!(done.status, JobStatus::Error);
    assert!(done.progress_percent < 100);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_job_can_be_resubmitted() {
    let mut harness = TestHarness::new();
    let job = harness
        .queue
        .submit(harness.drawing_job("clamp.ipt", &["pdf"]))
        .await
        .unwrap();
    harness.queue.cancel(&job.id).await.unwrap();

    let back = harness.queue.resubmit(&job.id).await.unwrap();
    assert_eq!(back.status, JobStatus::Pending);
    assert!(back.cancelled_at.is_none());

    harness.start_worker();
    let done = harness.wait_settled(&job.id).await;
    assert_eq!(done.status, JobStatus::Concluded);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_delete_removes_record_and_announces_it() {
    let harness = TestHarness::new();
    let session = RecordingSession::new();
    harness.broadcaster.subscribe(session.clone()).await.unwrap();

    let job = harness
        .queue
        .submit(harness.drawing_job("bolt.ipt", &["pdf"]))
        .await
        .unwrap();

    assert!(harness.queue.delete(&job.id).await.unwrap());
    assert!(harness.store.get(&job.id).unwrap().is_none());
    assert!(harness.queue.is_empty());
    assert!(!harness.queue.delete(&job.id).await.unwrap());

    let frames = session.frames();
    let last: serde_json::Value = serde_json::from_str(frames.last().unwrap()).unwrap();
    assert_eq!(last["type"], "DELETE");
    assert_eq!(last["id"], job.id.as_str());
}

#[tokio::test]
async fn test_submit_rejects_bad_input() {
    let harness = TestHarness::new();

    let bad_format = harness.drawing_job("a.ipt", &["step"]);
    assert!(matches!(
        harness.queue.submit(bad_format).await,
        Err(QueueError::InvalidSubmission(_))
    ));

    let mut no_origin = harness.drawing_job("b.ipt", &["pdf"]);
    no_origin.computer_of_origin = "  ".to_string();
    assert!(matches!(
        harness.queue.submit(no_origin).await,
        Err(QueueError::InvalidSubmission(_))
    ));

    assert_eq!(harness.store.count_by_status(None).unwrap(), 0);
}

#[tokio::test]
async fn test_submit_batch_assigns_sequential_positions() {
    let harness = TestHarness::new();
    let batch = (0..3)
        .map(|i| harness.drawing_job(&format!("s{i}.ipt"), &[]))
        .collect();

    let jobs: Vec<_> = harness
        .queue
        .submit_batch(batch)
        .await
        .unwrap()
        .into_iter()
        .map(Result::unwrap)
        .collect();
    let positions: Vec<_> = jobs.iter().map(|j| j.queue_position).collect();
    assert_eq!(positions, vec![Some(1), Some(2), Some(3)]);
    assert!(jobs.iter().all(|j| j.requested_formats == vec!["pdf".to_string()]));

    let too_many = (0..101)
        .map(|i| harness.drawing_job(&format!("t{i}.ipt"), &["pdf"]))
        .collect();
    assert!(matches!(
        harness.queue.submit_batch(too_many).await,
        Err(QueueError::InvalidSubmission(_))
    ));
}

#[tokio::test]
async fn test_submit_batch_reports_rejected_entries_and_keeps_the_rest() {
    let harness = TestHarness::new();
    let batch = vec![
        harness.drawing_job("first.ipt", &["pdf"]),
        harness.drawing_job("second.ipt", &["step"]),
        harness.drawing_job("third.ipt", &["pdf"]),
    ];

    let results = harness.queue.submit_batch(batch).await.unwrap();

    assert_eq!(results.len(), 3);
    assert!(matches!(&results[1], Err(QueueError::InvalidSubmission(_))));
    let first = results[0].as_ref().unwrap();
    let third = results[2].as_ref().unwrap();
    assert_eq!(first.queue_position, Some(1));
    assert_eq!(third.queue_position, Some(2));
    assert_eq!(harness.store.count_by_status(None).unwrap(), 2);
    assert_eq!(harness.queue.status().length, 2);
}

#[tokio::test]
async fn test_recover_queues_pending_records() {
    let harness = TestHarness::new();
    for (id, status) in [
        ("p1", JobStatus::Pending),
        ("p2", JobStatus::Pending),
        ("done", JobStatus::Concluded),
    ] {
        harness
            .store
            .insert(&JobBuilder::new(id).status(status).build())
            .unwrap();
    }

    assert_eq!(harness.queue.recover().unwrap(), 2);
    assert_eq!(harness.queue.status().length, 2);

    let stats = harness.queue.stats().unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.concluded, 1);
    assert_eq!(stats.queued_items, 2);
}

#[tokio::test]
async fn test_shutdown_leaves_no_job_processing() {
    let mut harness = TestHarness::new();
    let job = harness
        .queue
        .submit(harness.drawing_job("slow.ipt", &["pdf"]))
        .await
        .unwrap();
    harness.tool.fail_always("pdf", 1);
    harness.start_worker();

    harness
        .wait_for_status(&job.id, &[JobStatus::Processing])
        .await;
    let store = Arc::clone(&harness.store);
    harness.shutdown().await;

    let after = store.get(&job.id).unwrap().unwrap();
    assert_ne!(after.status, JobStatus::Processing);
}

#[derive(Clone, Default)]
struct CapturedLog(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_input_resolution_is_logged_at_info() {
    let log = CapturedLog::default();
    let writer = log.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut harness = TestHarness::new();
    let job = harness
        .queue
        .submit(harness.drawing_job("yoke.ipt", &["pdf"]))
        .await
        .unwrap();
    harness.start_worker();
    harness.wait_settled(&job.id).await;
    harness.shutdown().await;

    let text = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
    assert!(text.contains("Resolved input"), "log was:\n{text}");
    assert!(text.contains("yoke.ipt"));
}
