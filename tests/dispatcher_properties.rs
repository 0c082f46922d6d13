//! Behavioural properties of the dispatcher: deduplication, the concurrency
//! ceiling, slot release on every terminal condition, caching and deadlines.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{eventually, fast_settings, harness};
use mood_forge::error::JobFailure;
use mood_forge::scheduler::{
    DurableQueue, IntakeConfig, Job, JobState, QueueIntake, TaskKey,
};

const TICK: Duration = Duration::from_millis(50);

#[tokio::test]
async fn test_identical_submissions_spawn_one_unit() {
    let h = harness(fast_settings(), Duration::from_millis(100)).await;

    let submissions = (0..8).map(|_| {
        let dispatcher = h.dispatcher.clone();
        tokio::spawn(async move { dispatcher.submit("https://cdn.example.com/same.mp3").await })
    });
    let outcomes = futures::future::join_all(submissions).await;

    assert_eq!(h.counters.spawned(), 1);
    let first = outcomes[0].as_ref().unwrap().as_ref().unwrap().clone();
    for outcome in outcomes {
        assert_eq!(outcome.unwrap().unwrap(), first);
    }
    assert!(h.dispatcher.stats().coalesced >= 1);
}

#[tokio::test]
async fn test_result_scores_follow_model_polarity() {
    let h = harness(fast_settings(), Duration::from_millis(5)).await;

    let result = h
        .dispatcher
        .submit("https://cdn.example.com/a.mp3")
        .await
        .unwrap();

    assert!((result.per_model_score["mood_sad"] - 0.7).abs() < 1e-6);
    assert!((result.per_model_score["mood_happy"] - 0.3).abs() < 1e-6);
    assert_eq!(result.aux_features.tempo, 121.0);
    assert_eq!(result.task_key, TaskKey::from_source("https://cdn.example.com/a.mp3"));
}

#[tokio::test]
async fn test_burst_never_exceeds_ceiling_and_all_resolve() {
    let settings = fast_settings().with_max_concurrent_workers(5);
    let h = harness(settings, Duration::from_millis(100)).await;

    let refs: Vec<String> = (0..12)
        .map(|i| format!("https://cdn.example.com/track-{}.mp3", i))
        .collect();
    let outcomes = h.dispatcher.submit_batch(&refs).await;

    assert_eq!(outcomes.len(), 12);
    assert!(outcomes.iter().all(|(_, outcome)| outcome.is_ok()));

    let stats = h.dispatcher.stats();
    assert_eq!(stats.peak_active, 5);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.completed, 12);
    assert!(h.counters.peak_live() <= 5);
    assert_eq!(h.counters.spawned(), 12);
}

#[tokio::test]
async fn test_ceiling_is_saturated_while_jobs_wait() {
    let settings = fast_settings().with_max_concurrent_workers(5);
    let h = harness(settings, Duration::from_millis(100)).await;

    let refs: Vec<String> = (0..12)
        .map(|i| format!("https://cdn.example.com/track-{}.mp3", i))
        .collect();
    let dispatcher = h.dispatcher.clone();
    let batch = tokio::spawn(async move { dispatcher.submit_batch(&refs).await });

    let mut saw_waiting = false;
    while !batch.is_finished() {
        let stats = h.dispatcher.stats();
        if stats.pending > 0 {
            saw_waiting = true;
            assert_eq!(stats.active, 5, "idle slot while jobs wait: {:?}", stats);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(saw_waiting);
    assert!(batch.await.unwrap().iter().all(|(_, outcome)| outcome.is_ok()));
}

#[tokio::test]
async fn test_waiting_jobs_start_in_submission_order() {
    let settings = fast_settings().with_max_concurrent_workers(1);
    let h = harness(settings, Duration::from_millis(30)).await;

    let refs: Vec<String> = (0..6)
        .map(|i| format!("https://x/ordered-{}.mp3", i))
        .collect();

    let mut submissions = Vec::new();
    for (i, source_ref) in refs.iter().enumerate() {
        let dispatcher = h.dispatcher.clone();
        let source_ref = source_ref.clone();
        submissions.push(tokio::spawn(async move { dispatcher.submit(&source_ref).await }));

        // Each job is registered before the next one is submitted
        let registered = eventually(Duration::from_secs(1), || {
            let stats = h.dispatcher.stats();
            stats.active + stats.pending + stats.completed as usize > i
        })
        .await;
        assert!(registered, "job {} never registered", i);
    }

    for submission in futures::future::join_all(submissions).await {
        assert!(submission.unwrap().is_ok());
    }
    assert_eq!(h.counters.order(), refs);
}

#[tokio::test]
async fn test_each_terminal_condition_releases_its_slot() {
    let settings = fast_settings()
        .with_max_concurrent_workers(1)
        .with_job_timeout(Duration::from_millis(150));
    let h = harness(settings, Duration::from_millis(5)).await;

    let cases = [
        ("https://x/ok", None),
        ("https://x/error", Some("worker_error")),
        ("https://x/crash", Some("worker_crashed")),
        ("https://x/hang", Some("timeout")),
        ("https://x/refuse", Some("spawn_failure")),
    ];

    for (source_ref, expected_failure) in cases {
        let outcome = h.dispatcher.submit(source_ref).await;
        match expected_failure {
            None => assert!(outcome.is_ok(), "{} should succeed", source_ref),
            Some(kind) => assert_eq!(outcome.unwrap_err().kind(), kind),
        }

        // With a ceiling of one, the next case only runs if this slot was freed
        let stats = h.dispatcher.stats();
        assert_eq!(stats.active, 0, "slot still held after {}", source_ref);
        assert_eq!(stats.in_flight, 0);
    }

    assert_eq!(h.counters.live(), 0);
    let stats = h.dispatcher.stats();
    assert_eq!(stats.completed, 1);
    assert_eq!(stats.failed, 4);
}

#[tokio::test]
async fn test_crash_reports_exit_code() {
    let h = harness(fast_settings(), Duration::from_millis(5)).await;

    let failure = h.dispatcher.submit("https://x/crash").await.unwrap_err();
    assert_eq!(failure, JobFailure::WorkerCrashed { exit_code: Some(3) });
}

#[tokio::test]
async fn test_silent_unit_times_out_and_is_killed() {
    let deadline = Duration::from_millis(200);
    let settings = fast_settings()
        .with_max_concurrent_workers(1)
        .with_job_timeout(deadline);
    let h = harness(settings, Duration::from_millis(5)).await;

    let started = Instant::now();
    let failure = h.dispatcher.submit("https://x/hang").await.unwrap_err();

    assert_eq!(failure, JobFailure::Timeout(deadline));
    assert!(started.elapsed() < deadline * 3);
    assert_eq!(h.counters.killed(), 1);
    assert_eq!(h.dispatcher.stats().active, 0);

    let key = TaskKey::from_source("https://x/hang");
    let report = h.dispatcher.status(&key).await.unwrap();
    assert_eq!(report.state, JobState::TimedOut);

    // The freed slot serves the next job
    assert!(h.dispatcher.submit("https://x/after.mp3").await.is_ok());
}

#[tokio::test]
async fn test_cached_result_skips_spawn() {
    let h = harness(fast_settings(), Duration::from_millis(5)).await;

    let first = h.dispatcher.submit("https://x/a.mp3").await.unwrap();
    let second = h.dispatcher.submit("https://x/a.mp3").await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.counters.spawned(), 1);
    assert_eq!(h.dispatcher.stats().cache_hits, 1);
}

#[tokio::test]
async fn test_expired_result_is_recomputed() {
    let settings = fast_settings().with_result_ttl(Duration::from_millis(60));
    let h = harness(settings, Duration::from_millis(5)).await;

    h.dispatcher.submit("https://x/a.mp3").await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    h.dispatcher.submit("https://x/a.mp3").await.unwrap();

    assert_eq!(h.counters.spawned(), 2);
    assert_eq!(h.dispatcher.stats().cache_hits, 0);
}

#[tokio::test]
async fn test_invalid_input_is_rejected_before_dispatch() {
    let h = harness(fast_settings(), Duration::from_millis(5)).await;

    for bad in ["", "   ", "not a url", "ftp://host/a.mp3"] {
        let failure = h.dispatcher.submit(bad).await.unwrap_err();
        assert!(matches!(failure, JobFailure::InvalidInput(_)), "{:?}", bad);
    }

    assert_eq!(h.counters.spawned(), 0);
    assert_eq!(h.dispatcher.stats().in_flight, 0);
}

#[tokio::test]
async fn test_batch_failures_are_isolated() {
    let h = harness(fast_settings(), Duration::from_millis(5)).await;

    let refs = vec![
        "https://x/a.mp3".to_string(),
        "https://x/crash".to_string(),
        "https://x/b.mp3".to_string(),
    ];
    let outcomes = h.dispatcher.submit_batch(&refs).await;

    assert!(outcomes[0].1.is_ok());
    assert!(outcomes[1].1.is_err());
    assert!(outcomes[2].1.is_ok());
}

#[tokio::test]
async fn test_persistence_retries_then_succeeds() {
    let h = harness(fast_settings(), Duration::from_millis(5)).await;
    h.cache.fail_next_puts(2);

    let result = h.dispatcher.submit("https://x/a.mp3").await;

    assert!(result.is_ok());
    assert_eq!(h.cache.len(), 1);
}

#[tokio::test]
async fn test_exhausted_persistence_is_storage_failure() {
    let settings = fast_settings().with_persist_policy(2, Duration::from_millis(1));
    let h = harness(settings, Duration::from_millis(5)).await;
    h.cache.fail_next_puts(10);

    let failure = h.dispatcher.submit("https://x/a.mp3").await.unwrap_err();

    assert!(matches!(failure, JobFailure::StorageFailure(_)));
    assert_eq!(h.dispatcher.stats().active, 0);

    let records = h.queue.completed(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, JobState::Failed);
}

#[tokio::test]
async fn test_one_completion_record_per_computation() {
    let h = harness(fast_settings(), Duration::from_millis(50)).await;

    let refs: Vec<String> = std::iter::repeat("https://x/a.mp3".to_string())
        .take(4)
        .collect();
    h.dispatcher.submit_batch(&refs).await;
    h.dispatcher.submit("https://x/a.mp3").await.unwrap();

    let records = h.queue.completed(10).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].state, JobState::Completed);
}

#[tokio::test]
async fn test_status_of_unknown_key_is_none() {
    let h = harness(fast_settings(), Duration::from_millis(5)).await;

    let key = TaskKey::from_source("https://x/never.mp3");
    assert!(h.dispatcher.status(&key).await.is_none());
}

#[tokio::test]
async fn test_queue_intake_drains_durable_queue() {
    let settings = fast_settings().with_max_concurrent_workers(2);
    let h = harness(settings, Duration::from_millis(20)).await;

    for i in 0..5 {
        h.queue
            .enqueue(&Job::new(format!("https://x/queued-{}.mp3", i)))
            .await
            .unwrap();
    }
    h.queue.enqueue(&Job::new("https://x/crash")).await.unwrap();

    let queue: Arc<dyn DurableQueue> = h.queue.clone();
    let mut intake = QueueIntake::new(
        IntakeConfig::default()
            .with_poll_interval(TICK)
            .with_shutdown_timeout(Duration::from_secs(5)),
        queue,
        h.dispatcher.clone(),
    );
    intake.start().await.unwrap();

    let queue = h.queue.clone();
    let drained = eventually(Duration::from_secs(5), || intake.stats().total_processed() == 6).await;
    assert!(drained, "intake stats: {:?}", intake.stats());

    intake.shutdown().await.unwrap();
    assert!(!intake.is_running());

    let stats = intake.stats();
    assert_eq!(stats.jobs_completed, 5);
    assert_eq!(stats.jobs_failed, 1);
    assert!(h.dispatcher.stats().peak_active <= 2);

    let queue_stats = queue.stats().await.unwrap();
    assert_eq!(queue_stats.pending_jobs, 0);
    assert_eq!(queue_stats.processing_jobs, 0);
    assert_eq!(queue.completed(10).await.unwrap().len(), 6);
}

#[tokio::test]
async fn test_intake_takes_no_more_jobs_than_the_ceiling() {
    let settings = fast_settings().with_max_concurrent_workers(1);
    let h = harness(settings, Duration::from_millis(400)).await;

    for i in 0..20 {
        h.queue
            .enqueue(&Job::new(format!("https://x/backlog-{}.mp3", i)))
            .await
            .unwrap();
    }

    let queue: Arc<dyn DurableQueue> = h.queue.clone();
    let mut intake = QueueIntake::new(
        IntakeConfig::default()
            .with_poll_interval(TICK)
            .with_shutdown_timeout(Duration::from_secs(5)),
        queue,
        h.dispatcher.clone(),
    );
    intake.start().await.unwrap();

    let running = eventually(Duration::from_secs(2), || h.counters.live() == 1).await;
    assert!(running);
    tokio::time::sleep(Duration::from_millis(150)).await;

    // First job still running; the rest stay in the durable queue
    let queue_stats = h.queue.stats().await.unwrap();
    assert!(queue_stats.processing_jobs <= 1, "{:?}", queue_stats);
    assert!(queue_stats.pending_jobs >= 19, "{:?}", queue_stats);
    assert!(intake.stats().in_progress <= 1);
    assert_eq!(h.dispatcher.stats().pending, 0);

    intake.shutdown().await.unwrap();
    assert!(h.queue.stats().await.unwrap().pending_jobs >= 18);
}

#[tokio::test]
async fn test_intake_requeues_orphaned_jobs_on_start() {
    let h = harness(fast_settings(), Duration::from_millis(5)).await;

    h.queue.orphan(Job::new("https://x/orphan.mp3")).await;

    let queue: Arc<dyn DurableQueue> = h.queue.clone();
    let mut intake = QueueIntake::new(
        IntakeConfig::default().with_poll_interval(TICK),
        queue,
        h.dispatcher.clone(),
    );
    intake.start().await.unwrap();

    let done = eventually(Duration::from_secs(5), || intake.stats().jobs_completed == 1).await;
    intake.shutdown().await.unwrap();

    assert!(done);
    assert_eq!(h.counters.spawned(), 1);
}
