use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use spool_core::ports::{Clock, FixedClock};
use spool_core::{
    CancelOutcome, ProcessError, SpoolError, TaskConfig, TaskContext, TaskId, TaskManager,
    TaskStatus,
};
use tokio::sync::Semaphore;
use tokio::time::Instant;

fn config(max_concurrent: usize, max_workers_per_partition: usize) -> TaskConfig {
    TaskConfig {
        max_concurrent,
        max_workers_per_partition,
        ..TaskConfig::default()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Wall time that follows tokio's (pausable) clock.
struct TokioClock {
    base: DateTime<Utc>,
    start: Instant,
}

impl TokioClock {
    fn new() -> Self {
        Self {
            base: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            start: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.start.elapsed()).unwrap();
        self.base + elapsed
    }
}

#[tokio::test(start_paused = true)]
async fn single_worker_preserves_submission_order() {
    let manager = TaskManager::new(config(10, 1));
    manager.start().await;
    let seen = Arc::new(Mutex::new(Vec::new()));

    for n in 0..5u64 {
        let seen = Arc::clone(&seen);
        manager
            .submit_task(&format!("ep-{n}"), "A", move |_ctx: TaskContext| async move {
                // later submissions finish faster, so only the queue keeps them in order
                tokio::time::sleep(Duration::from_millis(100 * (5 - n))).await;
                seen.lock().unwrap().push(n);
                Ok::<(), ProcessError>(())
            })
            .await
            .unwrap();
    }

    manager.wait_idle("A").await;
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    assert_eq!(manager.partition_snapshot("A").unwrap().active_workers, 1);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn global_limit_caps_concurrent_callbacks() {
    let manager = TaskManager::new(config(3, 5));
    manager.start().await;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for partition in ["A", "B", "C", "D"] {
        for n in 0..5 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            manager
                .submit_task(&format!("{partition}-{n}"), partition, move |_ctx: TaskContext| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<(), ProcessError>(())
                })
                .await
                .unwrap();
        }
    }

    for partition in ["A", "B", "C", "D"] {
        manager.wait_idle(partition).await;
    }
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(manager.limiter().available(), 3);
    assert_eq!(manager.stats().await.counts.completed, 20);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn workers_scale_with_backlog_up_to_the_cap() {
    let manager = TaskManager::new(config(10, 5));
    manager.start().await;
    let gate = Arc::new(Semaphore::new(0));

    let submit = |n: usize| {
        let gate = Arc::clone(&gate);
        let manager = &manager;
        async move {
            manager
                .submit_task(&format!("ep-{n}"), "A", move |_ctx: TaskContext| async move {
                    let _permit = gate.acquire().await;
                    Ok::<(), ProcessError>(())
                })
                .await
                .unwrap()
        }
    };

    let first = submit(0).await;
    assert_eq!(first.active_workers, 1);
    assert_eq!(first.queue_position, 1);
    settle().await;

    // the single worker holds item 0; a backlog of two does not exceed 2 * 1
    submit(1).await;
    submit(2).await;
    assert_eq!(manager.partition_snapshot("A").unwrap().active_workers, 1);

    for n in 3..13 {
        submit(n).await;
    }
    let active = manager.partition_snapshot("A").unwrap().active_workers;
    assert!((2..=5).contains(&active), "active workers: {active}");

    for n in 13..33 {
        let submission = submit(n).await;
        assert!(submission.active_workers <= 5);
    }
    settle().await;
    assert_eq!(manager.partition_snapshot("A").unwrap().active_workers, 5);

    gate.add_permits(1000);
    manager.wait_idle("A").await;
    assert_eq!(manager.stats().await.counts.completed, 33);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn slow_callback_is_failed_with_timeout_message() {
    let manager = TaskManager::builder()
        .config(TaskConfig {
            processing_timeout: Duration::from_secs(1),
            ..TaskConfig::default()
        })
        .clock(Arc::new(TokioClock::new()))
        .build();
    manager.start().await;

    let slow = manager
        .submit_task("slow", "A", |_ctx: TaskContext| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), ProcessError>(())
        })
        .await
        .unwrap();
    let next = manager
        .submit_task("next", "A", |_ctx: TaskContext| async move { Ok::<(), ProcessError>(()) })
        .await
        .unwrap();

    let outcome = manager
        .wait_for_task(&slow.task_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(outcome.record.status, TaskStatus::Failed);
    let message = outcome.record.error_message.clone().unwrap();
    assert!(message.contains("timed out"), "unexpected message: {message}");

    // failed at the 1s limit, not after the callback's 5s sleep
    let started = outcome.record.started_at.unwrap();
    let completed = outcome.record.completed_at.unwrap();
    let ran_for = (completed - started).num_milliseconds();
    assert!((1000..1100).contains(&ran_for), "ran for {ran_for}ms");

    // the worker survives and moves on
    let outcome = manager
        .wait_for_task(&next.task_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(outcome.record.status, TaskStatus::Completed);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn callback_error_message_is_recorded() {
    let manager = TaskManager::new(TaskConfig::default());
    let submission = manager
        .submit_task("bad", "A", |_ctx: TaskContext| async move {
            Err::<(), _>(ProcessError::failed("entity extraction failed"))
        })
        .await
        .unwrap();

    let outcome = manager
        .wait_for_task(&submission.task_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome.record.status, TaskStatus::Failed);
    assert_eq!(
        outcome.record.error_message.as_deref(),
        Some("entity extraction failed")
    );
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn wait_returns_record_or_times_out() {
    let manager = TaskManager::new(TaskConfig::default());
    manager.start().await;
    let two_seconds = || {
        |ctx: TaskContext| async move {
            ctx.report_progress(50).await;
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok::<(), ProcessError>(())
        }
    };

    let quick = manager.submit_task("a", "A", two_seconds()).await.unwrap();
    let outcome = manager
        .wait_for_task(&quick.task_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(outcome.record.status, TaskStatus::Completed);
    assert_eq!(outcome.record.progress, 100);
    assert!(outcome.waited >= Duration::from_secs(2));
    assert!(outcome.waited <= Duration::from_secs(3));

    let slow = manager.submit_task("b", "B", two_seconds()).await.unwrap();
    let err = manager
        .wait_for_task(&slow.task_id, Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SpoolError::WaitTimeout { task_id, .. } if task_id == slow.task_id));
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_queued_task_prevents_its_side_effects() {
    let manager = TaskManager::new(config(10, 1));
    manager.start().await;
    let gate = Arc::new(Semaphore::new(0));
    let ran = Arc::new(AtomicUsize::new(0));

    let g = Arc::clone(&gate);
    manager
        .submit_task("blocker", "A", move |_ctx: TaskContext| async move {
            let _permit = g.acquire().await;
            Ok::<(), ProcessError>(())
        })
        .await
        .unwrap();
    settle().await;

    let counter = Arc::clone(&ran);
    let victim = manager
        .submit_task("victim", "A", move |_ctx: TaskContext| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), ProcessError>(())
        })
        .await
        .unwrap();
    assert_eq!(victim.queue_position, 1);

    let outcome = manager.cancel_task(&victim.task_id).await.unwrap();
    assert!(matches!(
        outcome,
        CancelOutcome::Cancelled { previous: TaskStatus::Queued, .. }
    ));
    assert_eq!(manager.partition_snapshot("A").unwrap().backlog, 0);

    gate.add_permits(1);
    manager.wait_idle("A").await;

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    let record = manager.get_task_status(&victim.task_id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    manager.shutdown().await;
}

/// Submits a callback that blocks on `gate`, then cancels it mid-run.
async fn cancel_while_running<F, Fut>(manager: &TaskManager, gate: &Arc<Semaphore>, body: F) -> TaskId
where
    F: FnOnce(TaskContext) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<(), ProcessError>> + Send + 'static,
{
    let g = Arc::clone(gate);
    let submission = manager
        .submit_task("running", "A", move |ctx: TaskContext| async move {
            let _permit = g.acquire().await;
            body(ctx).await
        })
        .await
        .unwrap();
    settle().await;
    assert_eq!(
        manager.get_task_status(&submission.task_id).await.unwrap().status,
        TaskStatus::Processing
    );

    let outcome = manager.cancel_task(&submission.task_id).await.unwrap();
    assert!(matches!(
        outcome,
        CancelOutcome::Cancelled { previous: TaskStatus::Processing, .. }
    ));
    submission.task_id
}

#[tokio::test(start_paused = true)]
async fn callback_that_honours_cancellation_stays_cancelled() {
    let manager = TaskManager::new(TaskConfig::default());
    let gate = Arc::new(Semaphore::new(0));
    let saw_cancel = Arc::new(AtomicUsize::new(0));

    let flag = Arc::clone(&saw_cancel);
    let task_id = cancel_while_running(&manager, &gate, move |ctx: TaskContext| async move {
        if ctx.is_cancelled().await {
            flag.fetch_add(1, Ordering::SeqCst);
            return Err(ProcessError::Cancelled);
        }
        Ok(())
    })
    .await;

    gate.add_permits(1);
    manager.wait_idle("A").await;

    assert_eq!(saw_cancel.load(Ordering::SeqCst), 1);
    let record = manager.get_task_status(&task_id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert!(record.completed_at.is_none());
    assert!(record.error_message.is_none());
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn callback_that_ignores_cancellation_still_completes() {
    let manager = TaskManager::new(TaskConfig::default());
    let gate = Arc::new(Semaphore::new(0));

    let task_id = cancel_while_running(&manager, &gate, |_ctx: TaskContext| async move {
        Ok::<(), ProcessError>(())
    })
    .await;

    gate.add_permits(1);
    manager.wait_idle("A").await;

    let record = manager.get_task_status(&task_id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert_eq!(record.progress, 100);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn cancelling_a_finished_task_is_a_no_op() {
    let manager = TaskManager::new(TaskConfig::default());
    let submission = manager
        .submit_task("done", "A", |_ctx: TaskContext| async move { Ok::<(), ProcessError>(()) })
        .await
        .unwrap();
    manager.wait_idle("A").await;
    let before = manager.get_task_status(&submission.task_id).await.unwrap();

    let outcome = manager.cancel_task(&submission.task_id).await.unwrap();
    assert_eq!(
        outcome,
        CancelOutcome::AlreadyFinished {
            task_id: submission.task_id,
            status: TaskStatus::Completed,
        }
    );
    assert!(outcome.message().ends_with("already completed"));

    let again = manager.cancel_task(&submission.task_id).await.unwrap();
    assert_eq!(again, outcome);
    assert_eq!(
        manager.get_task_status(&submission.task_id).await.unwrap(),
        before
    );
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn list_filters_by_partition_and_status_most_recent_first() {
    let manager = TaskManager::new(config(10, 1));
    manager.start().await;

    let mut failed_in_b = Vec::new();
    for n in 0..6 {
        let fail = n % 2 == 0;
        let submission = manager
            .submit_task(&format!("b-{n}"), "B", move |_ctx: TaskContext| async move {
                if fail {
                    Err(ProcessError::failed("boom"))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();
        if fail {
            failed_in_b.push(submission.task_id);
        }
    }
    for n in 0..3 {
        manager
            .submit_task(&format!("a-{n}"), "A", |_ctx: TaskContext| async move {
                Err::<(), _>(ProcessError::failed("boom"))
            })
            .await
            .unwrap();
    }
    manager.wait_idle("A").await;
    manager.wait_idle("B").await;

    let listed = manager.list_tasks(Some("B"), Some("FAILED"), 10).await.unwrap();
    let ids: Vec<_> = listed.iter().map(|r| r.task_id).collect();
    failed_in_b.reverse();
    assert_eq!(ids, failed_in_b);
    assert!(listed
        .iter()
        .all(|r| r.partition == "B" && r.status == TaskStatus::Failed));

    assert_eq!(manager.list_tasks(None, Some("failed"), 10).await.unwrap().len(), 6);
    assert_eq!(manager.list_tasks(None, None, 4).await.unwrap().len(), 4);
    manager.shutdown().await;
}

#[tokio::test]
async fn invalid_arguments_are_rejected() {
    let manager = TaskManager::new(TaskConfig::default());
    let submission = manager
        .submit_task("ep", "A", |_ctx: TaskContext| async move { Ok::<(), ProcessError>(()) })
        .await
        .unwrap();

    for limit in [0, 101] {
        let err = manager.list_tasks(None, None, limit).await.unwrap_err();
        assert!(matches!(err, SpoolError::InvalidLimit { max: 100, .. }));
        assert!(err.is_validation());
    }

    let err = manager.list_tasks(None, Some("bogus"), 10).await.unwrap_err();
    assert!(matches!(err, SpoolError::InvalidStatus(_)));
    assert!(err.to_string().contains("queued, processing, completed, failed, cancelled"));

    for timeout in [Duration::ZERO, Duration::from_secs(301)] {
        let err = manager
            .wait_for_task(&submission.task_id, timeout)
            .await
            .unwrap_err();
        assert!(matches!(err, SpoolError::InvalidTimeout { max_secs: 300, .. }));
    }
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn evicted_record_does_not_break_its_callback() {
    let manager = TaskManager::new(TaskConfig {
        store_max_size: 2,
        ..TaskConfig::default()
    });
    let gate = Arc::new(Semaphore::new(0));
    let stored = Arc::new(Mutex::new(None));

    let g = Arc::clone(&gate);
    let seen = Arc::clone(&stored);
    let first = manager
        .submit_task("first", "A", move |ctx: TaskContext| async move {
            let _permit = g.acquire().await;
            let accepted = ctx.report_progress(90).await;
            *seen.lock().unwrap() = Some(accepted);
            Ok::<(), ProcessError>(())
        })
        .await
        .unwrap();
    settle().await;

    for n in 0..2 {
        manager
            .submit_task(&format!("other-{n}"), "B", |_ctx: TaskContext| async move {
                Ok::<(), ProcessError>(())
            })
            .await
            .unwrap();
    }
    assert!(matches!(
        manager.get_task_status(&first.task_id).await,
        Err(SpoolError::NotFound(_))
    ));

    gate.add_permits(1);
    manager.wait_idle("A").await;
    manager.wait_idle("B").await;
    // the callback ran to the end and its progress write was dropped
    assert_eq!(*stored.lock().unwrap(), Some(false));
    assert_eq!(manager.stats().await.total, 2);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn janitor_removes_expired_records() {
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
    ));
    let manager = TaskManager::builder()
        .config(TaskConfig {
            store_ttl: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(10),
            ..TaskConfig::default()
        })
        .clock(clock.clone())
        .build();
    manager.start().await;

    let submission = manager
        .submit_task("ep", "A", |_ctx: TaskContext| async move { Ok::<(), ProcessError>(()) })
        .await
        .unwrap();
    manager.wait_idle("A").await;

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(manager.get_task_status(&submission.task_id).await.is_ok());

    clock.advance(Duration::from_secs(61));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(matches!(
        manager.get_task_status(&submission.task_id).await,
        Err(SpoolError::NotFound(_))
    ));
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_everything_and_rejects_new_work() {
    let manager = TaskManager::new(config(10, 1));
    manager.start().await;
    let gate = Arc::new(Semaphore::new(0));

    let g = Arc::clone(&gate);
    let running = manager
        .submit_task("running", "A", move |_ctx: TaskContext| async move {
            let _permit = g.acquire().await;
            Ok::<(), ProcessError>(())
        })
        .await
        .unwrap();
    let waiting = manager
        .submit_task("waiting", "A", |_ctx: TaskContext| async move { Ok::<(), ProcessError>(()) })
        .await
        .unwrap();
    settle().await;

    manager.shutdown().await;

    let record = manager.get_task_status(&running.task_id).await.unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("interrupted by shutdown"));
    assert_eq!(
        manager.get_task_status(&waiting.task_id).await.unwrap().status,
        TaskStatus::Queued
    );
    assert!(manager.partitions().is_empty());

    let err = manager
        .submit_task("late", "A", |_ctx: TaskContext| async move { Ok::<(), ProcessError>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, SpoolError::ShutDown));
    assert!(matches!(
        manager
            .run_inline("late", "A", |_ctx: TaskContext| async move { Ok::<(), ProcessError>(()) })
            .await,
        Err(SpoolError::ShutDown)
    ));
}
