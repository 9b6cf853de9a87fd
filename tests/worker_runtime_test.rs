//! Worker runtime tests over the in-process recording sink.
//!
//! These exercise the invocation lifecycle (statuses, logs, cancellation,
//! timeout, panic containment) without any network or database.

use std::sync::Arc;
use std::time::Duration;

use foreman::status::TaskStatus;
use foreman::test_support::RecordingSink;
use foreman::worker::{CallRequest, CallTaskError, Worker, WorkerConfig};

fn test_worker(sink: &RecordingSink) -> Worker {
    Worker::new(WorkerConfig::new("test-service"), Arc::new(sink.clone()))
}

fn call(unique_id: &str, codename: &str, arguments: &str, timeout_seconds: u32) -> CallRequest {
    CallRequest {
        task_codename: codename.to_string(),
        unique_task_id: unique_id.to_string(),
        arguments: arguments.to_string(),
        timeout_seconds,
        caller: "tests".to_string(),
        dispatch_timestamp: 0,
    }
}

/// Poll until `pred` holds or the deadline passes.
async fn wait_for(pred: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn successful_run_reports_full_lifecycle() {
    let sink = RecordingSink::new();
    let worker = test_worker(&sink);
    worker.register_task("greet", |_ctx, param| async move {
        param.logger.info(format!("hello {}", param.arguments)).await;
        Ok(())
    });

    worker.call_task(call("run-1", "greet", "world", 0)).await.unwrap();

    wait_for(|| sink.statuses_for("run-1").contains(&TaskStatus::Success)).await;
    assert_eq!(
        sink.statuses_for("run-1"),
        vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Success]
    );
    assert_eq!(sink.logs_for("run-1"), vec!["[INFO] hello world"]);
    assert_eq!(worker.running_count(), 0);
}

#[tokio::test]
async fn unregistered_codename_reports_task_not_found() {
    let sink = RecordingSink::new();
    let worker = test_worker(&sink);

    let err = worker
        .call_task(call("run-2", "no-such-task", "", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, CallTaskError::NotRegistered(_)));

    // Exactly one status, and no run-list entry was ever created.
    assert_eq!(sink.statuses_for("run-2"), vec![TaskStatus::TaskNotFound]);
    assert_eq!(worker.running_count(), 0);
}

#[tokio::test]
async fn failing_task_reports_failed_with_error_log() {
    let sink = RecordingSink::new();
    let worker = test_worker(&sink);
    worker.register_task("broken", |_ctx, _param| async move {
        anyhow::bail!("disk on fire")
    });

    worker.call_task(call("run-3", "broken", "", 0)).await.unwrap();

    wait_for(|| sink.statuses_for("run-3").contains(&TaskStatus::Failed)).await;
    assert_eq!(
        sink.statuses_for("run-3"),
        vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Failed]
    );
    let logs = sink.logs_for("run-3");
    assert_eq!(logs.len(), 1);
    assert!(logs[0].contains("disk on fire"), "got {logs:?}");
}

#[tokio::test]
async fn timeout_is_enforced() {
    let sink = RecordingSink::new();
    let worker = test_worker(&sink);
    worker.register_task("slow", |_ctx, _param| async move {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    });

    let started = tokio::time::Instant::now();
    worker.call_task(call("run-4", "slow", "", 1)).await.unwrap();

    wait_for(|| sink.statuses_for("run-4").contains(&TaskStatus::Timeout)).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(1), "finished too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "finished too late: {elapsed:?}");
    assert_eq!(worker.running_count(), 0);
}

#[tokio::test]
async fn duplicate_unique_id_is_rejected_without_touching_first_run() {
    let sink = RecordingSink::new();
    let worker = test_worker(&sink);
    let gate = Arc::new(tokio::sync::Notify::new());
    let gate_task = Arc::clone(&gate);
    worker.register_task("waiter", move |_ctx, _param| {
        let gate = Arc::clone(&gate_task);
        async move {
            gate.notified().await;
            Ok(())
        }
    });

    worker.call_task(call("run-5", "waiter", "", 0)).await.unwrap();
    wait_for(|| worker.is_running("run-5")).await;

    let err = worker
        .call_task(call("run-5", "waiter", "", 0))
        .await
        .unwrap_err();
    assert!(matches!(err, CallTaskError::DuplicateRun(_)));

    gate.notify_waiters();
    wait_for(|| sink.statuses_for("run-5").contains(&TaskStatus::Success)).await;

    // The first run's lifecycle, once - the duplicate wrote nothing.
    assert_eq!(
        sink.statuses_for("run-5"),
        vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Success]
    );
}

#[tokio::test]
async fn panic_is_contained_and_worker_survives() {
    let sink = RecordingSink::new();
    let worker = test_worker(&sink);
    worker.register_task("explode", |_ctx, _param| async move {
        panic!("boom");
    });
    worker.register_task("fine", |_ctx, _param| async move { Ok(()) });

    worker.call_task(call("run-6", "explode", "", 0)).await.unwrap();
    wait_for(|| sink.statuses_for("run-6").contains(&TaskStatus::Panic)).await;

    let statuses = sink.statuses_for("run-6");
    assert_eq!(
        statuses.iter().filter(|s| **s == TaskStatus::Panic).count(),
        1
    );
    let logs = sink.logs_for("run-6");
    assert!(logs.iter().any(|l| l.contains("boom")), "got {logs:?}");

    // The worker keeps serving after a panic.
    worker.call_task(call("run-7", "fine", "", 0)).await.unwrap();
    wait_for(|| sink.statuses_for("run-7").contains(&TaskStatus::Success)).await;
    assert_eq!(worker.running_count(), 0);
}

#[tokio::test]
async fn kill_cancels_run_and_unknown_kill_is_a_noop() {
    let sink = RecordingSink::new();
    let worker = test_worker(&sink);
    worker.register_task("patient", |ctx, _param| async move {
        ctx.cancelled().await;
        Ok(())
    });

    worker.call_task(call("run-8", "patient", "", 0)).await.unwrap();
    wait_for(|| worker.is_running("run-8")).await;

    assert!(worker.kill_task("run-8").await);
    wait_for(|| sink.statuses_for("run-8").contains(&TaskStatus::Manual)).await;
    assert_eq!(worker.running_count(), 0);

    // Unknown and already-finished ids: no error, no status write.
    assert!(!worker.kill_task("never-ran").await);
    assert!(!worker.kill_task("run-8").await);
    assert!(sink.statuses_for("never-ran").is_empty());
}

#[tokio::test]
async fn every_log_line_is_delivered_in_order_before_terminal_status() {
    let sink = RecordingSink::new();
    let worker = test_worker(&sink);
    worker.register_task("chatty", |_ctx, param| async move {
        for i in 0..50 {
            param.logger.info(format!("line {i}")).await;
        }
        Ok(())
    });

    worker.call_task(call("run-9", "chatty", "", 0)).await.unwrap();
    wait_for(|| sink.statuses_for("run-9").contains(&TaskStatus::Success)).await;

    let logs = sink.logs_for("run-9");
    let expected: Vec<String> = (0..50).map(|i| format!("[INFO] line {i}")).collect();
    assert_eq!(logs, expected);
}

#[tokio::test]
async fn status_report_failures_never_block_the_run() {
    let sink = RecordingSink::new();
    sink.set_fail_status(true);
    let worker = test_worker(&sink);
    worker.register_task("quiet", |_ctx, _param| async move { Ok(()) });

    worker.call_task(call("run-10", "quiet", "", 0)).await.unwrap();

    // Reports are retried then swallowed; the run still drains cleanly.
    wait_for(|| worker.running_count() == 0 && !worker.is_running("run-10")).await;
    assert!(sink.statuses_for("run-10").is_empty());
}
