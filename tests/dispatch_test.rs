//! Dispatch service tests over the in-memory store and registry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use foreman::dispatch::DispatchService;
use foreman::registry::{MemoryRegistry, ServiceRegistry};
use foreman::status::TaskStatus;
use foreman::store::{partition_for, MemoryStore, NewResult, ResultStore};

fn service(store: &MemoryStore) -> DispatchService {
    DispatchService::new(
        Arc::new(store.clone()),
        Arc::new(MemoryRegistry::new()) as Arc<dyn ServiceRegistry>,
    )
}

/// Insert an invocation row directly, bypassing `call_task`, so status and
/// log paths can be tested without racing the forwarding task.
async fn seed_result(store: &MemoryStore) -> (Uuid, String) {
    let id = Uuid::new_v4();
    let partition = partition_for(Utc::now());
    store
        .create_result(&NewResult {
            id,
            partition: partition.clone(),
            task_codename: "seeded".to_string(),
            caller: "tests".to_string(),
            arguments: String::new(),
            timeout_seconds: 0,
        })
        .await
        .unwrap();
    (id, partition)
}

#[tokio::test]
async fn call_task_rejects_unknown_codename() {
    let store = MemoryStore::new();
    let dispatch = service(&store);

    let err = dispatch.call_task("ghost", "", 0, "tests").await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);
}

#[tokio::test]
async fn call_task_rejects_disabled_task() {
    let store = MemoryStore::new();
    store.insert_task("parked", "demo", true, "disabled task");
    let dispatch = service(&store);

    let err = dispatch.call_task("parked", "", 0, "tests").await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::FailedPrecondition);
}

#[tokio::test]
async fn call_task_without_workers_lands_on_no_worker() {
    let store = MemoryStore::new();
    store.insert_task("orphan", "demo", false, "");
    let dispatch = service(&store);

    let unique_id = dispatch
        .call_task("orphan", "{\"n\":1}", 30, "alice")
        .await
        .unwrap();
    let result_id = Uuid::parse_str(&unique_id).unwrap();

    // The id comes back immediately; the NoWorker outcome lands async.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let row = loop {
        let partition = store.find_partition_of(result_id).await.unwrap();
        if let Some(partition) = partition {
            let row = store.get_result(&partition, result_id).await.unwrap().unwrap();
            if row.task_status() == Some(TaskStatus::NoWorker) {
                break row;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "NoWorker never landed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert_eq!(row.task_codename, "orphan");
    assert_eq!(row.caller, "alice");
    assert_eq!(row.arguments, "{\"n\":1}");
    assert_eq!(row.timeout_seconds, 30);
    assert!(row.worker.is_none());
    assert!(row.end_at.is_some());
}

#[tokio::test]
async fn set_task_status_stamps_terminals_and_absorbs() {
    let store = MemoryStore::new();
    let dispatch = service(&store);
    let (id, partition) = seed_result(&store).await;
    let unique_id = id.to_string();

    // Non-terminal: no end stamp.
    assert!(dispatch
        .set_task_status(&unique_id, TaskStatus::Running.code())
        .await
        .unwrap());
    let row = store.get_result(&partition, id).await.unwrap().unwrap();
    assert_eq!(row.task_status(), Some(TaskStatus::Running));
    assert!(row.end_at.is_none());

    // Terminal: stamped.
    assert!(dispatch
        .set_task_status(&unique_id, TaskStatus::Success.code())
        .await
        .unwrap());
    let row = store.get_result(&partition, id).await.unwrap().unwrap();
    assert_eq!(row.task_status(), Some(TaskStatus::Success));
    assert!(row.end_at.is_some());

    // Terminal states absorb every later update.
    assert!(!dispatch
        .set_task_status(&unique_id, TaskStatus::Failed.code())
        .await
        .unwrap());
    let row = store.get_result(&partition, id).await.unwrap().unwrap();
    assert_eq!(row.task_status(), Some(TaskStatus::Success));
}

#[tokio::test]
async fn set_task_status_rejects_garbage_without_erroring() {
    let store = MemoryStore::new();
    let dispatch = service(&store);
    let (id, _) = seed_result(&store).await;

    // Unknown status code.
    assert!(!dispatch.set_task_status(&id.to_string(), 42).await.unwrap());
    // Unknown invocation.
    assert!(!dispatch
        .set_task_status(&Uuid::new_v4().to_string(), TaskStatus::Running.code())
        .await
        .unwrap());
    // Not even a UUID.
    assert!(!dispatch
        .set_task_status("not-a-uuid", TaskStatus::Running.code())
        .await
        .unwrap());
}

#[tokio::test]
async fn append_log_line_acks_per_line() {
    let store = MemoryStore::new();
    let dispatch = service(&store);
    let (id, partition) = seed_result(&store).await;

    assert!(dispatch.append_log_line(&id.to_string(), "[INFO] first").await);
    assert!(dispatch.append_log_line(&id.to_string(), "[ERROR] second").await);
    assert!(!dispatch.append_log_line(&Uuid::new_v4().to_string(), "lost").await);
    assert!(!dispatch.append_log_line("not-a-uuid", "lost").await);

    let logs = store.list_logs(&partition, id).await.unwrap();
    let contents: Vec<&str> = logs.iter().map(|l| l.content.as_str()).collect();
    assert_eq!(contents, vec!["[INFO] first", "[ERROR] second"]);
}

#[tokio::test]
async fn list_tasks_reflects_definitions() {
    let store = MemoryStore::new();
    store.insert_task("alpha", "demo", false, "first task");
    store.insert_task("beta", "demo", true, "second task");
    let dispatch = service(&store);

    let tasks = dispatch.list_tasks().await.unwrap();
    let names: Vec<&str> = tasks.iter().map(|t| t.codename.as_str()).collect();
    assert_eq!(names, vec!["alpha", "beta"]);
}
