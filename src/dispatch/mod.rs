//! Central dispatch service.
//!
//! Accepts `CallTask` from external callers, creates the invocation's
//! `Result` row in the month-bucketed partition, resolves a live worker via
//! the service registry, and forwards the call point-to-point. Workers
//! report back through `SetTaskStatus` and the `AppendTaskLog` stream.
//!
//! Dispatch is asynchronous: `CallTask` returns the fresh unique id
//! immediately, and every downstream outcome (including `NoWorker` and
//! `CallError`) is visible only through the persisted Result/Log state.

pub mod server;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::Stream;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{async_trait, Request, Response, Status, Streaming};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::messages::proto;
use crate::registry::ServiceRegistry;
use crate::status::TaskStatus;
use crate::store::{partition_for, NewResult, ResultStore};

pub use server::DispatchServerHandle;

/// Index entries older than this are swept on the next dispatch. Covers
/// invocations that never reach a terminal status on this server, e.g.
/// when a worker dies mid-run; evicted ids still resolve through the
/// partition scan fallback.
const INFLIGHT_MAX_AGE: Duration = Duration::from_secs(6 * 60 * 60);

struct InflightEntry {
    partition: String,
    expires_at: Instant,
}

/// Core dispatch logic, shared by the gRPC adapter and tests.
#[derive(Clone)]
pub struct DispatchService {
    store: Arc<dyn ResultStore>,
    registry: Arc<dyn ServiceRegistry>,
    /// unique id -> partition for in-flight invocations. Fallback for ids
    /// that outlive the index (e.g. after a restart) is a newest-first
    /// partition scan in the store.
    inflight: Arc<Mutex<HashMap<String, InflightEntry>>>,
}

impl DispatchService {
    pub fn new(store: Arc<dyn ResultStore>, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self {
            store,
            registry,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn list_tasks(&self) -> Result<Vec<proto::TaskMeta>, Status> {
        let tasks = self
            .store
            .list_tasks()
            .await
            .map_err(|err| Status::internal(format!("failed to list tasks: {err}")))?;
        Ok(tasks
            .into_iter()
            .map(|t| proto::TaskMeta {
                id: t.id,
                codename: t.codename,
                arguments: t.formal_parameters,
                description: t.description,
            })
            .collect())
    }

    /// Validate, persist, and asynchronously forward one invocation.
    /// Returns the fresh unique id; all later failures surface only as
    /// terminal statuses on the Result row.
    pub async fn call_task(
        &self,
        codename: &str,
        arguments: &str,
        timeout_seconds: u32,
        caller: &str,
    ) -> Result<String, Status> {
        let def = self
            .store
            .get_task_by_codename(codename)
            .await
            .map_err(|err| Status::internal(format!("task lookup failed: {err}")))?
            .ok_or_else(|| Status::not_found(format!("no task with codename {codename:?}")))?;
        if def.disabled {
            return Err(Status::failed_precondition(format!(
                "task {codename:?} is disabled"
            )));
        }

        let result_id = Uuid::new_v4();
        let unique_id = result_id.to_string();
        let partition = partition_for(Utc::now());

        self.store
            .create_result(&NewResult {
                id: result_id,
                partition: partition.clone(),
                task_codename: def.codename.clone(),
                caller: caller.to_string(),
                arguments: arguments.to_string(),
                timeout_seconds: timeout_seconds as i32,
            })
            .await
            .map_err(|err| Status::internal(format!("failed to create result row: {err}")))?;

        {
            let now = Instant::now();
            let mut inflight = self.inflight.lock().expect("inflight lock poisoned");
            inflight.retain(|_, entry| now < entry.expires_at);
            inflight.insert(
                unique_id.clone(),
                InflightEntry {
                    partition: partition.clone(),
                    expires_at: now + INFLIGHT_MAX_AGE,
                },
            );
        }

        info!(
            codename = %def.codename,
            unique_task_id = %unique_id,
            partition = %partition,
            caller = %caller,
            "invocation created"
        );

        let svc = self.clone();
        let request = proto::WorkerCallTaskRequest {
            task_codename: def.codename.clone(),
            task_unique_id: unique_id.clone(),
            arguments: arguments.to_string(),
            timeout_seconds,
            caller: caller.to_string(),
            dispatch_timestamp: Utc::now().timestamp(),
        };
        let service_name = def.service_name;
        tokio::spawn(async move {
            svc.forward_to_worker(service_name, partition, result_id, request)
                .await;
        });

        Ok(unique_id)
    }

    /// Resolve a worker and forward the call. No worker means an immediate
    /// `NoWorker` terminal status - no retry; a failed worker RPC becomes
    /// `CallError`.
    async fn forward_to_worker(
        &self,
        service_name: String,
        partition: String,
        result_id: Uuid,
        request: proto::WorkerCallTaskRequest,
    ) {
        let unique_id = request.task_unique_id.clone();

        let workers = match self.registry.resolve(&service_name).await {
            Ok(workers) => workers,
            Err(err) => {
                error!(service_name = %service_name, error = %err, "worker discovery failed");
                Vec::new()
            }
        };
        let Some(worker) = workers.choose(&mut rand::thread_rng()).cloned() else {
            warn!(
                service_name = %service_name,
                unique_task_id = %unique_id,
                "no live worker, marking invocation"
            );
            self.write_terminal(&partition, result_id, TaskStatus::NoWorker)
                .await;
            return;
        };

        if let Err(err) = self
            .store
            .update_result_worker(&partition, result_id, &worker.worker_id)
            .await
        {
            warn!(error = %err, "failed to record assigned worker");
        }

        let endpoint = format!("http://{}", worker.address);
        let forwarded = async {
            let mut client = proto::worker_client::WorkerClient::connect(endpoint).await?;
            Ok::<_, anyhow::Error>(client.call_task(Request::new(request)).await?.into_inner())
        }
        .await;

        match forwarded {
            Ok(resp) if resp.ok => {}
            Ok(resp) => {
                // The worker refused the dispatch (unregistered codename or
                // duplicate run) and already reported any status it owed.
                // Nothing more arrives for this id, so drop its index entry;
                // late lookups go through the partition scan.
                warn!(
                    unique_task_id = %unique_id,
                    worker_id = %worker.worker_id,
                    message = %resp.message,
                    "worker rejected dispatch"
                );
                self.inflight
                    .lock()
                    .expect("inflight lock poisoned")
                    .remove(&unique_id);
            }
            Err(err) => {
                error!(
                    unique_task_id = %unique_id,
                    worker_id = %worker.worker_id,
                    error = %err,
                    "worker call failed"
                );
                self.write_terminal(&partition, result_id, TaskStatus::CallError)
                    .await;
            }
        }
    }

    async fn write_terminal(&self, partition: &str, result_id: Uuid, status: TaskStatus) {
        if let Err(err) = self
            .store
            .set_result_status(partition, result_id, status, Some(Utc::now()))
            .await
        {
            error!(
                result_id = %result_id,
                status = %status,
                error = %err,
                "failed to write terminal status"
            );
        }
        self.inflight
            .lock()
            .expect("inflight lock poisoned")
            .remove(&result_id.to_string());
    }

    /// Update an invocation's status. Returns false for unknown ids,
    /// unknown codes, or attempts to leave a terminal state.
    pub async fn set_task_status(&self, unique_id: &str, code: i32) -> Result<bool, Status> {
        let Some(status) = TaskStatus::from_code(code) else {
            warn!(unique_task_id = %unique_id, code, "unknown status code");
            return Ok(false);
        };
        let Ok(result_id) = Uuid::parse_str(unique_id) else {
            warn!(unique_task_id = %unique_id, "malformed unique id");
            return Ok(false);
        };
        let Some(partition) = self.partition_of(result_id, unique_id).await? else {
            warn!(unique_task_id = %unique_id, "status for unknown invocation");
            return Ok(false);
        };

        let end_at = status.is_terminal().then(Utc::now);
        let updated = self
            .store
            .set_result_status(&partition, result_id, status, end_at)
            .await
            .map_err(|err| Status::internal(format!("status update failed: {err}")))?;

        if status.is_terminal() {
            self.inflight
                .lock()
                .expect("inflight lock poisoned")
                .remove(unique_id);
        }
        Ok(updated)
    }

    /// Append one log line. Unresolvable ids and store failures are acked
    /// as `ok=false`; the stream itself stays up.
    pub async fn append_log_line(&self, unique_id: &str, content: &str) -> bool {
        let Ok(result_id) = Uuid::parse_str(unique_id) else {
            warn!(unique_task_id = %unique_id, "log line for malformed unique id");
            return false;
        };
        let partition = match self.partition_of(result_id, unique_id).await {
            Ok(Some(partition)) => partition,
            Ok(None) => {
                warn!(unique_task_id = %unique_id, "log line for unknown invocation");
                return false;
            }
            Err(err) => {
                error!(unique_task_id = %unique_id, error = %err, "partition lookup failed");
                return false;
            }
        };
        match self.store.append_log(&partition, result_id, content).await {
            Ok(()) => true,
            Err(err) => {
                error!(unique_task_id = %unique_id, error = %err, "log insert failed");
                false
            }
        }
    }

    async fn partition_of(
        &self,
        result_id: Uuid,
        unique_id: &str,
    ) -> Result<Option<String>, Status> {
        let cached = self
            .inflight
            .lock()
            .expect("inflight lock poisoned")
            .get(unique_id)
            .map(|entry| entry.partition.clone());
        if cached.is_some() {
            return Ok(cached);
        }
        self.store
            .find_partition_of(result_id)
            .await
            .map_err(|err| Status::internal(format!("partition scan failed: {err}")))
    }
}

// ============================================================================
// gRPC adapter
// ============================================================================

/// Tonic adapter over [`DispatchService`].
#[derive(Clone)]
pub struct DispatchGrpcService {
    dispatch: DispatchService,
}

impl DispatchGrpcService {
    pub fn new(dispatch: DispatchService) -> Self {
        Self { dispatch }
    }
}

#[async_trait]
impl proto::dispatch_server::Dispatch for DispatchGrpcService {
    async fn list_tasks(
        &self,
        _request: Request<proto::Empty>,
    ) -> Result<Response<proto::ListTasksResponse>, Status> {
        let tasks = self.dispatch.list_tasks().await?;
        Ok(Response::new(proto::ListTasksResponse { tasks }))
    }

    async fn call_task(
        &self,
        request: Request<proto::CallTaskRequest>,
    ) -> Result<Response<proto::CallTaskResponse>, Status> {
        let req = request.into_inner();
        let task_unique_id = self
            .dispatch
            .call_task(
                &req.task_codename,
                &req.arguments,
                req.timeout_seconds,
                &req.caller,
            )
            .await?;
        Ok(Response::new(proto::CallTaskResponse { task_unique_id }))
    }

    async fn set_task_status(
        &self,
        request: Request<proto::SetTaskStatusRequest>,
    ) -> Result<Response<proto::SetTaskStatusResponse>, Status> {
        let req = request.into_inner();
        let ok = self
            .dispatch
            .set_task_status(&req.task_unique_id, req.status)
            .await?;
        Ok(Response::new(proto::SetTaskStatusResponse { ok }))
    }

    type AppendTaskLogStream =
        Pin<Box<dyn Stream<Item = Result<proto::AppendTaskLogResponse, Status>> + Send + 'static>>;

    async fn append_task_log(
        &self,
        request: Request<Streaming<proto::AppendTaskLogRequest>>,
    ) -> Result<Response<Self::AppendTaskLogStream>, Status> {
        let mut inbound = request.into_inner();
        let dispatch = self.dispatch.clone();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                match inbound.message().await {
                    Ok(Some(line)) => {
                        let ok = dispatch
                            .append_log_line(&line.task_unique_id, &line.content)
                            .await;
                        if tx
                            .send(Ok(proto::AppendTaskLogResponse { ok }))
                            .await
                            .is_err()
                        {
                            // Receiver dropped, worker went away
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(?err, "log stream receive error");
                        break;
                    }
                }
            }
        });

        Ok(Response::new(
            Box::pin(ReceiverStream::new(rx)) as Self::AppendTaskLogStream
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::store::MemoryStore;
    use crate::test_support::RecordingSink;
    use crate::worker::{Worker, WorkerConfig};

    async fn seed_result(store: &MemoryStore, partition: &str) -> Uuid {
        let id = Uuid::new_v4();
        store
            .create_result(&NewResult {
                id,
                partition: partition.to_string(),
                task_codename: "seeded".to_string(),
                caller: "tests".to_string(),
                arguments: String::new(),
                timeout_seconds: 0,
            })
            .await
            .unwrap();
        id
    }

    fn index_entry(partition: &str, expires_at: Instant) -> InflightEntry {
        InflightEntry {
            partition: partition.to_string(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_stale_index_entries_are_swept_on_dispatch() {
        let store = MemoryStore::new();
        store.insert_task("echo", "demo", false, "");
        let dispatch = DispatchService::new(
            Arc::new(store.clone()),
            Arc::new(MemoryRegistry::new()),
        );

        let partition = partition_for(Utc::now());
        let stale_id = seed_result(&store, &partition).await;
        dispatch
            .inflight
            .lock()
            .unwrap()
            .insert(stale_id.to_string(), index_entry(&partition, Instant::now()));

        let fresh_id = dispatch.call_task("echo", "", 0, "tests").await.unwrap();

        {
            let inflight = dispatch.inflight.lock().unwrap();
            assert!(!inflight.contains_key(&stale_id.to_string()));
            assert!(inflight.contains_key(&fresh_id));
        }

        // Evicted ids still resolve through the partition scan fallback.
        assert!(dispatch
            .set_task_status(&stale_id.to_string(), TaskStatus::Success.code())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_rejected_dispatch_evicts_the_index_entry() {
        let store = MemoryStore::new();
        let registry = Arc::new(MemoryRegistry::new());
        let dispatch = DispatchService::new(Arc::new(store.clone()), registry.clone());

        // A worker with no registered tasks rejects every dispatch.
        let worker = Worker::new(
            WorkerConfig::new("empty"),
            Arc::new(RecordingSink::new()),
        );
        let handle = worker
            .start(registry as Arc<dyn ServiceRegistry>)
            .await
            .unwrap();

        let partition = partition_for(Utc::now());
        let result_id = seed_result(&store, &partition).await;
        dispatch.inflight.lock().unwrap().insert(
            result_id.to_string(),
            index_entry(&partition, Instant::now() + INFLIGHT_MAX_AGE),
        );

        dispatch
            .forward_to_worker(
                "empty".to_string(),
                partition,
                result_id,
                proto::WorkerCallTaskRequest {
                    task_codename: "ghost".to_string(),
                    task_unique_id: result_id.to_string(),
                    arguments: String::new(),
                    timeout_seconds: 0,
                    caller: "tests".to_string(),
                    dispatch_timestamp: 0,
                },
            )
            .await;

        assert!(!dispatch
            .inflight
            .lock()
            .unwrap()
            .contains_key(&result_id.to_string()));
        handle.stop().await;
    }
}
