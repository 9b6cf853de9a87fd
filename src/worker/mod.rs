//! Worker runtime: task registry, in-flight run-list, and invocation
//! lifecycle.
//!
//! A worker process registers its executable task functions by codename,
//! starts a point-to-point gRPC service for the dispatch service to call,
//! and publishes itself in the service registry under a TTL lease.
//!
//! Each invocation runs in its own tokio task with a dedicated log pipe.
//! Cancellation is cooperative: kill and timeout abort the task at its next
//! await point, never at the OS level. A panicking task function is
//! contained and mapped to the `Panic` terminal status - it must never take
//! the worker process down.

pub mod logpipe;
pub mod service;
pub mod sink;

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as AnyhowContext;
use chrono::Utc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tracing::{error, info, warn};

use crate::messages::proto;
use crate::registry::{derive_worker_id, RegistrationHandle, ServiceRegistry, WorkerInfo};
use crate::retry::{self, RetryPolicy};
use crate::status::TaskStatus;

use logpipe::{log_pipe, TaskLogger};
use service::WorkerGrpcService;
use sink::DispatchSink;

/// Return value of a task function.
pub type TaskResult = anyhow::Result<()>;

/// A registered task function, invoked once per dispatch.
pub type TaskFn = Arc<
    dyn Fn(TaskContext, TaskParam) -> Pin<Box<dyn Future<Output = TaskResult> + Send>>
        + Send
        + Sync,
>;

/// Cancellation handle passed into the task function. The function is
/// expected to observe it at its own pace; nothing is forcibly killed.
#[derive(Clone)]
pub struct TaskContext {
    cancel: CancellationToken,
}

impl TaskContext {
    /// Resolves when the invocation has been killed or timed out.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Per-invocation inputs handed to the task function.
pub struct TaskParam {
    pub arguments: String,
    pub logger: TaskLogger,
}

/// An incoming invocation request, as forwarded by the dispatch service.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub task_codename: String,
    pub unique_task_id: String,
    pub arguments: String,
    pub timeout_seconds: u32,
    pub caller: String,
    pub dispatch_timestamp: i64,
}

impl CallRequest {
    pub fn from_proto(req: proto::WorkerCallTaskRequest) -> Self {
        Self {
            task_codename: req.task_codename,
            unique_task_id: req.task_unique_id,
            arguments: req.arguments,
            timeout_seconds: req.timeout_seconds,
            caller: req.caller,
            dispatch_timestamp: req.dispatch_timestamp,
        }
    }
}

/// Dispatch-time validation failures. Both are reported to the caller of
/// the worker RPC as `ok=false`, never as an RPC-level error.
#[derive(Debug, Error)]
pub enum CallTaskError {
    #[error("no task registered under codename {0:?}")]
    NotRegistered(String),

    #[error("invocation {0:?} is already running on this worker")]
    DuplicateRun(String),
}

/// Worker process settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Service name workers of this kind register under.
    pub service_name: String,
    /// Listener bind address; port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Advertised endpoint when it differs from the bound address.
    pub advertise_addr: Option<String>,
    /// UUID-suffixed worker ids when true; a single fixed identity when
    /// only one instance of this worker kind is permitted.
    pub multi_instance: bool,
    /// Registration lease TTL.
    pub lease_ttl: Duration,
    /// Retry policy for status reports.
    pub retry: RetryPolicy,
}

impl WorkerConfig {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            bind_addr: "127.0.0.1:0".parse().expect("loopback addr parses"),
            advertise_addr: None,
            multi_instance: true,
            lease_ttl: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

struct RunningTask {
    cancel: CancellationToken,
}

/// The worker runtime. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Worker {
    config: WorkerConfig,
    tasks: Arc<Mutex<HashMap<String, TaskFn>>>,
    running: Arc<Mutex<HashMap<String, RunningTask>>>,
    sink: Arc<dyn DispatchSink>,
}

impl Worker {
    pub fn new(config: WorkerConfig, sink: Arc<dyn DispatchSink>) -> Self {
        Self {
            config,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(Mutex::new(HashMap::new())),
            sink,
        }
    }

    /// Bind a task function to a codename. Call before [`Worker::start`];
    /// re-registering a codename replaces the previous binding.
    pub fn register_task<F, Fut>(&self, codename: &str, task: F)
    where
        F: Fn(TaskContext, TaskParam) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let task: TaskFn = Arc::new(move |ctx, param| Box::pin(task(ctx, param)));
        self.tasks
            .lock()
            .expect("task registry lock poisoned")
            .insert(codename.to_string(), task);
    }

    /// Number of in-flight invocations.
    pub fn running_count(&self) -> usize {
        self.running.lock().expect("run-list lock poisoned").len()
    }

    pub fn is_running(&self, unique_task_id: &str) -> bool {
        self.running
            .lock()
            .expect("run-list lock poisoned")
            .contains_key(unique_task_id)
    }

    /// Validate and launch an invocation.
    ///
    /// Fails fast on an unregistered codename (reported as `TaskNotFound`)
    /// or a duplicate unique id (logged only - the first run's status is
    /// not touched). Otherwise reports `Pending` then `Running` and spawns
    /// the invocation task.
    pub async fn call_task(&self, req: CallRequest) -> Result<(), CallTaskError> {
        let task = self
            .tasks
            .lock()
            .expect("task registry lock poisoned")
            .get(&req.task_codename)
            .cloned();
        let Some(task) = task else {
            warn!(
                codename = %req.task_codename,
                unique_task_id = %req.unique_task_id,
                "call for unregistered codename"
            );
            self.report(&req.unique_task_id, TaskStatus::TaskNotFound)
                .await;
            return Err(CallTaskError::NotRegistered(req.task_codename));
        };

        let cancel = CancellationToken::new();
        {
            // Insert-if-absent under one short lock: at most one in-flight
            // run per unique id on this worker.
            let mut running = self.running.lock().expect("run-list lock poisoned");
            if running.contains_key(&req.unique_task_id) {
                warn!(
                    unique_task_id = %req.unique_task_id,
                    "duplicate call for an in-flight invocation, ignoring"
                );
                return Err(CallTaskError::DuplicateRun(req.unique_task_id));
            }
            running.insert(
                req.unique_task_id.clone(),
                RunningTask {
                    cancel: cancel.clone(),
                },
            );
        }

        self.report(&req.unique_task_id, TaskStatus::Pending).await;
        self.report(&req.unique_task_id, TaskStatus::Running).await;

        let worker = self.clone();
        tokio::spawn(async move {
            worker.run_invocation(task, req, cancel).await;
        });
        Ok(())
    }

    /// Cancel an in-flight invocation. Unknown ids are a no-op: no error,
    /// no status write. Returns whether an invocation was found.
    pub async fn kill_task(&self, unique_task_id: &str) -> bool {
        let cancel = self
            .running
            .lock()
            .expect("run-list lock poisoned")
            .get(unique_task_id)
            .map(|t| t.cancel.clone());
        match cancel {
            None => {
                info!(unique_task_id = %unique_task_id, "kill for unknown invocation, ignoring");
                false
            }
            Some(cancel) => {
                info!(unique_task_id = %unique_task_id, "killing invocation");
                cancel.cancel();
                true
            }
        }
    }

    /// Drive one invocation to its terminal status.
    ///
    /// This task is the single owner of the log pipe and of the terminal
    /// status report: the relay is always drained before the terminal
    /// status goes out, and the run-list entry is removed last.
    async fn run_invocation(&self, task: TaskFn, req: CallRequest, cancel: CancellationToken) {
        let (logger, rx) = log_pipe();
        let relay = logpipe::spawn_relay(self.sink.clone(), req.unique_task_id.clone(), rx);

        let ctx = TaskContext {
            cancel: cancel.clone(),
        };
        let param = TaskParam {
            arguments: req.arguments.clone(),
            logger: logger.clone(),
        };
        let mut inner = tokio::spawn(task(ctx, param));

        let outcome = if req.timeout_seconds > 0 {
            let limit = Duration::from_secs(req.timeout_seconds as u64);
            tokio::select! {
                _ = cancel.cancelled() => {
                    inner.abort();
                    let _ = (&mut inner).await;
                    TaskStatus::Manual
                }
                joined = tokio::time::timeout(limit, &mut inner) => match joined {
                    Err(_elapsed) => {
                        inner.abort();
                        let _ = (&mut inner).await;
                        TaskStatus::Timeout
                    }
                    Ok(join) => classify(join, &logger).await,
                }
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => {
                    inner.abort();
                    let _ = (&mut inner).await;
                    TaskStatus::Manual
                }
                join = &mut inner => classify(join, &logger).await,
            }
        };

        // Drop the last logger handle, then wait for the relay so every
        // enqueued line is attempted before the terminal status lands.
        drop(logger);
        if let Err(err) = relay.await {
            warn!(
                unique_task_id = %req.unique_task_id,
                error = %err,
                "log relay join failed"
            );
        }

        self.report(&req.unique_task_id, outcome).await;
        self.running
            .lock()
            .expect("run-list lock poisoned")
            .remove(&req.unique_task_id);

        info!(
            unique_task_id = %req.unique_task_id,
            codename = %req.task_codename,
            status = %outcome,
            "invocation finished"
        );
    }

    /// Fire-and-forget status report: bounded retries, then the failure is
    /// logged and swallowed so it never blocks task progress.
    async fn report(&self, unique_task_id: &str, status: TaskStatus) {
        let result = retry::with_backoff(self.config.retry, || {
            self.sink.report_status(unique_task_id, status)
        })
        .await;
        if let Err(err) = result {
            error!(
                unique_task_id = %unique_task_id,
                status = %status,
                error = %err,
                "status report failed, giving up"
            );
        }
    }

    /// Open the listener, start serving the worker RPC surface, and
    /// register in the service registry under a TTL lease.
    ///
    /// Registration is compare-and-swap: if another live worker already
    /// holds this worker id, `start` fails and the server is torn down.
    pub async fn start(&self, registry: Arc<dyn ServiceRegistry>) -> anyhow::Result<WorkerHandle> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .context("failed to bind worker listener")?;
        let addr = listener
            .local_addr()
            .context("failed to resolve worker addr")?;
        let advertised = self
            .config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| addr.to_string());
        let worker_id = derive_worker_id(&self.config.service_name, self.config.multi_instance);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let service = WorkerGrpcService::new(self.clone());
        let server = tokio::spawn(async move {
            let incoming = TcpListenerStream::new(listener);
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let result = Server::builder()
                .add_service(proto::worker_server::WorkerServer::new(service))
                .serve_with_incoming_shutdown(incoming, shutdown)
                .await;
            if let Err(err) = result {
                error!(?err, "worker server exited with error");
            }
        });

        info!(
            %addr,
            service_name = %self.config.service_name,
            worker_id = %worker_id,
            "worker serving"
        );

        let info = WorkerInfo {
            service_name: self.config.service_name.clone(),
            address: advertised,
            worker_id: worker_id.clone(),
            start_time: Utc::now(),
        };
        let registration = match registry.register(info, self.config.lease_ttl).await {
            Ok(handle) => handle,
            Err(err) => {
                let _ = shutdown_tx.send(());
                if let Err(join_err) = server.await {
                    warn!(?join_err, "worker server task join failed");
                }
                return Err(err).context("worker registration failed");
            }
        };

        Ok(WorkerHandle {
            addr,
            worker_id,
            registration,
            shutdown_tx,
            server,
        })
    }
}

/// Classify how the task function ended. Abort-driven endings are handled
/// by the select arms in `run_invocation`; a bare abort landing here means
/// something outside the runtime cancelled the inner task.
async fn classify(join: Result<TaskResult, JoinError>, logger: &TaskLogger) -> TaskStatus {
    match join {
        Ok(Ok(())) => TaskStatus::Success,
        Ok(Err(err)) => {
            logger.error(format!("task failed: {err:#}")).await;
            TaskStatus::Failed
        }
        Err(err) if err.is_panic() => {
            let payload = err.into_panic();
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic payload".to_string());
            logger.error(format!("task panicked: {msg}")).await;
            TaskStatus::Panic
        }
        Err(_) => TaskStatus::Manual,
    }
}

/// A started worker. `stop` unregisters first so no new dispatches arrive,
/// then shuts the server down; cleanup is best-effort, the lease TTL is
/// the safety net.
pub struct WorkerHandle {
    addr: SocketAddr,
    worker_id: String,
    registration: Box<dyn RegistrationHandle>,
    shutdown_tx: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("addr", &self.addr)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn stop(self) {
        self.registration.unregister().await;
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.server.await {
            warn!(?err, "worker server task join failed");
        }
    }
}
