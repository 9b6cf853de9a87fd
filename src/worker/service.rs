//! Point-to-point gRPC surface of a worker process.

use tonic::{async_trait, Request, Response, Status};

use crate::messages::proto;

use super::{CallRequest, Worker};

/// Thin adapter from the worker RPC surface to the runtime.
#[derive(Clone)]
pub struct WorkerGrpcService {
    worker: Worker,
}

impl WorkerGrpcService {
    pub fn new(worker: Worker) -> Self {
        Self { worker }
    }
}

#[async_trait]
impl proto::worker_server::Worker for WorkerGrpcService {
    async fn call_task(
        &self,
        request: Request<proto::WorkerCallTaskRequest>,
    ) -> Result<Response<proto::WorkerCallTaskResponse>, Status> {
        let req = CallRequest::from_proto(request.into_inner());
        // Validation failures are answered as ok=false, not RPC errors:
        // the terminal status (when any) has already been reported.
        let resp = match self.worker.call_task(req).await {
            Ok(()) => proto::WorkerCallTaskResponse {
                ok: true,
                message: "dispatched".to_string(),
            },
            Err(err) => proto::WorkerCallTaskResponse {
                ok: false,
                message: err.to_string(),
            },
        };
        Ok(Response::new(resp))
    }

    async fn kill_task(
        &self,
        request: Request<proto::KillTaskRequest>,
    ) -> Result<Response<proto::KillTaskResponse>, Status> {
        let req = request.into_inner();
        let found = self.worker.kill_task(&req.task_unique_id).await;
        let message = if found {
            "kill signalled".to_string()
        } else {
            "no such invocation".to_string()
        };
        // Kill is idempotent; an unknown id is still ok=true.
        Ok(Response::new(proto::KillTaskResponse { ok: true, message }))
    }
}
