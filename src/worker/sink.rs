//! Backchannel from a worker to the dispatch service.
//!
//! Status reports and log lines flow through the [`DispatchSink`] seam so
//! the runtime can be exercised in tests without a network; the production
//! implementation wraps the dispatch gRPC client.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{async_trait, transport::Channel, Request, Streaming};

use crate::messages::proto;
use crate::status::TaskStatus;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc error: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("dispatch rejected the update")]
    Rejected,

    #[error("log stream closed")]
    StreamClosed,
}

/// One open `AppendTaskLog` exchange. Each `append` sends a line and waits
/// for its ack, preserving enqueue order.
#[async_trait]
pub trait LogStream: Send {
    async fn append(&mut self, unique_id: &str, content: &str) -> Result<bool, SinkError>;
}

/// Status and log delivery to the dispatch service.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    async fn report_status(&self, unique_id: &str, status: TaskStatus) -> Result<(), SinkError>;

    async fn open_log_stream(&self) -> Result<Box<dyn LogStream>, SinkError>;
}

/// Production sink over the dispatch gRPC client.
#[derive(Clone)]
pub struct GrpcDispatchSink {
    client: proto::dispatch_client::DispatchClient<Channel>,
}

impl GrpcDispatchSink {
    /// Connect to the dispatch service, e.g. `http://127.0.0.1:7910`.
    pub async fn connect(endpoint: String) -> Result<Self, SinkError> {
        let client = proto::dispatch_client::DispatchClient::connect(endpoint).await?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DispatchSink for GrpcDispatchSink {
    async fn report_status(&self, unique_id: &str, status: TaskStatus) -> Result<(), SinkError> {
        let mut client = self.client.clone();
        let resp = client
            .set_task_status(Request::new(proto::SetTaskStatusRequest {
                task_unique_id: unique_id.to_string(),
                status: proto::TaskStatus::from(status) as i32,
            }))
            .await?;
        if resp.into_inner().ok {
            Ok(())
        } else {
            Err(SinkError::Rejected)
        }
    }

    async fn open_log_stream(&self) -> Result<Box<dyn LogStream>, SinkError> {
        let mut client = self.client.clone();
        let (tx, rx) = mpsc::channel(64);
        let resp = client
            .append_task_log(Request::new(ReceiverStream::new(rx)))
            .await?;
        Ok(Box::new(GrpcLogStream {
            tx,
            inbound: resp.into_inner(),
        }))
    }
}

struct GrpcLogStream {
    tx: mpsc::Sender<proto::AppendTaskLogRequest>,
    inbound: Streaming<proto::AppendTaskLogResponse>,
}

#[async_trait]
impl LogStream for GrpcLogStream {
    async fn append(&mut self, unique_id: &str, content: &str) -> Result<bool, SinkError> {
        self.tx
            .send(proto::AppendTaskLogRequest {
                task_unique_id: unique_id.to_string(),
                content: content.to_string(),
            })
            .await
            .map_err(|_| SinkError::StreamClosed)?;
        match self.inbound.message().await? {
            Some(ack) => Ok(ack.ok),
            None => Err(SinkError::StreamClosed),
        }
    }
}
