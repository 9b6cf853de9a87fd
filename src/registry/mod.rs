//! Lease-based worker registration and discovery.
//!
//! Workers publish a [`WorkerInfo`] JSON document under
//! `<prefix>/<service_name>/<worker_id>`, bound to a TTL lease. Absence of
//! the key (lease expiry or explicit delete) means the worker is gone.
//!
//! Registration is compare-and-swap: the put succeeds only if the key does
//! not already exist, so at most one live worker can hold a given worker id.

mod etcd;
mod memory;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tonic::async_trait;

pub use etcd::EtcdRegistry;
pub use memory::MemoryRegistry;

/// Ephemeral registration payload, owned by the distributed store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInfo {
    pub service_name: String,
    /// Advertised endpoint, `host:port`.
    pub address: String,
    pub worker_id: String,
    pub start_time: DateTime<Utc>,
}

impl WorkerInfo {
    /// Key suffix below the registry prefix.
    pub fn key_suffix(&self) -> String {
        format!("{}/{}", self.service_name, self.worker_id)
    }
}

/// Derive a worker id: UUID-suffixed in multi-instance mode, a fixed
/// "unique" id when only one instance of this worker kind is permitted.
pub fn derive_worker_id(service_name: &str, multi_instance: bool) -> String {
    if multi_instance {
        format!("{service_name}-{}", uuid::Uuid::new_v4())
    } else {
        format!("{service_name}-unique")
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("worker id already registered: {0}")]
    AlreadyRegistered(String),

    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("malformed registration payload: {0}")]
    Payload(#[from] serde_json::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Live registration. Dropping the handle without calling
/// [`RegistrationHandle::unregister`] leaves cleanup to lease expiry.
#[async_trait]
pub trait RegistrationHandle: Send + Sync {
    /// Delete the registration key and release the lease. Best-effort:
    /// errors are logged by implementations, the lease TTL is the safety
    /// net against orphaned entries.
    async fn unregister(&self);
}

/// Registration and discovery operations.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Publish `info` bound to a TTL lease. Fails with
    /// [`RegistryError::AlreadyRegistered`] when the key already exists.
    async fn register(
        &self,
        info: WorkerInfo,
        ttl: Duration,
    ) -> RegistryResult<Box<dyn RegistrationHandle>>;

    /// All live workers registered under `service_name`.
    async fn resolve(&self, service_name: &str) -> RegistryResult<Vec<WorkerInfo>>;
}
