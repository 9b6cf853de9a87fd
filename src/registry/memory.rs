//! In-process service registry for tests and single-process runs.
//!
//! Same CAS semantics as the etcd backend, minus leases: entries live until
//! explicitly unregistered.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tonic::async_trait;
use tracing::debug;

use super::{
    RegistrationHandle, RegistryError, RegistryResult, ServiceRegistry, WorkerInfo,
};

#[derive(Clone, Default)]
pub struct MemoryRegistry {
    entries: Arc<Mutex<HashMap<String, WorkerInfo>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live registrations, across all services.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ServiceRegistry for MemoryRegistry {
    async fn register(
        &self,
        info: WorkerInfo,
        _ttl: Duration,
    ) -> RegistryResult<Box<dyn RegistrationHandle>> {
        let key = info.key_suffix();
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if entries.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(key));
        }
        entries.insert(key.clone(), info);
        debug!(key = %key, "worker registered (memory)");
        Ok(Box::new(MemoryRegistration {
            entries: Arc::clone(&self.entries),
            key,
        }))
    }

    async fn resolve(&self, service_name: &str) -> RegistryResult<Vec<WorkerInfo>> {
        let entries = self.entries.lock().expect("registry lock poisoned");
        Ok(entries
            .values()
            .filter(|info| info.service_name == service_name)
            .cloned()
            .collect())
    }
}

struct MemoryRegistration {
    entries: Arc<Mutex<HashMap<String, WorkerInfo>>>,
    key: String,
}

#[async_trait]
impl RegistrationHandle for MemoryRegistration {
    async fn unregister(&self) {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .remove(&self.key);
        debug!(key = %self.key, "worker unregistered (memory)");
    }
}
