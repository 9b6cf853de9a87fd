//! In-memory store backend for tests and local runs.
//!
//! Mirrors the Postgres backend's semantics, including partition laziness
//! and the absorbing-terminal status guard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tonic::async_trait;
use uuid::Uuid;

use crate::status::TaskStatus;

use super::{
    validate_partition_label, LogRow, NewResult, ResultPartition, ResultRow, ResultStore,
    StoreResult, TaskDefinition,
};

#[derive(Default)]
struct MemoryState {
    tasks: Vec<TaskDefinition>,
    partitions: Vec<ResultPartition>,
    results: HashMap<(String, Uuid), ResultRow>,
    logs: HashMap<(String, Uuid), Vec<LogRow>>,
    next_partition_id: i64,
    next_task_id: i64,
    next_log_id: i64,
}

/// Trait-complete in-process store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a task definition, assigning it an id. Test/wiring helper that
    /// stands in for the external CRUD surface.
    pub fn insert_task(
        &self,
        codename: &str,
        service_name: &str,
        disabled: bool,
        description: &str,
    ) -> TaskDefinition {
        let mut state = self.inner.lock().expect("store lock poisoned");
        state.next_task_id += 1;
        let def = TaskDefinition {
            id: state.next_task_id,
            codename: codename.to_string(),
            service_name: service_name.to_string(),
            formal_parameters: String::new(),
            disabled,
            description: description.to_string(),
        };
        state.tasks.push(def.clone());
        def
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn list_tasks(&self) -> StoreResult<Vec<TaskDefinition>> {
        Ok(self.inner.lock().expect("store lock poisoned").tasks.clone())
    }

    async fn get_task_by_codename(&self, codename: &str) -> StoreResult<Option<TaskDefinition>> {
        let state = self.inner.lock().expect("store lock poisoned");
        Ok(state.tasks.iter().find(|t| t.codename == codename).cloned())
    }

    async fn list_partitions(&self) -> StoreResult<Vec<ResultPartition>> {
        let state = self.inner.lock().expect("store lock poisoned");
        let mut partitions = state.partitions.clone();
        partitions.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(partitions)
    }

    async fn ensure_partition(&self, partition: &str) -> StoreResult<()> {
        validate_partition_label(partition)?;
        let mut state = self.inner.lock().expect("store lock poisoned");
        if state.partitions.iter().any(|p| p.partition == partition) {
            return Ok(());
        }
        state.next_partition_id += 1;
        let entry = ResultPartition {
            id: state.next_partition_id,
            partition: partition.to_string(),
        };
        state.partitions.push(entry);
        Ok(())
    }

    async fn create_result(&self, new: &NewResult) -> StoreResult<()> {
        self.ensure_partition(&new.partition).await?;
        let mut state = self.inner.lock().expect("store lock poisoned");
        let row = ResultRow {
            id: new.id,
            partition: new.partition.clone(),
            task_codename: new.task_codename.clone(),
            caller: new.caller.clone(),
            arguments: new.arguments.clone(),
            timeout_seconds: new.timeout_seconds,
            worker: None,
            status: TaskStatus::Initialization.as_str().to_string(),
            start_at: Utc::now(),
            end_at: None,
        };
        state.results.insert((new.partition.clone(), new.id), row);
        Ok(())
    }

    async fn set_result_status(
        &self,
        partition: &str,
        result_id: Uuid,
        status: TaskStatus,
        end_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool> {
        validate_partition_label(partition)?;
        let mut state = self.inner.lock().expect("store lock poisoned");
        let Some(row) = state.results.get_mut(&(partition.to_string(), result_id)) else {
            return Ok(false);
        };
        let current = TaskStatus::parse(&row.status);
        if current.map(|s| s.is_terminal()).unwrap_or(false) {
            return Ok(false);
        }
        row.status = status.as_str().to_string();
        if end_at.is_some() {
            row.end_at = end_at;
        }
        Ok(true)
    }

    async fn update_result_worker(
        &self,
        partition: &str,
        result_id: Uuid,
        worker: &str,
    ) -> StoreResult<()> {
        validate_partition_label(partition)?;
        let mut state = self.inner.lock().expect("store lock poisoned");
        if let Some(row) = state.results.get_mut(&(partition.to_string(), result_id)) {
            row.worker = Some(worker.to_string());
        }
        Ok(())
    }

    async fn append_log(
        &self,
        partition: &str,
        result_id: Uuid,
        content: &str,
    ) -> StoreResult<()> {
        validate_partition_label(partition)?;
        let mut state = self.inner.lock().expect("store lock poisoned");
        state.next_log_id += 1;
        let line = LogRow {
            id: state.next_log_id,
            result_id,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        state
            .logs
            .entry((partition.to_string(), result_id))
            .or_default()
            .push(line);
        Ok(())
    }

    async fn get_result(
        &self,
        partition: &str,
        result_id: Uuid,
    ) -> StoreResult<Option<ResultRow>> {
        validate_partition_label(partition)?;
        let state = self.inner.lock().expect("store lock poisoned");
        Ok(state
            .results
            .get(&(partition.to_string(), result_id))
            .cloned())
    }

    async fn list_logs(&self, partition: &str, result_id: Uuid) -> StoreResult<Vec<LogRow>> {
        validate_partition_label(partition)?;
        let state = self.inner.lock().expect("store lock poisoned");
        Ok(state
            .logs
            .get(&(partition.to_string(), result_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn find_partition_of(&self, result_id: Uuid) -> StoreResult<Option<String>> {
        let state = self.inner.lock().expect("store lock poisoned");
        let mut partitions = state.partitions.clone();
        partitions.sort_by(|a, b| b.id.cmp(&a.id));
        for p in partitions {
            if state.results.contains_key(&(p.partition.clone(), result_id)) {
                return Ok(Some(p.partition));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_partition_is_idempotent() {
        let store = MemoryStore::new();
        store.ensure_partition("202608").await.unwrap();
        store.ensure_partition("202608").await.unwrap();
        let partitions = store.list_partitions().await.unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].partition, "202608");
    }

    #[tokio::test]
    async fn test_create_result_lazily_creates_partition() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store
            .create_result(&NewResult {
                id,
                partition: "202608".to_string(),
                task_codename: "echo".to_string(),
                caller: "test".to_string(),
                arguments: String::new(),
                timeout_seconds: 0,
            })
            .await
            .unwrap();
        assert_eq!(store.list_partitions().await.unwrap().len(), 1);
        let row = store.get_result("202608", id).await.unwrap().unwrap();
        assert_eq!(row.task_status(), Some(TaskStatus::Initialization));
    }

    #[tokio::test]
    async fn test_terminal_status_is_absorbing() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store
            .create_result(&NewResult {
                id,
                partition: "202608".to_string(),
                task_codename: "echo".to_string(),
                caller: "test".to_string(),
                arguments: String::new(),
                timeout_seconds: 0,
            })
            .await
            .unwrap();

        assert!(store
            .set_result_status("202608", id, TaskStatus::Running, None)
            .await
            .unwrap());
        assert!(store
            .set_result_status("202608", id, TaskStatus::Success, Some(Utc::now()))
            .await
            .unwrap());
        // A late RUNNING must not overwrite the terminal state
        assert!(!store
            .set_result_status("202608", id, TaskStatus::Running, None)
            .await
            .unwrap());
        let row = store.get_result("202608", id).await.unwrap().unwrap();
        assert_eq!(row.task_status(), Some(TaskStatus::Success));
        assert!(row.end_at.is_some());
    }

    #[tokio::test]
    async fn test_find_partition_of_scans_newest_first() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        store.ensure_partition("202607").await.unwrap();
        store
            .create_result(&NewResult {
                id,
                partition: "202608".to_string(),
                task_codename: "echo".to_string(),
                caller: "test".to_string(),
                arguments: String::new(),
                timeout_seconds: 0,
            })
            .await
            .unwrap();
        assert_eq!(
            store.find_partition_of(id).await.unwrap(),
            Some("202608".to_string())
        );
        assert_eq!(store.find_partition_of(Uuid::new_v4()).await.unwrap(), None);
    }
}
