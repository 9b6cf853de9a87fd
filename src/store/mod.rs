//! Partitioned result/log storage.
//!
//! Execution history is sharded into per-partition physical tables
//! (`results_<partition>` / `logs_<partition>`) so a single table never grows
//! without bound. The partition key is a caller-supplied time-bucket label,
//! normally the dispatch month (`%Y%m`).
//!
//! Storage sits behind the [`ResultStore`] trait with two implementations:
//! - [`PostgresStore`]: production backend over sqlx
//! - [`MemoryStore`]: in-process backend for tests and local runs

mod memory;
mod postgres;

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use thiserror::Error;
use tonic::async_trait;
use uuid::Uuid;

use crate::status::TaskStatus;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// `results_<partition>`: bit-exact naming, compatibility-critical.
pub fn result_table_name(partition: &str) -> String {
    format!("results_{partition}")
}

/// `logs_<partition>`: bit-exact naming, compatibility-critical.
pub fn log_table_name(partition: &str) -> String {
    format!("logs_{partition}")
}

/// Partition labels end up inside generated SQL, so the character set is
/// restricted to `[0-9A-Za-z_]`.
pub fn validate_partition_label(partition: &str) -> StoreResult<()> {
    if partition.is_empty()
        || !partition
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(StoreError::InvalidPartition(partition.to_string()));
    }
    Ok(())
}

/// Partition label for an invocation dispatched at `at`.
pub fn partition_for(at: DateTime<Utc>) -> String {
    at.format("%Y%m").to_string()
}

// ============================================================================
// Model Structs
// ============================================================================

/// A registered task definition. Immutable during a run.
#[derive(Debug, Clone, FromRow)]
pub struct TaskDefinition {
    pub id: i64,
    pub codename: String,
    /// Service whose workers can execute this task; dispatch resolves
    /// registrations under this name.
    pub service_name: String,
    pub formal_parameters: String,
    pub disabled: bool,
    pub description: String,
}

/// One row per invocation, living in `results_<partition>`.
#[derive(Debug, Clone, FromRow)]
pub struct ResultRow {
    pub id: Uuid,
    pub partition: String,
    pub task_codename: String,
    pub caller: String,
    pub arguments: String,
    pub timeout_seconds: i32,
    pub worker: Option<String>,
    pub status: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
}

impl ResultRow {
    pub fn task_status(&self) -> Option<TaskStatus> {
        TaskStatus::parse(&self.status)
    }
}

/// Append-only log line in `logs_<partition>`.
#[derive(Debug, Clone, FromRow)]
pub struct LogRow {
    pub id: i64,
    pub result_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Registry row recording that the paired partition tables exist.
#[derive(Debug, Clone, FromRow)]
pub struct ResultPartition {
    pub id: i64,
    pub partition: String,
}

/// Fields for a freshly dispatched invocation.
#[derive(Debug, Clone)]
pub struct NewResult {
    pub id: Uuid,
    pub partition: String,
    pub task_codename: String,
    pub caller: String,
    pub arguments: String,
    pub timeout_seconds: i32,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid partition label: {0:?}")]
    InvalidPartition(String),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Trait
// ============================================================================

/// Persistence operations used by the dispatch service.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn list_tasks(&self) -> StoreResult<Vec<TaskDefinition>>;

    async fn get_task_by_codename(&self, codename: &str) -> StoreResult<Option<TaskDefinition>>;

    async fn list_partitions(&self) -> StoreResult<Vec<ResultPartition>>;

    /// Make sure `results_<partition>` / `logs_<partition>` and the registry
    /// row exist, atomically. Idempotent: calling it for an existing
    /// partition is a no-op.
    async fn ensure_partition(&self, partition: &str) -> StoreResult<()>;

    /// Insert the invocation row, lazily creating its partition first.
    async fn create_result(&self, new: &NewResult) -> StoreResult<()>;

    /// Update the row's status; terminal statuses carry an `end_at` stamp.
    /// Returns false when the row is missing or already terminal.
    async fn set_result_status(
        &self,
        partition: &str,
        result_id: Uuid,
        status: TaskStatus,
        end_at: Option<DateTime<Utc>>,
    ) -> StoreResult<bool>;

    /// Record which worker the invocation was forwarded to.
    async fn update_result_worker(
        &self,
        partition: &str,
        result_id: Uuid,
        worker: &str,
    ) -> StoreResult<()>;

    async fn append_log(
        &self,
        partition: &str,
        result_id: Uuid,
        content: &str,
    ) -> StoreResult<()>;

    async fn get_result(&self, partition: &str, result_id: Uuid)
        -> StoreResult<Option<ResultRow>>;

    async fn list_logs(&self, partition: &str, result_id: Uuid) -> StoreResult<Vec<LogRow>>;

    /// Locate the partition holding `result_id`, scanning newest first.
    async fn find_partition_of(&self, result_id: Uuid) -> StoreResult<Option<String>>;
}
