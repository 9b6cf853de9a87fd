//! PostgreSQL-backed partitioned store.
//!
//! Fixed tables (`tasks`, `schedules`, `result_partitions`) come from
//! migrations; the per-partition `results_<p>` / `logs_<p>` pairs are created
//! on demand inside a single transaction so the registry row and both tables
//! appear as a unit.

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use tonic::async_trait;
use uuid::Uuid;

use crate::status::TaskStatus;

use super::{
    log_table_name, result_table_name, validate_partition_label, LogRow, NewResult, ResultPartition,
    ResultRow, ResultStore, StoreResult, TaskDefinition,
};

/// Column sets for the partition tables. The tables are first created under
/// their default names and then renamed to the partition-specific names, so
/// the rename fails loudly if a stray default table already exists.
const RESULTS_DDL: &str = r#"
    CREATE TABLE results (
        id UUID PRIMARY KEY,
        "partition" TEXT NOT NULL,
        task_codename TEXT NOT NULL,
        caller TEXT NOT NULL DEFAULT '',
        arguments TEXT NOT NULL DEFAULT '',
        timeout_seconds INTEGER NOT NULL DEFAULT 0,
        worker TEXT,
        status TEXT NOT NULL,
        start_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        end_at TIMESTAMPTZ
    )
"#;

const LOGS_DDL: &str = r#"
    CREATE TABLE logs (
        id BIGSERIAL PRIMARY KEY,
        result_id UUID NOT NULL,
        content TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )
"#;

/// Store backend over a Postgres pool.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect to the database and run migrations
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_pool_size(database_url, 10).await
    }

    /// Connect with a custom pool size
    pub async fn connect_with_pool_size(
        database_url: &str,
        max_connections: u32,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn partition_registered(&self, partition: &str) -> StoreResult<bool> {
        let row = sqlx::query(r#"SELECT 1 AS one FROM result_partitions WHERE "partition" = $1"#)
            .bind(partition)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl ResultStore for PostgresStore {
    async fn list_tasks(&self) -> StoreResult<Vec<TaskDefinition>> {
        let tasks = sqlx::query_as::<_, TaskDefinition>(
            r#"
            SELECT id, codename, service_name, formal_parameters, disabled, description
            FROM tasks
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    async fn get_task_by_codename(&self, codename: &str) -> StoreResult<Option<TaskDefinition>> {
        let task = sqlx::query_as::<_, TaskDefinition>(
            r#"
            SELECT id, codename, service_name, formal_parameters, disabled, description
            FROM tasks
            WHERE codename = $1
            "#,
        )
        .bind(codename)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }

    async fn list_partitions(&self) -> StoreResult<Vec<ResultPartition>> {
        let partitions = sqlx::query_as::<_, ResultPartition>(
            r#"SELECT id, "partition" FROM result_partitions ORDER BY id DESC"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(partitions)
    }

    async fn ensure_partition(&self, partition: &str) -> StoreResult<()> {
        validate_partition_label(partition)?;
        if self.partition_registered(partition).await? {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        // The registry row doubles as the creation lock: losing the conflict
        // means another connection is creating (or created) the tables.
        let inserted = sqlx::query(
            r#"
            INSERT INTO result_partitions ("partition") VALUES ($1)
            ON CONFLICT ("partition") DO NOTHING
            "#,
        )
        .bind(partition)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(RESULTS_DDL).execute(&mut *tx).await?;
        sqlx::query(&format!(
            "ALTER TABLE results RENAME TO {}",
            result_table_name(partition)
        ))
        .execute(&mut *tx)
        .await?;

        sqlx::query(LOGS_DDL).execute(&mut *tx).await?;
        sqlx::query(&format!(
            "ALTER TABLE logs RENAME TO {}",
            log_table_name(partition)
        ))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn create_result(&self, new: &NewResult) -> StoreResult<()> {
        self.ensure_partition(&new.partition).await?;

        let query = format!(
            r#"
            INSERT INTO {} (id, "partition", task_codename, caller, arguments, timeout_seconds, status, start_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            result_table_name(&new.partition)
        );
        sqlx::query(&query)
            .bind(new.id)
            .bind(&new.partition)
            .bind(&new.task_codename)
            .bind(&new.caller)
            .bind(&new.arguments)
            .bind(new.timeout_seconds)
            .bind(TaskStatus::Initialization.as_str())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
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

        // Terminal states are absorbing: the update only matches live rows.
        let query = format!(
            r#"
            UPDATE {}
            SET status = $1, end_at = COALESCE($2, end_at)
            WHERE id = $3 AND status IN ('initialization', 'pending', 'running')
            "#,
            result_table_name(partition)
        );
        let affected = sqlx::query(&query)
            .bind(status.as_str())
            .bind(end_at)
            .bind(result_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    async fn update_result_worker(
        &self,
        partition: &str,
        result_id: Uuid,
        worker: &str,
    ) -> StoreResult<()> {
        validate_partition_label(partition)?;

        let query = format!(
            "UPDATE {} SET worker = $1 WHERE id = $2",
            result_table_name(partition)
        );
        sqlx::query(&query)
            .bind(worker)
            .bind(result_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_log(
        &self,
        partition: &str,
        result_id: Uuid,
        content: &str,
    ) -> StoreResult<()> {
        validate_partition_label(partition)?;

        let query = format!(
            "INSERT INTO {} (result_id, content) VALUES ($1, $2)",
            log_table_name(partition)
        );
        sqlx::query(&query)
            .bind(result_id)
            .bind(content)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_result(
        &self,
        partition: &str,
        result_id: Uuid,
    ) -> StoreResult<Option<ResultRow>> {
        validate_partition_label(partition)?;

        let query = format!(
            r#"
            SELECT id, "partition", task_codename, caller, arguments, timeout_seconds,
                   worker, status, start_at, end_at
            FROM {}
            WHERE id = $1
            "#,
            result_table_name(partition)
        );
        let row = sqlx::query_as::<_, ResultRow>(&query)
            .bind(result_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_logs(&self, partition: &str, result_id: Uuid) -> StoreResult<Vec<LogRow>> {
        validate_partition_label(partition)?;

        let query = format!(
            "SELECT id, result_id, content, created_at FROM {} WHERE result_id = $1 ORDER BY id",
            log_table_name(partition)
        );
        let logs = sqlx::query_as::<_, LogRow>(&query)
            .bind(result_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(logs)
    }

    async fn find_partition_of(&self, result_id: Uuid) -> StoreResult<Option<String>> {
        for partition in self.list_partitions().await? {
            let query = format!(
                "SELECT 1 AS one FROM {} WHERE id = $1",
                result_table_name(&partition.partition)
            );
            let hit = sqlx::query(&query)
                .bind(result_id)
                .fetch_optional(&self.pool)
                .await?;
            if hit.is_some() {
                return Ok(Some(partition.partition));
            }
        }
        Ok(None)
    }
}
