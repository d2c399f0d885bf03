//! PostgreSQL storage backend.
//!
//! Two tables: `batchqueue_batches` and `batchqueue_jobs` (FK with cascade
//! delete). JSONB columns hold `payload`, `result`, `error`, `context`,
//! and `options`. Counter recomputes and the terminal compare-and-set are
//! single statements; multi-row writes share one transaction.

use super::{BatchFilters, BatchStorage, BatchUpdate};
use crate::errors::{JobExecutionError, StorageError, StorageResult};
use crate::models::{
    BatchDefinition, BatchJobDefinition, BatchOptions, BatchStatus, BatchType, JobPayload,
    JobStatus, JsonMap,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batchqueue_batches (
    id UUID PRIMARY KEY,
    batch_type TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    total_jobs INTEGER NOT NULL DEFAULT 0,
    completed_jobs INTEGER NOT NULL DEFAULT 0,
    failed_jobs INTEGER NOT NULL DEFAULT 0,
    context JSONB NOT NULL DEFAULT '{}'::jsonb,
    options JSONB NOT NULL DEFAULT '{}'::jsonb,
    queue_name TEXT,
    queue_config TEXT,
    created TIMESTAMP NOT NULL DEFAULT NOW(),
    modified TIMESTAMP NOT NULL DEFAULT NOW(),
    completed_at TIMESTAMP
);

CREATE TABLE IF NOT EXISTS batchqueue_jobs (
    id UUID PRIMARY KEY,
    batch_id UUID NOT NULL REFERENCES batchqueue_batches(id) ON DELETE CASCADE,
    queue_job_id TEXT,
    "position" INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    payload JSONB NOT NULL,
    result JSONB,
    error JSONB,
    completed_at TIMESTAMP,
    UNIQUE (batch_id, "position")
);

CREATE INDEX IF NOT EXISTS idx_batchqueue_batches_status
    ON batchqueue_batches (status);
CREATE INDEX IF NOT EXISTS idx_batchqueue_jobs_batch_position
    ON batchqueue_jobs (batch_id, "position");
CREATE UNIQUE INDEX IF NOT EXISTS idx_batchqueue_jobs_batch_queue_id
    ON batchqueue_jobs (batch_id, queue_job_id) WHERE queue_job_id IS NOT NULL;
"#;

#[derive(Debug, FromRow)]
struct BatchRow {
    id: Uuid,
    batch_type: String,
    status: String,
    total_jobs: i32,
    completed_jobs: i32,
    failed_jobs: i32,
    context: Value,
    options: Value,
    queue_name: Option<String>,
    queue_config: Option<String>,
    created: NaiveDateTime,
    modified: NaiveDateTime,
    completed_at: Option<NaiveDateTime>,
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    batch_id: Uuid,
    queue_job_id: Option<String>,
    position: i32,
    status: String,
    payload: Value,
    result: Option<Value>,
    error: Option<Value>,
    completed_at: Option<NaiveDateTime>,
}

impl BatchRow {
    fn into_definition(self, jobs: Vec<BatchJobDefinition>) -> StorageResult<BatchDefinition> {
        let batch_type: BatchType = self.batch_type.parse().map_err(StorageError::Decode)?;
        let status: BatchStatus = self.status.parse().map_err(StorageError::Decode)?;
        let context = self
            .context
            .as_object()
            .cloned()
            .unwrap_or_else(JsonMap::new);
        let options: BatchOptions = serde_json::from_value(self.options)?;

        Ok(BatchDefinition {
            id: self.id,
            batch_type,
            status,
            total_jobs: self.total_jobs.max(0) as u32,
            completed_jobs: self.completed_jobs.max(0) as u32,
            failed_jobs: self.failed_jobs.max(0) as u32,
            context,
            options,
            queue_name: self.queue_name,
            queue_config: self.queue_config,
            created: self.created,
            modified: self.modified,
            completed_at: self.completed_at,
            jobs,
        })
    }
}

impl JobRow {
    fn into_definition(self) -> StorageResult<BatchJobDefinition> {
        let status: JobStatus = self.status.parse().map_err(StorageError::Decode)?;
        let payload: JobPayload = serde_json::from_value(self.payload)?;
        let error: Option<JobExecutionError> =
            self.error.map(serde_json::from_value).transpose()?;

        Ok(BatchJobDefinition {
            id: self.id,
            batch_id: self.batch_id,
            queue_job_id: self.queue_job_id,
            position: self.position.max(0) as u32,
            status,
            payload,
            result: self.result,
            error,
            completed_at: self.completed_at,
        })
    }
}

const JOB_COLUMNS: &str =
    r#"id, batch_id, queue_job_id, "position", status, payload, result, error, completed_at"#;
const BATCH_COLUMNS: &str = "id, batch_type, status, total_jobs, completed_jobs, failed_jobs, \
     context, options, queue_name, queue_config, created, modified, completed_at";

/// PostgreSQL-backed [`BatchStorage`].
#[derive(Debug, Clone)]
pub struct SqlBatchStorage {
    pool: PgPool,
}

impl SqlBatchStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a pool to `connection` and verify it with a ping.
    pub async fn connect(connection: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(connection)
            .await?;
        Ok(Self { pool })
    }

    /// Create the tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_job_tx(
        tx: &mut Transaction<'_, Postgres>,
        job: &BatchJobDefinition,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO batchqueue_jobs (id, batch_id, queue_job_id, "position", status, payload, result, error, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id)
        .bind(job.batch_id)
        .bind(&job.queue_job_id)
        .bind(job.position as i32)
        .bind(job.status.to_string())
        .bind(serde_json::to_value(&job.payload)?)
        .bind(&job.result)
        .bind(job.error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(job.completed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn load_jobs(&self, id: Uuid) -> StorageResult<Vec<BatchJobDefinition>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"SELECT {JOB_COLUMNS} FROM batchqueue_jobs WHERE batch_id = $1 ORDER BY "position" ASC"#
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_definition).collect()
    }
}

/// Append `filters` as numbered WHERE clauses; returns the clause string
/// and the bind values in order.
fn filter_clauses(filters: &BatchFilters) -> (String, Vec<String>) {
    let mut clauses = Vec::new();
    let mut binds = Vec::new();

    if let Some(status) = filters.status {
        binds.push(status.to_string());
        clauses.push(format!("status = ${}", binds.len()));
    }
    if let Some(batch_type) = filters.batch_type {
        binds.push(batch_type.to_string());
        clauses.push(format!("batch_type = ${}", binds.len()));
    }
    if let Some(name) = &filters.name {
        binds.push(name.clone());
        clauses.push(format!("options->>'name' = ${}", binds.len()));
    }
    if let Some(has_compensation) = filters.has_compensation {
        let exists = "EXISTS (SELECT 1 FROM batchqueue_jobs j \
             WHERE j.batch_id = batchqueue_batches.id \
             AND j.payload->>'compensation' IS NOT NULL)";
        if has_compensation {
            clauses.push(exists.to_string());
        } else {
            clauses.push(format!("NOT {exists}"));
        }
    }

    let clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    (clause, binds)
}

#[async_trait]
impl BatchStorage for SqlBatchStorage {
    async fn create_batch(&self, batch: &BatchDefinition) -> StorageResult<Uuid> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO batchqueue_batches
                (id, batch_type, status, total_jobs, completed_jobs, failed_jobs,
                 context, options, queue_name, queue_config, created, modified, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(batch.id)
        .bind(batch.batch_type.to_string())
        .bind(batch.status.to_string())
        .bind(batch.total_jobs as i32)
        .bind(batch.completed_jobs as i32)
        .bind(batch.failed_jobs as i32)
        .bind(Value::Object(batch.context.clone()))
        .bind(serde_json::to_value(&batch.options)?)
        .bind(&batch.queue_name)
        .bind(&batch.queue_config)
        .bind(batch.created)
        .bind(batch.modified)
        .bind(batch.completed_at)
        .execute(&mut *tx)
        .await?;

        for job in &batch.jobs {
            Self::insert_job_tx(&mut tx, job).await?;
        }

        tx.commit().await?;
        Ok(batch.id)
    }

    async fn update_batch(&self, id: Uuid, update: BatchUpdate) -> StorageResult<()> {
        let mut sets = vec!["modified = NOW()".to_string()];
        let mut bind_index = 1;

        if update.status.is_some() {
            bind_index += 1;
            sets.push(format!("status = ${bind_index}"));
        }
        if update.context.is_some() {
            bind_index += 1;
            sets.push(format!("context = ${bind_index}"));
        }
        if update.queue_config.is_some() {
            bind_index += 1;
            sets.push(format!("queue_config = ${bind_index}"));
        }
        if update.completed_at.is_some() {
            bind_index += 1;
            sets.push(format!("completed_at = ${bind_index}"));
        }

        let sql = format!(
            "UPDATE batchqueue_batches SET {} WHERE id = $1",
            sets.join(", ")
        );
        let mut query = sqlx::query(&sql).bind(id);
        if let Some(status) = update.status {
            query = query.bind(status.to_string());
        }
        if let Some(context) = update.context {
            query = query.bind(Value::Object(context));
        }
        if let Some(queue_config) = update.queue_config {
            query = query.bind(queue_config);
        }
        if let Some(completed_at) = update.completed_at {
            query = query.bind(completed_at);
        }
        query.execute(&self.pool).await?;
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> StorageResult<Option<BatchDefinition>> {
        let row = sqlx::query_as::<_, BatchRow>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batchqueue_batches WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let jobs = self.load_jobs(id).await?;
                Ok(Some(row.into_definition(jobs)?))
            }
            None => Ok(None),
        }
    }

    async fn add_jobs_to_batch(
        &self,
        id: Uuid,
        jobs: &[BatchJobDefinition],
    ) -> StorageResult<usize> {
        let mut tx = self.pool.begin().await?;

        for job in jobs {
            Self::insert_job_tx(&mut tx, job).await?;
        }
        sqlx::query(
            "UPDATE batchqueue_batches b
             SET total_jobs = (SELECT COUNT(*) FROM batchqueue_jobs j WHERE j.batch_id = b.id),
                 modified = NOW()
             WHERE b.id = $1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(jobs.len())
    }

    async fn get_job_by_position(
        &self,
        id: Uuid,
        position: u32,
    ) -> StorageResult<Option<BatchJobDefinition>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"SELECT {JOB_COLUMNS} FROM batchqueue_jobs WHERE batch_id = $1 AND "position" = $2"#
        ))
        .bind(id)
        .bind(position as i32)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::into_definition).transpose()
    }

    async fn get_job_by_id(
        &self,
        id: Uuid,
        job_id: Uuid,
    ) -> StorageResult<Option<BatchJobDefinition>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM batchqueue_jobs WHERE batch_id = $1 AND id = $2"
        ))
        .bind(id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::into_definition).transpose()
    }

    async fn update_job_queue_id(
        &self,
        id: Uuid,
        position: u32,
        queue_job_id: &str,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"UPDATE batchqueue_jobs SET queue_job_id = $3 WHERE batch_id = $1 AND "position" = $2"#,
        )
        .bind(id)
        .bind(position as i32)
        .bind(queue_job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        job_id: Uuid,
        status: JobStatus,
        result: Option<Value>,
        error: Option<JobExecutionError>,
    ) -> StorageResult<()> {
        sqlx::query(
            "UPDATE batchqueue_jobs
             SET status = $3,
                 result = COALESCE($4, result),
                 error = COALESCE($5, error),
                 completed_at = CASE
                     WHEN $6 AND completed_at IS NULL THEN NOW()
                     WHEN $6 THEN completed_at
                     ELSE NULL
                 END
             WHERE batch_id = $1 AND id = $2",
        )
        .bind(id)
        .bind(job_id)
        .bind(status.to_string())
        .bind(result)
        .bind(error.as_ref().map(serde_json::to_value).transpose()?)
        .bind(status.is_terminal())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_completed_jobs(&self, id: Uuid) -> StorageResult<u32> {
        let count = sqlx::query_scalar::<_, i32>(
            "UPDATE batchqueue_batches b
             SET completed_jobs = (SELECT COUNT(*) FROM batchqueue_jobs j
                                   WHERE j.batch_id = b.id AND j.status = 'completed'),
                 modified = NOW()
             WHERE b.id = $1
             RETURNING b.completed_jobs",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);
        Ok(count.max(0) as u32)
    }

    async fn increment_failed_jobs(&self, id: Uuid) -> StorageResult<u32> {
        let count = sqlx::query_scalar::<_, i32>(
            "UPDATE batchqueue_batches b
             SET failed_jobs = (SELECT COUNT(*) FROM batchqueue_jobs j
                                WHERE j.batch_id = b.id AND j.status = 'failed'),
                 modified = NOW()
             WHERE b.id = $1
             RETURNING b.failed_jobs",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .unwrap_or(0);
        Ok(count.max(0) as u32)
    }

    async fn mark_batch_terminal(
        &self,
        id: Uuid,
        status: BatchStatus,
        sticky: bool,
    ) -> StorageResult<bool> {
        let sql = if sticky {
            "UPDATE batchqueue_batches
             SET status = $2, completed_at = NOW(), modified = NOW()
             WHERE id = $1 AND status NOT IN ('completed', 'failed')"
        } else {
            "UPDATE batchqueue_batches
             SET status = $2, completed_at = NOW(), modified = NOW()
             WHERE id = $1"
        };
        let result = sqlx::query(sql)
            .bind(id)
            .bind(status.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_batch_results(&self, id: Uuid) -> StorageResult<HashMap<Uuid, Value>> {
        let rows = sqlx::query_as::<_, (Uuid, Value)>(
            "SELECT id, result FROM batchqueue_jobs
             WHERE batch_id = $1 AND result IS NOT NULL",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn get_all_jobs(
        &self,
        id: Uuid,
        status: Option<JobStatus>,
    ) -> StorageResult<Vec<BatchJobDefinition>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, JobRow>(&format!(
                    r#"SELECT {JOB_COLUMNS} FROM batchqueue_jobs
                       WHERE batch_id = $1 AND status = $2 ORDER BY "position" ASC"#
                ))
                .bind(id)
                .bind(status.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(&format!(
                    r#"SELECT {JOB_COLUMNS} FROM batchqueue_jobs
                       WHERE batch_id = $1 ORDER BY "position" ASC"#
                ))
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(JobRow::into_definition).collect()
    }

    async fn get_batches(
        &self,
        filters: &BatchFilters,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<BatchDefinition>> {
        let (clause, binds) = filter_clauses(filters);
        let sql = format!(
            "SELECT {BATCH_COLUMNS} FROM batchqueue_batches{clause} \
             ORDER BY created DESC LIMIT ${} OFFSET ${}",
            binds.len() + 1,
            binds.len() + 2
        );

        let mut query = sqlx::query_as::<_, BatchRow>(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let rows = query
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut batches = Vec::with_capacity(rows.len());
        for row in rows {
            let jobs = self.load_jobs(row.id).await?;
            batches.push(row.into_definition(jobs)?);
        }
        Ok(batches)
    }

    async fn count_batches(&self, filters: &BatchFilters) -> StorageResult<u64> {
        let (clause, binds) = filter_clauses(filters);
        let sql = format!("SELECT COUNT(*) FROM batchqueue_batches{clause}");

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let count = query.fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn delete_batch(&self, id: Uuid) -> StorageResult<bool> {
        let result = sqlx::query("DELETE FROM batchqueue_batches WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_old_batches(&self, older_than_days: u32) -> StorageResult<u64> {
        let result = sqlx::query(
            "DELETE FROM batchqueue_batches
             WHERE status IN ('completed', 'failed')
               AND completed_at < NOW() - make_interval(days => $1)",
        )
        .bind(older_than_days as i32)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StorageResult<bool> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_clauses_number_binds_in_order() {
        let filters = BatchFilters {
            status: Some(BatchStatus::Completed),
            batch_type: Some(BatchType::Sequential),
            name: Some("imports".into()),
            has_compensation: Some(true),
        };
        let (clause, binds) = filter_clauses(&filters);
        assert!(clause.starts_with(" WHERE "));
        assert!(clause.contains("status = $1"));
        assert!(clause.contains("batch_type = $2"));
        assert!(clause.contains("options->>'name' = $3"));
        assert!(clause.contains("payload->>'compensation'"));
        assert_eq!(binds, vec!["completed", "sequential", "imports"]);
    }

    #[test]
    fn empty_filters_add_no_clause() {
        let (clause, binds) = filter_clauses(&BatchFilters::default());
        assert!(clause.is_empty());
        assert!(binds.is_empty());
    }
}
