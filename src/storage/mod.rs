//! Durable batch state.
//!
//! Three implementations of one behavioral contract: PostgreSQL
//! ([`SqlBatchStorage`]), Redis ([`RedisBatchStorage`]), and an in-memory
//! backend for tests. Counter updates recompute from authoritative row
//! state instead of blind increments, so redeliveries from the queue
//! transport cannot double-count.

mod memory;
mod redis;
mod sql;

pub use memory::InMemoryBatchStorage;
pub use redis::RedisBatchStorage;
pub use sql::SqlBatchStorage;

use crate::config::{BatchQueueConfig, StorageBackendKind};
use crate::errors::{JobExecutionError, StorageResult};
use crate::models::{
    BatchDefinition, BatchJobDefinition, BatchStatus, BatchType, JobStatus, JsonMap,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Connect the storage backend the configuration selects.
///
/// The SQL backend also runs its idempotent schema bootstrap so a fresh
/// database works without migration tooling.
pub async fn connect_from_config(
    config: &BatchQueueConfig,
) -> StorageResult<std::sync::Arc<dyn BatchStorage>> {
    match config.storage {
        StorageBackendKind::Sql => {
            let storage = SqlBatchStorage::connect(&config.sql.connection).await?;
            storage.ensure_schema().await?;
            Ok(std::sync::Arc::new(storage))
        }
        StorageBackendKind::Redis => Ok(std::sync::Arc::new(
            RedisBatchStorage::from_config(&config.redis).await?,
        )),
    }
}

/// Partial update applied to a batch row. Unset fields are left untouched;
/// `modified` is always refreshed.
#[derive(Debug, Clone, Default)]
pub struct BatchUpdate {
    pub status: Option<BatchStatus>,
    pub context: Option<JsonMap>,
    pub queue_config: Option<String>,
    pub completed_at: Option<chrono::NaiveDateTime>,
}

impl BatchUpdate {
    pub fn status(status: BatchStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn context(context: JsonMap) -> Self {
        Self {
            context: Some(context),
            ..Default::default()
        }
    }
}

/// Filters for batch listing and counting.
#[derive(Debug, Clone, Default)]
pub struct BatchFilters {
    pub status: Option<BatchStatus>,
    pub batch_type: Option<BatchType>,
    pub name: Option<String>,
    pub has_compensation: Option<bool>,
}

impl BatchFilters {
    pub(crate) fn matches(&self, batch: &BatchDefinition) -> bool {
        if let Some(status) = self.status {
            if batch.status != status {
                return false;
            }
        }
        if let Some(batch_type) = self.batch_type {
            if batch.batch_type != batch_type {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if batch.options.name.as_deref() != Some(name.as_str()) {
                return false;
            }
        }
        if let Some(has_compensation) = self.has_compensation {
            if batch.has_compensation() != has_compensation {
                return false;
            }
        }
        true
    }
}

/// The storage contract shared by every backend.
///
/// Every mutating call commits atomically from the caller's perspective;
/// `increment_*` recompute their counter from child-row state and return
/// the new value; `mark_batch_terminal` owns the terminal read-check-write.
#[async_trait]
pub trait BatchStorage: Send + Sync {
    /// Persist a batch and its full initial job set atomically.
    async fn create_batch(&self, batch: &BatchDefinition) -> StorageResult<Uuid>;

    async fn update_batch(&self, id: Uuid, update: BatchUpdate) -> StorageResult<()>;

    /// Load a batch with its jobs ordered by position. `None` if unknown.
    async fn get_batch(&self, id: Uuid) -> StorageResult<Option<BatchDefinition>>;

    /// Append job rows and grow `total_jobs` accordingly; returns the
    /// number of rows added.
    async fn add_jobs_to_batch(
        &self,
        id: Uuid,
        jobs: &[BatchJobDefinition],
    ) -> StorageResult<usize>;

    async fn get_job_by_position(
        &self,
        id: Uuid,
        position: u32,
    ) -> StorageResult<Option<BatchJobDefinition>>;

    async fn get_job_by_id(
        &self,
        id: Uuid,
        job_id: Uuid,
    ) -> StorageResult<Option<BatchJobDefinition>>;

    /// Record the queue-provided message id on the row at `position`.
    async fn update_job_queue_id(
        &self,
        id: Uuid,
        position: u32,
        queue_job_id: &str,
    ) -> StorageResult<()>;

    /// Write a job's status, result, and error. Terminal statuses stamp
    /// `completed_at`. Idempotent: replaying an identical write leaves the
    /// row value-equal.
    async fn update_job_status(
        &self,
        id: Uuid,
        job_id: Uuid,
        status: JobStatus,
        result: Option<Value>,
        error: Option<JobExecutionError>,
    ) -> StorageResult<()>;

    /// Recompute `completed_jobs` from child rows; returns the new count.
    async fn increment_completed_jobs(&self, id: Uuid) -> StorageResult<u32>;

    /// Recompute `failed_jobs` from child rows; returns the new count.
    async fn increment_failed_jobs(&self, id: Uuid) -> StorageResult<u32>;

    /// Atomically transition the batch to a terminal status, stamping
    /// `completed_at`. With `sticky`, an already-terminal batch is left
    /// untouched. Returns whether the transition was applied.
    async fn mark_batch_terminal(
        &self,
        id: Uuid,
        status: BatchStatus,
        sticky: bool,
    ) -> StorageResult<bool>;

    /// Results of result-reporting jobs, keyed by job row id.
    async fn get_batch_results(&self, id: Uuid) -> StorageResult<HashMap<Uuid, Value>>;

    /// Jobs of a batch ordered by position, optionally filtered by status.
    async fn get_all_jobs(
        &self,
        id: Uuid,
        status: Option<JobStatus>,
    ) -> StorageResult<Vec<BatchJobDefinition>>;

    /// Batches matching `filters`, newest first.
    async fn get_batches(
        &self,
        filters: &BatchFilters,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<BatchDefinition>>;

    async fn count_batches(&self, filters: &BatchFilters) -> StorageResult<u64>;

    /// Delete a batch and all of its jobs. Returns whether it existed.
    async fn delete_batch(&self, id: Uuid) -> StorageResult<bool>;

    /// Remove terminal batches whose completion is older than the cut-off.
    /// Returns the number removed.
    async fn cleanup_old_batches(&self, older_than_days: u32) -> StorageResult<u64>;

    async fn health_check(&self) -> StorageResult<bool>;
}
