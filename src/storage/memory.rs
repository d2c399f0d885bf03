//! In-memory storage backend.
//!
//! Implements the full [`BatchStorage`] contract over a mutex-guarded map.
//! State is lost on drop; this backend exists for the integration test
//! harness and for demos, not for production use.

use super::{BatchFilters, BatchStorage, BatchUpdate};
use crate::errors::{JobExecutionError, StorageResult};
use crate::models::{BatchDefinition, BatchJobDefinition, BatchStatus, JobStatus};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct InMemoryBatchStorage {
    batches: Mutex<HashMap<Uuid, BatchDefinition>>,
}

impl InMemoryBatchStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchStorage for InMemoryBatchStorage {
    async fn create_batch(&self, batch: &BatchDefinition) -> StorageResult<Uuid> {
        let mut batches = self.batches.lock().await;
        let mut stored = batch.clone();
        stored.jobs.sort_by_key(|job| job.position);
        batches.insert(stored.id, stored);
        Ok(batch.id)
    }

    async fn update_batch(&self, id: Uuid, update: BatchUpdate) -> StorageResult<()> {
        let mut batches = self.batches.lock().await;
        if let Some(batch) = batches.get_mut(&id) {
            if let Some(status) = update.status {
                batch.status = status;
            }
            if let Some(context) = update.context {
                batch.context = context;
            }
            if let Some(queue_config) = update.queue_config {
                batch.queue_config = Some(queue_config);
            }
            if let Some(completed_at) = update.completed_at {
                batch.completed_at = Some(completed_at);
            }
            batch.modified = Utc::now().naive_utc();
        }
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> StorageResult<Option<BatchDefinition>> {
        let batches = self.batches.lock().await;
        Ok(batches.get(&id).cloned())
    }

    async fn add_jobs_to_batch(
        &self,
        id: Uuid,
        jobs: &[BatchJobDefinition],
    ) -> StorageResult<usize> {
        let mut batches = self.batches.lock().await;
        let Some(batch) = batches.get_mut(&id) else {
            return Ok(0);
        };
        batch.jobs.extend_from_slice(jobs);
        batch.jobs.sort_by_key(|job| job.position);
        batch.total_jobs = batch.jobs.len() as u32;
        batch.modified = Utc::now().naive_utc();
        Ok(jobs.len())
    }

    async fn get_job_by_position(
        &self,
        id: Uuid,
        position: u32,
    ) -> StorageResult<Option<BatchJobDefinition>> {
        let batches = self.batches.lock().await;
        Ok(batches
            .get(&id)
            .and_then(|batch| batch.get_job_at(position).cloned()))
    }

    async fn get_job_by_id(
        &self,
        id: Uuid,
        job_id: Uuid,
    ) -> StorageResult<Option<BatchJobDefinition>> {
        let batches = self.batches.lock().await;
        Ok(batches
            .get(&id)
            .and_then(|batch| batch.get_job(job_id).cloned()))
    }

    async fn update_job_queue_id(
        &self,
        id: Uuid,
        position: u32,
        queue_job_id: &str,
    ) -> StorageResult<()> {
        let mut batches = self.batches.lock().await;
        if let Some(batch) = batches.get_mut(&id) {
            if let Some(job) = batch.jobs.iter_mut().find(|job| job.position == position) {
                job.queue_job_id = Some(queue_job_id.to_string());
            }
        }
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
        let mut batches = self.batches.lock().await;
        if let Some(batch) = batches.get_mut(&id) {
            if let Some(job) = batch.jobs.iter_mut().find(|job| job.id == job_id) {
                let was_terminal = job.status.is_terminal();
                job.status = status;
                if result.is_some() {
                    job.result = result;
                }
                if error.is_some() {
                    job.error = error;
                }
                if !status.is_terminal() {
                    job.completed_at = None;
                } else if !was_terminal {
                    job.completed_at = Some(Utc::now().naive_utc());
                }
            }
            batch.modified = Utc::now().naive_utc();
        }
        Ok(())
    }

    async fn increment_completed_jobs(&self, id: Uuid) -> StorageResult<u32> {
        recompute_counter(&self.batches, id, JobStatus::Completed).await
    }

    async fn increment_failed_jobs(&self, id: Uuid) -> StorageResult<u32> {
        recompute_counter(&self.batches, id, JobStatus::Failed).await
    }

    async fn mark_batch_terminal(
        &self,
        id: Uuid,
        status: BatchStatus,
        sticky: bool,
    ) -> StorageResult<bool> {
        let mut batches = self.batches.lock().await;
        let Some(batch) = batches.get_mut(&id) else {
            return Ok(false);
        };
        if sticky && batch.status.is_terminal() {
            return Ok(false);
        }
        batch.status = status;
        let now = Utc::now().naive_utc();
        batch.completed_at = Some(now);
        batch.modified = now;
        Ok(true)
    }

    async fn get_batch_results(&self, id: Uuid) -> StorageResult<HashMap<Uuid, Value>> {
        let batches = self.batches.lock().await;
        Ok(batches
            .get(&id)
            .map(|batch| {
                batch
                    .jobs
                    .iter()
                    .filter_map(|job| job.result.clone().map(|result| (job.id, result)))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_all_jobs(
        &self,
        id: Uuid,
        status: Option<JobStatus>,
    ) -> StorageResult<Vec<BatchJobDefinition>> {
        let batches = self.batches.lock().await;
        Ok(batches
            .get(&id)
            .map(|batch| {
                batch
                    .jobs
                    .iter()
                    .filter(|job| status.map(|s| job.status == s).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_batches(
        &self,
        filters: &BatchFilters,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<BatchDefinition>> {
        let batches = self.batches.lock().await;
        let mut matching: Vec<_> = batches
            .values()
            .filter(|batch| filters.matches(batch))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_batches(&self, filters: &BatchFilters) -> StorageResult<u64> {
        let batches = self.batches.lock().await;
        Ok(batches
            .values()
            .filter(|batch| filters.matches(batch))
            .count() as u64)
    }

    async fn delete_batch(&self, id: Uuid) -> StorageResult<bool> {
        let mut batches = self.batches.lock().await;
        Ok(batches.remove(&id).is_some())
    }

    async fn cleanup_old_batches(&self, older_than_days: u32) -> StorageResult<u64> {
        let cutoff = Utc::now().naive_utc() - chrono::Duration::days(i64::from(older_than_days));
        let mut batches = self.batches.lock().await;
        let before = batches.len();
        batches.retain(|_, batch| {
            !(batch.status.is_terminal()
                && batch.completed_at.map(|at| at < cutoff).unwrap_or(false))
        });
        Ok((before - batches.len()) as u64)
    }

    async fn health_check(&self) -> StorageResult<bool> {
        Ok(true)
    }
}

async fn recompute_counter(
    batches: &Mutex<HashMap<Uuid, BatchDefinition>>,
    id: Uuid,
    status: JobStatus,
) -> StorageResult<u32> {
    let mut batches = batches.lock().await;
    let Some(batch) = batches.get_mut(&id) else {
        return Ok(0);
    };
    let count = batch.jobs.iter().filter(|job| job.status == status).count() as u32;
    match status {
        JobStatus::Completed => batch.completed_jobs = count,
        JobStatus::Failed => batch.failed_jobs = count,
        _ => {}
    }
    batch.modified = Utc::now().naive_utc();
    Ok(count)
}
