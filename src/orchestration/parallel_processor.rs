//! Worker-side handler for parallel batch jobs.

use super::manager::BatchManager;
use super::run_callback;
use crate::errors::JobExecutionError;
use crate::messaging::{Delivery, JobResponse};
use crate::models::{BatchDefinition, BatchJobDefinition, BatchStatus, JobStatus};
use crate::registry::JobOutcome;
use crate::storage::BatchUpdate;
use serde_json::Value;
use tracing::{debug, instrument, warn};

/// Processes one parallel-queue delivery: runs the job, updates the row
/// and the recomputed counters, and detects batch completion.
///
/// Counter updates recompute from row state, so a redelivered message
/// cannot double-count, and the terminal transition is a compare-and-set
/// so the batch commits exactly once.
#[derive(Debug, Clone)]
pub struct ParallelProcessor {
    manager: BatchManager,
}

impl ParallelProcessor {
    pub fn new(manager: BatchManager) -> Self {
        Self { manager }
    }

    #[instrument(skip(self, delivery), fields(message_id = %delivery.message_id, class = %delivery.envelope.class))]
    pub async fn process(&self, delivery: &Delivery) -> JobResponse {
        let envelope = &delivery.envelope;

        if envelope.is_callback() {
            return run_callback(self.manager.registry(), envelope).await;
        }
        let (Some(batch_id), Some(position)) = (envelope.batch_id(), envelope.job_position())
        else {
            // Not batch traffic; acknowledge and move on.
            return JobResponse::Ack;
        };

        let storage = self.manager.storage();
        let batch = match storage.get_batch(batch_id).await {
            Ok(Some(batch)) => batch,
            Ok(None) => {
                debug!(%batch_id, "batch is gone, dropping message");
                return JobResponse::Reject;
            }
            Err(error) => {
                warn!(%batch_id, %error, "failed to load batch");
                return JobResponse::Requeue;
            }
        };
        let Some(job) = batch.get_job_at(position).cloned() else {
            warn!(%batch_id, position, "no job at position");
            return JobResponse::Reject;
        };

        if let Err(error) = storage
            .update_job_queue_id(batch_id, position, &delivery.message_id)
            .await
        {
            warn!(%batch_id, %error, "failed to record queue message id");
            return JobResponse::Requeue;
        }
        if batch.status == BatchStatus::Pending {
            if let Err(error) = storage
                .update_batch(batch_id, BatchUpdate::status(BatchStatus::Running))
                .await
            {
                warn!(%batch_id, %error, "failed to mark batch running");
                return JobResponse::Requeue;
            }
        }
        if let Err(error) = storage
            .update_job_status(batch_id, job.id, JobStatus::Running, None, None)
            .await
        {
            warn!(%batch_id, %error, "failed to mark job running");
            return JobResponse::Requeue;
        }

        let Some(mut handler) = self.manager.registry().instantiate(&envelope.class) else {
            warn!(class = %envelope.class, "job class is not registered");
            return JobResponse::Reject;
        };

        match handler.execute(&envelope.args).await {
            Ok(JobOutcome::Complete) => self.record_success(&batch, &job, handler.result()).await,
            Ok(JobOutcome::Reject) => {
                let error = JobExecutionError::new("job rejected the message");
                self.record_failure(&batch, &job, error, JobResponse::Reject)
                    .await
            }
            Ok(JobOutcome::Requeue) => {
                let error = JobExecutionError::new("job requested redelivery");
                self.record_failure(&batch, &job, error, JobResponse::Requeue)
                    .await
            }
            Err(error) => {
                self.record_failure(&batch, &job, error, JobResponse::Requeue)
                    .await
            }
        }
    }

    async fn record_success(
        &self,
        batch: &BatchDefinition,
        job: &BatchJobDefinition,
        result: Option<Value>,
    ) -> JobResponse {
        let storage = self.manager.storage();
        let sticky = self.manager.sticky_terminal_state();

        if let Err(error) = storage
            .update_job_status(batch.id, job.id, JobStatus::Completed, result, None)
            .await
        {
            warn!(batch_id = %batch.id, %error, "failed to mark job completed");
            return JobResponse::Requeue;
        }
        let completed = match storage.increment_completed_jobs(batch.id).await {
            Ok(count) => count,
            Err(error) => {
                warn!(batch_id = %batch.id, %error, "failed to recompute completed count");
                return JobResponse::Requeue;
            }
        };

        // Fresh read: total_jobs may have grown and siblings may have
        // failed since this delivery started.
        let fresh = match storage.get_batch(batch.id).await {
            Ok(Some(batch)) => batch,
            Ok(None) => return JobResponse::Reject,
            Err(error) => {
                warn!(batch_id = %batch.id, %error, "failed to reload batch");
                return JobResponse::Requeue;
            }
        };
        let failed = if fresh.failed_jobs > 0 {
            // A previously failed row may have been retried into success;
            // recompute so the counters stay consistent with row state.
            match storage.increment_failed_jobs(batch.id).await {
                Ok(count) => count,
                Err(error) => {
                    warn!(batch_id = %batch.id, %error, "failed to recompute failed count");
                    return JobResponse::Requeue;
                }
            }
        } else {
            0
        };

        if completed >= fresh.total_jobs && failed == 0 {
            match storage
                .mark_batch_terminal(batch.id, BatchStatus::Completed, sticky)
                .await
            {
                Ok(true) => {
                    debug!(batch_id = %batch.id, completed, "batch completed");
                    if let Some(callback) = &fresh.options.on_complete {
                        self.manager
                            .enqueue_callback(&fresh, callback, BatchStatus::Completed, None)
                            .await;
                    }
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(batch_id = %batch.id, %error, "failed to complete batch");
                    return JobResponse::Requeue;
                }
            }
        } else if failed > 0 && completed + failed >= fresh.total_jobs {
            // The batch just drained with failures; fire the deferred
            // failure callback unless it already fired on first error.
            if !self.manager.fail_on_first_error(&fresh) {
                if let Some(callback) = &fresh.options.on_failure {
                    self.manager
                        .enqueue_callback(&fresh, callback, BatchStatus::Failed, None)
                        .await;
                }
            }
        }

        JobResponse::Ack
    }

    async fn record_failure(
        &self,
        batch: &BatchDefinition,
        job: &BatchJobDefinition,
        error: JobExecutionError,
        response: JobResponse,
    ) -> JobResponse {
        let storage = self.manager.storage();
        let sticky = self.manager.sticky_terminal_state();

        if let Err(storage_error) = storage
            .update_job_status(
                batch.id,
                job.id,
                JobStatus::Failed,
                None,
                Some(error.clone()),
            )
            .await
        {
            warn!(batch_id = %batch.id, %storage_error, "failed to mark job failed");
            return JobResponse::Requeue;
        }
        let failed = match storage.increment_failed_jobs(batch.id).await {
            Ok(count) => count,
            Err(storage_error) => {
                warn!(batch_id = %batch.id, %storage_error, "failed to recompute failed count");
                return JobResponse::Requeue;
            }
        };

        let fresh = match storage.get_batch(batch.id).await {
            Ok(Some(batch)) => batch,
            Ok(None) => return JobResponse::Reject,
            Err(storage_error) => {
                warn!(batch_id = %batch.id, %storage_error, "failed to reload batch");
                return JobResponse::Requeue;
            }
        };

        // A failed job fails the batch, but siblings keep running; their
        // later successes never downgrade the terminal state while sticky.
        let transitioned = match storage
            .mark_batch_terminal(batch.id, BatchStatus::Failed, sticky)
            .await
        {
            Ok(transitioned) => transitioned,
            Err(storage_error) => {
                warn!(batch_id = %batch.id, %storage_error, "failed to fail batch");
                return JobResponse::Requeue;
            }
        };

        if let Some(callback) = &fresh.options.on_failure {
            let fail_fast = self.manager.fail_on_first_error(&fresh);
            let drained = fresh.completed_jobs + failed >= fresh.total_jobs;
            if (fail_fast && transitioned) || (!fail_fast && drained) {
                self.manager
                    .enqueue_callback(&fresh, callback, BatchStatus::Failed, Some(&error.message))
                    .await;
            }
        }

        debug!(batch_id = %batch.id, position = job.position, error = %error.message, "job failed");
        response
    }
}
