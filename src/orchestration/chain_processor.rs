//! Worker-side handler for sequential chain steps.
//!
//! A chain keeps exactly one message in flight: each successful step
//! enqueues only its successor, which serializes execution across the
//! whole worker fleet without locks. Step advancement reloads the batch
//! first, so context written by the finished step and jobs appended while
//! it ran are both visible to the next step.

use super::manager::BatchManager;
use super::run_callback;
use crate::errors::JobExecutionError;
use crate::messaging::{Delivery, JobEnvelope, JobResponse};
use crate::models::{BatchDefinition, BatchJobDefinition, BatchStatus, JobStatus};
use crate::registry::{JobHandler, JobOutcome};
use crate::storage::BatchUpdate;
use tracing::{debug, instrument, warn};

/// Processes one chain-queue delivery: runs the step with the batch's
/// accumulated context, persists context and result, then either releases
/// the next step or finishes the batch. A failing step stops the chain
/// and launches compensation for completed rollback-capable steps.
#[derive(Debug, Clone)]
pub struct ChainProcessor {
    manager: BatchManager,
}

impl ChainProcessor {
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
            return JobResponse::Ack;
        };

        let storage = self.manager.storage();
        // Fresh read: the chain's context is whatever the previous step
        // left behind, not what this message was enqueued with.
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
        if batch.status.is_terminal() {
            // A finished or failed chain never advances again.
            debug!(%batch_id, status = %batch.status, "chain already terminal, dropping message");
            return JobResponse::Reject;
        }
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
            warn!(%batch_id, %error, "failed to mark step running");
            return JobResponse::Requeue;
        }

        let Some(mut handler) = self.manager.registry().instantiate(&envelope.class) else {
            warn!(class = %envelope.class, "job class is not registered");
            return JobResponse::Reject;
        };
        handler.set_context(&batch.context);

        match handler.execute(&envelope.args).await {
            Ok(JobOutcome::Complete) => self.complete_step(&batch, &job, handler.as_ref()).await,
            Ok(JobOutcome::Reject) => {
                let error = JobExecutionError::new("job rejected the message");
                self.fail_step(&batch, &job, error, JobResponse::Reject)
                    .await
            }
            Ok(JobOutcome::Requeue) => {
                let error = JobExecutionError::new("job requested redelivery");
                self.fail_step(&batch, &job, error, JobResponse::Requeue)
                    .await
            }
            Err(error) => self.fail_step(&batch, &job, error, JobResponse::Requeue).await,
        }
    }

    async fn complete_step(
        &self,
        batch: &BatchDefinition,
        job: &BatchJobDefinition,
        handler: &dyn JobHandler,
    ) -> JobResponse {
        let storage = self.manager.storage();
        let sticky = self.manager.sticky_terminal_state();

        // Persist context the step accumulated before anything can read it.
        if let Some(new_context) = handler.context() {
            if new_context != batch.context {
                if let Err(error) = storage
                    .update_batch(batch.id, BatchUpdate::context(new_context))
                    .await
                {
                    warn!(batch_id = %batch.id, %error, "failed to persist step context");
                    return JobResponse::Requeue;
                }
            }
        }
        if let Err(error) = storage
            .update_job_status(batch.id, job.id, JobStatus::Completed, handler.result(), None)
            .await
        {
            warn!(batch_id = %batch.id, %error, "failed to mark step completed");
            return JobResponse::Requeue;
        }
        let completed = match storage.increment_completed_jobs(batch.id).await {
            Ok(count) => count,
            Err(error) => {
                warn!(batch_id = %batch.id, %error, "failed to recompute completed count");
                return JobResponse::Requeue;
            }
        };

        // Reload: picks up the context written above and any growth from
        // jobs appended by the step itself.
        let fresh = match storage.get_batch(batch.id).await {
            Ok(Some(batch)) => batch,
            Ok(None) => return JobResponse::Reject,
            Err(error) => {
                warn!(batch_id = %batch.id, %error, "failed to reload batch");
                return JobResponse::Requeue;
            }
        };

        if completed >= fresh.total_jobs {
            match storage
                .mark_batch_terminal(batch.id, BatchStatus::Completed, sticky)
                .await
            {
                Ok(true) => {
                    debug!(batch_id = %batch.id, steps = completed, "chain completed");
                    if let Some(callback) = &fresh.options.on_complete {
                        self.manager
                            .enqueue_callback(&fresh, callback, BatchStatus::Completed, None)
                            .await;
                    }
                }
                Ok(false) => {}
                Err(error) => {
                    warn!(batch_id = %batch.id, %error, "failed to complete chain");
                    return JobResponse::Requeue;
                }
            }
            return JobResponse::Ack;
        }

        let Some(next) = fresh.next_sequential_job(job.position) else {
            warn!(batch_id = %batch.id, position = job.position, "chain has a position gap, cannot advance");
            return JobResponse::Ack;
        };
        let Some(queue) = fresh.queue_config.clone() else {
            warn!(batch_id = %batch.id, "chain has no resolved queue, cannot advance");
            return JobResponse::Ack;
        };
        let envelope = JobEnvelope::for_batch_job(&fresh, next);
        if let Err(error) = self.manager.queue().push(&queue, &envelope).await {
            warn!(batch_id = %batch.id, %error, "failed to enqueue next step");
            return JobResponse::Requeue;
        }
        debug!(batch_id = %batch.id, next_position = next.position, "chain advanced");
        JobResponse::Ack
    }

    async fn fail_step(
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
            warn!(batch_id = %batch.id, %storage_error, "failed to mark step failed");
            return JobResponse::Requeue;
        }
        if let Err(storage_error) = storage.increment_failed_jobs(batch.id).await {
            warn!(batch_id = %batch.id, %storage_error, "failed to recompute failed count");
            return JobResponse::Requeue;
        }

        // No next step is enqueued: everything past this position stays
        // pending forever.
        let transitioned = match storage
            .mark_batch_terminal(batch.id, BatchStatus::Failed, sticky)
            .await
        {
            Ok(transitioned) => transitioned,
            Err(storage_error) => {
                warn!(batch_id = %batch.id, %storage_error, "failed to fail chain");
                return JobResponse::Requeue;
            }
        };

        if transitioned {
            let fresh = match storage.get_batch(batch.id).await {
                Ok(Some(batch)) => batch,
                Ok(None) => return JobResponse::Reject,
                Err(storage_error) => {
                    warn!(batch_id = %batch.id, %storage_error, "failed to reload batch");
                    return JobResponse::Requeue;
                }
            };

            if let Some(callback) = &fresh.options.on_failure {
                self.manager
                    .enqueue_callback(&fresh, callback, BatchStatus::Failed, Some(&error.message))
                    .await;
            }
            match self.manager.launch_compensation(&fresh).await {
                Ok(Some(compensation_id)) => {
                    debug!(batch_id = %batch.id, %compensation_id, "compensation launched");
                }
                Ok(None) => {}
                Err(compensation_error) => {
                    warn!(batch_id = %batch.id, %compensation_error, "failed to launch compensation");
                }
            }
        }

        debug!(batch_id = %batch.id, position = job.position, error = %error.message, "chain step failed");
        response
    }
}
