//! Initial message fan-out for a persisted batch.

use crate::errors::{MessagingError, MessagingResult};
use crate::messaging::{JobEnvelope, QueueClient};
use crate::models::{BatchDefinition, BatchJobDefinition, BatchType};
use futures::future::join_all;
use std::sync::Arc;
use tracing::debug;

/// Translates a stored batch into its initial queue messages: every job
/// for a parallel batch, only position zero for a chain (later steps are
/// released by the chain processor as their predecessors complete).
#[derive(Clone)]
pub(crate) struct Dispatcher {
    queue: Arc<dyn QueueClient>,
}

impl Dispatcher {
    pub(crate) fn new(queue: Arc<dyn QueueClient>) -> Self {
        Self { queue }
    }

    pub(crate) async fn dispatch(&self, batch: &BatchDefinition) -> MessagingResult<()> {
        let queue_name = resolved_queue(batch)?;

        match batch.batch_type {
            BatchType::Parallel => {
                let pushes = batch.jobs.iter().map(|job| {
                    let envelope = JobEnvelope::for_batch_job(batch, job);
                    let queue = self.queue.clone();
                    let queue_name = queue_name.to_string();
                    async move { queue.push(&queue_name, &envelope).await }
                });
                for push in join_all(pushes).await {
                    push?;
                }
                debug!(batch_id = %batch.id, jobs = batch.jobs.len(), queue = queue_name, "dispatched parallel batch");
            }
            BatchType::Sequential => {
                if let Some(first) = batch.get_job_at(0) {
                    let envelope = JobEnvelope::for_batch_job(batch, first);
                    self.queue.push(queue_name, &envelope).await?;
                    debug!(batch_id = %batch.id, queue = queue_name, "dispatched first chain step");
                }
            }
        }
        Ok(())
    }

    /// Enqueue jobs appended to an already-running parallel batch.
    pub(crate) async fn dispatch_appended(
        &self,
        batch: &BatchDefinition,
        jobs: &[BatchJobDefinition],
    ) -> MessagingResult<()> {
        let queue_name = resolved_queue(batch)?;
        for job in jobs {
            let envelope = JobEnvelope::for_batch_job(batch, job);
            self.queue.push(queue_name, &envelope).await?;
        }
        debug!(batch_id = %batch.id, jobs = jobs.len(), queue = queue_name, "dispatched appended jobs");
        Ok(())
    }
}

fn resolved_queue(batch: &BatchDefinition) -> MessagingResult<&str> {
    batch
        .queue_config
        .as_deref()
        .ok_or_else(|| MessagingError::Queue(format!("batch {} has no resolved queue", batch.id)))
}
