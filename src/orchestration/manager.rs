//! The public entry point for constructing, dispatching, and introspecting
//! batches.

use super::builder::BatchBuilder;
use super::compensation;
use super::dispatcher::Dispatcher;
use super::queue_resolver::QueueResolver;
use crate::config::BatchQueueConfig;
use crate::constants::{
    CTX_COMPENSATION_BATCH_ID, CTX_COMPENSATION_STARTED_AT, CTX_COMPENSATION_STATUS,
};
use crate::errors::{BatchQueueError, Result};
use crate::messaging::{JobEnvelope, QueueClient};
use crate::models::{
    format_timestamp, normalize_job_specs, BatchDefinition, BatchProgress, BatchStatus, BatchType,
    CallbackSpec, JobSpec, JobStatus,
};
use crate::registry::HandlerRegistry;
use crate::storage::{BatchFilters, BatchStorage, BatchUpdate};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Orchestrator facade bound to a storage backend, a queue transport, and
/// the handler registry. Cheap to clone; all components are shared.
#[derive(Clone)]
pub struct BatchManager {
    storage: Arc<dyn BatchStorage>,
    queue: Arc<dyn QueueClient>,
    registry: Arc<HandlerRegistry>,
    config: Arc<BatchQueueConfig>,
    resolver: QueueResolver,
    dispatcher: Dispatcher,
}

impl BatchManager {
    /// Build a manager. The built-in compensation callbacks are registered
    /// onto `registry` before it is frozen.
    pub fn new(
        storage: Arc<dyn BatchStorage>,
        queue: Arc<dyn QueueClient>,
        mut registry: HandlerRegistry,
        config: BatchQueueConfig,
    ) -> Self {
        compensation::register_builtin_handlers(&mut registry, storage.clone());
        let config = Arc::new(config);
        Self {
            storage,
            queue: queue.clone(),
            registry: Arc::new(registry),
            resolver: QueueResolver::new(config.clone()),
            dispatcher: Dispatcher::new(queue),
            config,
        }
    }

    /// Start a parallel batch of independent jobs.
    pub fn batch(&self, jobs: Vec<JobSpec>) -> BatchBuilder {
        BatchBuilder::new(self.clone(), BatchType::Parallel, jobs)
    }

    /// Start a sequential chain; each job sees the context accumulated by
    /// its predecessors.
    pub fn chain(&self, jobs: Vec<JobSpec>) -> BatchBuilder {
        BatchBuilder::new(self.clone(), BatchType::Sequential, jobs)
    }

    pub async fn get_batch(&self, id: Uuid) -> Result<BatchDefinition> {
        self.storage
            .get_batch(id)
            .await?
            .ok_or(BatchQueueError::BatchNotFound(id))
    }

    pub async fn get_progress(&self, id: Uuid) -> Result<BatchProgress> {
        Ok(BatchProgress::from(&self.get_batch(id).await?))
    }

    pub async fn get_batches(
        &self,
        filters: &BatchFilters,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<BatchDefinition>> {
        Ok(self.storage.get_batches(filters, limit, offset).await?)
    }

    pub async fn count_batches(&self, filters: &BatchFilters) -> Result<u64> {
        Ok(self.storage.count_batches(filters).await?)
    }

    /// Results reported by the batch's jobs, keyed by job row id.
    pub async fn get_batch_results(
        &self,
        id: Uuid,
    ) -> Result<std::collections::HashMap<Uuid, Value>> {
        Ok(self.storage.get_batch_results(id).await?)
    }

    /// Append jobs to a non-terminal batch.
    ///
    /// For parallel batches the appended jobs are enqueued immediately so
    /// the new work starts promptly. For chains nothing is enqueued here:
    /// the running chain reaches the new positions through its normal
    /// step-advance protocol.
    #[instrument(skip(self, jobs), fields(batch_id = %id))]
    pub async fn add_jobs(&self, id: Uuid, jobs: Vec<JobSpec>) -> Result<BatchDefinition> {
        let batch = self.get_batch(id).await?;
        if batch.status.is_terminal() {
            return Err(BatchQueueError::BatchClosed(id));
        }
        if jobs.is_empty() {
            return Ok(batch);
        }

        let normalized = normalize_job_specs(
            jobs,
            batch.batch_type,
            &self.registry,
            id,
            batch.total_jobs,
        )?;
        self.storage.add_jobs_to_batch(id, &normalized).await?;

        let updated = self.get_batch(id).await?;
        if updated.batch_type == BatchType::Parallel {
            self.dispatcher
                .dispatch_appended(&updated, &normalized)
                .await?;
        }
        debug!(added = normalized.len(), total = updated.total_jobs, "appended jobs");
        Ok(updated)
    }

    /// Cancel a batch: close it, roll back completed side effects, and
    /// remove its state.
    ///
    /// The batch is first marked failed so appends and chain advancement
    /// stop. When a compensation chain is launched, the row is kept as a
    /// tombstone for the compensation callbacks to report into and is
    /// reaped by [`cleanup`](Self::cleanup); otherwise it is deleted
    /// immediately. In-flight messages for the batch are tolerated by the
    /// processors, which reject on the missing row.
    #[instrument(skip(self), fields(batch_id = %id))]
    pub async fn cancel_batch(&self, id: Uuid) -> Result<()> {
        let batch = self.get_batch(id).await?;

        if !batch.status.is_terminal() {
            self.storage
                .mark_batch_terminal(id, BatchStatus::Failed, false)
                .await?;
        }

        let compensation_id = self.launch_compensation(&batch).await?;
        if compensation_id.is_none() {
            self.storage.delete_batch(id).await?;
        }
        info!(compensating = compensation_id.is_some(), "batch cancelled");
        Ok(())
    }

    /// Manually trigger compensation for a batch with compensation-bearing
    /// completed jobs. Returns the compensation batch id, or `None` when
    /// there is nothing to roll back.
    pub async fn compensate(&self, id: Uuid) -> Result<Option<Uuid>> {
        let batch = self.get_batch(id).await?;
        self.launch_compensation(&batch).await
    }

    /// Remove completed and failed batches older than the cut-off.
    pub async fn cleanup(&self, older_than_days: u32) -> Result<u64> {
        let removed = self.storage.cleanup_old_batches(older_than_days).await?;
        if removed > 0 {
            info!(removed, older_than_days, "cleaned up old batches");
        }
        Ok(removed)
    }

    /// Build and dispatch the compensation chain for `original`, and mark
    /// the original's context with the rollback bookkeeping.
    pub(crate) async fn launch_compensation(
        &self,
        original: &BatchDefinition,
    ) -> Result<Option<Uuid>> {
        // At most one compensation chain per batch: a cancel after a
        // failure-triggered rollback reuses the chain already in flight.
        if let Some(existing) = original
            .context
            .get(CTX_COMPENSATION_BATCH_ID)
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
        {
            return Ok(Some(existing));
        }

        let completed = self
            .storage
            .get_all_jobs(original.id, Some(JobStatus::Completed))
            .await?;
        let specs = compensation::compensation_specs(original.id, &completed);
        if specs.is_empty() {
            return Ok(None);
        }

        let callback_args = compensation::compensation_callback_args(original.id);
        let mut builder = self
            .chain(specs)
            .set_context(original.context.clone())
            .on_complete(CallbackSpec::with_args(
                crate::constants::COMPENSATION_COMPLETE_CALLBACK,
                callback_args.clone(),
            ))
            .on_failure(CallbackSpec::with_args(
                crate::constants::COMPENSATION_FAILED_CALLBACK,
                callback_args,
            ));
        if let Some(queue_name) = &original.queue_name {
            builder = builder.queue(queue_name.as_str());
        }
        if let Some(queue_config) = &original.queue_config {
            builder = builder.queue_config(queue_config.as_str());
        }
        let compensation_id = builder.dispatch().await?;

        // Correlate the two batches on the original's context. A fresh read
        // picks up context writes that landed while the chain was failing.
        let mut context = match self.storage.get_batch(original.id).await? {
            Some(batch) => batch.context,
            None => original.context.clone(),
        };
        context.insert(
            CTX_COMPENSATION_BATCH_ID.into(),
            Value::String(compensation_id.to_string()),
        );
        context.insert(
            CTX_COMPENSATION_STATUS.into(),
            Value::String("running".into()),
        );
        context.insert(
            CTX_COMPENSATION_STARTED_AT.into(),
            Value::String(format_timestamp(chrono::Utc::now().naive_utc())),
        );
        self.storage
            .update_batch(original.id, BatchUpdate::context(context))
            .await?;

        info!(batch_id = %original.id, compensation_batch_id = %compensation_id, "launched compensation chain");
        Ok(Some(compensation_id))
    }

    /// Enqueue an `on_complete` / `on_failure` callback onto the batch's
    /// queue. Callback delivery is best-effort; a push failure is logged.
    pub(crate) async fn enqueue_callback(
        &self,
        batch: &BatchDefinition,
        spec: &CallbackSpec,
        status: BatchStatus,
        error: Option<&str>,
    ) {
        let envelope = JobEnvelope::for_callback(spec, batch.id, status, error);
        let queue = batch.queue_config.clone().unwrap_or_else(|| {
            self.resolver
                .resolve(batch.batch_type, batch.queue_name.as_deref(), None)
        });
        if let Err(push_error) = self.queue.push(&queue, &envelope).await {
            warn!(batch_id = %batch.id, class = %spec.class, %push_error, "failed to enqueue callback");
        }
    }

    pub(crate) fn storage(&self) -> &Arc<dyn BatchStorage> {
        &self.storage
    }

    pub(crate) fn queue(&self) -> &Arc<dyn QueueClient> {
        &self.queue
    }

    /// Shared handle to the queue transport this manager enqueues onto.
    pub fn queue_client(&self) -> Arc<dyn QueueClient> {
        self.queue.clone()
    }

    pub(crate) fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub(crate) fn config(&self) -> &BatchQueueConfig {
        &self.config
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Queue resolver bound to this manager's configuration.
    pub fn resolver(&self) -> &QueueResolver {
        &self.resolver
    }

    pub(crate) fn sticky_terminal_state(&self) -> bool {
        self.config.defaults.sticky_terminal_state
    }

    pub(crate) fn fail_on_first_error(&self, batch: &BatchDefinition) -> bool {
        batch.options.fail_on_first_error || self.config.defaults.fail_on_first_error
    }
}

impl std::fmt::Debug for BatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchManager")
            .field("storage", &"Arc<dyn BatchStorage>")
            .field("registered_classes", &self.registry.len())
            .finish()
    }
}
