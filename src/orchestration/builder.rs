//! Fluent construction and dispatch of a batch.

use super::manager::BatchManager;
use crate::errors::{BatchQueueError, Result};
use crate::models::{
    normalize_job_specs, BatchDefinition, BatchOptions, BatchStatus, BatchType, CallbackSpec,
    JobSpec, JsonMap,
};
use serde_json::Value;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Accumulates context, options, callbacks, and queue selection, then
/// `dispatch()` persists the batch atomically and enqueues its initial
/// messages.
#[derive(Debug)]
pub struct BatchBuilder {
    manager: BatchManager,
    batch_type: BatchType,
    specs: Vec<JobSpec>,
    context: JsonMap,
    options: BatchOptions,
    queue_name: Option<String>,
    queue_config: Option<String>,
}

impl BatchBuilder {
    pub(crate) fn new(manager: BatchManager, batch_type: BatchType, specs: Vec<JobSpec>) -> Self {
        let queue_name = manager.config().queue.name.clone();
        Self {
            manager,
            batch_type,
            specs,
            context: JsonMap::new(),
            options: BatchOptions::default(),
            queue_name,
            queue_config: None,
        }
    }

    /// Replace the batch's shared context.
    pub fn set_context(mut self, context: JsonMap) -> Self {
        self.context = context;
        self
    }

    /// Set one context entry.
    pub fn context_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    pub fn on_complete(mut self, callback: CallbackSpec) -> Self {
        self.options.on_complete = Some(callback);
        self
    }

    pub fn on_failure(mut self, callback: CallbackSpec) -> Self {
        self.options.on_failure = Some(callback);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.options.max_retries = Some(max_retries);
        self
    }

    pub fn retry_delay(mut self, retry_delay: u32) -> Self {
        self.options.retry_delay = Some(retry_delay);
        self
    }

    pub fn timeout(mut self, timeout: u64) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn fail_on_first_error(mut self, fail_on_first_error: bool) -> Self {
        self.options.fail_on_first_error = fail_on_first_error;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.options.name = Some(name.into());
        self
    }

    /// Route through a configured named queue.
    pub fn queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = Some(queue_name.into());
        self
    }

    /// Pin the concrete queue, bypassing name resolution.
    pub fn queue_config(mut self, queue_config: impl Into<String>) -> Self {
        self.queue_config = Some(queue_config.into());
        self
    }

    /// Apply an options map as it arrives off the wire. Unknown keys are
    /// ignored; callback values must be serializable job specs.
    pub fn set_options(mut self, options: &JsonMap) -> Result<Self> {
        if let Some(value) = options.get("on_complete") {
            self.options.on_complete = Some(CallbackSpec::from_value(value)?);
        }
        if let Some(value) = options.get("on_failure") {
            self.options.on_failure = Some(CallbackSpec::from_value(value)?);
        }
        if let Some(max_retries) = options.get("max_retries").and_then(Value::as_u64) {
            self.options.max_retries = Some(max_retries as u32);
        }
        if let Some(retry_delay) = options.get("retry_delay").and_then(Value::as_u64) {
            self.options.retry_delay = Some(retry_delay as u32);
        }
        if let Some(timeout) = options.get("timeout").and_then(Value::as_u64) {
            self.options.timeout = Some(timeout);
        }
        if let Some(fail_fast) = options.get("fail_on_first_error").and_then(Value::as_bool) {
            self.options.fail_on_first_error = fail_fast;
        }
        if let Some(name) = options.get("name").and_then(Value::as_str) {
            self.options.name = Some(name.to_string());
        }
        Ok(self)
    }

    /// Persist the batch with its full job set in one transaction, enqueue
    /// the initial messages, and return the batch id.
    #[instrument(skip(self), fields(batch_type = %self.batch_type, jobs = self.specs.len()))]
    pub async fn dispatch(self) -> Result<Uuid> {
        if self.specs.is_empty() {
            return Err(BatchQueueError::EmptyBatch);
        }
        self.validate_callbacks()?;

        let queue_config = self.manager.resolver().resolve(
            self.batch_type,
            self.queue_name.as_deref(),
            self.queue_config.as_deref(),
        );

        let id = Uuid::new_v4();
        let jobs = normalize_job_specs(self.specs, self.batch_type, self.manager.registry(), id, 0)?;
        let now = chrono::Utc::now().naive_utc();

        let batch = BatchDefinition {
            id,
            batch_type: self.batch_type,
            status: BatchStatus::Pending,
            total_jobs: jobs.len() as u32,
            completed_jobs: 0,
            failed_jobs: 0,
            context: self.context,
            options: self.options,
            queue_name: self.queue_name,
            queue_config: Some(queue_config),
            created: now,
            modified: now,
            completed_at: None,
            jobs,
        };

        self.manager.storage().create_batch(&batch).await?;
        self.manager.dispatcher().dispatch(&batch).await?;

        debug!(batch_id = %id, "batch dispatched");
        Ok(id)
    }

    fn validate_callbacks(&self) -> Result<()> {
        for callback in [&self.options.on_complete, &self.options.on_failure]
            .into_iter()
            .flatten()
        {
            if !self.manager.registry().contains(&callback.class) {
                return Err(BatchQueueError::InvalidCallback(format!(
                    "callback class '{}' is not registered",
                    callback.class
                )));
            }
        }
        Ok(())
    }
}
