//! Saga-style compensation.
//!
//! When a chain fails, its completed jobs that declared a compensation
//! partner are rolled back by a new sequential batch running the partner
//! classes in reverse position order. The failing job and jobs that never
//! ran are not compensated. The compensation chain is an ordinary chain
//! processed by the same machinery; its jobs are recognizable by the
//! `_compensation` block in their args, and its completion callbacks
//! write the outcome back onto the originating batch's context.

use crate::constants::{
    ARG_BATCH_ID, ARG_COMPENSATION_DETAILS, ARG_ERROR, ARG_ORIGINAL_BATCH_ID,
    COMPENSATION_COMPLETE_CALLBACK, COMPENSATION_FAILED_CALLBACK, CTX_COMPENSATION_COMPLETED_AT,
    CTX_COMPENSATION_ERROR, CTX_COMPENSATION_FAILED_AT, CTX_COMPENSATION_STATUS,
};
use crate::errors::JobExecutionError;
use crate::models::{format_timestamp, BatchJobDefinition, JobSpec, JsonMap};
use crate::registry::{HandlerRegistry, JobHandler, JobOutcome};
use crate::storage::{BatchStorage, BatchUpdate};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Build the job specs of a compensation chain for `original_batch_id`.
///
/// `completed_jobs` must already be restricted to completed rows; jobs
/// without a compensation class are skipped. The result runs newest
/// side effect first.
pub(crate) fn compensation_specs(
    original_batch_id: Uuid,
    completed_jobs: &[BatchJobDefinition],
) -> Vec<JobSpec> {
    let mut candidates: Vec<&BatchJobDefinition> = completed_jobs
        .iter()
        .filter(|job| job.has_compensation())
        .collect();
    candidates.sort_by(|a, b| b.position.cmp(&a.position));

    let mut specs = Vec::with_capacity(candidates.len());
    for (order, job) in candidates.iter().enumerate() {
        let Some(compensation_class) = job.payload.compensation.clone() else {
            continue;
        };

        let mut details = JsonMap::new();
        details.insert(
            "original_batch_id".into(),
            Value::String(original_batch_id.to_string()),
        );
        details.insert(
            "original_job_class".into(),
            Value::String(job.payload.class.clone()),
        );
        details.insert("original_position".into(), Value::from(job.position));
        details.insert(
            "original_result".into(),
            job.result.clone().unwrap_or(Value::Null),
        );
        details.insert("compensation_order".into(), Value::from(order as u64));

        let mut args = job.payload.args.clone();
        args.insert(ARG_COMPENSATION_DETAILS.into(), Value::Object(details));

        specs.push(JobSpec::detailed(compensation_class, args));
    }
    specs
}

/// Args shared by the two compensation callbacks.
pub(crate) fn compensation_callback_args(original_batch_id: Uuid) -> JsonMap {
    let mut args = JsonMap::new();
    args.insert(
        ARG_ORIGINAL_BATCH_ID.into(),
        Value::String(original_batch_id.to_string()),
    );
    args
}

/// Register the built-in compensation callbacks against a storage handle.
pub(crate) fn register_builtin_handlers(
    registry: &mut HandlerRegistry,
    storage: Arc<dyn BatchStorage>,
) {
    let complete_storage = storage.clone();
    registry.register(COMPENSATION_COMPLETE_CALLBACK, move || {
        Box::new(CompensationCompleteCallback {
            storage: complete_storage.clone(),
        })
    });
    registry.register(COMPENSATION_FAILED_CALLBACK, move || {
        Box::new(CompensationFailedCallback {
            storage: storage.clone(),
        })
    });
}

fn arg_uuid(args: &JsonMap, key: &str) -> Option<Uuid> {
    args.get(key)
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
}

/// `on_complete` of a compensation chain: merges the chain's accumulated
/// context back onto the originating batch and stamps
/// `compensation_status = completed`.
struct CompensationCompleteCallback {
    storage: Arc<dyn BatchStorage>,
}

#[async_trait]
impl JobHandler for CompensationCompleteCallback {
    async fn execute(&mut self, args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        let Some(original_id) = arg_uuid(args, ARG_ORIGINAL_BATCH_ID) else {
            warn!("compensation complete callback missing original batch id");
            return Ok(JobOutcome::Reject);
        };
        let compensation_id = arg_uuid(args, ARG_BATCH_ID);

        let original = self
            .storage
            .get_batch(original_id)
            .await
            .map_err(|e| JobExecutionError::new(e.to_string()))?;
        let Some(original) = original else {
            // The batch may have been cancelled while compensation ran.
            debug!(batch_id = %original_id, "original batch gone, dropping compensation outcome");
            return Ok(JobOutcome::Complete);
        };

        let mut context = original.context.clone();
        if let Some(compensation_id) = compensation_id {
            if let Some(compensation) = self
                .storage
                .get_batch(compensation_id)
                .await
                .map_err(|e| JobExecutionError::new(e.to_string()))?
            {
                for (key, value) in compensation.context {
                    context.insert(key, value);
                }
            }
        }
        context.insert(
            CTX_COMPENSATION_STATUS.into(),
            Value::String("completed".into()),
        );
        context.insert(
            CTX_COMPENSATION_COMPLETED_AT.into(),
            Value::String(format_timestamp(chrono::Utc::now().naive_utc())),
        );

        self.storage
            .update_batch(original_id, BatchUpdate::context(context))
            .await
            .map_err(|e| JobExecutionError::new(e.to_string()))?;

        debug!(batch_id = %original_id, "compensation chain completed");
        Ok(JobOutcome::Complete)
    }
}

/// `on_failure` of a compensation chain: stamps
/// `compensation_status = failed` and the error onto the originating batch.
struct CompensationFailedCallback {
    storage: Arc<dyn BatchStorage>,
}

#[async_trait]
impl JobHandler for CompensationFailedCallback {
    async fn execute(&mut self, args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        let Some(original_id) = arg_uuid(args, ARG_ORIGINAL_BATCH_ID) else {
            warn!("compensation failed callback missing original batch id");
            return Ok(JobOutcome::Reject);
        };

        let original = self
            .storage
            .get_batch(original_id)
            .await
            .map_err(|e| JobExecutionError::new(e.to_string()))?;
        let Some(original) = original else {
            debug!(batch_id = %original_id, "original batch gone, dropping compensation failure");
            return Ok(JobOutcome::Complete);
        };

        let mut context = original.context.clone();
        context.insert(
            CTX_COMPENSATION_STATUS.into(),
            Value::String("failed".into()),
        );
        context.insert(
            CTX_COMPENSATION_FAILED_AT.into(),
            Value::String(format_timestamp(chrono::Utc::now().naive_utc())),
        );
        if let Some(error) = args.get(ARG_ERROR).and_then(Value::as_str) {
            context.insert(
                CTX_COMPENSATION_ERROR.into(),
                Value::String(error.to_string()),
            );
        }

        self.storage
            .update_batch(original_id, BatchUpdate::context(context))
            .await
            .map_err(|e| JobExecutionError::new(e.to_string()))?;

        warn!(batch_id = %original_id, "compensation chain failed");
        Ok(JobOutcome::Complete)
    }
}
