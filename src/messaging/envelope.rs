//! Queue message envelopes.
//!
//! An envelope is `{class, args}` where `args` merges, in increasing
//! precedence, the job's own arguments, the batch context, and the routing
//! markers the orchestrator controls (`batch_id`, `job_position`, and the
//! callback/compensation flags).

use crate::constants::{
    ARG_BATCH_ID, ARG_COMPENSATION, ARG_COMPENSATION_DETAILS, ARG_ERROR, ARG_IS_CALLBACK,
    ARG_IS_COMPENSATION, ARG_JOB_POSITION, ARG_STATUS,
};
use crate::models::{BatchDefinition, BatchJobDefinition, BatchStatus, CallbackSpec, JsonMap};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub class: String,
    #[serde(default)]
    pub args: JsonMap,
}

impl JobEnvelope {
    pub fn new(class: impl Into<String>, args: JsonMap) -> Self {
        Self {
            class: class.into(),
            args,
        }
    }

    /// Envelope for a batch job: job args, overlaid with the batch context,
    /// overlaid with routing markers.
    pub fn for_batch_job(batch: &BatchDefinition, job: &BatchJobDefinition) -> Self {
        let mut args = job.payload.args.clone();
        for (key, value) in &batch.context {
            args.insert(key.clone(), value.clone());
        }
        args.insert(ARG_BATCH_ID.into(), Value::String(batch.id.to_string()));
        args.insert(ARG_JOB_POSITION.into(), Value::from(job.position));
        if let Some(compensation) = &job.payload.compensation {
            args.insert(ARG_COMPENSATION.into(), Value::String(compensation.clone()));
        }
        if args.contains_key(ARG_COMPENSATION_DETAILS) {
            args.insert(ARG_IS_COMPENSATION.into(), Value::Bool(true));
        }

        Self {
            class: job.payload.class.clone(),
            args,
        }
    }

    /// Envelope for an `on_complete` / `on_failure` callback job.
    pub fn for_callback(
        spec: &CallbackSpec,
        batch_id: Uuid,
        status: BatchStatus,
        error: Option<&str>,
    ) -> Self {
        let mut args = spec.args.clone();
        args.insert(ARG_BATCH_ID.into(), Value::String(batch_id.to_string()));
        args.insert(ARG_STATUS.into(), Value::String(status.to_string()));
        if let Some(error) = error {
            args.insert(ARG_ERROR.into(), Value::String(error.to_string()));
        }
        args.insert(ARG_IS_CALLBACK.into(), Value::Bool(true));

        Self {
            class: spec.class.clone(),
            args,
        }
    }

    pub fn batch_id(&self) -> Option<Uuid> {
        self.args
            .get(ARG_BATCH_ID)
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
    }

    pub fn job_position(&self) -> Option<u32> {
        self.args
            .get(ARG_JOB_POSITION)
            .and_then(Value::as_u64)
            .map(|position| position as u32)
    }

    pub fn compensation(&self) -> Option<&str> {
        self.args.get(ARG_COMPENSATION).and_then(Value::as_str)
    }

    pub fn is_callback(&self) -> bool {
        self.args
            .get(ARG_IS_CALLBACK)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_compensation(&self) -> bool {
        self.args
            .get(ARG_IS_COMPENSATION)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// The `_compensation` block carried by compensation chain jobs.
    pub fn compensation_details(&self) -> Option<&Value> {
        self.args.get(ARG_COMPENSATION_DETAILS)
    }

    /// Whether this envelope addresses a batch job row, as opposed to a
    /// callback or a pass-through message.
    pub fn is_batch_job(&self) -> bool {
        self.batch_id().is_some() && self.job_position().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BatchOptions, BatchType, JobPayload, JobStatus};

    fn batch_with_job() -> (BatchDefinition, BatchJobDefinition) {
        let id = Uuid::new_v4();
        let now = chrono::NaiveDate::from_ymd_opt(2025, 4, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();
        let mut context = JsonMap::new();
        context.insert("tenant".into(), Value::String("acme".into()));
        context.insert("n".into(), Value::from(9));

        let mut payload = JobPayload::new("resize");
        payload.compensation = Some("restore".into());
        payload.args.insert("n".into(), Value::from(1));
        let job = BatchJobDefinition::new(id, 2, payload);

        let batch = BatchDefinition {
            id,
            batch_type: BatchType::Sequential,
            status: BatchStatus::Running,
            total_jobs: 3,
            completed_jobs: 2,
            failed_jobs: 0,
            context,
            options: BatchOptions::default(),
            queue_name: None,
            queue_config: Some("chainedjobs".into()),
            created: now,
            modified: now,
            completed_at: None,
            jobs: vec![],
        };
        (batch, job)
    }

    #[test]
    fn batch_job_envelope_merges_args_context_and_markers() {
        let (batch, job) = batch_with_job();
        let envelope = JobEnvelope::for_batch_job(&batch, &job);

        assert_eq!(envelope.class, "resize");
        assert_eq!(envelope.batch_id(), Some(batch.id));
        assert_eq!(envelope.job_position(), Some(2));
        assert_eq!(envelope.compensation(), Some("restore"));
        assert!(!envelope.is_callback());
        assert!(!envelope.is_compensation());
        // Context overrides job args on key collision.
        assert_eq!(envelope.args.get("n").and_then(Value::as_i64), Some(9));
        assert_eq!(
            envelope.args.get("tenant").and_then(Value::as_str),
            Some("acme")
        );
    }

    #[test]
    fn compensation_details_flag_the_envelope() {
        let (batch, mut job) = batch_with_job();
        job.payload.args.insert(
            ARG_COMPENSATION_DETAILS.into(),
            serde_json::json!({"original_position": 1}),
        );
        let envelope = JobEnvelope::for_batch_job(&batch, &job);
        assert!(envelope.is_compensation());
        assert!(envelope.compensation_details().is_some());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn callback_envelope_carries_outcome_fields() {
        let spec = CallbackSpec::new("notify");
        let batch_id = Uuid::new_v4();
        let envelope =
            JobEnvelope::for_callback(&spec, batch_id, BatchStatus::Failed, Some("boom"));

        assert!(envelope.is_callback());
        assert_eq!(envelope.batch_id(), Some(batch_id));
        assert_eq!(
            envelope.args.get(ARG_STATUS).and_then(Value::as_str),
            Some("failed")
        );
        assert_eq!(
            envelope.args.get(ARG_ERROR).and_then(Value::as_str),
            Some("boom")
        );
        // Callback envelopes do not address a job row.
        assert!(!envelope.is_batch_job());
    }
}
