//! Job records inside a batch, and the input shapes they normalize from.

use super::{format_timestamp, parse_timestamp, JsonMap};
use crate::errors::{BatchQueueError, JobExecutionError, Result, StorageError, StorageResult};
use crate::models::BatchType;
use crate::registry::HandlerRegistry;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle of a single job slot inside a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {s}")),
        }
    }
}

/// Canonical job descriptor persisted on the job row and carried in queue
/// envelopes: the handler class, an optional compensation partner class,
/// and the user's argument map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<String>,
    #[serde(default)]
    pub args: JsonMap,
}

impl JobPayload {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            compensation: None,
            args: JsonMap::new(),
        }
    }
}

/// One job attempt-slot inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobDefinition {
    pub id: Uuid,
    pub batch_id: Uuid,
    /// Queue-provided message identifier, recorded on first worker pickup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_job_id: Option<String>,
    /// Zero-based execution index, unique within the batch.
    pub position: u32,
    pub status: JobStatus,
    pub payload: JobPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobExecutionError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<NaiveDateTime>,
}

impl BatchJobDefinition {
    pub fn new(batch_id: Uuid, position: u32, payload: JobPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            queue_job_id: None,
            position,
            status: JobStatus::Pending,
            payload,
            result: None,
            error: None,
            completed_at: None,
        }
    }

    pub fn has_compensation(&self) -> bool {
        self.payload.compensation.is_some()
    }

    /// Flat map used by the storage adapters.
    pub fn to_map(&self) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("id".into(), Value::String(self.id.to_string()));
        map.insert("batch_id".into(), Value::String(self.batch_id.to_string()));
        if let Some(job_id) = &self.queue_job_id {
            map.insert("job_id".into(), Value::String(job_id.clone()));
        }
        map.insert("position".into(), Value::from(self.position));
        map.insert("status".into(), Value::String(self.status.to_string()));
        map.insert(
            "payload".into(),
            serde_json::to_value(&self.payload).unwrap_or(Value::Null),
        );
        if let Some(result) = &self.result {
            map.insert("result".into(), result.clone());
        }
        if let Some(error) = &self.error {
            map.insert(
                "error".into(),
                serde_json::to_value(error).unwrap_or(Value::Null),
            );
        }
        if let Some(completed_at) = self.completed_at {
            map.insert(
                "completed_at".into(),
                Value::String(format_timestamp(completed_at)),
            );
        }
        map
    }

    /// Inverse of [`to_map`](Self::to_map).
    pub fn from_map(map: &JsonMap) -> StorageResult<Self> {
        let id = read_uuid(map, "id")?;
        let batch_id = read_uuid(map, "batch_id")?;
        let queue_job_id = map
            .get("job_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let position = map
            .get("position")
            .and_then(Value::as_u64)
            .ok_or_else(|| StorageError::Decode("job map missing position".into()))?
            as u32;
        let status = map
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("pending")
            .parse::<JobStatus>()
            .map_err(StorageError::Decode)?;
        let payload: JobPayload = map
            .get("payload")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .ok_or_else(|| StorageError::Decode("job map missing payload".into()))?;
        let result = map.get("result").cloned();
        let error = map
            .get("error")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?;
        let completed_at = map
            .get("completed_at")
            .and_then(Value::as_str)
            .map(parse_timestamp)
            .transpose()?;

        Ok(Self {
            id,
            batch_id,
            queue_job_id,
            position,
            status,
            payload,
            result,
            error,
            completed_at,
        })
    }
}

fn read_uuid(map: &JsonMap, key: &str) -> StorageResult<Uuid> {
    map.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| StorageError::Decode(format!("job map missing {key}")))?
        .parse()
        .map_err(|e| StorageError::Decode(format!("invalid {key}: {e}")))
}

/// Input shapes accepted when building or extending a batch.
///
/// Deserializes from the wire forms clients send: a bare class name, a
/// `[job, compensation]` pair, a detailed map, or a previously loaded job
/// row coming back out of storage.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum JobSpec {
    Class(String),
    WithCompensation(String, String),
    Detailed {
        class: String,
        #[serde(default)]
        args: JsonMap,
        #[serde(default)]
        compensation: Option<String>,
    },
    Row(BatchJobDefinition),
}

impl JobSpec {
    pub fn class(name: impl Into<String>) -> Self {
        Self::Class(name.into())
    }

    pub fn with_compensation(class: impl Into<String>, compensation: impl Into<String>) -> Self {
        Self::WithCompensation(class.into(), compensation.into())
    }

    pub fn detailed(class: impl Into<String>, args: JsonMap) -> Self {
        Self::Detailed {
            class: class.into(),
            args,
            compensation: None,
        }
    }

    pub fn detailed_with_compensation(
        class: impl Into<String>,
        args: JsonMap,
        compensation: impl Into<String>,
    ) -> Self {
        Self::Detailed {
            class: class.into(),
            args,
            compensation: Some(compensation.into()),
        }
    }

    fn into_payload(self) -> JobPayload {
        match self {
            Self::Class(class) => JobPayload::new(class),
            Self::WithCompensation(class, compensation) => JobPayload {
                class,
                compensation: Some(compensation),
                args: JsonMap::new(),
            },
            Self::Detailed {
                class,
                args,
                compensation,
            } => JobPayload {
                class,
                compensation,
                args,
            },
            Self::Row(row) => row.payload,
        }
    }
}

/// Normalize user-facing job specs into canonical job rows for `batch_id`,
/// assigning contiguous positions starting at `start_position`.
///
/// Rejects unknown handler classes, and compensation classes on anything
/// but a sequential batch.
pub fn normalize_job_specs(
    specs: Vec<JobSpec>,
    batch_type: BatchType,
    registry: &HandlerRegistry,
    batch_id: Uuid,
    start_position: u32,
) -> Result<Vec<BatchJobDefinition>> {
    let mut jobs = Vec::with_capacity(specs.len());

    for (index, spec) in specs.into_iter().enumerate() {
        let payload = spec.into_payload();

        if !registry.contains(&payload.class) {
            return Err(BatchQueueError::InvalidJob(format!(
                "unknown job class '{}'",
                payload.class
            )));
        }
        if let Some(compensation) = &payload.compensation {
            if batch_type != BatchType::Sequential {
                return Err(BatchQueueError::InvalidJob(format!(
                    "compensation '{compensation}' declared on job '{}' of a parallel batch",
                    payload.class
                )));
            }
            if !registry.contains(compensation) {
                return Err(BatchQueueError::InvalidJob(format!(
                    "unknown compensation class '{compensation}'"
                )));
            }
        }

        jobs.push(BatchJobDefinition::new(
            batch_id,
            start_position + index as u32,
            payload,
        ));
    }

    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{JobHandler, JobOutcome};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl JobHandler for Noop {
        async fn execute(
            &mut self,
            _args: &JsonMap,
        ) -> std::result::Result<JobOutcome, JobExecutionError> {
            Ok(JobOutcome::Complete)
        }
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register("work", || Box::new(Noop));
        registry.register("undo", || Box::new(Noop));
        registry
    }

    #[test]
    fn normalizes_all_input_shapes() {
        let registry = registry();
        let batch_id = Uuid::new_v4();
        let mut args = JsonMap::new();
        args.insert("n".into(), Value::from(1));

        let jobs = normalize_job_specs(
            vec![
                JobSpec::class("work"),
                JobSpec::with_compensation("work", "undo"),
                JobSpec::detailed("work", args.clone()),
            ],
            BatchType::Sequential,
            &registry,
            batch_id,
            0,
        )
        .unwrap();

        assert_eq!(jobs.len(), 3);
        assert_eq!(
            jobs.iter().map(|j| j.position).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(jobs[1].payload.compensation.as_deref(), Some("undo"));
        assert_eq!(jobs[2].payload.args, args);
        assert!(jobs.iter().all(|j| j.batch_id == batch_id));
        assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));
    }

    #[test]
    fn unknown_class_is_rejected() {
        let err = normalize_job_specs(
            vec![JobSpec::class("missing")],
            BatchType::Parallel,
            &registry(),
            Uuid::new_v4(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, BatchQueueError::InvalidJob(_)));
    }

    #[test]
    fn compensation_on_parallel_batch_is_rejected() {
        let err = normalize_job_specs(
            vec![JobSpec::with_compensation("work", "undo")],
            BatchType::Parallel,
            &registry(),
            Uuid::new_v4(),
            0,
        )
        .unwrap_err();
        assert!(matches!(err, BatchQueueError::InvalidJob(_)));
    }

    #[test]
    fn specs_deserialize_from_wire_shapes() {
        let spec: JobSpec = serde_json::from_str("\"work\"").unwrap();
        assert!(matches!(spec, JobSpec::Class(ref c) if c == "work"));

        let spec: JobSpec = serde_json::from_str("[\"work\", \"undo\"]").unwrap();
        assert!(matches!(spec, JobSpec::WithCompensation(_, _)));

        let spec: JobSpec =
            serde_json::from_str("{\"class\": \"work\", \"args\": {\"n\": 1}}").unwrap();
        match spec {
            JobSpec::Detailed { class, args, .. } => {
                assert_eq!(class, "work");
                assert_eq!(args.get("n").and_then(Value::as_i64), Some(1));
            }
            other => panic!("unexpected shape: {other:?}"),
        }
    }

    #[test]
    fn job_map_round_trips() {
        let mut job = BatchJobDefinition::new(Uuid::new_v4(), 3, JobPayload::new("work"));
        job.queue_job_id = Some("42".into());
        job.status = JobStatus::Failed;
        job.error = Some(JobExecutionError::new("boom"));
        job.completed_at = Some(
            chrono::NaiveDate::from_ymd_opt(2025, 1, 2)
                .unwrap()
                .and_hms_opt(3, 4, 5)
                .unwrap(),
        );

        let back = BatchJobDefinition::from_map(&job.to_map()).unwrap();
        assert_eq!(job, back);
    }
}
