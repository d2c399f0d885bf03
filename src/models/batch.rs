//! The batch model: a group of jobs dispatched together, either as a
//! parallel fan-out or a sequential chain with accumulated context.

use super::batch_job::{BatchJobDefinition, JobStatus};
use super::{format_timestamp, parse_timestamp, JsonMap};
use crate::errors::{BatchQueueError, StorageError, StorageResult};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Execution shape of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    /// Independent jobs executed concurrently.
    Parallel,
    /// Jobs executed strictly one after another, sharing context.
    Sequential,
}

impl fmt::Display for BatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parallel => write!(f, "parallel"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

impl FromStr for BatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            _ => Err(format!("Invalid batch type: {s}")),
        }
    }
}

/// Lifecycle of a batch. `Pending` may skip straight to a terminal state
/// (an empty compensation edge case); otherwise transitions are monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid batch status: {s}")),
        }
    }
}

/// A serializable callback job spec: the handler class to enqueue and the
/// args it receives on top of the batch outcome fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackSpec {
    pub class: String,
    #[serde(default)]
    pub args: JsonMap,
}

impl CallbackSpec {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            args: JsonMap::new(),
        }
    }

    pub fn with_args(class: impl Into<String>, args: JsonMap) -> Self {
        Self {
            class: class.into(),
            args,
        }
    }

    /// Accept a callback given as a raw JSON value. Anything that is not an
    /// object carrying a `class` string is rejected: callbacks must be
    /// serializable job specs, never closures or handler instances.
    pub fn from_value(value: &Value) -> crate::errors::Result<Self> {
        let map = value.as_object().ok_or_else(|| {
            BatchQueueError::InvalidCallback(
                "callback must be a map with a 'class' key, not a function reference".to_string(),
            )
        })?;
        let class = map
            .get("class")
            .and_then(Value::as_str)
            .ok_or_else(|| BatchQueueError::InvalidCallback("callback has no 'class' key".into()))?;
        let args = map
            .get("args")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        Ok(Self {
            class: class.to_string(),
            args,
        })
    }
}

/// Recognized batch options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_complete: Option<CallbackSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<CallbackSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// Seconds between transport retries; a hint forwarded to the queue.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<u32>,
    /// Execution timeout hint, seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    pub fail_on_first_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// One submitted group of jobs with its progress accounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDefinition {
    pub id: Uuid,
    pub batch_type: BatchType,
    pub status: BatchStatus,
    pub total_jobs: u32,
    pub completed_jobs: u32,
    pub failed_jobs: u32,
    /// Shared mutable map visible to every job of the batch; accumulates
    /// across the steps of a chain.
    pub context: JsonMap,
    pub options: BatchOptions,
    /// Logical queue label chosen by the client, if any.
    pub queue_name: Option<String>,
    /// Concrete queue this batch's messages are enqueued onto.
    pub queue_config: Option<String>,
    pub created: NaiveDateTime,
    pub modified: NaiveDateTime,
    pub completed_at: Option<NaiveDateTime>,
    /// Child jobs ordered by position.
    pub jobs: Vec<BatchJobDefinition>,
}

impl BatchDefinition {
    /// All jobs finished successfully.
    pub fn is_complete(&self) -> bool {
        self.total_jobs > 0 && self.completed_jobs >= self.total_jobs && self.failed_jobs == 0
    }

    /// At least one job failed.
    pub fn has_failed(&self) -> bool {
        self.failed_jobs > 0 || self.status == BatchStatus::Failed
    }

    /// Whether any job carries a compensation partner class.
    pub fn has_compensation(&self) -> bool {
        self.jobs.iter().any(BatchJobDefinition::has_compensation)
    }

    pub fn get_job(&self, id: Uuid) -> Option<&BatchJobDefinition> {
        self.jobs.iter().find(|job| job.id == id)
    }

    pub fn get_job_at(&self, position: u32) -> Option<&BatchJobDefinition> {
        self.jobs.iter().find(|job| job.position == position)
    }

    /// Completed jobs holding a compensation class, the candidates for a
    /// rollback chain.
    pub fn jobs_with_compensation(&self) -> Vec<&BatchJobDefinition> {
        self.jobs
            .iter()
            .filter(|job| job.status == JobStatus::Completed && job.has_compensation())
            .collect()
    }

    /// The job a chain advances to after `current_position` completes.
    pub fn next_sequential_job(&self, current_position: u32) -> Option<&BatchJobDefinition> {
        self.get_job_at(current_position + 1)
    }

    /// Flat map used by the storage adapters; timestamps leave in the
    /// shared wire format regardless of backend representation.
    pub fn to_map(&self) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("id".into(), Value::String(self.id.to_string()));
        map.insert("type".into(), Value::String(self.batch_type.to_string()));
        map.insert("status".into(), Value::String(self.status.to_string()));
        map.insert("total_jobs".into(), Value::from(self.total_jobs));
        map.insert("completed_jobs".into(), Value::from(self.completed_jobs));
        map.insert("failed_jobs".into(), Value::from(self.failed_jobs));
        map.insert("context".into(), Value::Object(self.context.clone()));
        map.insert(
            "options".into(),
            serde_json::to_value(&self.options).unwrap_or(Value::Null),
        );
        if let Some(queue_name) = &self.queue_name {
            map.insert("queue_name".into(), Value::String(queue_name.clone()));
        }
        if let Some(queue_config) = &self.queue_config {
            map.insert("queue_config".into(), Value::String(queue_config.clone()));
        }
        map.insert(
            "created".into(),
            Value::String(format_timestamp(self.created)),
        );
        map.insert(
            "modified".into(),
            Value::String(format_timestamp(self.modified)),
        );
        if let Some(completed_at) = self.completed_at {
            map.insert(
                "completed_at".into(),
                Value::String(format_timestamp(completed_at)),
            );
        }
        map.insert(
            "jobs".into(),
            Value::Array(
                self.jobs
                    .iter()
                    .map(|job| Value::Object(job.to_map()))
                    .collect(),
            ),
        );
        map
    }

    /// Inverse of [`to_map`](Self::to_map).
    pub fn from_map(map: &JsonMap) -> StorageResult<Self> {
        let id: Uuid = map
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::Decode("batch map missing id".into()))?
            .parse()
            .map_err(|e| StorageError::Decode(format!("invalid batch id: {e}")))?;
        let batch_type = map
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .parse::<BatchType>()
            .map_err(StorageError::Decode)?;
        let status = map
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("pending")
            .parse::<BatchStatus>()
            .map_err(StorageError::Decode)?;
        let total_jobs = read_count(map, "total_jobs");
        let completed_jobs = read_count(map, "completed_jobs");
        let failed_jobs = read_count(map, "failed_jobs");
        let context = map
            .get("context")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let options: BatchOptions = map
            .get("options")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default();
        let queue_name = map
            .get("queue_name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let queue_config = map
            .get("queue_config")
            .and_then(Value::as_str)
            .map(str::to_string);
        let created = map
            .get("created")
            .and_then(Value::as_str)
            .map(parse_timestamp)
            .transpose()?
            .ok_or_else(|| StorageError::Decode("batch map missing created".into()))?;
        let modified = map
            .get("modified")
            .and_then(Value::as_str)
            .map(parse_timestamp)
            .transpose()?
            .unwrap_or(created);
        let completed_at = map
            .get("completed_at")
            .and_then(Value::as_str)
            .map(parse_timestamp)
            .transpose()?;
        let mut jobs = map
            .get("jobs")
            .and_then(Value::as_array)
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(Value::as_object)
                    .map(BatchJobDefinition::from_map)
                    .collect::<StorageResult<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();
        jobs.sort_by_key(|job| job.position);

        Ok(Self {
            id,
            batch_type,
            status,
            total_jobs,
            completed_jobs,
            failed_jobs,
            context,
            options,
            queue_name,
            queue_config,
            created,
            modified,
            completed_at,
            jobs,
        })
    }
}

fn read_count(map: &JsonMap, key: &str) -> u32 {
    map.get(key).and_then(Value::as_u64).unwrap_or(0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobPayload;

    fn sample_batch() -> BatchDefinition {
        let id = Uuid::new_v4();
        let now = chrono::NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        let mut context = JsonMap::new();
        context.insert("tenant".into(), Value::String("acme".into()));
        context.insert("step".into(), Value::from(1));

        let mut second = JobPayload::new("resize");
        second.compensation = Some("restore".into());

        BatchDefinition {
            id,
            batch_type: BatchType::Sequential,
            status: BatchStatus::Running,
            total_jobs: 2,
            completed_jobs: 1,
            failed_jobs: 0,
            context,
            options: BatchOptions {
                on_complete: Some(CallbackSpec::new("notify")),
                name: Some("imports".into()),
                ..Default::default()
            },
            queue_name: Some("imports".into()),
            queue_config: Some("chainedjobs".into()),
            created: now,
            modified: now,
            completed_at: None,
            jobs: vec![
                BatchJobDefinition {
                    status: JobStatus::Completed,
                    result: Some(Value::from(10)),
                    ..BatchJobDefinition::new(id, 0, JobPayload::new("fetch"))
                },
                BatchJobDefinition::new(id, 1, second),
            ],
        }
    }

    #[test]
    fn map_round_trip_is_value_equal() {
        let batch = sample_batch();
        let back = BatchDefinition::from_map(&batch.to_map()).unwrap();
        assert_eq!(batch, back);
    }

    #[test]
    fn context_key_order_survives_round_trip() {
        let batch = sample_batch();
        let back = BatchDefinition::from_map(&batch.to_map()).unwrap();
        let keys: Vec<_> = back.context.keys().cloned().collect();
        assert_eq!(keys, vec!["tenant".to_string(), "step".to_string()]);
    }

    #[test]
    fn predicates_reflect_counters_and_payloads() {
        let mut batch = sample_batch();
        assert!(!batch.is_complete());
        assert!(!batch.has_failed());
        assert!(batch.has_compensation());
        assert_eq!(batch.jobs_with_compensation().len(), 0);

        batch.jobs[1].status = JobStatus::Completed;
        assert_eq!(batch.jobs_with_compensation().len(), 1);

        batch.completed_jobs = 2;
        assert!(batch.is_complete());

        batch.failed_jobs = 1;
        assert!(batch.has_failed());
        assert!(!batch.is_complete());
    }

    #[test]
    fn next_sequential_job_walks_positions() {
        let batch = sample_batch();
        assert_eq!(batch.next_sequential_job(0).unwrap().position, 1);
        assert!(batch.next_sequential_job(1).is_none());
    }

    #[test]
    fn callback_spec_rejects_non_map_values() {
        assert!(CallbackSpec::from_value(&Value::String("notify".into())).is_err());
        assert!(CallbackSpec::from_value(&serde_json::json!({"args": {}})).is_err());
        let spec =
            CallbackSpec::from_value(&serde_json::json!({"class": "notify", "args": {"k": 1}}))
                .unwrap();
        assert_eq!(spec.class, "notify");
        assert_eq!(spec.args.get("k").and_then(Value::as_i64), Some(1));
    }
}
