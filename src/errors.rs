//! Error types for the batch queue system.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type surfaced by the public orchestration API.
#[derive(Debug, Error)]
pub enum BatchQueueError {
    /// A job specification could not be normalized: unknown class, bad
    /// shape, or a compensation class declared on a parallel batch.
    #[error("Invalid job: {0}")]
    InvalidJob(String),
    /// Dispatch was attempted with zero jobs.
    #[error("Batch has no jobs to dispatch")]
    EmptyBatch,
    /// A lookup or append referenced a deleted or unknown batch.
    #[error("Batch {0} not found")]
    BatchNotFound(Uuid),
    /// An append targeted a batch that already reached a terminal status.
    #[error("Batch {0} is closed to new jobs")]
    BatchClosed(Uuid),
    /// A callback was not given as a serializable `{class, args}` spec.
    #[error("Invalid callback: {0}")]
    InvalidCallback(String),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Job execution failed: {0}")]
    JobExecution(#[from] JobExecutionError),
}

pub type Result<T> = std::result::Result<T, BatchQueueError>;

/// Storage backend failures: connectivity, constraint violations, and
/// row decoding problems. Workers treat these as transient and requeue.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Decode error: {0}")]
    Decode(String),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Queue transport failures.
#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("Queue push failed: {0}")]
    Push(String),
    #[error("Queue receive failed: {0}")]
    Receive(String),
    #[error("Queue operation failed: {0}")]
    Queue(String),
    #[error("Envelope serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type MessagingResult<T> = std::result::Result<T, MessagingError>;

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to read configuration file {path}: {reason}")]
    Read { path: String, reason: String },
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigurationError>;

/// The error record a failing user job leaves on its `BatchJob` row.
///
/// `file`, `line`, and `trace` are optional diagnostics a handler may attach;
/// the record round-trips through the storage backends as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct JobExecutionError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl JobExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: None,
            line: None,
            trace: None,
        }
    }

    pub fn with_location(mut self, file: impl Into<String>, line: u32) -> Self {
        self.file = Some(file.into());
        self.line = Some(line);
        self
    }

    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}

impl From<anyhow::Error> for JobExecutionError {
    fn from(error: anyhow::Error) -> Self {
        let trace = format!("{error:?}");
        let mut record = JobExecutionError::new(error.to_string());
        if trace != record.message {
            record.trace = Some(trace);
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_execution_error_round_trips_as_json() {
        let error = JobExecutionError::new("boom")
            .with_location("src/job.rs", 42)
            .with_trace("stack");
        let value = serde_json::to_value(&error).unwrap();
        let back: JobExecutionError = serde_json::from_value(value).unwrap();
        assert_eq!(error, back);
    }

    #[test]
    fn anyhow_conversion_keeps_message() {
        let error: JobExecutionError = anyhow::anyhow!("payment declined").into();
        assert_eq!(error.message, "payment declined");
    }
}
