//! Data model: batches, their jobs, and the read models derived from them.

mod batch;
mod batch_job;
mod progress;

pub use batch::{BatchDefinition, BatchOptions, BatchStatus, BatchType, CallbackSpec};
pub use batch_job::{normalize_job_specs, BatchJobDefinition, JobPayload, JobSpec, JobStatus};
pub use progress::BatchProgress;

use crate::constants::TIMESTAMP_FORMAT;
use crate::errors::{StorageError, StorageResult};
use chrono::NaiveDateTime;

/// JSON object with insertion order preserved, used for batch context,
/// batch options, and job args.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Render a timestamp in the wire format shared by both storage backends.
pub(crate) fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a wire-format timestamp produced by [`format_timestamp`].
pub(crate) fn parse_timestamp(raw: &str) -> StorageResult<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| StorageError::Decode(format!("invalid timestamp '{raw}': {e}")))
}
