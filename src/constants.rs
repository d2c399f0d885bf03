//! Shared constants: queue names, reserved handler classes, and the
//! envelope / context keys the orchestrator controls.

/// Default queue for parallel batches when no override is configured.
pub const DEFAULT_PARALLEL_QUEUE: &str = "batchjob";

/// Default queue for sequential chains when no override is configured.
pub const DEFAULT_SEQUENTIAL_QUEUE: &str = "chainedjobs";

/// Default Redis key namespace prefix.
pub const DEFAULT_REDIS_PREFIX: &str = "batch:";

/// Default Redis TTL for batch state, in seconds (24h).
pub const DEFAULT_REDIS_TTL_SECONDS: u64 = 86_400;

/// Reserved class name of the built-in handler that records a finished
/// compensation chain back onto the originating batch.
pub const COMPENSATION_COMPLETE_CALLBACK: &str = "batchqueue.compensation_complete";

/// Reserved class name of the built-in handler that records a failed
/// compensation chain back onto the originating batch.
pub const COMPENSATION_FAILED_CALLBACK: &str = "batchqueue.compensation_failed";

// Envelope argument keys the orchestrator injects alongside user args.
pub const ARG_BATCH_ID: &str = "batch_id";
pub const ARG_JOB_POSITION: &str = "job_position";
pub const ARG_COMPENSATION: &str = "compensation";
pub const ARG_IS_CALLBACK: &str = "is_callback";
pub const ARG_IS_COMPENSATION: &str = "is_compensation";
pub const ARG_COMPENSATION_DETAILS: &str = "_compensation";
pub const ARG_STATUS: &str = "status";
pub const ARG_ERROR: &str = "error";
pub const ARG_ORIGINAL_BATCH_ID: &str = "original_batch_id";

// Context keys written onto a batch when a compensation chain runs.
pub const CTX_COMPENSATION_BATCH_ID: &str = "compensation_batch_id";
pub const CTX_COMPENSATION_STATUS: &str = "compensation_status";
pub const CTX_COMPENSATION_STARTED_AT: &str = "compensation_started_at";
pub const CTX_COMPENSATION_COMPLETED_AT: &str = "compensation_completed_at";
pub const CTX_COMPENSATION_FAILED_AT: &str = "compensation_failed_at";
pub const CTX_COMPENSATION_ERROR: &str = "compensation_error";

/// Wire format for timestamps leaving the storage adapters.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
