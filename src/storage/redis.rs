//! Redis storage backend.
//!
//! One hash per batch for metadata (`<prefix><id>`), plus `:jobs`,
//! `:results`, and `:failed` hashes keyed by job row id, and a set of all
//! batch ids for listing. Job-status writes and counter recomputes run as
//! Lua scripts so a worker's status flip, result write, counter update,
//! and terminal check commit atomically. Every write renews the TTL.
//!
//! Metadata timestamps are stored as Unix seconds and hydrate back into
//! the shared wire format.

use super::{BatchFilters, BatchStorage, BatchUpdate};
use crate::config::RedisConfig;
use crate::errors::{JobExecutionError, StorageError, StorageResult};
use crate::models::{
    BatchDefinition, BatchJobDefinition, BatchOptions, BatchStatus, BatchType, JobStatus, JsonMap,
};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use redis::aio::ConnectionManager;
use redis::Script;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

const UPDATE_JOB_STATUS_SCRIPT: &str = r#"
local jobs_key = KEYS[1]
local results_key = KEYS[2]
local failed_key = KEYS[3]
local meta_key = KEYS[4]
local job_id = ARGV[1]
local status = ARGV[2]
local result = ARGV[3]
local err = ARGV[4]
local now = ARGV[5]
local wire_now = ARGV[6]
local ttl = tonumber(ARGV[7])

local raw = redis.call('HGET', jobs_key, job_id)
if not raw then return 0 end
local job = cjson.decode(raw)
local was_terminal = (job.status == 'completed' or job.status == 'failed')

job.status = status
if result ~= '' then
  job.result = cjson.decode(result)
  redis.call('HSET', results_key, job_id, result)
end
if err ~= '' then
  job.error = cjson.decode(err)
  redis.call('HSET', failed_key, job_id, err)
end
if status == 'completed' or status == 'failed' then
  if not was_terminal then job.completed_at = wire_now end
else
  job.completed_at = nil
end

redis.call('HSET', jobs_key, job_id, cjson.encode(job))
redis.call('HSET', meta_key, 'modified', now)
redis.call('EXPIRE', jobs_key, ttl)
redis.call('EXPIRE', results_key, ttl)
redis.call('EXPIRE', failed_key, ttl)
redis.call('EXPIRE', meta_key, ttl)
return 1
"#;

const RECOMPUTE_COUNTER_SCRIPT: &str = r#"
local jobs_key = KEYS[1]
local meta_key = KEYS[2]
local status = ARGV[1]
local field = ARGV[2]
local now = ARGV[3]
local ttl = tonumber(ARGV[4])

local count = 0
for _, raw in ipairs(redis.call('HVALS', jobs_key)) do
  if cjson.decode(raw).status == status then count = count + 1 end
end
redis.call('HSET', meta_key, field, count, 'modified', now)
redis.call('EXPIRE', meta_key, ttl)
redis.call('EXPIRE', jobs_key, ttl)
return count
"#;

const MARK_TERMINAL_SCRIPT: &str = r#"
local meta_key = KEYS[1]
local channel = KEYS[2]
local status = ARGV[1]
local sticky = ARGV[2]
local now = ARGV[3]
local ttl = tonumber(ARGV[4])
local batch_id = ARGV[5]

if redis.call('EXISTS', meta_key) == 0 then return 0 end
local current = redis.call('HGET', meta_key, 'status')
if sticky == '1' and (current == 'completed' or current == 'failed') then
  return 0
end
redis.call('HSET', meta_key, 'status', status, 'completed_at', now, 'modified', now)
redis.call('EXPIRE', meta_key, ttl)
redis.call('PUBLISH', channel, cjson.encode({batch_id = batch_id, status = status}))
return 1
"#;

const ADD_JOBS_SCRIPT: &str = r#"
local jobs_key = KEYS[1]
local meta_key = KEYS[2]
local now = ARGV[1]
local ttl = tonumber(ARGV[2])

local added = 0
for i = 3, #ARGV, 2 do
  redis.call('HSET', jobs_key, ARGV[i], ARGV[i + 1])
  added = added + 1
end
local total = redis.call('HLEN', jobs_key)
redis.call('HSET', meta_key, 'total_jobs', total, 'modified', now)
redis.call('EXPIRE', jobs_key, ttl)
redis.call('EXPIRE', meta_key, ttl)
return added
"#;

/// Redis-backed [`BatchStorage`] using an async multiplexed connection.
pub struct RedisBatchStorage {
    connection_manager: ConnectionManager,
    prefix: String,
    ttl: i64,
    update_job_status: Script,
    recompute_counter: Script,
    mark_terminal: Script,
    add_jobs: Script,
}

impl std::fmt::Debug for RedisBatchStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBatchStorage")
            .field("prefix", &self.prefix)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl RedisBatchStorage {
    /// Connect from configuration.
    pub async fn from_config(config: &RedisConfig) -> StorageResult<Self> {
        let client = redis::Client::open(config.url().as_str())?;
        let connection_manager = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(connection_manager, config))
    }

    /// Build over an existing connection manager.
    pub fn with_connection(connection_manager: ConnectionManager, config: &RedisConfig) -> Self {
        Self {
            connection_manager,
            prefix: config.prefix.clone(),
            ttl: config.ttl as i64,
            update_job_status: Script::new(UPDATE_JOB_STATUS_SCRIPT),
            recompute_counter: Script::new(RECOMPUTE_COUNTER_SCRIPT),
            mark_terminal: Script::new(MARK_TERMINAL_SCRIPT),
            add_jobs: Script::new(ADD_JOBS_SCRIPT),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.connection_manager.clone()
    }

    fn meta_key(&self, id: Uuid) -> String {
        format!("{}{}", self.prefix, id)
    }

    fn jobs_key(&self, id: Uuid) -> String {
        format!("{}{}:jobs", self.prefix, id)
    }

    fn results_key(&self, id: Uuid) -> String {
        format!("{}{}:results", self.prefix, id)
    }

    fn failed_key(&self, id: Uuid) -> String {
        format!("{}{}:failed", self.prefix, id)
    }

    fn index_key(&self) -> String {
        format!("{}index", self.prefix)
    }

    fn events_channel(&self) -> String {
        format!("{}events", self.prefix)
    }

    async fn load_jobs_map(&self, id: Uuid) -> StorageResult<Vec<BatchJobDefinition>> {
        let mut conn = self.conn();
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.jobs_key(id))
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(raw.len());
        for encoded in raw.values() {
            let map: JsonMap = serde_json::from_str(encoded)?;
            jobs.push(BatchJobDefinition::from_map(&map)?);
        }
        jobs.sort_by_key(|job| job.position);
        Ok(jobs)
    }

    async fn write_job_entry(&self, id: Uuid, job: &BatchJobDefinition) -> StorageResult<()> {
        let mut conn = self.conn();
        let encoded = serde_json::to_string(&Value::Object(job.to_map()))?;
        redis::cmd("HSET")
            .arg(self.jobs_key(id))
            .arg(job.id.to_string())
            .arg(encoded)
            .query_async::<()>(&mut conn)
            .await?;
        redis::cmd("EXPIRE")
            .arg(self.jobs_key(id))
            .arg(self.ttl)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

/// Metadata hash fields for a batch (timestamps as Unix seconds).
fn meta_fields(batch: &BatchDefinition) -> StorageResult<Vec<(String, String)>> {
    let mut fields = vec![
        ("id".to_string(), batch.id.to_string()),
        ("type".to_string(), batch.batch_type.to_string()),
        ("status".to_string(), batch.status.to_string()),
        ("total_jobs".to_string(), batch.total_jobs.to_string()),
        (
            "completed_jobs".to_string(),
            batch.completed_jobs.to_string(),
        ),
        ("failed_jobs".to_string(), batch.failed_jobs.to_string()),
        (
            "context".to_string(),
            serde_json::to_string(&Value::Object(batch.context.clone()))?,
        ),
        (
            "options".to_string(),
            serde_json::to_string(&batch.options)?,
        ),
        (
            "created".to_string(),
            batch.created.and_utc().timestamp().to_string(),
        ),
        (
            "modified".to_string(),
            batch.modified.and_utc().timestamp().to_string(),
        ),
    ];
    if let Some(queue_name) = &batch.queue_name {
        fields.push(("queue_name".to_string(), queue_name.clone()));
    }
    if let Some(queue_config) = &batch.queue_config {
        fields.push(("queue_config".to_string(), queue_config.clone()));
    }
    if let Some(completed_at) = batch.completed_at {
        fields.push((
            "completed_at".to_string(),
            completed_at.and_utc().timestamp().to_string(),
        ));
    }
    Ok(fields)
}

fn parse_unix_timestamp(raw: &str) -> StorageResult<NaiveDateTime> {
    let seconds: i64 = raw
        .parse()
        .map_err(|e| StorageError::Decode(format!("invalid unix timestamp '{raw}': {e}")))?;
    chrono::DateTime::from_timestamp(seconds, 0)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| StorageError::Decode(format!("unix timestamp out of range: {raw}")))
}

/// Hydrate a batch from its metadata hash and job entries.
fn batch_from_meta(
    meta: &HashMap<String, String>,
    jobs: Vec<BatchJobDefinition>,
) -> StorageResult<BatchDefinition> {
    let get = |field: &str| -> StorageResult<&str> {
        meta.get(field)
            .map(String::as_str)
            .ok_or_else(|| StorageError::Decode(format!("batch hash missing {field}")))
    };

    let id: Uuid = get("id")?
        .parse()
        .map_err(|e| StorageError::Decode(format!("invalid batch id: {e}")))?;
    let batch_type: BatchType = get("type")?.parse().map_err(StorageError::Decode)?;
    let status: BatchStatus = get("status")?.parse().map_err(StorageError::Decode)?;
    let count = |field: &str| -> u32 {
        meta.get(field)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    };
    let context: JsonMap = meta
        .get("context")
        .map(|raw| serde_json::from_str(raw))
        .transpose()?
        .unwrap_or_default();
    let options: BatchOptions = meta
        .get("options")
        .map(|raw| serde_json::from_str(raw))
        .transpose()?
        .unwrap_or_default();
    let created = parse_unix_timestamp(get("created")?)?;
    let modified = meta
        .get("modified")
        .map(|raw| parse_unix_timestamp(raw))
        .transpose()?
        .unwrap_or(created);
    let completed_at = meta
        .get("completed_at")
        .map(|raw| parse_unix_timestamp(raw))
        .transpose()?;

    Ok(BatchDefinition {
        id,
        batch_type,
        status,
        total_jobs: count("total_jobs"),
        completed_jobs: count("completed_jobs"),
        failed_jobs: count("failed_jobs"),
        context,
        options,
        queue_name: meta.get("queue_name").cloned(),
        queue_config: meta.get("queue_config").cloned(),
        created,
        modified,
        completed_at,
        jobs,
    })
}

#[async_trait]
impl BatchStorage for RedisBatchStorage {
    async fn create_batch(&self, batch: &BatchDefinition) -> StorageResult<Uuid> {
        let mut conn = self.conn();
        let fields = meta_fields(batch)?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        {
            let cmd = pipe.cmd("HSET").arg(self.meta_key(batch.id));
            for (field, value) in &fields {
                cmd.arg(field).arg(value);
            }
        }
        if !batch.jobs.is_empty() {
            let cmd = pipe.cmd("HSET").arg(self.jobs_key(batch.id));
            for job in &batch.jobs {
                cmd.arg(job.id.to_string())
                    .arg(serde_json::to_string(&Value::Object(job.to_map()))?);
            }
        }
        pipe.cmd("SADD").arg(self.index_key()).arg(batch.id.to_string());
        pipe.cmd("EXPIRE").arg(self.meta_key(batch.id)).arg(self.ttl);
        pipe.cmd("EXPIRE").arg(self.jobs_key(batch.id)).arg(self.ttl);
        pipe.query_async::<()>(&mut conn).await?;

        Ok(batch.id)
    }

    async fn update_batch(&self, id: Uuid, update: BatchUpdate) -> StorageResult<()> {
        let mut conn = self.conn();
        let now = chrono::Utc::now().timestamp();

        let mut pipe = redis::pipe();
        pipe.atomic();
        {
            let cmd = pipe.cmd("HSET").arg(self.meta_key(id));
            cmd.arg("modified").arg(now);
            if let Some(status) = update.status {
                cmd.arg("status").arg(status.to_string());
            }
            if let Some(context) = update.context {
                cmd.arg("context")
                    .arg(serde_json::to_string(&Value::Object(context))?);
            }
            if let Some(queue_config) = update.queue_config {
                cmd.arg("queue_config").arg(queue_config);
            }
            if let Some(completed_at) = update.completed_at {
                cmd.arg("completed_at").arg(completed_at.and_utc().timestamp());
            }
        }
        pipe.cmd("EXPIRE").arg(self.meta_key(id)).arg(self.ttl);
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn get_batch(&self, id: Uuid) -> StorageResult<Option<BatchDefinition>> {
        let mut conn = self.conn();
        let meta: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.meta_key(id))
            .query_async(&mut conn)
            .await?;
        if meta.is_empty() {
            return Ok(None);
        }
        let jobs = self.load_jobs_map(id).await?;
        Ok(Some(batch_from_meta(&meta, jobs)?))
    }

    async fn add_jobs_to_batch(
        &self,
        id: Uuid,
        jobs: &[BatchJobDefinition],
    ) -> StorageResult<usize> {
        if jobs.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let mut invocation = self.add_jobs.prepare_invoke();
        invocation
            .key(self.jobs_key(id))
            .key(self.meta_key(id))
            .arg(chrono::Utc::now().timestamp())
            .arg(self.ttl);
        for job in jobs {
            invocation
                .arg(job.id.to_string())
                .arg(serde_json::to_string(&Value::Object(job.to_map()))?);
        }
        let added: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(added.max(0) as usize)
    }

    async fn get_job_by_position(
        &self,
        id: Uuid,
        position: u32,
    ) -> StorageResult<Option<BatchJobDefinition>> {
        let jobs = self.load_jobs_map(id).await?;
        Ok(jobs.into_iter().find(|job| job.position == position))
    }

    async fn get_job_by_id(
        &self,
        id: Uuid,
        job_id: Uuid,
    ) -> StorageResult<Option<BatchJobDefinition>> {
        let mut conn = self.conn();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.jobs_key(id))
            .arg(job_id.to_string())
            .query_async(&mut conn)
            .await?;
        raw.map(|encoded| {
            let map: JsonMap = serde_json::from_str(&encoded)?;
            BatchJobDefinition::from_map(&map)
        })
        .transpose()
    }

    async fn update_job_queue_id(
        &self,
        id: Uuid,
        position: u32,
        queue_job_id: &str,
    ) -> StorageResult<()> {
        // Read-modify-write; safe because the queue delivers a message to
        // at most one worker at a time.
        let Some(mut job) = self.get_job_by_position(id, position).await? else {
            return Ok(());
        };
        job.queue_job_id = Some(queue_job_id.to_string());
        self.write_job_entry(id, &job).await
    }

    async fn update_job_status(
        &self,
        id: Uuid,
        job_id: Uuid,
        status: JobStatus,
        result: Option<Value>,
        error: Option<JobExecutionError>,
    ) -> StorageResult<()> {
        let mut conn = self.conn();
        let now = chrono::Utc::now();
        let result_arg = result.map(|r| serde_json::to_string(&r)).transpose()?;
        let error_arg = error.map(|e| serde_json::to_string(&e)).transpose()?;

        let _: i64 = self
            .update_job_status
            .key(self.jobs_key(id))
            .key(self.results_key(id))
            .key(self.failed_key(id))
            .key(self.meta_key(id))
            .arg(job_id.to_string())
            .arg(status.to_string())
            .arg(result_arg.unwrap_or_default())
            .arg(error_arg.unwrap_or_default())
            .arg(now.timestamp())
            .arg(crate::models::format_timestamp(now.naive_utc()))
            .arg(self.ttl)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn increment_completed_jobs(&self, id: Uuid) -> StorageResult<u32> {
        let mut conn = self.conn();
        let count: i64 = self
            .recompute_counter
            .key(self.jobs_key(id))
            .key(self.meta_key(id))
            .arg(JobStatus::Completed.to_string())
            .arg("completed_jobs")
            .arg(chrono::Utc::now().timestamp())
            .arg(self.ttl)
            .invoke_async(&mut conn)
            .await?;
        Ok(count.max(0) as u32)
    }

    async fn increment_failed_jobs(&self, id: Uuid) -> StorageResult<u32> {
        let mut conn = self.conn();
        let count: i64 = self
            .recompute_counter
            .key(self.jobs_key(id))
            .key(self.meta_key(id))
            .arg(JobStatus::Failed.to_string())
            .arg("failed_jobs")
            .arg(chrono::Utc::now().timestamp())
            .arg(self.ttl)
            .invoke_async(&mut conn)
            .await?;
        Ok(count.max(0) as u32)
    }

    async fn mark_batch_terminal(
        &self,
        id: Uuid,
        status: BatchStatus,
        sticky: bool,
    ) -> StorageResult<bool> {
        let mut conn = self.conn();
        let applied: i64 = self
            .mark_terminal
            .key(self.meta_key(id))
            .key(self.events_channel())
            .arg(status.to_string())
            .arg(if sticky { "1" } else { "0" })
            .arg(chrono::Utc::now().timestamp())
            .arg(self.ttl)
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(applied > 0)
    }

    async fn get_batch_results(&self, id: Uuid) -> StorageResult<HashMap<Uuid, Value>> {
        let mut conn = self.conn();
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.results_key(id))
            .query_async(&mut conn)
            .await?;

        let mut results = HashMap::with_capacity(raw.len());
        for (job_id, encoded) in raw {
            let job_id: Uuid = job_id
                .parse()
                .map_err(|e| StorageError::Decode(format!("invalid job id in results: {e}")))?;
            results.insert(job_id, serde_json::from_str(&encoded)?);
        }
        Ok(results)
    }

    async fn get_all_jobs(
        &self,
        id: Uuid,
        status: Option<JobStatus>,
    ) -> StorageResult<Vec<BatchJobDefinition>> {
        let jobs = self.load_jobs_map(id).await?;
        Ok(jobs
            .into_iter()
            .filter(|job| status.map(|s| job.status == s).unwrap_or(true))
            .collect())
    }

    async fn get_batches(
        &self,
        filters: &BatchFilters,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<BatchDefinition>> {
        let mut conn = self.conn();
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.index_key())
            .query_async(&mut conn)
            .await?;

        let mut matching = Vec::new();
        for raw in ids {
            let Ok(id) = raw.parse::<Uuid>() else {
                continue;
            };
            match self.get_batch(id).await? {
                Some(batch) if filters.matches(&batch) => matching.push(batch),
                Some(_) => {}
                // Expired entries are pruned lazily.
                None => {
                    redis::cmd("SREM")
                        .arg(self.index_key())
                        .arg(raw)
                        .query_async::<()>(&mut conn)
                        .await?;
                }
            }
        }
        matching.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_batches(&self, filters: &BatchFilters) -> StorageResult<u64> {
        let batches = self.get_batches(filters, usize::MAX, 0).await?;
        Ok(batches.len() as u64)
    }

    async fn delete_batch(&self, id: Uuid) -> StorageResult<bool> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL")
            .arg(self.meta_key(id))
            .arg(self.jobs_key(id))
            .arg(self.results_key(id))
            .arg(self.failed_key(id));
        pipe.cmd("SREM").arg(self.index_key()).arg(id.to_string());
        let (deleted, _removed): (i64, i64) = pipe.query_async(&mut conn).await?;
        Ok(deleted > 0)
    }

    async fn cleanup_old_batches(&self, older_than_days: u32) -> StorageResult<u64> {
        let cutoff = chrono::Utc::now().naive_utc()
            - chrono::Duration::days(i64::from(older_than_days));
        let filters = BatchFilters::default();
        let batches = self.get_batches(&filters, usize::MAX, 0).await?;

        let mut removed = 0;
        for batch in batches {
            let expired = batch.status.is_terminal()
                && batch.completed_at.map(|at| at < cutoff).unwrap_or(false);
            if expired && self.delete_batch(batch.id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn health_check(&self) -> StorageResult<bool> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(pong == "PONG")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobPayload;

    fn sample_batch() -> BatchDefinition {
        let id = Uuid::new_v4();
        let created = chrono::NaiveDate::from_ymd_opt(2025, 5, 20)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        BatchDefinition {
            id,
            batch_type: BatchType::Parallel,
            status: BatchStatus::Running,
            total_jobs: 1,
            completed_jobs: 0,
            failed_jobs: 0,
            context: JsonMap::new(),
            options: BatchOptions::default(),
            queue_name: Some("imports".into()),
            queue_config: Some("batchjob".into()),
            created,
            modified: created,
            completed_at: None,
            jobs: vec![BatchJobDefinition::new(id, 0, JobPayload::new("work"))],
        }
    }

    #[test]
    fn meta_fields_round_trip_through_hash() {
        let batch = sample_batch();
        let fields: HashMap<String, String> = meta_fields(&batch).unwrap().into_iter().collect();
        assert_eq!(fields["type"], "parallel");
        assert_eq!(fields["status"], "running");

        let hydrated = batch_from_meta(&fields, batch.jobs.clone()).unwrap();
        assert_eq!(hydrated.id, batch.id);
        assert_eq!(hydrated.created, batch.created);
        assert_eq!(hydrated.queue_name.as_deref(), Some("imports"));
        assert_eq!(hydrated.jobs.len(), 1);
    }

    #[test]
    fn unix_timestamps_hydrate_to_wire_format() {
        let batch = sample_batch();
        let fields: HashMap<String, String> = meta_fields(&batch).unwrap().into_iter().collect();
        // Stored as unix seconds...
        assert!(fields["created"].chars().all(|c| c.is_ascii_digit()));
        // ...and hydrated back to the same instant.
        let hydrated = batch_from_meta(&fields, vec![]).unwrap();
        assert_eq!(
            crate::models::format_timestamp(hydrated.created),
            "2025-05-20 10:30:00"
        );
    }

    #[test]
    fn missing_meta_fields_are_decode_errors() {
        let meta = HashMap::new();
        assert!(matches!(
            batch_from_meta(&meta, vec![]),
            Err(StorageError::Decode(_))
        ));
    }
}
