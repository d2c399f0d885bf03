//! Configuration for the batch queue system.
//!
//! All values deserialize from TOML with defaults, so an empty file (or no
//! file at all) yields a working development configuration. The loaded
//! [`BatchQueueConfig`] is an explicit value threaded through
//! [`BatchManager`](crate::orchestration::BatchManager) construction; there
//! is no process-wide singleton.

mod loader;

pub use loader::ConfigLoader;

use crate::constants::{
    DEFAULT_PARALLEL_QUEUE, DEFAULT_REDIS_PREFIX, DEFAULT_REDIS_TTL_SECONDS,
    DEFAULT_SEQUENTIAL_QUEUE,
};
use crate::errors::{ConfigResult, ConfigurationError};
use crate::models::BatchType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Root configuration, keyed `[storage]`, `[sql]`, `[redis]`, `[queue]`,
/// `[defaults]`, `[cleanup]`, `[queues]` in TOML.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchQueueConfig {
    pub storage: StorageBackendKind,
    pub sql: SqlConfig,
    pub redis: RedisConfig,
    pub queue: QueueSection,
    pub defaults: DefaultsConfig,
    pub cleanup: CleanupConfig,
    pub queues: QueuesConfig,
}

impl BatchQueueConfig {
    /// Validate cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.redis.ttl == 0 {
            return Err(ConfigurationError::Invalid(
                "redis.ttl must be greater than zero".to_string(),
            ));
        }
        if self.redis.port == 0 {
            return Err(ConfigurationError::Invalid(
                "redis.port must be greater than zero".to_string(),
            ));
        }
        for (name, entry) in self.queues.named.iter().chain(self.queues.types.iter()) {
            if entry.queue_config.trim().is_empty() {
                return Err(ConfigurationError::Invalid(format!(
                    "queue entry '{name}' has an empty queue_config"
                )));
            }
        }
        Ok(())
    }
}

/// Which durable backend holds batch state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    Sql,
    Redis,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SqlConfig {
    /// Connection string for the PostgreSQL pool.
    pub connection: String,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            connection: "postgresql://localhost/batchqueue_development".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub password: Option<String>,
    pub persistent: bool,
    /// Connect timeout, seconds.
    pub timeout: u64,
    /// Read timeout, seconds.
    pub read_timeout: u64,
    /// Key namespace prefix.
    pub prefix: String,
    /// State TTL, seconds; renewed on every write.
    pub ttl: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            persistent: true,
            timeout: 5,
            read_timeout: 5,
            prefix: DEFAULT_REDIS_PREFIX.to_string(),
            ttl: DEFAULT_REDIS_TTL_SECONDS,
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// Default queue name applied to batches that do not pick one explicitly.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueSection {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DefaultsConfig {
    /// Fire the failure callback on the first failing job of a parallel
    /// batch rather than once the batch has fully drained.
    pub fail_on_first_error: bool,
    pub max_retries: u32,
    /// Execution timeout hint, seconds. Consumed by external monitoring;
    /// the orchestrator never preempts a running job.
    pub timeout: u64,
    /// When true, the first terminal status a batch reaches is final and a
    /// later counter check can never overwrite it. When false, the last
    /// committed transition wins.
    pub sticky_terminal_state: bool,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            fail_on_first_error: false,
            max_retries: 3,
            timeout: 3600,
            sticky_terminal_state: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub enabled: bool,
    pub older_than_days: u32,
    /// Seconds between cleanup sweeps when the host schedules them.
    pub run_interval: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            older_than_days: 30,
            run_interval: 86_400,
        }
    }
}

/// Queue routing tables: per-type defaults, per-type overrides, and fully
/// named queues operators can point batches at.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub default: QueueTypeDefaults,
    pub named: HashMap<String, NamedQueueConfig>,
    pub types: HashMap<String, NamedQueueConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueTypeDefaults {
    pub parallel: String,
    pub sequential: String,
}

impl Default for QueueTypeDefaults {
    fn default() -> Self {
        Self {
            parallel: DEFAULT_PARALLEL_QUEUE.to_string(),
            sequential: DEFAULT_SEQUENTIAL_QUEUE.to_string(),
        }
    }
}

impl QueueTypeDefaults {
    pub fn for_type(&self, batch_type: BatchType) -> &str {
        match batch_type {
            BatchType::Parallel => &self.parallel,
            BatchType::Sequential => &self.sequential,
        }
    }
}

/// A named or per-type queue entry: the concrete queue to enqueue onto and
/// the processor variant workers run against it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NamedQueueConfig {
    pub queue_config: String,
    #[serde(default)]
    pub processor: ProcessorKind,
}

/// Worker-side processor variant for a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorKind {
    #[default]
    Parallel,
    Chain,
}
