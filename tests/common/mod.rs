//! Shared harness for the end-to-end orchestration tests: in-memory
//! storage and queue, a handler registry the test configures, and worker
//! drain helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use batchqueue_core::{
    BatchManager, BatchQueueConfig, HandlerRegistry, InMemoryBatchStorage, InMemoryQueueClient,
    JobExecutionError, JobHandler, JobOutcome, JsonMap, QueueWorker,
};
use serde_json::Value;
use std::sync::{Arc, Mutex, OnceLock};

/// Handles a test can capture into its handler factories before the
/// manager exists.
#[derive(Clone)]
pub struct Handles {
    pub storage: Arc<InMemoryBatchStorage>,
    pub queue: Arc<InMemoryQueueClient>,
    /// Filled once the manager is built; handlers that call back into the
    /// orchestrator (e.g. to append jobs) read it lazily.
    pub manager: Arc<OnceLock<BatchManager>>,
}

pub struct Harness {
    pub manager: BatchManager,
    pub storage: Arc<InMemoryBatchStorage>,
    pub queue: Arc<InMemoryQueueClient>,
}

impl Harness {
    /// Drain both default queues until neither yields messages, following
    /// work that earlier rounds enqueue (next steps, callbacks,
    /// compensation chains). Returns the total number of deliveries.
    pub async fn drain_all(&self) -> usize {
        let parallel = QueueWorker::new(&self.manager, "batchjob");
        let chain = QueueWorker::new(&self.manager, "chainedjobs");

        let mut total = 0;
        loop {
            let processed = parallel.drain().await.unwrap() + chain.drain().await.unwrap();
            if processed == 0 {
                return total;
            }
            total += processed;
        }
    }
}

/// Build a harness, letting the test register handlers with access to the
/// shared handles.
pub fn build(configure: impl FnOnce(&mut HandlerRegistry, &Handles)) -> Harness {
    build_with_config(BatchQueueConfig::default(), configure)
}

pub fn build_with_config(
    config: BatchQueueConfig,
    configure: impl FnOnce(&mut HandlerRegistry, &Handles),
) -> Harness {
    let handles = Handles {
        storage: Arc::new(InMemoryBatchStorage::new()),
        queue: Arc::new(InMemoryQueueClient::new()),
        manager: Arc::new(OnceLock::new()),
    };

    let mut registry = HandlerRegistry::new();
    configure(&mut registry, &handles);

    let manager = BatchManager::new(
        handles.storage.clone(),
        handles.queue.clone(),
        registry,
        config,
    );
    handles
        .manager
        .set(manager.clone())
        .expect("manager slot set twice");

    Harness {
        manager,
        storage: handles.storage,
        queue: handles.queue,
    }
}

/// Job that completes and reports `{"value": 1}`.
pub struct ReportValue;

#[async_trait]
impl JobHandler for ReportValue {
    async fn execute(&mut self, _args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        Ok(JobOutcome::Complete)
    }

    fn result(&self) -> Option<Value> {
        Some(serde_json::json!({"value": 1}))
    }
}

/// Job that always fails.
pub struct AlwaysFail;

#[async_trait]
impl JobHandler for AlwaysFail {
    async fn execute(&mut self, _args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        Err(JobExecutionError::new("intentional failure"))
    }
}

/// Job that appends the `tag` arg it was invoked with to a shared log.
pub struct TagRecorder {
    pub log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobHandler for TagRecorder {
    async fn execute(&mut self, args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        let tag = args
            .get("tag")
            .and_then(Value::as_str)
            .unwrap_or("job")
            .to_string();
        self.log.lock().unwrap().push(tag);
        Ok(JobOutcome::Complete)
    }
}

/// Callback that records every args map it is invoked with.
pub struct CallbackRecorder {
    pub calls: Arc<Mutex<Vec<JsonMap>>>,
}

#[async_trait]
impl JobHandler for CallbackRecorder {
    async fn execute(&mut self, args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        self.calls.lock().unwrap().push(args.clone());
        Ok(JobOutcome::Complete)
    }
}
