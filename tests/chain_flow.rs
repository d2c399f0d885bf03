//! End-to-end coverage of sequential chains: strict ordering, context
//! accumulation, result collection through a completion callback, and the
//! single-step edge case.

mod common;

use async_trait::async_trait;
use batchqueue_core::{
    BatchStatus, BatchStorage, BatchUpdate, CallbackSpec, JobExecutionError, JobHandler,
    JobOutcome, JobSpec, JsonMap, QueueClient,
};
use common::{Handles, TagRecorder};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Chain step that reports its `v` arg as its result.
struct EchoV {
    value: Option<Value>,
}

#[async_trait]
impl JobHandler for EchoV {
    async fn execute(&mut self, args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        self.value = args.get("v").cloned();
        Ok(JobOutcome::Complete)
    }

    fn result(&self) -> Option<Value> {
        self.value.clone()
    }
}

/// Completion callback that folds every job result into the batch context:
/// `accumulated_sum` and the raw `results` list.
struct Accumulate {
    handles: Handles,
}

#[async_trait]
impl JobHandler for Accumulate {
    async fn execute(&mut self, args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        let batch_id: Uuid = args
            .get("batch_id")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| JobExecutionError::new("callback missing batch_id"))?;

        let storage = &self.handles.storage;
        let results = storage
            .get_batch_results(batch_id)
            .await
            .map_err(|e| JobExecutionError::new(e.to_string()))?;
        let sum: i64 = results.values().filter_map(Value::as_i64).sum();

        let batch = storage
            .get_batch(batch_id)
            .await
            .map_err(|e| JobExecutionError::new(e.to_string()))?
            .ok_or_else(|| JobExecutionError::new("batch vanished"))?;
        let mut context = batch.context;
        context.insert("accumulated_sum".into(), Value::from(sum));
        context.insert(
            "results".into(),
            Value::Array(results.values().cloned().collect()),
        );
        storage
            .update_batch(batch_id, BatchUpdate::context(context))
            .await
            .map_err(|e| JobExecutionError::new(e.to_string()))?;
        Ok(JobOutcome::Complete)
    }
}

/// Chain step that stamps a `seen_step` marker into the shared context.
struct StampContext {
    context: JsonMap,
}

#[async_trait]
impl JobHandler for StampContext {
    async fn execute(&mut self, args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        if let Some(stamp) = args.get("stamp") {
            self.context.insert("seen_step".into(), stamp.clone());
        }
        Ok(JobOutcome::Complete)
    }

    fn set_context(&mut self, context: &JsonMap) {
        self.context = context.clone();
    }

    fn context(&self) -> Option<JsonMap> {
        Some(self.context.clone())
    }
}

#[tokio::test]
async fn chain_of_three_accumulates_results() {
    let harness = common::build(|registry, handles| {
        registry.register("echo_v", || Box::new(EchoV { value: None }));
        let handles = handles.clone();
        registry.register("accumulate", move || {
            Box::new(Accumulate {
                handles: handles.clone(),
            })
        });
    });

    let jobs = [1, 2, 3]
        .into_iter()
        .map(|v| {
            let mut args = JsonMap::new();
            args.insert("v".into(), Value::from(v));
            JobSpec::detailed("echo_v", args)
        })
        .collect();
    let batch_id = harness
        .manager
        .chain(jobs)
        .on_complete(CallbackSpec::new("accumulate"))
        .dispatch()
        .await
        .unwrap();

    harness.drain_all().await;

    let batch = harness.manager.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_jobs, 3);
    assert_eq!(
        batch.context.get("accumulated_sum").and_then(Value::as_i64),
        Some(6)
    );
    assert_eq!(
        batch
            .context
            .get("results")
            .and_then(Value::as_array)
            .map(Vec::len),
        Some(3)
    );
}

#[tokio::test]
async fn chain_steps_run_in_strict_position_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let harness = common::build(|registry, _| {
        let log = log.clone();
        registry.register("record", move || Box::new(TagRecorder { log: log.clone() }));
    });

    let jobs = ["first", "second", "third"]
        .into_iter()
        .map(|tag| {
            let mut args = JsonMap::new();
            args.insert("tag".into(), Value::from(tag));
            JobSpec::detailed("record", args)
        })
        .collect();
    let batch_id = harness.manager.chain(jobs).dispatch().await.unwrap();

    // Only the first step is enqueued at dispatch; the rest are released
    // one at a time as predecessors complete.
    assert_eq!(harness.queue.queue_depth("chainedjobs").await.unwrap(), 1);

    harness.drain_all().await;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["first".to_string(), "second".into(), "third".into()]
    );
    let batch = harness.manager.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
}

#[tokio::test]
async fn context_written_by_one_step_is_visible_to_the_next() {
    let harness = common::build(|registry, _| {
        registry.register("stamp", || {
            Box::new(StampContext {
                context: JsonMap::new(),
            })
        });
    });

    let mut first_args = JsonMap::new();
    first_args.insert("stamp".into(), Value::from("one"));
    let batch_id = harness
        .manager
        .chain(vec![
            JobSpec::detailed("stamp", first_args),
            JobSpec::class("stamp"),
        ])
        .context_value("origin", Value::from("test"))
        .dispatch()
        .await
        .unwrap();

    harness.drain_all().await;

    let batch = harness.manager.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    // The second step saw (and preserved) what the first one wrote.
    assert_eq!(
        batch.context.get("seen_step").and_then(Value::as_str),
        Some("one")
    );
    assert_eq!(
        batch.context.get("origin").and_then(Value::as_str),
        Some("test")
    );
}

#[tokio::test]
async fn single_step_chain_completes_without_a_next_enqueue() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let harness = common::build(|registry, _| {
        let log = log.clone();
        registry.register("record", move || Box::new(TagRecorder { log: log.clone() }));
    });

    let batch_id = harness
        .manager
        .chain(vec![JobSpec::class("record")])
        .dispatch()
        .await
        .unwrap();
    harness.drain_all().await;

    let batch = harness.manager.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.completed_jobs, 1);
    assert_eq!(harness.queue.queue_depth("chainedjobs").await.unwrap(), 0);
}
