//! End-to-end coverage of Saga-style compensation: rollback of completed
//! chain steps in reverse order, outcome reporting onto the original
//! batch, cancellation, and cleanup of tombstoned batches.

mod common;

use async_trait::async_trait;
use batchqueue_core::{
    BatchQueueError, BatchStatus, CallbackSpec, JobExecutionError, JobHandler, JobOutcome,
    JobSpec, JobStatus, JsonMap,
};
use common::{AlwaysFail, CallbackRecorder, ReportValue};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Forward job standing in for a side-effecting operation; reports the
/// `action` it performed.
struct Operation {
    action: Option<Value>,
}

#[async_trait]
impl JobHandler for Operation {
    async fn execute(&mut self, args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        self.action = args.get("action").cloned();
        Ok(JobOutcome::Complete)
    }

    fn result(&self) -> Option<Value> {
        self.action.clone()
    }
}

/// Rollback partner: appends `{action}` to the chain context's
/// `compensations` list, newest rollback first.
struct Undo {
    context: JsonMap,
}

#[async_trait]
impl JobHandler for Undo {
    async fn execute(&mut self, args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        let action = args.get("action").cloned().unwrap_or(Value::Null);
        let mut entry = JsonMap::new();
        entry.insert("action".into(), action);

        let mut compensations = self
            .context
            .get("compensations")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        compensations.push(Value::Object(entry));
        self.context
            .insert("compensations".into(), Value::Array(compensations));
        Ok(JobOutcome::Complete)
    }

    fn set_context(&mut self, context: &JsonMap) {
        self.context = context.clone();
    }

    fn context(&self) -> Option<JsonMap> {
        Some(self.context.clone())
    }
}

fn op_spec(action: &str, compensation: &str) -> JobSpec {
    let mut args = JsonMap::new();
    args.insert("action".into(), Value::from(action));
    JobSpec::detailed_with_compensation("operation", args, compensation)
}

fn register_compensation_handlers(registry: &mut batchqueue_core::HandlerRegistry) {
    registry.register("operation", || Box::new(Operation { action: None }));
    registry.register("undo", || {
        Box::new(Undo {
            context: JsonMap::new(),
        })
    });
    registry.register("explode", || Box::new(AlwaysFail));
}

#[tokio::test]
async fn chain_failure_launches_compensation() {
    let harness = common::build(|registry, _| {
        register_compensation_handlers(registry);
    });

    let batch_id = harness
        .manager
        .chain(vec![
            op_spec("create_order", "undo"),
            JobSpec::class("explode"),
        ])
        .dispatch()
        .await
        .unwrap();

    harness.drain_all().await;

    let batch = harness.manager.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    assert_eq!(batch.completed_jobs, 1);
    assert_eq!(batch.failed_jobs, 1);

    // The rollback chain ran to completion and reported back.
    let compensation_id: Uuid = batch
        .context
        .get("compensation_batch_id")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
        .expect("compensation batch id recorded on the original context");
    let compensation = harness.manager.get_batch(compensation_id).await.unwrap();
    assert_eq!(compensation.status, BatchStatus::Completed);
    assert_eq!(
        batch
            .context
            .get("compensation_status")
            .and_then(Value::as_str),
        Some("completed")
    );
    assert!(batch.context.contains_key("compensation_completed_at"));

    let compensations = batch
        .context
        .get("compensations")
        .and_then(Value::as_array)
        .unwrap();
    assert_eq!(compensations.len(), 1);
    assert_eq!(
        compensations[0].get("action").and_then(Value::as_str),
        Some("create_order")
    );
}

#[tokio::test]
async fn multi_step_compensation_rolls_back_in_reverse_order() {
    let harness = common::build(|registry, _| {
        register_compensation_handlers(registry);
    });

    let batch_id = harness
        .manager
        .chain(vec![
            op_spec("a", "undo"),
            op_spec("b", "undo"),
            op_spec("c", "undo"),
            JobSpec::class("explode"),
        ])
        .dispatch()
        .await
        .unwrap();

    harness.drain_all().await;

    let batch = harness.manager.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);

    let actions: Vec<&str> = batch
        .context
        .get("compensations")
        .and_then(Value::as_array)
        .unwrap()
        .iter()
        .filter_map(|entry| entry.get("action").and_then(Value::as_str))
        .collect();
    // Newest side effect rolled back first; the failing job has no entry.
    assert_eq!(actions, vec!["c", "b", "a"]);

    // The compensation chain mirrors the rollback-eligible jobs.
    let compensation_id: Uuid = batch
        .context
        .get("compensation_batch_id")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
        .unwrap();
    let compensation = harness.manager.get_batch(compensation_id).await.unwrap();
    assert_eq!(compensation.total_jobs, 3);
    assert_eq!(compensation.status, BatchStatus::Completed);
}

#[tokio::test]
async fn positions_after_the_failure_stay_pending() {
    let harness = common::build(|registry, _| {
        register_compensation_handlers(registry);
    });

    let batch_id = harness
        .manager
        .chain(vec![
            op_spec("a", "undo"),
            JobSpec::class("explode"),
            op_spec("c", "undo"),
        ])
        .dispatch()
        .await
        .unwrap();

    harness.drain_all().await;

    let batch = harness.manager.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
    let statuses: Vec<JobStatus> = batch.jobs.iter().map(|job| job.status).collect();
    assert_eq!(
        statuses,
        vec![JobStatus::Completed, JobStatus::Failed, JobStatus::Pending]
    );

    // Only the completed step was compensated.
    let actions: Vec<&str> = batch
        .context
        .get("compensations")
        .and_then(Value::as_array)
        .unwrap()
        .iter()
        .filter_map(|entry| entry.get("action").and_then(Value::as_str))
        .collect();
    assert_eq!(actions, vec!["a"]);
}

#[tokio::test]
async fn failure_callback_fires_when_the_chain_fails() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let harness = common::build(|registry, _| {
        register_compensation_handlers(registry);
        let calls = calls.clone();
        registry.register("notify_failure", move || {
            Box::new(CallbackRecorder {
                calls: calls.clone(),
            })
        });
    });

    harness
        .manager
        .chain(vec![op_spec("a", "undo"), JobSpec::class("explode")])
        .on_failure(CallbackSpec::new("notify_failure"))
        .dispatch()
        .await
        .unwrap();

    harness.drain_all().await;

    let recorded = calls.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(
        recorded[0].get("status").and_then(Value::as_str),
        Some("failed")
    );
    assert_eq!(
        recorded[0].get("error").and_then(Value::as_str),
        Some("intentional failure")
    );
}

#[tokio::test]
async fn manual_compensation_rolls_back_a_completed_chain() {
    let harness = common::build(|registry, _| {
        register_compensation_handlers(registry);
    });

    let batch_id = harness
        .manager
        .chain(vec![op_spec("provision", "undo"), op_spec("announce", "undo")])
        .dispatch()
        .await
        .unwrap();
    harness.drain_all().await;
    assert_eq!(
        harness.manager.get_batch(batch_id).await.unwrap().status,
        BatchStatus::Completed
    );

    let compensation_id = harness
        .manager
        .compensate(batch_id)
        .await
        .unwrap()
        .expect("two completed jobs carry compensations");
    harness.drain_all().await;

    let compensation = harness.manager.get_batch(compensation_id).await.unwrap();
    assert_eq!(compensation.status, BatchStatus::Completed);
    let batch = harness.manager.get_batch(batch_id).await.unwrap();
    let actions: Vec<&str> = batch
        .context
        .get("compensations")
        .and_then(Value::as_array)
        .unwrap()
        .iter()
        .filter_map(|entry| entry.get("action").and_then(Value::as_str))
        .collect();
    assert_eq!(actions, vec!["announce", "provision"]);
}

#[tokio::test]
async fn cancel_without_compensation_deletes_the_batch() {
    let harness = common::build(|registry, _| {
        registry.register("report_value", || Box::new(ReportValue));
    });

    let batch_id = harness
        .manager
        .batch(vec![JobSpec::class("report_value"); 2])
        .dispatch()
        .await
        .unwrap();

    harness.manager.cancel_batch(batch_id).await.unwrap();
    let err = harness.manager.get_batch(batch_id).await.unwrap_err();
    assert!(matches!(err, BatchQueueError::BatchNotFound(_)));

    // Workers tolerate the in-flight messages of the deleted batch.
    let processed = harness.drain_all().await;
    assert_eq!(processed, 2);
}

#[tokio::test]
async fn cancel_with_compensation_keeps_a_tombstone_until_cleanup() {
    let harness = common::build(|registry, _| {
        register_compensation_handlers(registry);
    });

    let batch_id = harness
        .manager
        .chain(vec![op_spec("reserve", "undo"), op_spec("confirm", "undo")])
        .dispatch()
        .await
        .unwrap();
    harness.drain_all().await;

    harness.manager.cancel_batch(batch_id).await.unwrap();
    harness.drain_all().await;

    // The tombstone carries the rollback outcome.
    let batch = harness.manager.get_batch(batch_id).await.unwrap();
    assert_eq!(
        batch
            .context
            .get("compensation_status")
            .and_then(Value::as_str),
        Some("completed")
    );

    // Cleanup reaps every terminal batch past the cut-off (here: all).
    let removed = harness.manager.cleanup(0).await.unwrap();
    assert!(removed >= 1);
    assert!(matches!(
        harness.manager.get_batch(batch_id).await.unwrap_err(),
        BatchQueueError::BatchNotFound(_)
    ));
}
