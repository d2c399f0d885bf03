//! End-to-end coverage of dynamic job appending: a running chain step
//! extends its own batch, and context mutated by a step propagates to the
//! jobs it appended.

mod common;

use async_trait::async_trait;
use batchqueue_core::{
    BatchManager, BatchStatus, JobExecutionError, JobHandler, JobOutcome, JobSpec, JobStatus,
    JsonMap,
};
use common::TagRecorder;
use serde_json::Value;
use std::sync::{Arc, Mutex, OnceLock};
use uuid::Uuid;

fn batch_id_arg(args: &JsonMap) -> Result<Uuid, JobExecutionError> {
    args.get("batch_id")
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| JobExecutionError::new("missing batch_id"))
}

/// Chain step that appends more jobs to its own batch while running.
struct Extender {
    manager: Arc<OnceLock<BatchManager>>,
    log: Arc<Mutex<Vec<String>>>,
    to_add: Vec<JobSpec>,
}

#[async_trait]
impl JobHandler for Extender {
    async fn execute(&mut self, args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        self.log.lock().unwrap().push("extender".into());
        let batch_id = batch_id_arg(args)?;
        let manager = self.manager.get().expect("manager not wired");
        manager
            .add_jobs(batch_id, std::mem::take(&mut self.to_add))
            .await
            .map_err(|e| JobExecutionError::new(e.to_string()))?;
        Ok(JobOutcome::Complete)
    }
}

/// Chain step that rewrites the shared context and appends a receiver job.
struct Updater {
    manager: Arc<OnceLock<BatchManager>>,
    context: JsonMap,
}

#[async_trait]
impl JobHandler for Updater {
    async fn execute(&mut self, args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        self.context.insert("step".into(), Value::from(2));
        self.context.insert("data".into(), Value::from("value"));

        let batch_id = batch_id_arg(args)?;
        let manager = self.manager.get().expect("manager not wired");
        manager
            .add_jobs(batch_id, vec![JobSpec::class("receiver")])
            .await
            .map_err(|e| JobExecutionError::new(e.to_string()))?;
        Ok(JobOutcome::Complete)
    }

    fn set_context(&mut self, context: &JsonMap) {
        self.context = context.clone();
    }

    fn context(&self) -> Option<JsonMap> {
        Some(self.context.clone())
    }
}

/// Records the context it receives for later assertions.
struct Receiver {
    seen: Arc<Mutex<Option<JsonMap>>>,
}

#[async_trait]
impl JobHandler for Receiver {
    async fn execute(&mut self, _args: &JsonMap) -> Result<JobOutcome, JobExecutionError> {
        Ok(JobOutcome::Complete)
    }

    fn set_context(&mut self, context: &JsonMap) {
        *self.seen.lock().unwrap() = Some(context.clone());
    }
}

fn tagged(tag: &str) -> JobSpec {
    let mut args = JsonMap::new();
    args.insert("tag".into(), Value::from(tag));
    JobSpec::detailed("record", args)
}

#[tokio::test]
async fn a_running_step_can_extend_its_own_chain() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let harness = common::build(|registry, handles| {
        let recorder_log = log.clone();
        registry.register("record", move || {
            Box::new(TagRecorder {
                log: recorder_log.clone(),
            })
        });
        let manager = handles.manager.clone();
        let extender_log = log.clone();
        registry.register("extender", move || {
            Box::new(Extender {
                manager: manager.clone(),
                log: extender_log.clone(),
                to_add: vec![tagged("j3"), tagged("j4")],
            })
        });
    });

    let batch_id = harness
        .manager
        .chain(vec![JobSpec::class("extender"), tagged("j2")])
        .dispatch()
        .await
        .unwrap();

    harness.drain_all().await;

    let batch = harness.manager.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.total_jobs, 4);
    assert_eq!(batch.completed_jobs, 4);
    let positions: Vec<_> = batch.jobs.iter().map(|job| job.position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);
    assert!(batch.jobs.iter().all(|job| job.status == JobStatus::Completed));

    // The appended jobs ran after the pre-existing tail.
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "extender".to_string(),
            "j2".into(),
            "j3".into(),
            "j4".into()
        ]
    );
}

#[tokio::test]
async fn context_mutations_propagate_to_appended_jobs() {
    let seen = Arc::new(Mutex::new(None));
    let harness = common::build(|registry, handles| {
        let manager = handles.manager.clone();
        registry.register("updater", move || {
            Box::new(Updater {
                manager: manager.clone(),
                context: JsonMap::new(),
            })
        });
        let seen = seen.clone();
        registry.register("receiver", move || {
            Box::new(Receiver { seen: seen.clone() })
        });
    });

    let batch_id = harness
        .manager
        .chain(vec![JobSpec::class("updater")])
        .context_value("step", Value::from(1))
        .dispatch()
        .await
        .unwrap();

    harness.drain_all().await;

    let expected: JsonMap = serde_json::from_value(serde_json::json!({
        "step": 2,
        "data": "value",
    }))
    .unwrap();

    // The appended receiver saw the context as mutated by its predecessor.
    let recorded = seen.lock().unwrap().clone().expect("receiver ran");
    assert_eq!(recorded, expected);

    let batch = harness.manager.get_batch(batch_id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.total_jobs, 2);
    assert_eq!(batch.context, expected);
}
