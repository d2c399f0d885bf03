//! Queue name resolution.
//!
//! Resolves a batch's logical routing (type plus optional named queue)
//! to the concrete queue its messages are enqueued onto, in priority
//! order:
//!
//! 1. an explicit `queue_config` set on the builder,
//! 2. a configured named queue matching the batch's `queue_name`,
//! 3. a per-type override from `queues.types`,
//! 4. the per-type defaults (`batchjob` / `chainedjobs`).

use crate::config::{BatchQueueConfig, ProcessorKind};
use crate::models::BatchType;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct QueueResolver {
    config: Arc<BatchQueueConfig>,
}

impl QueueResolver {
    pub fn new(config: Arc<BatchQueueConfig>) -> Self {
        Self { config }
    }

    /// Resolve the concrete queue for a batch.
    pub fn resolve(
        &self,
        batch_type: BatchType,
        queue_name: Option<&str>,
        explicit_queue_config: Option<&str>,
    ) -> String {
        if let Some(explicit) = explicit_queue_config {
            return explicit.to_string();
        }
        if let Some(name) = queue_name {
            if let Some(named) = self.config.queues.named.get(name) {
                return named.queue_config.clone();
            }
        }
        if let Some(entry) = self.config.queues.types.get(&batch_type.to_string()) {
            return entry.queue_config.clone();
        }
        self.config.queues.default.for_type(batch_type).to_string()
    }

    /// The processor variant a worker should run against a queue.
    ///
    /// Named and per-type entries carry it explicitly; the built-in
    /// defaults imply it from the batch type they serve.
    pub fn processor_for(&self, queue: &str) -> ProcessorKind {
        for entry in self
            .config
            .queues
            .named
            .values()
            .chain(self.config.queues.types.values())
        {
            if entry.queue_config == queue {
                return entry.processor;
            }
        }
        if queue == self.config.queues.default.sequential {
            ProcessorKind::Chain
        } else {
            ProcessorKind::Parallel
        }
    }
}
