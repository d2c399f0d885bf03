//! Queue consumer loop.
//!
//! Each worker owns one queue and the processor variant configured for it;
//! the variant is a tagged enum, chosen per queue, not a trait hierarchy.
//! Production deployments typically run many workers across processes; the
//! loop here is also what the integration tests drive synchronously.

use crate::config::ProcessorKind;
use crate::errors::MessagingResult;
use crate::messaging::{Delivery, JobResponse, QueueClient};
use crate::orchestration::{BatchManager, ChainProcessor, ParallelProcessor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_VISIBILITY_TIMEOUT: i64 = 30;
const DEFAULT_RECEIVE_LIMIT: usize = 10;

/// The processor variant a worker runs against its queue.
#[derive(Debug, Clone)]
pub enum QueueProcessor {
    Parallel(ParallelProcessor),
    Chain(ChainProcessor),
}

impl QueueProcessor {
    pub fn for_kind(manager: BatchManager, kind: ProcessorKind) -> Self {
        match kind {
            ProcessorKind::Parallel => Self::Parallel(ParallelProcessor::new(manager)),
            ProcessorKind::Chain => Self::Chain(ChainProcessor::new(manager)),
        }
    }

    pub async fn process(&self, delivery: &Delivery) -> JobResponse {
        match self {
            Self::Parallel(processor) => processor.process(delivery).await,
            Self::Chain(processor) => processor.process(delivery).await,
        }
    }
}

/// Single-queue consumer applying processor responses to the transport.
pub struct QueueWorker {
    queue: Arc<dyn QueueClient>,
    queue_name: String,
    processor: QueueProcessor,
    visibility_timeout: i64,
    receive_limit: usize,
    poll_interval: Duration,
    shutdown_when_empty: bool,
}

impl QueueWorker {
    /// Build a worker for `queue_name`, selecting the processor variant
    /// from the manager's queue configuration.
    pub fn new(manager: &BatchManager, queue_name: impl Into<String>) -> Self {
        let queue_name = queue_name.into();
        let kind = manager.resolver().processor_for(&queue_name);
        Self {
            queue: manager.queue_client(),
            queue_name,
            processor: QueueProcessor::for_kind(manager.clone(), kind),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            receive_limit: DEFAULT_RECEIVE_LIMIT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            shutdown_when_empty: false,
        }
    }

    pub fn with_processor(mut self, processor: QueueProcessor) -> Self {
        self.processor = processor;
        self
    }

    pub fn visibility_timeout(mut self, seconds: i64) -> Self {
        self.visibility_timeout = seconds;
        self
    }

    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Shut the run loop down once the queue is empty.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_empty = true;
        self
    }

    /// Receive one round of messages and process them. Returns how many
    /// deliveries were handled.
    pub async fn run_once(&self) -> MessagingResult<usize> {
        let deliveries = self
            .queue
            .receive(&self.queue_name, self.receive_limit, self.visibility_timeout)
            .await?;
        let count = deliveries.len();

        for delivery in deliveries {
            let response = self.processor.process(&delivery).await;
            match response {
                JobResponse::Ack | JobResponse::Reject => {
                    self.queue
                        .delete_message(&self.queue_name, &delivery.message_id)
                        .await?;
                }
                JobResponse::Requeue => {
                    // Left in place; the transport redelivers it after the
                    // visibility timeout.
                    trace!(message_id = %delivery.message_id, "message left for redelivery");
                }
            }
            debug!(message_id = %delivery.message_id, ?response, "processed delivery");
        }
        Ok(count)
    }

    /// Process until the queue yields nothing, following messages that
    /// earlier rounds enqueue. Returns the total processed.
    pub async fn drain(&self) -> MessagingResult<usize> {
        let mut total = 0;
        loop {
            let processed = self.run_once().await?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    /// Poll forever (or until the queue empties, if configured).
    pub async fn run(&self) -> MessagingResult<()> {
        info!(queue = %self.queue_name, "worker started");
        loop {
            let processed = self.run_once().await?;
            if processed == 0 {
                if self.shutdown_when_empty {
                    info!(queue = %self.queue_name, "queue empty, worker shutting down");
                    return Ok(());
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}

impl std::fmt::Debug for QueueWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueWorker")
            .field("queue_name", &self.queue_name)
            .field("visibility_timeout", &self.visibility_timeout)
            .field("shutdown_when_empty", &self.shutdown_when_empty)
            .finish()
    }
}
