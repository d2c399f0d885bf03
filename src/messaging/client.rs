//! The queue transport contract.

use super::envelope::JobEnvelope;
use crate::errors::MessagingResult;
use async_trait::async_trait;

/// What a processor tells the transport to do with a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobResponse {
    /// Done; delete the message.
    Ack,
    /// Poison; delete the message without retrying, operators investigate.
    Reject,
    /// Leave the message for redelivery under the transport's retry policy.
    Requeue,
}

/// One received message: the transport's identifier plus the decoded
/// envelope.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub envelope: JobEnvelope,
}

/// Durable FIFO transport with at-least-once delivery per named queue.
///
/// Redeliveries are permitted at any time; all orchestration logic driven
/// from deliveries is idempotent against them.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Create the queue if it does not exist.
    async fn create_queue(&self, queue: &str) -> MessagingResult<()>;

    /// Durably enqueue an envelope; returns the transport's message id.
    async fn push(&self, queue: &str, envelope: &JobEnvelope) -> MessagingResult<String>;

    /// Claim up to `limit` messages, invisible to other consumers for
    /// `visibility_timeout` seconds.
    async fn receive(
        &self,
        queue: &str,
        limit: usize,
        visibility_timeout: i64,
    ) -> MessagingResult<Vec<Delivery>>;

    /// Delete a message (terminal acknowledge or poison discard).
    async fn delete_message(&self, queue: &str, message_id: &str) -> MessagingResult<()>;

    /// Messages currently in the queue, visible or claimed.
    async fn queue_depth(&self, queue: &str) -> MessagingResult<usize>;
}
