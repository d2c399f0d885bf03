//! In-memory queue transport for tests and demos.
//!
//! Messages live in per-queue `VecDeque`s guarded by a tokio mutex, with
//! visibility-timeout claim semantics: a received message stays in the
//! queue but is hidden from other consumers until its timeout expires or
//! it is deleted.

use super::client::{Delivery, JobResponse, QueueClient};
use super::envelope::JobEnvelope;
use crate::errors::{MessagingError, MessagingResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct StoredMessage {
    id: i64,
    envelope: JobEnvelope,
    visible_after: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Queue {
    messages: VecDeque<StoredMessage>,
    next_id: i64,
}

/// Testing transport implementing the full [`QueueClient`] contract.
#[derive(Debug, Default)]
pub struct InMemoryQueueClient {
    queues: Mutex<HashMap<String, Queue>>,
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a processor response the way a worker loop would.
    pub async fn apply_response(
        &self,
        queue: &str,
        message_id: &str,
        response: JobResponse,
    ) -> MessagingResult<()> {
        match response {
            JobResponse::Ack | JobResponse::Reject => self.delete_message(queue, message_id).await,
            JobResponse::Requeue => Ok(()),
        }
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn create_queue(&self, queue: &str) -> MessagingResult<()> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn push(&self, queue: &str, envelope: &JobEnvelope) -> MessagingResult<String> {
        let mut queues = self.queues.lock().await;
        let entry = queues.entry(queue.to_string()).or_default();
        entry.next_id += 1;
        let id = entry.next_id;
        entry.messages.push_back(StoredMessage {
            id,
            envelope: envelope.clone(),
            visible_after: None,
        });
        Ok(id.to_string())
    }

    async fn receive(
        &self,
        queue: &str,
        limit: usize,
        visibility_timeout: i64,
    ) -> MessagingResult<Vec<Delivery>> {
        let mut queues = self.queues.lock().await;
        let entry = queues.entry(queue.to_string()).or_default();
        let now = Utc::now();
        let claimed_until = now + chrono::Duration::seconds(visibility_timeout);

        let mut deliveries = Vec::new();
        for message in entry.messages.iter_mut() {
            if deliveries.len() >= limit {
                break;
            }
            let available = message
                .visible_after
                .map(|visible| visible <= now)
                .unwrap_or(true);
            if available {
                message.visible_after = Some(claimed_until);
                deliveries.push(Delivery {
                    message_id: message.id.to_string(),
                    envelope: message.envelope.clone(),
                });
            }
        }
        Ok(deliveries)
    }

    async fn delete_message(&self, queue: &str, message_id: &str) -> MessagingResult<()> {
        let id: i64 = message_id
            .parse()
            .map_err(|_| MessagingError::Queue(format!("bad message id '{message_id}'")))?;
        let mut queues = self.queues.lock().await;
        if let Some(entry) = queues.get_mut(queue) {
            if let Some(index) = entry.messages.iter().position(|m| m.id == id) {
                entry.messages.remove(index);
            }
        }
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> MessagingResult<usize> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map(|q| q.messages.len()).unwrap_or(0))
    }
}
