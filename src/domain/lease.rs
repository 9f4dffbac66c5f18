use std::time::Duration;

use tracing::trace;

use super::entity::{QueueMessage, RenderJob};
use super::error::QueueError;
use super::repository::JobQueue;

/// A received message held under its visibility timeout.
///
/// A lease ends in one of three ways, and the last two reach the same queue
/// state (message visible again, next receive bumps `receive_count`):
/// - `commit`: the message is deleted.
/// - `abandon`: the visibility window is cut short explicitly.
/// - drop without either: the window expires on its own.
pub struct Lease<Q: JobQueue> {
    queue: Q,
    message: QueueMessage,
    settled: bool,
}

impl<Q: JobQueue> Lease<Q> {
    pub fn new(queue: Q, message: QueueMessage) -> Self {
        Self {
            queue,
            message,
            settled: false,
        }
    }

    /// Receives up to `max_batch` messages and wraps each in its own lease.
    pub async fn acquire(
        queue: &Q,
        max_batch: usize,
        wait: Duration,
    ) -> Result<Vec<Self>, QueueError> {
        let messages = queue.receive(max_batch, wait).await?;
        Ok(messages
            .into_iter()
            .map(|m| Lease::new(queue.clone(), m))
            .collect())
    }

    pub fn message(&self) -> &QueueMessage {
        &self.message
    }

    pub fn receive_count(&self) -> u32 {
        self.message.receive_count
    }

    pub fn job(&self) -> serde_json::Result<RenderJob> {
        self.message.job()
    }

    pub async fn extend(&self, duration: Duration) -> Result<(), QueueError> {
        self.queue
            .extend_visibility(&self.message.receipt_handle, duration)
            .await
    }

    pub async fn commit(mut self) -> Result<(), QueueError> {
        self.settled = true;
        self.queue.delete(&self.message.receipt_handle).await
    }

    pub async fn abandon(mut self, delay: Duration) -> Result<(), QueueError> {
        self.settled = true;
        self.queue
            .extend_visibility(&self.message.receipt_handle, delay)
            .await
    }
}

impl<Q: JobQueue> Drop for Lease<Q> {
    fn drop(&mut self) {
        if !self.settled {
            trace!(
                message_id = %self.message.message_id,
                receive_count = self.message.receive_count,
                "lease left to expire"
            );
        }
    }
}
