use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use super::entity::{
    DeadLetter, MessageId, Namespace, QueueDepth, QueueMessage, ReceiptHandle, RenderJob,
};
use super::error::{QueueError, RenderError, StorageError};

/// At-least-once queue with per-message visibility timeouts and a redrive
/// policy. Implementations move a message to their dead-letter side once it
/// has been delivered `max_receive_count` times without a delete.
#[async_trait::async_trait]
pub trait JobQueue: Clone + Send + Sync + 'static {
    async fn enqueue(&self, job: &RenderJob) -> Result<MessageId, QueueError>;

    /// All-or-nothing.
    async fn enqueue_batch(&self, jobs: &[RenderJob]) -> Result<Vec<MessageId>, QueueError>;

    /// Long-polls for up to `wait` until at least one message is visible.
    /// Returns an empty batch when the wait elapses.
    async fn receive(
        &self,
        max_batch: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Resets the message's visibility window to `duration` from now. A zero
    /// duration makes the message visible again immediately.
    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        duration: Duration,
    ) -> Result<(), QueueError>;

    async fn approximate_depth(&self) -> Result<QueueDepth, QueueError>;
}

/// Terminal sink for messages that exhausted their receives. Inspected
/// out-of-band.
#[async_trait::async_trait]
pub trait DeadLetterQueue: Clone + Send + Sync + 'static {
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    async fn dead_letter_count(&self) -> Result<u64, QueueError>;
}

#[async_trait::async_trait]
pub trait ArtifactStore: Clone + Send + Sync + 'static {
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Bytes, StorageError>;

    /// Overwrites any existing object. Readers see either the old or the new
    /// bytes, never a partial write.
    async fn put(&self, namespace: Namespace, key: &str, bytes: Bytes)
        -> Result<(), StorageError>;
}

/// The typesetting collaborator. Compiling and rendering are pure and may be
/// CPU-bound, so callers run them off the async executor.
pub trait Renderer: Send + Sync + 'static {
    type Template: Clone + Send + Sync + 'static;

    fn compile(&self, template_ref: &str, source: &[u8]) -> Result<Self::Template, RenderError>;

    fn render(&self, template: &Self::Template, data: &Value) -> Result<Bytes, RenderError>;
}
