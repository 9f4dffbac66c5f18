use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{
    entity::{DeadLetter, MessageId, Namespace, QueueDepth, QueueMessage, ReceiptHandle, RenderJob},
    error::{QueueError, StorageError},
    policy::QueuePolicy,
    repository::{ArtifactStore, DeadLetterQueue, JobQueue},
};

#[derive(Debug)]
struct StoredMessage {
    id: MessageId,
    body: String,
    enqueued_at: Instant,
    enqueued_wall: DateTime<Utc>,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<ReceiptHandle>,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        self.visible_at <= now
    }

    fn holds(&self, receipt: &ReceiptHandle, now: Instant) -> bool {
        self.receipt.as_ref() == Some(receipt) && self.visible_at > now
    }
}

#[derive(Debug)]
struct StoredDeadLetter {
    letter: DeadLetter,
    dead_lettered_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    messages: VecDeque<StoredMessage>,
    dead_letters: VecDeque<StoredDeadLetter>,
}

impl State {
    /// Applies retention and the redrive policy. Redrive happens at the
    /// moment an exhausted message would otherwise become deliverable again.
    fn sweep(&mut self, policy: &QueuePolicy, now: Instant) {
        let before = self.messages.len();
        self.messages
            .retain(|m| now.saturating_duration_since(m.enqueued_at) < policy.message_retention);
        let expired = before - self.messages.len();
        if expired > 0 {
            warn!(expired, "discarded messages past retention");
        }

        let mut i = 0;
        while i < self.messages.len() {
            let m = &self.messages[i];
            if m.is_visible(now) && m.receive_count >= policy.max_receive_count {
                if let Some(m) = self.messages.remove(i) {
                    warn!(message_id = %m.id, receive_count = m.receive_count, "moving message to dead-letter queue");
                    self.dead_letters.push_back(StoredDeadLetter {
                        letter: DeadLetter {
                            message_id: m.id,
                            body: m.body,
                            receive_count: m.receive_count,
                            enqueued_at: m.enqueued_wall,
                            dead_lettered_at: Utc::now(),
                        },
                        dead_lettered_at: now,
                    });
                }
            } else {
                i += 1;
            }
        }

        self.dead_letters.retain(|d| {
            now.saturating_duration_since(d.dead_lettered_at) < policy.dead_letter_retention
        });
    }

    fn take(&mut self, policy: &QueuePolicy, max_batch: usize, now: Instant) -> Vec<QueueMessage> {
        let received_at = Utc::now();
        self.messages
            .iter_mut()
            .filter(|m| m.is_visible(now))
            .take(max_batch)
            .map(|m| {
                let receipt = ReceiptHandle::generate();
                m.receive_count += 1;
                m.visible_at = now + policy.visibility_timeout;
                m.receipt = Some(receipt.clone());
                QueueMessage {
                    message_id: m.id.clone(),
                    receipt_handle: receipt,
                    receive_count: m.receive_count,
                    received_at,
                    body: m.body.clone(),
                }
            })
            .collect()
    }

    /// Earliest moment a currently hidden message becomes visible.
    fn next_visible(&self, now: Instant) -> Option<Instant> {
        self.messages
            .iter()
            .map(|m| m.visible_at)
            .filter(|at| *at > now)
            .min()
    }
}

#[derive(Debug)]
struct Inner {
    policy: QueuePolicy,
    state: Mutex<State>,
    notify: Notify,
}

/// Single-process queue with the same lease and redrive semantics as the
/// durable backend. Clones share state.
#[derive(Clone, Debug)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl InMemoryQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    fn stored(job: &RenderJob, now: Instant) -> Result<StoredMessage, QueueError> {
        Ok(StoredMessage {
            id: MessageId(Uuid::new_v4().to_string()),
            body: job.encode()?,
            enqueued_at: now,
            enqueued_wall: Utc::now(),
            visible_at: now,
            receive_count: 0,
            receipt: None,
        })
    }
}

#[async_trait::async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job: &RenderJob) -> Result<MessageId, QueueError> {
        let ids = self.enqueue_batch(std::slice::from_ref(job)).await?;
        ids.into_iter()
            .next()
            .ok_or_else(|| QueueError::Unavailable("enqueue returned no id".to_string()))
    }

    async fn enqueue_batch(&self, jobs: &[RenderJob]) -> Result<Vec<MessageId>, QueueError> {
        let now = Instant::now();
        // Encode everything before touching state so a bad job enqueues nothing.
        let stored = jobs
            .iter()
            .map(|job| Self::stored(job, now))
            .collect::<Result<Vec<_>, _>>()?;
        let ids = stored.iter().map(|m| m.id.clone()).collect();

        self.inner.state.lock().await.messages.extend(stored);
        self.inner.notify.notify_waiters();

        Ok(ids)
    }

    async fn receive(
        &self,
        max_batch: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        if max_batch == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + wait;

        loop {
            // Register before checking so an enqueue between the check and
            // the wait is not missed.
            let notified = self.inner.notify.notified();

            let now = Instant::now();
            let next_visible = {
                let mut state = self.inner.state.lock().await;
                state.sweep(&self.inner.policy, now);
                let batch = state.take(&self.inner.policy, max_batch, now);
                if !batch.is_empty() {
                    debug!(count = batch.len(), "received messages");
                    return Ok(batch);
                }
                state.next_visible(now)
            };

            if now >= deadline {
                return Ok(Vec::new());
            }

            let wake = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = sleep_until(wake) => {}
            }
        }
    }

    async fn delete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        let index = state
            .messages
            .iter()
            .position(|m| m.holds(receipt, now))
            .ok_or(QueueError::Expired)?;
        state.messages.remove(index);
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt: &ReceiptHandle,
        duration: Duration,
    ) -> Result<(), QueueError> {
        let now = Instant::now();
        {
            let mut state = self.inner.state.lock().await;
            let message = state
                .messages
                .iter_mut()
                .find(|m| m.holds(receipt, now))
                .ok_or(QueueError::Expired)?;
            message.visible_at = now + duration;
        }

        if duration.is_zero() {
            self.inner.notify.notify_waiters();
        }

        Ok(())
    }

    async fn approximate_depth(&self) -> Result<QueueDepth, QueueError> {
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        state.sweep(&self.inner.policy, now);

        let visible = state.messages.iter().filter(|m| m.is_visible(now)).count() as u64;
        Ok(QueueDepth {
            visible,
            in_flight: state.messages.len() as u64 - visible,
        })
    }
}

#[async_trait::async_trait]
impl DeadLetterQueue for InMemoryQueue {
    async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        state.sweep(&self.inner.policy, now);

        Ok(state
            .dead_letters
            .iter()
            .take(limit)
            .map(|d| d.letter.clone())
            .collect())
    }

    async fn dead_letter_count(&self) -> Result<u64, QueueError> {
        let now = Instant::now();
        let mut state = self.inner.state.lock().await;
        state.sweep(&self.inner.policy, now);

        Ok(state.dead_letters.len() as u64)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryArtifactStore {
    objects: Arc<RwLock<HashMap<(Namespace, String), Bytes>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Management path for the templates namespace.
    pub async fn put_template(&self, key: &str, source: impl Into<Bytes>) {
        self.objects
            .write()
            .await
            .insert((Namespace::Templates, key.to_string()), source.into());
    }

    pub async fn keys(&self, namespace: Namespace) -> Vec<String> {
        let mut keys: Vec<String> = self
            .objects
            .read()
            .await
            .keys()
            .filter(|(ns, _)| *ns == namespace)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait::async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn get(&self, namespace: Namespace, key: &str) -> Result<Bytes, StorageError> {
        self.objects
            .read()
            .await
            .get(&(namespace, key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                namespace,
                key: key.to_string(),
            })
    }

    async fn put(&self, namespace: Namespace, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        self.objects
            .write()
            .await
            .insert((namespace, key.to_string()), bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> QueuePolicy {
        QueuePolicy {
            max_receive_count: 3,
            visibility_timeout: Duration::from_secs(30),
            message_retention: Duration::from_secs(3600),
            dead_letter_retention: Duration::from_secs(14 * 24 * 3600),
            poll_interval: Duration::from_millis(100),
        }
    }

    fn job() -> RenderJob {
        RenderJob::new("invoice-v1".to_string(), json!({"total": 10}))
    }

    #[tokio::test(start_paused = true)]
    async fn received_message_is_hidden_until_timeout() {
        let queue = InMemoryQueue::new(policy());
        queue.enqueue(&job()).await.unwrap();

        let first = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].receive_count, 1);

        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_batch_request_returns_at_once() {
        let queue = InMemoryQueue::new(policy());
        queue.enqueue(&job()).await.unwrap();

        let started = Instant::now();
        assert!(queue.receive(0, Duration::from_secs(5)).await.unwrap().is_empty());
        assert_eq!(started.elapsed(), Duration::ZERO);

        let batch = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(batch[0].receive_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_with_stale_receipt_is_expired() {
        let queue = InMemoryQueue::new(policy());
        queue.enqueue(&job()).await.unwrap();

        let first = queue.receive(1, Duration::ZERO).await.unwrap().remove(0);
        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.receive(1, Duration::ZERO).await.unwrap().remove(0);

        assert!(matches!(
            queue.delete(&first.receipt_handle).await,
            Err(QueueError::Expired)
        ));
        queue.delete(&second.receipt_handle).await.unwrap();
        assert_eq!(queue.approximate_depth().await.unwrap().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn redrives_after_max_receive_count() {
        let queue = InMemoryQueue::new(policy());
        let id = queue.enqueue(&job()).await.unwrap();

        let mut counts = Vec::new();
        for _ in 0..5 {
            let batch = queue.receive(1, Duration::ZERO).await.unwrap();
            counts.extend(batch.iter().map(|m| m.receive_count));
            tokio::time::advance(Duration::from_secs(31)).await;
        }

        assert_eq!(counts, vec![1, 2, 3]);
        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message_id, id);
        assert_eq!(dead[0].receive_count, 3);
        assert_eq!(queue.approximate_depth().await.unwrap().total(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandon_makes_message_visible_immediately() {
        let queue = InMemoryQueue::new(policy());
        queue.enqueue(&job()).await.unwrap();

        let msg = queue.receive(1, Duration::ZERO).await.unwrap().remove(0);
        queue
            .extend_visibility(&msg.receipt_handle, Duration::ZERO)
            .await
            .unwrap();

        let again = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(again[0].receive_count, 2);
        assert!(matches!(
            queue.delete(&msg.receipt_handle).await,
            Err(QueueError::Expired)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_wakes_on_enqueue() {
        let queue = InMemoryQueue::new(policy());

        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            producer.enqueue(&job()).await.unwrap();
        });

        let start = Instant::now();
        let batch = queue.receive(10, Duration::from_secs(20)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_returns_empty_after_wait() {
        let queue = InMemoryQueue::new(policy());
        let start = Instant::now();
        assert!(queue
            .receive(10, Duration::from_secs(20))
            .await
            .unwrap()
            .is_empty());
        assert!(start.elapsed() >= Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn retention_discards_stale_messages() {
        let queue = InMemoryQueue::new(policy());
        queue.enqueue(&job()).await.unwrap();

        tokio::time::advance(Duration::from_secs(3601)).await;
        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(queue.dead_letter_count().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn depth_counts_visible_and_in_flight() {
        let queue = InMemoryQueue::new(policy());
        queue.enqueue_batch(&[job(), job(), job()]).await.unwrap();
        queue.receive(1, Duration::ZERO).await.unwrap();

        let depth = queue.approximate_depth().await.unwrap();
        assert_eq!(depth, QueueDepth { visible: 2, in_flight: 1 });
    }

    #[tokio::test]
    async fn store_overwrites_results() {
        let store = MemoryArtifactStore::new();
        store
            .put(Namespace::Results, "a.pdf", Bytes::from_static(b"one"))
            .await
            .unwrap();
        store
            .put(Namespace::Results, "a.pdf", Bytes::from_static(b"two"))
            .await
            .unwrap();

        assert_eq!(
            store.get(Namespace::Results, "a.pdf").await.unwrap(),
            Bytes::from_static(b"two")
        );
        assert!(store
            .get(Namespace::Templates, "a.pdf")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
