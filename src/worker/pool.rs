use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::render::RenderWorker;
use crate::domain::{
    event::EventTransport,
    repository::{ArtifactStore, JobQueue, Renderer},
    scaling::CapacityKnob,
};

struct Slot {
    id: usize,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slots {
    active: Vec<Slot>,
    /// Told to stop, still finishing their last batch.
    retiring: Vec<JoinHandle<()>>,
}

/// A resizable set of pull loops sharing one `RenderWorker`.
///
/// Shrinking cancels the newest loops. They stop receiving at once but
/// finish the batch they hold, so resizing never waits on a render.
pub struct WorkerPool<Q, S, R, E>
where
    Q: JobQueue,
    S: ArtifactStore,
    R: Renderer,
    E: EventTransport,
{
    worker: RenderWorker<Q, S, R, E>,
    shutdown: CancellationToken,
    slots: Arc<Mutex<Slots>>,
    next_id: Arc<AtomicUsize>,
}

impl<Q, S, R, E> Clone for WorkerPool<Q, S, R, E>
where
    Q: JobQueue,
    S: ArtifactStore,
    R: Renderer,
    E: EventTransport,
{
    fn clone(&self) -> Self {
        Self {
            worker: self.worker.clone(),
            shutdown: self.shutdown.clone(),
            slots: self.slots.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<Q, S, R, E> WorkerPool<Q, S, R, E>
where
    Q: JobQueue,
    S: ArtifactStore,
    R: Renderer,
    E: EventTransport,
{
    pub fn new(worker: RenderWorker<Q, S, R, E>, shutdown: CancellationToken) -> Self {
        Self {
            worker,
            shutdown,
            slots: Arc::new(Mutex::new(Slots::default())),
            next_id: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn size(&self) -> usize {
        self.slots.lock().await.active.len()
    }

    pub fn busy(&self) -> usize {
        self.worker.busy()
    }

    pub async fn resize(&self, desired: usize) {
        let mut slots = self.slots.lock().await;
        slots.retiring.retain(|h| !h.is_finished());

        // A loop only exits on its own by panicking.
        let before = slots.active.len();
        slots.active.retain(|s| !s.handle.is_finished());
        if slots.active.len() < before {
            warn!(lost = before - slots.active.len(), "worker loops exited unexpectedly");
        }

        if self.shutdown.is_cancelled() {
            return;
        }

        while slots.active.len() < desired {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let cancel = self.shutdown.child_token();
            let worker = self.worker.clone();
            let token = cancel.clone();
            let handle = tokio::spawn(async move { worker.run(id, token).await });
            slots.active.push(Slot { id, cancel, handle });
        }

        while slots.active.len() > desired {
            if let Some(slot) = slots.active.pop() {
                info!(worker_id = slot.id, "retiring worker");
                slot.cancel.cancel();
                slots.retiring.push(slot.handle);
            }
        }

        info!(size = slots.active.len(), "worker pool resized");
    }

    /// Stops every loop and waits for in-hand batches to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let handles: Vec<_> = {
            let mut slots = self.slots.lock().await;
            let mut handles: Vec<_> = slots.active.drain(..).map(|s| s.handle).collect();
            handles.append(&mut slots.retiring);
            handles
        };

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker loop ended abnormally");
            }
        }
        info!("worker pool stopped");
    }
}

#[async_trait::async_trait]
impl<Q, S, R, E> CapacityKnob for WorkerPool<Q, S, R, E>
where
    Q: JobQueue,
    S: ArtifactStore,
    R: Renderer,
    E: EventTransport,
{
    async fn current(&self) -> usize {
        self.size().await
    }

    async fn set_desired(&self, desired: usize) -> Result<()> {
        self.resize(desired).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::policy::{QueuePolicy, WorkerPolicy};
    use crate::infrastructure::events::MemoryEventTransport;
    use crate::infrastructure::memory::{InMemoryQueue, MemoryArtifactStore};
    use crate::infrastructure::renderer::PlaceholderRenderer;
    use std::time::Duration;

    fn pool() -> WorkerPool<InMemoryQueue, MemoryArtifactStore, PlaceholderRenderer, MemoryEventTransport>
    {
        let worker = RenderWorker::new(
            InMemoryQueue::new(QueuePolicy::default()),
            MemoryArtifactStore::new(),
            PlaceholderRenderer,
            MemoryEventTransport::new(),
            WorkerPolicy {
                receive_wait: Duration::from_millis(50),
                ..WorkerPolicy::default()
            },
        );
        WorkerPool::new(worker, CancellationToken::new())
    }

    #[tokio::test]
    async fn grows_and_shrinks() {
        let pool = pool();

        pool.set_desired(4).await.unwrap();
        assert_eq!(pool.current().await, 4);

        pool.set_desired(1).await.unwrap();
        assert_eq!(pool.current().await, 1);

        pool.shutdown().await;
        assert_eq!(pool.current().await, 0);
    }

    #[tokio::test]
    async fn does_not_grow_after_shutdown() {
        let pool = pool();
        pool.shutdown().await;
        pool.resize(3).await;
        assert_eq!(pool.size().await, 0);
    }
}
