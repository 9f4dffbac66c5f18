use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    entity::{result_key, Namespace, RenderJob, RenderResult},
    error::{JobError, QueueError},
    event::{Event, EventTransport, JobFailed, Payload, QueueUnreachable},
    lease::Lease,
    policy::WorkerPolicy,
    repository::{ArtifactStore, JobQueue, Renderer},
};
use crate::retry;

const RECEIVE_BACKOFF_BASE: Duration = Duration::from_millis(200);

struct BusyGuard(Arc<AtomicUsize>);

impl BusyGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pulls batches off the queue and turns each message into an artifact.
///
/// Clones share the template cache and the busy counter, so one
/// `RenderWorker` can back every task in a pool.
pub struct RenderWorker<Q, S, R, E>
where
    Q: JobQueue,
    S: ArtifactStore,
    R: Renderer,
    E: EventTransport,
{
    queue: Q,
    store: S,
    renderer: Arc<R>,
    event: E,
    policy: Arc<WorkerPolicy>,
    templates: Arc<RwLock<HashMap<String, (Instant, R::Template)>>>,
    busy: Arc<AtomicUsize>,
}

impl<Q, S, R, E> Clone for RenderWorker<Q, S, R, E>
where
    Q: JobQueue,
    S: ArtifactStore,
    R: Renderer,
    E: EventTransport,
{
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            store: self.store.clone(),
            renderer: self.renderer.clone(),
            event: self.event.clone(),
            policy: self.policy.clone(),
            templates: self.templates.clone(),
            busy: self.busy.clone(),
        }
    }
}

impl<Q, S, R, E> RenderWorker<Q, S, R, E>
where
    Q: JobQueue,
    S: ArtifactStore,
    R: Renderer,
    E: EventTransport,
{
    pub fn new(queue: Q, store: S, renderer: R, event: E, policy: WorkerPolicy) -> Self {
        Self {
            queue,
            store,
            renderer: Arc::new(renderer),
            event,
            policy: Arc::new(policy),
            templates: Arc::new(RwLock::new(HashMap::new())),
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of pull loops currently working through a batch.
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// The pull loop. Runs until `cancel` fires; a batch already received is
    /// finished first. Queue outages are retried forever.
    pub async fn run(&self, worker_id: usize, cancel: CancellationToken) {
        info!(worker_id, "worker started");

        let mut failures: u32 = 0;
        let mut outage_since: Option<Instant> = None;
        let mut reported = false;

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = Lease::acquire(&self.queue, self.policy.batch_size, self.policy.receive_wait) => r,
            };

            match received {
                Ok(leases) => {
                    if failures > 0 {
                        info!(worker_id, failures, "queue reachable again");
                    }
                    failures = 0;
                    outage_since = None;
                    reported = false;

                    if leases.is_empty() {
                        continue;
                    }

                    let _busy = BusyGuard::enter(&self.busy);
                    self.process_batch(leases).await;
                }
                Err(e) => {
                    failures += 1;
                    let outage = outage_since.get_or_insert_with(Instant::now).elapsed();
                    warn!(worker_id, failures, error = %e, "receive failed");

                    if outage >= self.policy.queue_outage_threshold && !reported {
                        reported = true;
                        self.report_outage(worker_id, failures, outage, &e).await;
                    }

                    let delay =
                        retry::backoff(failures, RECEIVE_BACKOFF_BASE, self.policy.receive_backoff_max);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        info!(worker_id, "worker stopped");
    }

    /// Processes every lease independently and concurrently. A failing or
    /// panicking job affects only its own message.
    pub async fn process_batch(&self, leases: Vec<Lease<Q>>) -> Vec<RenderResult> {
        debug!(count = leases.len(), "processing batch");

        let tasks: Vec<_> = leases
            .into_iter()
            .map(|lease| {
                let worker = self.clone();
                tokio::spawn(async move { worker.process(lease).await })
            })
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for joined in join_all(tasks).await {
            match joined {
                Ok(result) => results.push(result),
                // The lease was dropped with the task and will expire.
                Err(e) => error!(error = %e, "render task panicked"),
            }
        }
        results
    }

    #[instrument(
        skip_all,
        fields(
            message_id = %lease.message().message_id,
            receive_count = lease.receive_count(),
        )
    )]
    pub async fn process(&self, lease: Lease<Q>) -> RenderResult {
        let job = match lease.job() {
            Ok(job) => job,
            Err(e) => {
                let id = lease.message().message_id.to_string();
                return self.fail(lease, id, String::new(), JobError::from(e)).await;
            }
        };

        let budget = self.policy.max_job_duration;
        let outcome = match timeout(budget, self.execute(&job)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(JobError::JobTimeout(budget)),
        };

        match outcome {
            Ok((key, size)) => {
                // Artifact first, delete second. A failed delete only costs a
                // redundant, idempotent re-render.
                match lease.commit().await {
                    Ok(()) => {}
                    Err(QueueError::Expired) => {
                        warn!(job_id = %job.job_id, "lease expired before delete, job will be redelivered");
                    }
                    Err(e) => {
                        warn!(job_id = %job.job_id, error = %e, "delete failed, job will be redelivered");
                    }
                }

                info!(job_id = %job.job_id, %key, size, "job succeeded");
                let result = RenderResult::succeeded(&job, key, size);
                self.publish(Payload::JobSucceeded(result.clone())).await;
                result
            }
            Err(e) => {
                let job_id = job.job_id.clone();
                self.fail(lease, job_id, job.template_ref, e).await
            }
        }
    }

    /// Leaves the message for the queue's redrive policy to retry or
    /// dead-letter. Permanent errors are not deleted early.
    async fn fail(
        &self,
        lease: Lease<Q>,
        job_id: String,
        template_ref: String,
        err: JobError,
    ) -> RenderResult {
        let receive_count = lease.receive_count();
        let permanent = err.is_permanent();
        warn!(%job_id, receive_count, permanent, error = %err, "job failed");

        match self.policy.abandon_delay {
            Some(delay) => {
                if let Err(e) = lease.abandon(delay).await {
                    warn!(%job_id, error = %e, "abandon failed, lease will expire");
                }
            }
            None => drop(lease),
        }

        let result = RenderResult::failed(job_id, template_ref, err.to_string());
        self.publish(Payload::JobFailed(JobFailed {
            result: result.clone(),
            receive_count,
            permanent,
        }))
        .await;
        result
    }

    async fn execute(&self, job: &RenderJob) -> Result<(String, u64), JobError> {
        let template = self.template(&job.template_ref).await?;
        let bytes = self.render(template, job.payload.clone()).await?;
        let size = bytes.len() as u64;

        let key = result_key(&job.job_id, &self.policy.result_extension);
        self.store
            .put(Namespace::Results, &key, bytes)
            .await
            .map_err(JobError::StorageWrite)?;

        Ok((key, size))
    }

    async fn template(&self, template_ref: &str) -> Result<R::Template, JobError> {
        if let Some((loaded_at, template)) = self.templates.read().await.get(template_ref) {
            if loaded_at.elapsed() < self.policy.template_cache_ttl {
                debug!(template_ref, "template cache hit");
                return Ok(template.clone());
            }
        }

        debug!(template_ref, "template cache miss");
        let source = self
            .store
            .get(Namespace::Templates, template_ref)
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    JobError::TemplateNotFound(template_ref.to_string())
                } else {
                    JobError::TemplateFetch(e)
                }
            })?;

        let renderer = self.renderer.clone();
        let name = template_ref.to_string();
        let template = tokio::task::spawn_blocking(move || renderer.compile(&name, &source))
            .await
            .map_err(|e| JobError::RenderAborted(e.to_string()))??;

        self.templates
            .write()
            .await
            .insert(template_ref.to_string(), (Instant::now(), template.clone()));

        Ok(template)
    }

    /// Renders off the executor under the time budget. On timeout the
    /// blocking task is left to finish but its output is discarded.
    async fn render(&self, template: R::Template, payload: Value) -> Result<Bytes, JobError> {
        let renderer = self.renderer.clone();
        let budget = self.policy.max_render_duration;
        let started = Instant::now();

        let task = tokio::task::spawn_blocking(move || renderer.render(&template, &payload));
        let bytes = match timeout(budget, task).await {
            Ok(Ok(rendered)) => rendered?,
            Ok(Err(e)) => return Err(JobError::RenderAborted(e.to_string())),
            Err(_) => return Err(JobError::RenderTimeout(budget)),
        };

        debug!(elapsed = ?started.elapsed(), "rendered");
        Ok(bytes)
    }

    async fn report_outage(&self, worker_id: usize, failures: u32, outage: Duration, err: &QueueError) {
        error!(worker_id, failures, outage = ?outage, error = %err, "queue unreachable");
        self.publish(Payload::QueueUnreachable(QueueUnreachable {
            worker_id,
            consecutive_failures: failures,
            outage_secs: outage.as_secs(),
            error: err.to_string(),
        }))
        .await;
    }

    async fn publish(&self, payload: Payload) {
        let event = Event::new(payload);
        if let Err(e) = self.event.publish(&event).await {
            warn!(kind = event.payload.kind(), error = %e, "failed to publish event");
        }
    }
}
