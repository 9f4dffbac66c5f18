use std::future::Future;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::{
    entity::{
        result_key, BatchSubmitAck, BatchSubmitRequest, DeadLetter, Namespace, RenderJob,
        ResultStatus, SubmitAck, SubmitRequest,
    },
    error::{ErrorBody, ErrorKind, QueueError, SubmitError, ValidationError},
    event::{Event, EventTransport, JobQueued, Payload},
    policy::IngressPolicy,
    repository::{ArtifactStore, DeadLetterQueue, JobQueue},
    validate,
};
use crate::retry;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceResponse<T, E> {
    Ok(T),
    Err(E),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollRequest {
    pub job_id: String,
}

fn default_dead_letter_limit() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRequest {
    #[serde(default = "default_dead_letter_limit")]
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterReport {
    pub count: u64,
    pub entries: Vec<DeadLetter>,
}

/// Serves an encoded request by method name and always produces an encoded
/// reply, errors included.
#[async_trait::async_trait]
pub trait RpcRouter: Clone + Send + Sync + 'static {
    async fn route(&self, method: &str, body: &[u8]) -> Vec<u8>;
}

/// Ingress: validates, assigns a job id, enqueues, and acknowledges. Never
/// renders.
#[derive(Clone, Debug)]
pub struct RequestHandler<Q, S, E>
where
    Q: JobQueue,
    S: ArtifactStore,
    E: EventTransport,
{
    queue: Q,
    store: S,
    event: E,
    policy: IngressPolicy,
}

impl<Q, S, E> RequestHandler<Q, S, E>
where
    Q: JobQueue,
    S: ArtifactStore,
    E: EventTransport,
{
    pub fn new(queue: Q, store: S, event: E, policy: IngressPolicy) -> Self {
        Self {
            queue,
            store,
            event,
            policy,
        }
    }

    pub async fn submit(&self, req: SubmitRequest) -> Result<SubmitAck, SubmitError> {
        info!(template_ref = %req.template_ref, "submit request");

        validate::validate_request(&req, self.policy.max_payload_bytes)?;

        let job = RenderJob::new(req.template_ref, req.payload);
        let message_id = self.with_retry(|| self.queue.enqueue(&job)).await?;

        self.publish_queued(&job, message_id.to_string()).await;

        let ack = SubmitAck {
            result_key: result_key(&job.job_id, &self.policy.result_extension),
            job_id: job.job_id,
            status: "queued".to_string(),
        };

        info!(job_id = %ack.job_id, %message_id, "job queued");
        Ok(ack)
    }

    pub async fn submit_batch(&self, req: BatchSubmitRequest) -> Result<BatchSubmitAck, SubmitError> {
        info!(jobs = req.jobs.len(), "batch submit request");

        validate::validate_batch(
            &req,
            self.policy.max_submit_batch,
            self.policy.max_payload_bytes,
        )?;

        let jobs: Vec<RenderJob> = req
            .jobs
            .into_iter()
            .map(|r| RenderJob::new(r.template_ref, r.payload))
            .collect();

        let message_ids = self.with_retry(|| self.queue.enqueue_batch(&jobs)).await?;

        for (job, message_id) in jobs.iter().zip(message_ids) {
            self.publish_queued(job, message_id.to_string()).await;
        }

        info!(jobs = jobs.len(), "batch queued");

        Ok(BatchSubmitAck {
            result_keys: jobs
                .iter()
                .map(|j| result_key(&j.job_id, &self.policy.result_extension))
                .collect(),
            job_ids: jobs.into_iter().map(|j| j.job_id).collect(),
            status: "queued".to_string(),
        })
    }

    /// The completion channel: a job is done once its artifact exists.
    pub async fn poll_result(&self, job_id: &str) -> Result<ResultStatus, SubmitError> {
        if Uuid::parse_str(job_id).is_err() {
            return Err(ValidationError::InvalidJobId(job_id.to_string()).into());
        }

        let key = result_key(job_id, &self.policy.result_extension);
        match self.store.get(Namespace::Results, &key).await {
            Ok(bytes) => Ok(ResultStatus::Ready {
                result_key: key,
                size: bytes.len() as u64,
            }),
            Err(e) if e.is_not_found() => Ok(ResultStatus::Pending),
            Err(e) => Err(e.into()),
        }
    }

    /// Retries transport failures with jittered backoff. Anything else, or
    /// running out of attempts, is surfaced.
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, SubmitError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.policy.enqueue_attempts => {
                    let delay = retry::backoff(
                        attempt,
                        self.policy.enqueue_backoff_base,
                        self.policy.enqueue_backoff_max,
                    );
                    warn!(attempt, ?delay, error = %e, "enqueue failed, retrying");
                    sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    error!(attempt, error = %e, "enqueue failed, giving up");
                    return Err(SubmitError::QueueUnavailable {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => return Err(SubmitError::Queue(e)),
            }
        }
    }

    async fn publish_queued(&self, job: &RenderJob, message_id: String) {
        let event = Event::new(Payload::JobQueued(JobQueued {
            job_id: job.job_id.clone(),
            template_ref: job.template_ref.clone(),
            message_id,
        }));
        if let Err(e) = self.event.publish(&event).await {
            warn!(job_id = %job.job_id, error = %e, "failed to publish event");
        }
    }
}

impl<Q, S, E> RequestHandler<Q, S, E>
where
    Q: JobQueue + DeadLetterQueue,
    S: ArtifactStore,
    E: EventTransport,
{
    /// Oldest dead letters first, for operators.
    pub async fn dead_letters(&self, limit: usize) -> Result<DeadLetterReport, SubmitError> {
        let count = self.queue.dead_letter_count().await.map_err(SubmitError::Queue)?;
        let entries = self
            .queue
            .dead_letters(limit)
            .await
            .map_err(SubmitError::Queue)?;
        Ok(DeadLetterReport { count, entries })
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, SubmitError> {
    serde_json::from_slice(body)
        .map_err(|e| SubmitError::from(ValidationError::MalformedRequest(e.to_string())))
}

fn encode<T: Serialize>(result: Result<T, SubmitError>) -> Vec<u8> {
    let response = match result {
        Ok(value) => ServiceResponse::Ok(value),
        Err(e) => {
            warn!(error = %e, "request failed");
            ServiceResponse::Err(ErrorBody::from(&e))
        }
    };

    serde_json::to_vec(&response).unwrap_or_else(|e| {
        error!(error = %e, "failed to encode response");
        Vec::new()
    })
}

#[async_trait::async_trait]
impl<Q, S, E> RpcRouter for RequestHandler<Q, S, E>
where
    Q: JobQueue + DeadLetterQueue,
    S: ArtifactStore,
    E: EventTransport,
{
    async fn route(&self, method: &str, body: &[u8]) -> Vec<u8> {
        match method {
            "submit" => match decode::<SubmitRequest>(body) {
                Ok(req) => encode(self.submit(req).await),
                Err(e) => encode::<SubmitAck>(Err(e)),
            },
            "submit_batch" => match decode::<BatchSubmitRequest>(body) {
                Ok(req) => encode(self.submit_batch(req).await),
                Err(e) => encode::<BatchSubmitAck>(Err(e)),
            },
            "result" => match decode::<PollRequest>(body) {
                Ok(req) => encode(self.poll_result(&req.job_id).await),
                Err(e) => encode::<ResultStatus>(Err(e)),
            },
            "dead_letters" => match decode::<DeadLetterRequest>(body) {
                Ok(req) => encode(self.dead_letters(req.limit).await),
                Err(e) => encode::<DeadLetterReport>(Err(e)),
            },
            other => {
                let response: ServiceResponse<(), ErrorBody> = ServiceResponse::Err(ErrorBody {
                    kind: ErrorKind::Validation,
                    message: format!("unknown method {:?}", other),
                });
                serde_json::to_vec(&response).unwrap_or_default()
            }
        }
    }
}
