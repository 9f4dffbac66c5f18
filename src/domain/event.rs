use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::entity::RenderResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub header: Header,
    pub payload: Payload,
}

impl Event {
    pub fn new(payload: Payload) -> Self {
        Self {
            header: Header {
                id: Uuid::new_v4().to_string(),
                timestamp: Utc::now(),
            },
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Payload {
    JobQueued(JobQueued),
    JobSucceeded(RenderResult),
    JobFailed(JobFailed),
    ScaleDecision(ScaleDecision),
    QueueUnreachable(QueueUnreachable),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::JobQueued(_) => "job_queued",
            Payload::JobSucceeded(_) => "job_succeeded",
            Payload::JobFailed(_) => "job_failed",
            Payload::ScaleDecision(_) => "scale_decision",
            Payload::QueueUnreachable(_) => "queue_unreachable",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobQueued {
    pub job_id: String,
    pub template_ref: String,
    pub message_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobFailed {
    pub result: RenderResult,
    pub receive_count: u32,
    pub permanent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleDecision {
    pub signal: f64,
    pub previous: usize,
    pub desired: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueUnreachable {
    pub worker_id: usize,
    pub consecutive_failures: u32,
    pub outage_secs: u64,
    pub error: String,
}

/// Observability sink. Publishing is best effort: callers log failures and
/// carry on.
#[async_trait::async_trait]
pub trait EventTransport: Clone + Send + Sync + 'static {
    async fn publish(&self, event: &Event) -> Result<()>;
}
