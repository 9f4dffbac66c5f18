use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderJob {
    // ID
    pub job_id: String,

    // Input
    pub template_ref: String,
    pub payload: Value,

    pub submitted_at: DateTime<Utc>,
}

impl RenderJob {
    pub fn new(template_ref: String, payload: Value) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            template_ref,
            payload,
            submitted_at: Utc::now(),
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(body: &str) -> serde_json::Result<Self> {
        serde_json::from_str(body)
    }
}

/// A single render request as it arrives at the ingress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(alias = "template_id")]
    pub template_ref: String,
    #[serde(alias = "data")]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSubmitRequest {
    pub jobs: Vec<SubmitRequest>,
}

/// Returned to the caller once a job is durably queued. The artifact will
/// appear under `result_key` in the results namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitAck {
    pub job_id: String,
    pub status: String,
    pub result_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSubmitAck {
    pub job_ids: Vec<String>,
    pub status: String,
    pub result_keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResultStatus {
    Pending,
    Ready { result_key: String, size: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque lease token handed out by `receive`. Only valid until the
/// message's visibility window closes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: MessageId,
    pub receipt_handle: ReceiptHandle,
    pub receive_count: u32,
    pub received_at: DateTime<Utc>,

    // Serialized RenderJob
    pub body: String,
}

impl QueueMessage {
    pub fn job(&self) -> serde_json::Result<RenderJob> {
        RenderJob::decode(&self.body)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub visible: u64,
    pub in_flight: u64,
}

impl QueueDepth {
    pub fn total(&self) -> u64 {
        self.visible + self.in_flight
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub body: String,
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn job(&self) -> serde_json::Result<RenderJob> {
        RenderJob::decode(&self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    Templates,
    Results,
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Namespace::Templates => "templates",
            Namespace::Results => "results",
        })
    }
}

/// Results are keyed solely by job id, so a retried job overwrites its own
/// artifact and nothing else.
pub fn result_key(job_id: &str, extension: &str) -> String {
    format!("{}.{}", job_id, extension)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderResult {
    pub job_id: String,
    pub template_ref: String,
    pub status: RenderStatus,
    pub artifact_ref: Option<String>,
    pub file_size: Option<u64>,
    pub error: Option<String>,
}

impl RenderResult {
    pub fn succeeded(job: &RenderJob, artifact_ref: String, file_size: u64) -> Self {
        Self {
            job_id: job.job_id.clone(),
            template_ref: job.template_ref.clone(),
            status: RenderStatus::Succeeded,
            artifact_ref: Some(artifact_ref),
            file_size: Some(file_size),
            error: None,
        }
    }

    pub fn failed(job_id: String, template_ref: String, error: String) -> Self {
        Self {
            job_id,
            template_ref,
            status: RenderStatus::Failed,
            artifact_ref: None,
            file_size: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RenderStatus::Succeeded
    }
}
