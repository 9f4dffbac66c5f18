use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::entity::Namespace;

/// Malformed ingress input. Never enqueued, reported straight back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("template_ref must not be empty")]
    EmptyTemplateRef,

    #[error("template_ref {0:?} is not a valid storage key")]
    InvalidTemplateRef(String),

    #[error("payload must be a JSON object")]
    PayloadNotObject,

    #[error("payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("batch contains no jobs")]
    EmptyBatch,

    #[error("batch contains {size} jobs, limit is {limit}")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("job_id {0:?} is not a valid job id")]
    InvalidJobId(String),

    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("job {index}: {source}")]
    InBatch {
        index: usize,
        source: Box<ValidationError>,
    },
}

#[derive(Debug, Error)]
pub enum QueueError {
    /// Transport failure talking to the queue substrate.
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// The receipt handle's visibility window has closed, or the message
    /// was already deleted.
    #[error("receipt handle expired")]
    Expired,

    #[error("failed to encode message body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl QueueError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{namespace}/{key} not found")]
    NotFound { namespace: Namespace, key: String },

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("failed to read {namespace}/{key}: {message}")]
    Read {
        namespace: Namespace,
        key: String,
        message: String,
    },

    #[error("failed to write {namespace}/{key}: {message}")]
    Write {
        namespace: Namespace,
        key: String,
        message: String,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Errors returned by the rendering collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("render failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("queue unavailable after {attempts} attempts: {source}")]
    QueueUnavailable { attempts: u32, source: QueueError },

    #[error("enqueue failed: {0}")]
    Queue(QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl SubmitError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SubmitError::Validation(_) => ErrorKind::Validation,
            SubmitError::QueueUnavailable { .. } => ErrorKind::QueueUnavailable,
            SubmitError::Queue(_) | SubmitError::Storage(_) => ErrorKind::Internal,
        }
    }
}

/// Caller-visible error classes. `Validation` is a 4xx, the rest are 5xx.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    QueueUnavailable,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&SubmitError> for ErrorBody {
    fn from(err: &SubmitError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Why a single job was not completed. Every variant leaves the message
/// undeleted; `is_permanent` only informs logs and events.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("malformed message body: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("template {0:?} not found")]
    TemplateNotFound(String),

    #[error("template fetch failed: {0}")]
    TemplateFetch(StorageError),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("render exceeded {0:?} budget")]
    RenderTimeout(Duration),

    #[error("job exceeded {0:?} budget")]
    JobTimeout(Duration),

    #[error("render task aborted: {0}")]
    RenderAborted(String),

    #[error("artifact write failed: {0}")]
    StorageWrite(StorageError),
}

impl JobError {
    pub fn is_permanent(&self) -> bool {
        match self {
            JobError::MalformedMessage(_) | JobError::TemplateNotFound(_) => true,
            JobError::Render(RenderError::InvalidTemplate(_))
            | JobError::Render(RenderError::InvalidPayload(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid configuration: {0}")]
pub struct ConfigError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(QueueError::Unavailable("down".into()).is_retryable());
        assert!(!QueueError::Expired.is_retryable());
    }

    #[test]
    fn job_error_classification() {
        assert!(JobError::TemplateNotFound("x".into()).is_permanent());
        assert!(JobError::Render(RenderError::InvalidPayload("x".into())).is_permanent());
        assert!(!JobError::Render(RenderError::Failed("x".into())).is_permanent());
        assert!(!JobError::RenderTimeout(Duration::from_secs(1)).is_permanent());
        assert!(!JobError::StorageWrite(StorageError::Write {
            namespace: Namespace::Results,
            key: "k".into(),
            message: "disk full".into(),
        })
        .is_permanent());
    }

    #[test]
    fn submit_error_kinds() {
        let err = SubmitError::from(ValidationError::EmptyTemplateRef);
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = SubmitError::QueueUnavailable {
            attempts: 3,
            source: QueueError::Unavailable("down".into()),
        };
        let body = ErrorBody::from(&err);
        assert_eq!(body.kind, ErrorKind::QueueUnavailable);
        assert!(body.message.contains("3 attempts"));
    }
}
