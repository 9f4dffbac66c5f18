use serde_json::Value;

use super::entity::{BatchSubmitRequest, SubmitRequest};
use super::error::ValidationError;

const MAX_KEY_LEN: usize = 256;

/// Storage keys: alphanumerics plus `-`, `_`, `.` and `/`, relative, and
/// never climbing out of their namespace.
pub fn is_safe_key(key: &str) -> bool {
    key.len() <= MAX_KEY_LEN
        && !key.starts_with('/')
        && !key.split('/').any(|part| part.is_empty() || part == "..")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

pub fn validate_template_ref(template_ref: &str) -> Result<(), ValidationError> {
    if template_ref.trim().is_empty() {
        return Err(ValidationError::EmptyTemplateRef);
    }

    if !is_safe_key(template_ref) {
        return Err(ValidationError::InvalidTemplateRef(template_ref.to_string()));
    }

    Ok(())
}

pub fn validate_payload(payload: &Value, max_bytes: usize) -> Result<(), ValidationError> {
    if !payload.is_object() {
        return Err(ValidationError::PayloadNotObject);
    }

    // Value serialization cannot fail, but a failure still shouldn't pass.
    let size = serde_json::to_vec(payload)
        .map(|v| v.len())
        .unwrap_or(usize::MAX);
    if size > max_bytes {
        return Err(ValidationError::PayloadTooLarge {
            size,
            limit: max_bytes,
        });
    }

    Ok(())
}

pub fn validate_request(req: &SubmitRequest, max_payload_bytes: usize) -> Result<(), ValidationError> {
    validate_template_ref(&req.template_ref)?;
    validate_payload(&req.payload, max_payload_bytes)
}

pub fn validate_batch(
    req: &BatchSubmitRequest,
    max_jobs: usize,
    max_payload_bytes: usize,
) -> Result<(), ValidationError> {
    if req.jobs.is_empty() {
        return Err(ValidationError::EmptyBatch);
    }

    if req.jobs.len() > max_jobs {
        return Err(ValidationError::BatchTooLarge {
            size: req.jobs.len(),
            limit: max_jobs,
        });
    }

    for (index, job) in req.jobs.iter().enumerate() {
        validate_request(job, max_payload_bytes).map_err(|e| ValidationError::InBatch {
            index,
            source: Box::new(e),
        })?;
    }

    Ok(())
}
