//! Validated, immutable policy values handed to each component at
//! construction. Built once from `Config` at startup.

use std::str::FromStr;
use std::time::Duration;

use super::error::ConfigError;

#[derive(Debug, Clone, PartialEq)]
pub struct QueuePolicy {
    pub max_receive_count: u32,
    pub visibility_timeout: Duration,
    pub message_retention: Duration,
    pub dead_letter_retention: Duration,
    /// Sleep between polls for backends without a blocking receive.
    pub poll_interval: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_receive_count: 3,
            visibility_timeout: Duration::from_secs(60),
            message_retention: Duration::from_secs(4 * 24 * 3600),
            dead_letter_retention: Duration::from_secs(14 * 24 * 3600),
            poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPolicy {
    pub batch_size: usize,
    pub receive_wait: Duration,
    pub max_render_duration: Duration,
    /// Budget for one message end to end: template fetch, render and
    /// result write.
    pub max_job_duration: Duration,
    /// `None` leaves failed messages to time out; `Some(d)` hands them back
    /// to the queue explicitly, visible again after `d`.
    pub abandon_delay: Option<Duration>,
    pub template_cache_ttl: Duration,
    pub result_extension: String,
    pub queue_outage_threshold: Duration,
    pub receive_backoff_max: Duration,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self {
            batch_size: 10,
            receive_wait: Duration::from_secs(20),
            max_render_duration: Duration::from_secs(30),
            max_job_duration: Duration::from_secs(45),
            abandon_delay: None,
            template_cache_ttl: Duration::from_secs(300),
            result_extension: "pdf".to_string(),
            queue_outage_threshold: Duration::from_secs(60),
            receive_backoff_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// Busy workers over allocated workers.
    Utilization,
    /// Queue depth over what the current capacity is sized to hold.
    Backlog,
}

impl FromStr for SignalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "utilization" => Ok(SignalKind::Utilization),
            "backlog" => Ok(SignalKind::Backlog),
            other => Err(format!("unknown scale signal {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub period: Duration,
    pub min_capacity: usize,
    pub max_capacity: usize,
    pub target_utilization: f64,
    /// Scale in only once the signal drops below
    /// `target_utilization * (1 - scale_in_margin)`.
    pub scale_in_margin: f64,
    pub scale_out_cooldown: Duration,
    pub scale_in_cooldown: Duration,
    pub signal: SignalKind,
    pub target_backlog_per_worker: f64,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            min_capacity: 1,
            max_capacity: 10,
            target_utilization: 0.75,
            scale_in_margin: 0.1,
            scale_out_cooldown: Duration::from_secs(30),
            scale_in_cooldown: Duration::from_secs(120),
            signal: SignalKind::Utilization,
            target_backlog_per_worker: 10.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngressPolicy {
    pub max_payload_bytes: usize,
    pub max_submit_batch: usize,
    pub enqueue_attempts: u32,
    pub enqueue_backoff_base: Duration,
    pub enqueue_backoff_max: Duration,
    pub result_extension: String,
}

impl Default for IngressPolicy {
    fn default() -> Self {
        Self {
            max_payload_bytes: 256 * 1024,
            max_submit_batch: 100,
            enqueue_attempts: 3,
            enqueue_backoff_base: Duration::from_millis(100),
            enqueue_backoff_max: Duration::from_secs(2),
            result_extension: "pdf".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    pub queue: QueuePolicy,
    pub worker: WorkerPolicy,
    pub scaling: ScalingPolicy,
    pub ingress: IngressPolicy,
}

fn ensure(cond: bool, message: impl Into<String>) -> Result<(), ConfigError> {
    if cond {
        Ok(())
    } else {
        Err(ConfigError(message.into()))
    }
}

impl Settings {
    /// Checks every cross-option constraint once, at boot, rather than at
    /// the first failure they would cause.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.queue;
        let w = &self.worker;
        let s = &self.scaling;
        let i = &self.ingress;

        ensure(q.max_receive_count >= 1, "max_receive_count must be at least 1")?;
        ensure(
            q.visibility_timeout > w.max_job_duration,
            format!(
                "visibility_timeout ({:?}) must exceed max_job_duration ({:?})",
                q.visibility_timeout, w.max_job_duration
            ),
        )?;
        ensure(
            q.dead_letter_retention >= q.message_retention,
            "dead_letter_retention must be at least message_retention",
        )?;
        ensure(!q.poll_interval.is_zero(), "poll_interval must be non-zero")?;

        ensure(
            (1..=10).contains(&w.batch_size),
            format!("batch_size must be within 1..=10, got {}", w.batch_size),
        )?;
        ensure(
            w.receive_wait < q.visibility_timeout,
            "receive_wait must be shorter than visibility_timeout",
        )?;
        ensure(!w.max_render_duration.is_zero(), "max_render_duration must be non-zero")?;
        ensure(
            w.max_job_duration >= w.max_render_duration,
            format!(
                "max_job_duration ({:?}) must cover max_render_duration ({:?})",
                w.max_job_duration, w.max_render_duration
            ),
        )?;
        ensure(!w.result_extension.is_empty(), "result_extension must not be empty")?;

        ensure(s.max_capacity >= 1, "max_capacity must be at least 1")?;
        ensure(
            s.min_capacity <= s.max_capacity,
            format!(
                "min_capacity ({}) must not exceed max_capacity ({})",
                s.min_capacity, s.max_capacity
            ),
        )?;
        ensure(
            s.target_utilization > 0.0 && s.target_utilization < 1.0,
            "target_utilization must be within (0, 1)",
        )?;
        ensure(
            (0.0..1.0).contains(&s.scale_in_margin),
            "scale_in_margin must be within [0, 1)",
        )?;
        ensure(!s.period.is_zero(), "scale_period must be non-zero")?;
        ensure(
            !s.scale_out_cooldown.is_zero() && !s.scale_in_cooldown.is_zero(),
            "scaling cooldowns must be non-zero",
        )?;
        ensure(
            s.target_backlog_per_worker > 0.0,
            "target_backlog_per_worker must be positive",
        )?;
        // An empty pool reports zero utilization forever.
        ensure(
            s.signal != SignalKind::Utilization || s.min_capacity >= 1,
            "min_capacity must be at least 1 with the utilization signal",
        )?;

        ensure(i.enqueue_attempts >= 1, "enqueue_attempts must be at least 1")?;
        ensure(i.max_submit_batch >= 1, "max_submit_batch must be at least 1")?;
        ensure(i.max_payload_bytes >= 2, "max_payload_bytes is too small")?;

        Ok(())
    }
}
