use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt::format, prelude::__tracing_subscriber_field_MakeExt, EnvFilter};

use crate::domain::{
    error::ConfigError,
    policy::{IngressPolicy, QueuePolicy, ScalingPolicy, Settings, SignalKind, WorkerPolicy},
};

/// Which halves of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    All,
    Ingress,
    Worker,
}

impl Role {
    pub fn runs_ingress(self) -> bool {
        matches!(self, Role::All | Role::Ingress)
    }

    pub fn runs_worker(self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Role::All),
            "ingress" => Ok(Role::Ingress),
            "worker" => Ok(Role::Worker),
            other => Err(format!("unknown role {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format {:?}", other)),
        }
    }
}

#[derive(Debug, Parser)]
pub struct Config {
    #[clap(long, env, default_value = "all")]
    pub role: Role,
    /// Postgres URL of the job queue. Without it the queue lives in memory
    /// and only `--role all` makes sense.
    #[clap(long, env = "QUEUE_URL")]
    pub queue_url: Option<String>,
    #[clap(long, env, default_value = "true", parse(try_from_str))]
    pub run_migrations: bool,
    /// Without it events go to the log and there is no request ingress.
    #[clap(long, env)]
    pub nats_url: Option<String>,
    #[clap(long, env, default_value = "render")]
    pub subject_prefix: String,
    #[clap(long, env, default_value = "./data")]
    pub artifact_root: PathBuf,
    #[clap(long, env = "TEMPLATES_BUCKET", default_value = "templates")]
    pub templates_bucket: String,
    #[clap(long, env = "RESULTS_BUCKET", default_value = "results")]
    pub results_bucket: String,
    #[clap(long, env, default_value = "text")]
    pub log_format: LogFormat,

    #[clap(long, env, default_value = "3")]
    pub max_receive_count: u32,
    #[clap(long, env, default_value = "60")]
    pub visibility_timeout_secs: u64,
    #[clap(long, env, default_value = "345600")]
    pub message_retention_secs: u64,
    #[clap(long, env, default_value = "1209600")]
    pub dead_letter_retention_secs: u64,
    #[clap(long, env, default_value = "500")]
    pub poll_interval_ms: u64,

    #[clap(long, env, default_value = "10")]
    pub batch_size: usize,
    #[clap(long, env, default_value = "20")]
    pub receive_wait_secs: u64,
    #[clap(long, env, default_value = "30")]
    pub max_render_secs: u64,
    /// Whole-message budget; must stay under the visibility timeout.
    #[clap(long, env, default_value = "45")]
    pub max_job_secs: u64,
    /// Hand failed messages back after this many seconds instead of waiting
    /// out the visibility timeout.
    #[clap(long, env)]
    pub abandon_delay_secs: Option<u64>,
    #[clap(long, env, default_value = "300")]
    pub template_cache_ttl_secs: u64,
    #[clap(long, env, default_value = "pdf")]
    pub result_extension: String,
    #[clap(long, env, default_value = "60")]
    pub queue_outage_secs: u64,
    #[clap(long, env, default_value = "30")]
    pub receive_backoff_max_secs: u64,

    #[clap(long, env, default_value = "60")]
    pub scale_period_secs: u64,
    #[clap(long, env, default_value = "1")]
    pub min_capacity: usize,
    #[clap(long, env, default_value = "10")]
    pub max_capacity: usize,
    #[clap(long, env, default_value = "0.75")]
    pub target_utilization: f64,
    #[clap(long, env, default_value = "0.1")]
    pub scale_in_margin: f64,
    #[clap(long, env, default_value = "30")]
    pub scale_out_cooldown_secs: u64,
    #[clap(long, env, default_value = "120")]
    pub scale_in_cooldown_secs: u64,
    #[clap(long, env, default_value = "utilization")]
    pub scale_signal: SignalKind,
    #[clap(long, env, default_value = "10")]
    pub target_backlog_per_worker: f64,

    #[clap(long, env, default_value = "262144")]
    pub max_payload_bytes: usize,
    #[clap(long, env, default_value = "100")]
    pub max_submit_batch: usize,
    #[clap(long, env, default_value = "3")]
    pub enqueue_attempts: u32,
    #[clap(long, env, default_value = "100")]
    pub enqueue_backoff_base_ms: u64,
    #[clap(long, env, default_value = "2000")]
    pub enqueue_backoff_max_ms: u64,
}

impl Config {
    /// Builds the policy values and rejects inconsistent combinations.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        if self.queue_url.is_none() && self.role != Role::All {
            return Err(ConfigError(format!(
                "role {:?} needs a shared queue, set QUEUE_URL",
                self.role
            )));
        }

        let settings = Settings {
            queue: QueuePolicy {
                max_receive_count: self.max_receive_count,
                visibility_timeout: Duration::from_secs(self.visibility_timeout_secs),
                message_retention: Duration::from_secs(self.message_retention_secs),
                dead_letter_retention: Duration::from_secs(self.dead_letter_retention_secs),
                poll_interval: Duration::from_millis(self.poll_interval_ms),
            },
            worker: WorkerPolicy {
                batch_size: self.batch_size,
                receive_wait: Duration::from_secs(self.receive_wait_secs),
                max_render_duration: Duration::from_secs(self.max_render_secs),
                max_job_duration: Duration::from_secs(self.max_job_secs),
                abandon_delay: self.abandon_delay_secs.map(Duration::from_secs),
                template_cache_ttl: Duration::from_secs(self.template_cache_ttl_secs),
                result_extension: self.result_extension.clone(),
                queue_outage_threshold: Duration::from_secs(self.queue_outage_secs),
                receive_backoff_max: Duration::from_secs(self.receive_backoff_max_secs),
            },
            scaling: ScalingPolicy {
                period: Duration::from_secs(self.scale_period_secs),
                min_capacity: self.min_capacity,
                max_capacity: self.max_capacity,
                target_utilization: self.target_utilization,
                scale_in_margin: self.scale_in_margin,
                scale_out_cooldown: Duration::from_secs(self.scale_out_cooldown_secs),
                scale_in_cooldown: Duration::from_secs(self.scale_in_cooldown_secs),
                signal: self.scale_signal,
                target_backlog_per_worker: self.target_backlog_per_worker,
            },
            ingress: IngressPolicy {
                max_payload_bytes: self.max_payload_bytes,
                max_submit_batch: self.max_submit_batch,
                enqueue_attempts: self.enqueue_attempts,
                enqueue_backoff_base: Duration::from_millis(self.enqueue_backoff_base_ms),
                enqueue_backoff_max: Duration::from_millis(self.enqueue_backoff_max_ms),
                result_extension: self.result_extension.clone(),
            },
        };

        settings.validate()?;
        Ok(settings)
    }
}

pub fn configure_tracing(log_format: LogFormat) {
    match log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .init(),
        LogFormat::Text => {
            let formatter =
                format::debug_fn(|writer, field, value| write!(writer, "{}={:?}", field, value))
                    .delimited(" ");

            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_target(false)
                .fmt_fields(formatter)
                .init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["render-queue"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults_produce_valid_settings() {
        let config = parse(&["--queue-url", "postgres://localhost/render"]);
        let settings = config.settings().unwrap();

        assert_eq!(settings.queue.max_receive_count, 3);
        assert_eq!(settings.worker.batch_size, 10);
        assert_eq!(settings.scaling.signal, SignalKind::Utilization);
        assert_eq!(settings.worker.abandon_delay, None);
    }

    #[test]
    fn split_roles_need_a_shared_queue() {
        let config = Config {
            queue_url: None,
            ..parse(&["--role", "worker"])
        };
        let err = config.settings().unwrap_err();
        assert!(err.to_string().contains("QUEUE_URL"));
    }

    #[test]
    fn rejects_render_budget_beyond_visibility() {
        let config = parse(&[
            "--queue-url",
            "postgres://localhost/render",
            "--visibility-timeout-secs",
            "30",
            "--max-render-secs",
            "45",
        ]);
        assert!(config.settings().is_err());
    }

    #[test]
    fn rejects_job_budget_beyond_visibility() {
        let config = parse(&[
            "--queue-url",
            "postgres://localhost/render",
            "--visibility-timeout-secs",
            "40",
            "--max-render-secs",
            "20",
        ]);
        let err = config.settings().unwrap_err();
        assert!(err.to_string().contains("max_job_duration"));
    }

    #[test]
    fn parses_enums() {
        let config = parse(&["--role", "ingress", "--log-format", "json", "--scale-signal", "backlog"]);
        assert_eq!(config.role, Role::Ingress);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.scale_signal, SignalKind::Backlog);

        assert!(Config::try_parse_from(["render-queue", "--role", "janitor"]).is_err());
    }
}
