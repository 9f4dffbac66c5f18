use anyhow::Result;
use clap::Parser;
use render_queue::api::service::RequestHandler;
use render_queue::autoscaler::{Autoscaler, PoolUtilization, QueueBacklog};
use render_queue::config::{self, Config};
use render_queue::domain::policy::{Settings, SignalKind};
use render_queue::domain::repository::{ArtifactStore, DeadLetterQueue, JobQueue};
use render_queue::domain::scaling::SignalSource;
use render_queue::infrastructure::events::{AnyEventTransport, LogEventTransport};
use render_queue::infrastructure::filesystem::FsArtifactStore;
use render_queue::infrastructure::memory::InMemoryQueue;
use render_queue::infrastructure::nats::{NatsEventTransport, NatsRpc};
use render_queue::infrastructure::postgres::PgJobQueue;
use render_queue::infrastructure::renderer::PlaceholderRenderer;
use render_queue::worker::{RenderWorker, WorkerPool};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    config::configure_tracing(config.log_format);

    let settings = config.settings()?;

    let store = FsArtifactStore::new(
        config.artifact_root.clone(),
        config.templates_bucket.clone(),
        config.results_bucket.clone(),
    );

    let nc = match &config.nats_url {
        Some(url) => Some(async_nats::connect(url).await?),
        None => None,
    };
    let event = match &nc {
        Some(nc) => AnyEventTransport::Nats(NatsEventTransport::new(
            nc.clone(),
            config.subject_prefix.clone(),
        )),
        None => AnyEventTransport::Log(LogEventTransport),
    };

    match &config.queue_url {
        Some(url) => {
            let pool = PgPoolOptions::new().connect(url).await?;
            let queue = PgJobQueue::new(pool, settings.queue.clone());
            if config.run_migrations {
                queue.migrate().await?;
            }
            run(&config, settings, queue, store, event, nc).await
        }
        None => {
            warn!("QUEUE_URL not set, using an in-memory queue");
            let queue = InMemoryQueue::new(settings.queue.clone());
            run(&config, settings, queue, store, event, nc).await
        }
    }
}

async fn run<Q, S>(
    config: &Config,
    settings: Settings,
    queue: Q,
    store: S,
    event: AnyEventTransport,
    nc: Option<async_nats::Client>,
) -> Result<()>
where
    Q: JobQueue + DeadLetterQueue,
    S: ArtifactStore,
{
    let shutdown = CancellationToken::new();

    let pool = if config.role.runs_worker() {
        let worker = RenderWorker::new(
            queue.clone(),
            store.clone(),
            PlaceholderRenderer,
            event.clone(),
            settings.worker.clone(),
        );
        let pool = WorkerPool::new(worker, shutdown.child_token());

        let signal: Box<dyn SignalSource> = match settings.scaling.signal {
            SignalKind::Utilization => Box::new(PoolUtilization::new(pool.clone())),
            SignalKind::Backlog => Box::new(QueueBacklog::new(
                queue.clone(),
                pool.clone(),
                settings.scaling.target_backlog_per_worker,
            )),
        };
        let scaler = Autoscaler::new(
            pool.clone(),
            signal,
            event.clone(),
            settings.scaling.clone(),
            settings.scaling.min_capacity,
        );
        scaler.start().await?;
        tokio::spawn(scaler.run(shutdown.child_token()));

        Some(pool)
    } else {
        None
    };

    let ingress = async {
        match (config.role.runs_ingress(), nc) {
            (true, Some(nc)) => {
                let handler = RequestHandler::new(
                    queue.clone(),
                    store.clone(),
                    event.clone(),
                    settings.ingress.clone(),
                );
                NatsRpc::new(nc, config.subject_prefix.clone())
                    .listen(handler)
                    .await
            }
            (true, None) => {
                warn!("NATS_URL not set, request ingress disabled");
                futures::future::pending().await
            }
            (false, _) => futures::future::pending().await,
        }
    };

    tokio::select! {
        r = ingress => {
            match r {
                Ok(()) => error!("Ingress listener exited"),
                Err(e) => error!(error = %e, "Ingress listener failed"),
            }
        }
        r = tokio::signal::ctrl_c() => {
            r?;
            info!("Shutdown requested");
        }
    }

    shutdown.cancel();
    if let Some(pool) = pool {
        pool.shutdown().await;
    }

    info!("Exiting");

    Ok(())
}
