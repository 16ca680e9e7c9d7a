// Main entry point for the killfeed pipeline daemon.

use std::sync::Arc;

use anyhow::{Context, Result};
use killfeed_core::domains::feeds::{PollConsumer, StreamListener, StreamListenerConfig};
use killfeed_core::kernel::jobs::{queues, JobQueue, QueueWorkerConfig, WorkerPool};
use killfeed_core::kernel::{
    scheduled_tasks, KillmailPublisher, NatsPublisher, NoopPublisher, PgResponseCache, ServerDeps,
};
use killfeed_core::{domains, Config};
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,killfeed_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting killfeed pipeline");

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run migrations")?;

    let cache = Arc::new(PgResponseCache::new(pool.clone()));
    let esi_client = Arc::new(esi::EsiClient::new(
        &config.esi_base_url,
        &config.compatibility_date,
        cache,
    )?);

    let publisher: Arc<dyn KillmailPublisher> = match &config.nats_url {
        Some(url) => {
            tracing::info!(url = %url, "Connecting to NATS");
            Arc::new(NatsPublisher::connect(url).await?)
        }
        None => {
            tracing::warn!("NATS_URL not set, publishing is a no-op");
            Arc::new(NoopPublisher)
        }
    };

    let jobs = Arc::new(JobQueue::new(pool.clone()));
    let registry = Arc::new(domains::build_registry());
    let deps = Arc::new(ServerDeps::new(
        pool.clone(),
        esi_client,
        jobs.clone(),
        publisher,
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let workers = &config.workers;
    let pools = [
        QueueWorkerConfig::new(queues::KILLMAILS, workers.killmail_workers),
        // Entity fetches share the upstream error budget; keep them
        // capped so a backfill cannot drain it.
        QueueWorkerConfig::new(queues::ENTITIES, workers.entity_workers).with_rate_limit(10.0),
        QueueWorkerConfig::new(queues::PRICES, workers.price_workers).with_rate_limit(5.0),
        QueueWorkerConfig::new(queues::VALUES, workers.value_workers),
        QueueWorkerConfig::new(queues::PUBLISH, workers.publish_workers),
        QueueWorkerConfig::new(queues::STATS, workers.stats_workers),
    ];
    for worker_config in pools {
        let pool = WorkerPool::new(
            worker_config,
            jobs.clone(),
            registry.clone(),
            deps.clone(),
        );
        tasks.spawn(pool.run(shutdown.clone()));
    }

    let mut scheduler = scheduled_tasks::start_scheduler(deps.clone()).await?;

    if let Some(url) = &config.stream_url {
        let listener = StreamListener::new(
            StreamListenerConfig::new(url, config.followed.clone()),
            deps.clone(),
        );
        tasks.spawn(listener.run(shutdown.clone()));
    }

    if let Some(url) = &config.redisq_url {
        let consumer = PollConsumer::new(esi::RedisqClient::new(url)?, deps.clone());
        tasks.spawn(consumer.run(shutdown.clone()));
    }

    tracing::info!("Pipeline running; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutdown requested, draining workers");
    shutdown.cancel();
    scheduler.shutdown().await.ok();
    while tasks.join_next().await.is_some() {}

    tracing::info!("Pipeline stopped");
    Ok(())
}
