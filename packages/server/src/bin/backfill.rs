// CLI for bulk historical imports.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use killfeed_core::domains::backfill::{run_backfill, BackfillConfig, BackfillMode};
use killfeed_core::kernel::jobs::JobQueue;
use killfeed_core::kernel::{NoopPublisher, PgResponseCache, ServerDeps};
use killfeed_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Fetch reference pages and enqueue fetch jobs.
    Enqueue,
    /// Fetch full bodies and ingest inline.
    Direct,
}

#[derive(Parser, Debug)]
#[command(name = "backfill", about = "Bulk historical killmail import")]
struct Args {
    /// Name of this run; progress is recorded per name for resume.
    #[arg(long, default_value = "backfill")]
    name: String,

    #[arg(long, value_enum, default_value_t = Mode::Enqueue)]
    mode: Mode,

    /// Upstream filter as a JSON object, passed through verbatim.
    #[arg(long, default_value = "{}")]
    filter: String,

    #[arg(long, default_value_t = 1_000)]
    batch_size: i64,

    /// Start at this page instead of the recorded resume point.
    #[arg(long)]
    skip: Option<i64>,

    /// In-flight pages in enqueue mode.
    #[arg(long, default_value_t = 5)]
    concurrency: usize,

    /// Export API base URL; falls back to EXPORT_BASE_URL.
    #[arg(long)]
    export_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,killfeed_core=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    let export_url = args
        .export_url
        .or(config.export_base_url)
        .context("export URL required: pass --export-url or set EXPORT_BASE_URL")?;
    let filter: serde_json::Value =
        serde_json::from_str(&args.filter).context("--filter must be a JSON object")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;
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
    let jobs = Arc::new(JobQueue::new(pool.clone()));
    // Publishing stays with the daemon's workers; this process only
    // enqueues and inserts.
    let deps = ServerDeps::new(pool, esi_client, jobs, Arc::new(NoopPublisher));

    let export = esi::ExportClient::new(&export_url)?;
    let backfill_config = BackfillConfig {
        name: args.name.clone(),
        mode: match args.mode {
            Mode::Enqueue => BackfillMode::Enqueue,
            Mode::Direct => BackfillMode::Direct,
        },
        filter,
        batch_size: args.batch_size,
        start_page: args.skip,
        concurrency: args.concurrency,
    };

    match run_backfill(&deps, &export, &backfill_config).await {
        Ok(report) => {
            println!(
                "pages: {}  fetched: {}  enqueued: {}  inserted: {}  duplicate: {}  errors: {}",
                report.pages,
                report.fetched,
                report.enqueued,
                report.inserted,
                report.duplicates,
                report.errors
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    }
}
