mod packs;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;

use tollgate_common::config::EngineConfig;
use tollgate_engine::executor::ExecutorRegistry;
use tollgate_engine::ledger::RedisLedger;
use tollgate_engine::objstore::S3ResultStore;
use tollgate_engine::queue::SqsWorkQueue;
use tollgate_engine::store::PgRunStore;
use tollgate_engine::worker::WorkerService;

use packs::EchoPack;

#[derive(Parser)]
#[command(name = "tollgate-worker", about = "Tollgate worker service")]
struct Args {
    /// PostgreSQL connection string
    #[arg(long, env = "TOLLGATE_DATABASE_URL")]
    database_url: String,

    /// Redis connection string for the ledger cache
    #[arg(long, env = "TOLLGATE_REDIS_URL", default_value = "redis://127.0.0.1/")]
    redis_url: String,

    /// SQS queue URL for work dispatch
    #[arg(long, env = "TOLLGATE_QUEUE_URL")]
    queue_url: String,

    /// S3 bucket holding result artifacts
    #[arg(long, env = "TOLLGATE_RESULT_BUCKET")]
    result_bucket: String,

    /// Optional JSON config file overriding engine defaults
    #[arg(long)]
    config: Option<String>,

    /// Prometheus exporter bind address
    #[arg(long, default_value = "127.0.0.1:9091")]
    metrics_address: String,

    /// Maximum database connections
    #[arg(long, default_value_t = 8)]
    db_pool_size: u32,
}

fn load_config(path: Option<&str>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {path}"))?
        }
        None => EngineConfig::default(),
    };
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_address.parse::<std::net::SocketAddr>()?)
        .install()
        .context("installing prometheus exporter")?;

    let pool = PgPoolOptions::new()
        .max_connections(args.db_pool_size)
        .connect(&args.database_url)
        .await
        .context("connecting to database")?;

    let redis_client = redis::Client::open(args.redis_url.as_str()).context("redis client")?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("redis connection")?;

    let aws_config =
        aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    let s3 = aws_sdk_s3::Client::new(&aws_config);
    let sqs = aws_sdk_sqs::Client::new(&aws_config);

    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(EchoPack));

    let running = Arc::new(AtomicBool::new(true));
    let worker = Arc::new(WorkerService::new(
        Arc::new(PgRunStore::new(pool)),
        Arc::new(RedisLedger::new(redis_conn)),
        Arc::new(SqsWorkQueue::new(sqs, args.queue_url.clone())),
        Arc::new(S3ResultStore::new(s3, args.result_bucket.clone())),
        Arc::new(registry),
        config,
        Arc::clone(&running),
    ));

    let loop_handle = tokio::spawn(Arc::clone(&worker).run_loop());

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("Shutdown requested; draining in-flight work");
    running.store(false, Ordering::SeqCst);
    loop_handle.await.context("worker loop join")?;

    Ok(())
}
