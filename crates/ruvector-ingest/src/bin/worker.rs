//! Ingestion worker binary
//!
//! Run with: cargo run -p ruvector-ingest --bin ruvector-ingest-worker -- 0 --config ingest.toml

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ruvector_ingest::config::{IngestConfig, QueueBackend, QueueConfig};
use ruvector_ingest::ingestion::ParserRegistry;
use ruvector_ingest::processing::{
    HeartbeatRegistry, HeartbeatReporter, MemoryHeartbeatRegistry, MemoryQueue, ProgressSync,
    TaskDecomposer, TaskExecutor, WorkQueue,
};
use ruvector_ingest::providers::{LocalBlobStore, OllamaModelFactory};
use ruvector_ingest::storage::{MetadataDb, SqliteDocStore};

#[derive(Parser, Debug)]
#[command(name = "ruvector-ingest-worker", version, about = "Consume ingestion tasks from the work queue")]
struct Args {
    /// Consumer number; the consumer is named `task_consumer_<N>`
    #[arg(default_value_t = 0)]
    consumer_no: u32,

    /// TOML configuration file (defaults plus environment when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also aggregate document progress in this process
    #[arg(long)]
    sync_progress: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ruvector_ingest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => IngestConfig::from_file(path)?,
        None => IngestConfig::from_env(),
    };
    let consumer = format!("task_consumer_{}", args.consumer_no);

    tracing::info!("Configuration loaded");
    tracing::info!("  - Queue: {:?} ({})", config.queue.backend, config.queue.queue_name);
    tracing::info!("  - Database: {}", config.storage.database_path.display());
    tracing::info!("  - Ollama: {}", config.llm.base_url);
    tracing::info!("  - Max content length: {}MB", config.worker.max_content_length / 1024 / 1024);

    let db = MetadataDb::new(&config.storage.database_path)?;
    let doc_store = Arc::new(SqliteDocStore::new(&config.storage.doc_store_path)?);
    let blobs = Arc::new(LocalBlobStore::new(config.storage.blob_root.clone())?);
    let models = Arc::new(OllamaModelFactory::new(&config.llm)?);
    let (queue, registry) = connect_queue(&config.queue).await?;

    let executor = TaskExecutor::new(
        consumer.clone(),
        db.clone(),
        queue.clone(),
        blobs.clone(),
        doc_store.clone(),
        models,
        Arc::new(ParserRegistry::with_defaults()),
        config.worker.clone(),
    );

    let heartbeat = HeartbeatReporter::new(
        consumer.clone(),
        queue.clone(),
        registry,
        executor.state(),
        Duration::from_secs(config.worker.heartbeat_interval_secs),
        Duration::from_secs(config.worker.heartbeat_expiry_secs),
    )
    .spawn();

    let sync = if args.sync_progress {
        let decomposer = Arc::new(TaskDecomposer::new(
            db.clone(),
            blobs,
            doc_store,
            queue,
            config.decompose.clone(),
        ));
        let interval = Duration::from_secs(config.worker.progress_sync_interval_secs.max(1));
        Some(ProgressSync::new(db, decomposer).spawn(interval))
    } else {
        None
    };

    tracing::info!("{} is ready, press Ctrl+C to stop", consumer);
    tokio::select! {
        _ = executor.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("{} received shutdown signal", consumer);
        }
    }

    heartbeat.abort();
    if let Some(sync) = sync {
        sync.abort();
    }
    Ok(())
}

async fn connect_queue(
    config: &QueueConfig,
) -> anyhow::Result<(Arc<dyn WorkQueue>, Arc<dyn HeartbeatRegistry>)> {
    match config.backend {
        QueueBackend::Memory => {
            tracing::warn!("Using the in-process queue: tasks are only visible to this process");
            let queue = MemoryQueue::new(Duration::from_secs(config.retention_secs), config.max_len);
            Ok((Arc::new(queue), Arc::new(MemoryHeartbeatRegistry::new())))
        }
        QueueBackend::Redis => connect_redis(config).await,
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(
    config: &QueueConfig,
) -> anyhow::Result<(Arc<dyn WorkQueue>, Arc<dyn HeartbeatRegistry>)> {
    use ruvector_ingest::processing::{RedisHeartbeatRegistry, RedisStreamQueue};

    let queue = RedisStreamQueue::connect(config).await?;
    let registry = RedisHeartbeatRegistry::new(queue.connection());
    Ok((Arc::new(queue), Arc::new(registry)))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(
    _config: &QueueConfig,
) -> anyhow::Result<(Arc<dyn WorkQueue>, Arc<dyn HeartbeatRegistry>)> {
    anyhow::bail!("the redis queue backend needs the `redis` feature")
}
