// # Stampede Server
//
// Entry point for the dispatch pipeline: loads configuration, wires the
// storage drivers, registers the pipeline workers and runs until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stampede::config::Config;
use stampede::queue::{Broker, WorkerRuntime};
use stampede::storage::{
    JobStore, MemoryJobStore, MemoryObjectStorage, MemoryPushDb, ObjectStorage, PgJobStore,
    PgPushDb, PushBus, PushDb, S3ObjectStorage,
};
use stampede::worker::{
    CreateBatchesFromFiltersWorker, CsvSplitWorker, DbToCsvWorker, DirectWorker,
    JobGroupExpanderWorker, ProcessBatchWorker, WorkerContext,
};
use stampede::Result;

#[derive(Parser)]
#[command(name = "stampede-server", version, about = "Push-notification dispatch pipeline")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "STAMPEDE_CONFIG", default_value = "config/stampede.yaml")]
    config: PathBuf,

    /// Run against in-memory drivers instead of Postgres/S3 (local dev).
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_file(&cli.config)?;
    info!(version = stampede::VERSION, config = %cli.config.display(), "starting stampede");

    let broker = Broker::new();
    let (store, push_db, objects): (
        Arc<dyn JobStore>,
        Arc<dyn PushDb>,
        Arc<dyn ObjectStorage>,
    ) = if cli.memory {
        warn!("running with in-memory drivers, nothing is durable");
        (
            Arc::new(MemoryJobStore::new()),
            Arc::new(MemoryPushDb::new()),
            Arc::new(MemoryObjectStorage::new()),
        )
    } else {
        let pool = stampede::storage::postgres::connect(&config.database).await?;
        let push_pool = stampede::storage::postgres::connect(&config.push_db).await?;
        let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        (
            Arc::new(PgJobStore::new(pool)),
            Arc::new(PgPushDb::new(push_pool)),
            Arc::new(S3ObjectStorage::new(
                aws_sdk_s3::Client::new(&aws),
                &config.s3,
            )),
        )
    };
    let bus: Arc<dyn PushBus> = build_bus(&config, cli.memory)?;

    let ctx = Arc::new(WorkerContext {
        config: config.clone(),
        broker: broker.clone(),
        store,
        push_db,
        objects,
        bus,
    });

    let mut runtime = WorkerRuntime::new(broker, config.queue.clone());
    runtime.register(Arc::new(JobGroupExpanderWorker::new(ctx.clone())));
    runtime.register(Arc::new(CreateBatchesFromFiltersWorker::new(ctx.clone())));
    runtime.register(Arc::new(DbToCsvWorker::new(ctx.clone())));
    runtime.register(Arc::new(CsvSplitWorker::new(ctx.clone())));
    runtime.register(Arc::new(ProcessBatchWorker::new(ctx.clone())));
    runtime.register(Arc::new(DirectWorker::new(ctx)));

    let runtime = Arc::new(runtime);
    let shutdown_runtime = runtime.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown_runtime.shutdown();
        }
    });

    runtime.run().await;
    Ok(())
}

#[cfg(feature = "kafka")]
fn build_bus(config: &Config, memory: bool) -> Result<Arc<dyn PushBus>> {
    if memory {
        return Ok(Arc::new(stampede::storage::MemoryPushBus::new()));
    }
    Ok(Arc::new(stampede::storage::KafkaPushBus::new(&config.bus)?))
}

#[cfg(not(feature = "kafka"))]
fn build_bus(_config: &Config, memory: bool) -> Result<Arc<dyn PushBus>> {
    if memory {
        return Ok(Arc::new(stampede::storage::MemoryPushBus::new()));
    }
    warn!("built without the kafka feature, pushes go to the log bus");
    Ok(Arc::new(stampede::storage::LogPushBus))
}
