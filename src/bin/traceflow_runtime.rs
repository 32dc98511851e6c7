//! Traceflow Runtime
//!
//! Opens the repository database, applies the schema, restores persisted
//! subscriptions and runs the subscription scheduler until Ctrl+C.
//!
//! Usage:
//!   cargo run --release --bin traceflow_runtime
//!
//! Environment variables:
//!   EPCIS_DB_PATH - SQLite database path (default: traceflow.db)
//!   EPCIS_SCHEMA_DIR - migration directory (default: sql)
//!   SUBSCRIPTION_TICK_INTERVAL_MS - scheduler tick (default: 1000)
//!   SUBSCRIPTION_MAX_CONCURRENCY - subscription runs per tick (default: 8)
//!   SUBSCRIPTION_CHANNEL_BUFFER - scheduler command queue (default: 256)
//!   DELIVERY_TIMEOUT_MS - outbound POST timeout (default: 10000)
//!   DELIVERY_RETRY_INITIAL_MS - first retry backoff (default: 1000)
//!   DELIVERY_RETRY_MAX_MS - backoff ceiling (default: 60000)
//!   DELIVERY_RETRY_LIMIT - retries before waiting for the next capture (default: unlimited)
//!   RUST_LOG - log filter (default: info)

use dotenv::dotenv;
use log::{error, info};
use std::sync::Arc;
use traceflow::storage::{run_schema_migrations, subscription_store};
use traceflow::subscriptions::{
    HttpResultSender, QuerySubscriptionRunner, ResultSender, SchedulerConfig, SubscriptionRunner,
    SubscriptionScheduler,
};
use traceflow::{Database, QueryRegistry, QueryService, RepositoryConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("🚀 Traceflow Runtime v{}", env!("CARGO_PKG_VERSION"));

    let config = RepositoryConfig::from_env();
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Schema dir: {}", config.schema_dir);
    info!("   ├─ Tick interval: {}ms", config.tick_interval_ms);
    info!("   └─ Max concurrency: {}", config.max_concurrency);

    info!("🔧 Initializing database...");
    let database = Database::new(&config.db_path);
    let mut conn = database.open()?;
    run_schema_migrations(&mut conn, &config.schema_dir)?;
    let subscriptions = subscription_store::list(&conn)?;
    drop(conn);
    info!("✅ Database initialized ({} subscriptions restored)", subscriptions.len());

    let registry = Arc::new(QueryRegistry::with_defaults());
    let sender: Arc<dyn ResultSender> = Arc::new(HttpResultSender::new(config.delivery_timeout())?);
    let runner: Arc<dyn SubscriptionRunner> = Arc::new(QuerySubscriptionRunner::new(
        database.clone(),
        registry.clone(),
        sender,
    ));

    let scheduler = SubscriptionScheduler::new(SchedulerConfig::from(&config), runner);
    let (handle, scheduler_task) = scheduler.spawn(subscriptions);
    info!("✅ Subscription scheduler started");

    let queries = QueryService::new(database, registry, handle.clone());
    info!(
        "📋 Queries available: {} (standard {}, vendor {})",
        queries.query_names().join(", "),
        queries.standard_version(),
        queries.vendor_version()
    );

    tokio::signal::ctrl_c().await?;
    info!("🛑 Shutdown requested");

    if let Err(e) = handle.shutdown().await {
        error!("❌ Scheduler shutdown failed: {}", e);
    }
    if let Err(e) = scheduler_task.await {
        error!("❌ Scheduler task panicked: {}", e);
    }

    info!("👋 Traceflow Runtime stopped");
    Ok(())
}
