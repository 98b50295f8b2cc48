// Request Orchestrator - HTTP server and worker pool
// Run with: cargo run --bin server

//! # Request Orchestrator Server Binary
//!
//! Loads configuration, builds the orchestrator, starts the scheduler's
//! worker pool and serves the REST API until Ctrl-C.
//!
//! ```text
//! main()
//!   ↓ loads
//! OrchestratorConfig (config/orchestrator.toml + ORCHESTRATOR__* env)
//!   ↓ builds
//! Orchestrator (registry, pipeline, queue, batching, telemetry)
//!   ↓ drives
//! Scheduler workers  +  ApiServer (axum)
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Graceful Shutdown
//! The API server stops accepting connections when the Ctrl-C future
//! resolves. The worker pool is shut down afterwards so in-flight items are
//! reported before the process exits, then detached steps get one step
//! timeout to finish.

use dotenv::dotenv;
use request_orchestrator::api::ApiServerBuilder;
use request_orchestrator::engine::{
    HttpCallbackNotifier, PostgresBatchStore, PostgresQueueStore, PostgresTelemetryStore,
};
use request_orchestrator::{Orchestrator, OrchestratorConfig};
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenv() {
        eprintln!("Warning: Could not load .env file: {}", e);
    }

    let config_path = env::var("ORCHESTRATOR_CONFIG").ok();
    let config = OrchestratorConfig::load(config_path.as_deref())?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Starting Request Orchestrator...");
    info!("=====================================");
    info!("Server: {}", config.server_addr());
    info!("Registry: {}", config.registry_path);
    info!("Capability endpoint: {}", config.capability_endpoint);
    info!("Workers: {}", config.worker_count);

    let mut builder =
        Orchestrator::builder(config.clone()).with_notifier(Arc::new(HttpCallbackNotifier::new()));
    match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;

            let queue = PostgresQueueStore::new(pool.clone());
            queue.migrate().await?;
            let batches = PostgresBatchStore::new(pool.clone());
            batches.migrate().await?;
            let telemetry = PostgresTelemetryStore::new(pool);
            telemetry.migrate().await?;

            info!("✅ Queue, batches and telemetry on PostgreSQL");
            builder = builder
                .with_queue_store(Arc::new(queue))
                .with_batch_store(Arc::new(batches))
                .with_telemetry_store(Arc::new(telemetry));
        }
        None => warn!("No database_url configured, state is in-memory and lost on restart"),
    }

    let orchestrator = Arc::new(builder.build().await?);
    let workers = orchestrator.start_workers();

    let served = ApiServerBuilder::new(orchestrator.clone())
        .build()
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            info!("🛑 Shutdown requested");
        })
        .await;

    workers.shutdown().await;
    orchestrator.shutdown().await;
    info!("👋 Request Orchestrator stopped");
    served.map_err(|e| anyhow::anyhow!(e))
}
