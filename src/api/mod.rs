// HTTP submission API
// Submit requests, poll their outcome, and read telemetry over REST

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::engine::Orchestrator;
use handlers::{
    cancel_request, cost_period, get_request, health_check, not_found, queue_stats, recent_traces,
    reload_registry, submit_request, ApiState,
};

/// API server configuration
#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub port: u16,
    pub host: String,
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            host: "0.0.0.0".to_string(),
            cors_enabled: true,
        }
    }
}

impl From<&OrchestratorConfig> for ApiConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            port: config.server_port,
            host: config.server_host.clone(),
            ..Default::default()
        }
    }
}

pub struct ApiServer {
    config: ApiConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(config: ApiConfig, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            state: ApiState::new(orchestrator),
        }
    }

    pub fn create_router(&self) -> Router {
        let router = Router::new()
            .route("/v1/requests", post(submit_request))
            .route("/v1/requests/:id", get(get_request))
            .route("/v1/requests/:id/cancel", post(cancel_request))
            .route("/v1/queue/stats", get(queue_stats))
            .route("/v1/telemetry/periods/:granularity", get(cost_period))
            .route("/v1/telemetry/traces", get(recent_traces))
            .route("/v1/registry/reload", post(reload_registry))
            .route("/health", get(health_check))
            .fallback(not_found)
            .with_state(self.state.clone());

        if self.config.cors_enabled {
            router.layer(CorsLayer::permissive())
        } else {
            router
        }
    }

    /// Run until the process is killed
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` resolves, letting in-flight requests finish
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = self.create_router();
        let addr = format!("{}:{}", self.config.host, self.config.port);

        info!("🚀 Request orchestrator API starting");
        info!("📡 Server address: http://{}", addr);
        info!("🔗 API endpoints:");
        info!("   POST http://{}/v1/requests", addr);
        info!("   GET  http://{}/v1/requests/:id", addr);
        info!("   POST http://{}/v1/requests/:id/cancel", addr);
        info!("   GET  http://{}/v1/queue/stats", addr);
        info!("   GET  http://{}/v1/telemetry/periods/:granularity", addr);
        info!("   GET  http://{}/v1/telemetry/traces", addr);
        info!("   POST http://{}/v1/registry/reload", addr);
        info!("   GET  http://{}/health", addr);

        axum::Server::bind(&addr.parse()?)
            .serve(app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

/// Builder pattern for the API server
pub struct ApiServerBuilder {
    config: ApiConfig,
    orchestrator: Arc<Orchestrator>,
}

impl ApiServerBuilder {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        let config = ApiConfig::from(orchestrator.config());
        Self { config, orchestrator }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn with_cors(mut self, enabled: bool) -> Self {
        self.config.cors_enabled = enabled;
        self
    }

    pub fn build(self) -> ApiServer {
        ApiServer::new(self.config, self.orchestrator)
    }
}
