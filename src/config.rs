// Runtime configuration for the orchestrator
// Loaded from an optional TOML file overlaid by ORCHESTRATOR__* environment variables

//! # Orchestrator Configuration
//!
//! Every tunable has a default so the engine runs with no configuration file at
//! all. Sources, lowest precedence first:
//!
//! 1. Built-in defaults ([`OrchestratorConfig::default`])
//! 2. `config/orchestrator.toml` (or the path passed to [`OrchestratorConfig::load`])
//! 3. Environment variables such as `ORCHESTRATOR__WORKER_COUNT=8`
//!
//! Durations are expressed in milliseconds in the file and environment; use
//! the accessor methods to get `std::time::Duration` / `chrono::Duration`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::Granularity;
use crate::{OrchestratorError, Result};

const DEFAULT_CONFIG_FILE: &str = "config/orchestrator";
const ENV_PREFIX: &str = "ORCHESTRATOR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    // Scheduler
    pub worker_count: usize,
    pub lease_timeout_ms: u64,
    pub sweep_interval_ms: u64,
    pub idle_wait_ms: u64,
    pub default_max_retries: u32,
    pub default_expiry_ms: Option<u64>,

    // Batching
    pub batching_enabled: bool,
    pub batch_window_ms: u64,
    pub batch_max_size: usize,
    pub follower_timeout_ms: u64,

    // Routing and execution
    pub max_fallback_hops: usize,
    pub pipeline_retry_budget: u32,
    pub step_timeout_ms: u64,
    pub pipeline_timeout_ms: u64,
    pub registry_ttl_ms: u64,
    pub default_chain_id: Option<String>,
    pub event_buffer_size: usize,

    // Telemetry
    pub cost_granularities: Vec<Granularity>,
    /// Finished queue items, resolved batches and traces kept by the in-memory stores
    pub in_memory_retention: usize,

    // Outer surfaces
    pub server_host: String,
    pub server_port: u16,
    pub database_url: Option<String>,
    pub capability_endpoint: String,
    pub registry_path: String,
    pub log_level: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            lease_timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
            idle_wait_ms: 1_000,
            default_max_retries: 3,
            default_expiry_ms: Some(15 * 60 * 1_000),
            batching_enabled: true,
            batch_window_ms: 2_000,
            batch_max_size: 16,
            follower_timeout_ms: 180_000,
            max_fallback_hops: 5,
            pipeline_retry_budget: 3,
            step_timeout_ms: 30_000,
            pipeline_timeout_ms: 120_000,
            registry_ttl_ms: 60_000,
            default_chain_id: Some("general".to_string()),
            event_buffer_size: 1_024,
            cost_granularities: vec![Granularity::Daily, Granularity::Monthly],
            in_memory_retention: 10_000,
            server_host: "0.0.0.0".to_string(),
            server_port: 4000,
            database_url: None,
            capability_endpoint: "http://localhost:8080".to_string(),
            registry_path: "config/registry.json".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from file and environment
    ///
    /// When `path` is `None` the default file is optional; an explicit path
    /// must exist.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(
                ::config::File::with_name(path.unwrap_or(DEFAULT_CONFIG_FILE))
                    .required(path.is_some()),
            )
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject tunables the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.worker_count == 0 {
            problems.push("worker_count must be at least 1");
        }
        if self.lease_timeout_ms == 0 {
            problems.push("lease_timeout_ms must be greater than zero");
        }
        if self.sweep_interval_ms == 0 {
            problems.push("sweep_interval_ms must be greater than zero");
        }
        if self.batch_max_size == 0 {
            problems.push("batch_max_size must be at least 1");
        }
        if self.max_fallback_hops == 0 {
            problems.push("max_fallback_hops must be at least 1");
        }
        if self.step_timeout_ms == 0 || self.pipeline_timeout_ms == 0 {
            problems.push("step and pipeline timeouts must be greater than zero");
        }
        if self.event_buffer_size == 0 {
            problems.push("event_buffer_size must be at least 1");
        }
        // A follower must outlast its leader's window plus a full pipeline run
        if self.follower_timeout_ms <= self.batch_window_ms.saturating_add(self.pipeline_timeout_ms) {
            problems.push("follower_timeout_ms must exceed batch_window_ms + pipeline_timeout_ms");
        }
        if self.in_memory_retention == 0 {
            problems.push("in_memory_retention must be at least 1");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Configuration(problems.join("; ")))
        }
    }

    pub fn lease_timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.lease_timeout_ms as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn default_expiry(&self) -> Option<chrono::Duration> {
        self.default_expiry_ms
            .map(|ms| chrono::Duration::milliseconds(ms as i64))
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn follower_timeout(&self) -> Duration {
        Duration::from_millis(self.follower_timeout_ms)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_timeout_ms)
    }

    pub fn registry_ttl(&self) -> Duration {
        Duration::from_millis(self.registry_ttl_ms)
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}
