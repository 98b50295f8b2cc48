// Request Orchestrator - Rust Edition
// Intent routing, priority queueing and request batching for capability calls

//! # Request Orchestrator Library
//!
//! This is the library root for the request orchestrator: the engine that sits
//! behind a thin HTTP handler, accepts a natural-language or structured request,
//! works out what should run, and runs it.
//!
//! ## Request Flow
//!
//! ```text
//! submit()                      (api / Orchestrator::submit)
//!   ↓ enqueue
//! PriorityQueue                 (engine::queue)
//!   ↓ atomic claim by a worker  (engine::scheduler)
//! IntentClassifier              (engine::classifier)
//!   ↓ intent or none
//! ChainResolver                 (engine::resolver)
//!   ↓ ordered steps (+ fallback tiers)
//! BatchEngine                   (engine::batching, optional)
//!   ↓ leader runs, followers wait
//! ActorPipeline                 (engine::pipeline)
//!   ↓ per-step invoke through CapabilityInvoker
//! CostRecorder                  (engine::telemetry)
//! ```
//!
//! ## Core Components
//!
//! - [`engine::Registry`]: versioned, read-only snapshot of capabilities,
//!   intents, action mappings, function chains and actors
//! - [`engine::IntentClassifier`]: keyword/priority intent selection
//! - [`engine::ChainResolver`]: intent or actor → concrete step list, walking
//!   fallback chains with a hop bound
//! - [`engine::ActorPipeline`]: step execution with required/optional,
//!   fire-and-forget, streaming and retry semantics
//! - [`engine::PriorityQueue`] / [`engine::Scheduler`]: tiered queue with
//!   exactly-once claims, leases, retries, expiry and a worker pool
//! - [`engine::BatchEngine`]: groups equivalent concurrent requests into one
//!   upstream call
//! - [`engine::CostRecorder`]: debug traces and incremental cost periods
//!
//! ## Rust Learning Notes:
//!
//! ### Re-exports
//! `pub use` statements create shortcuts so users don't need to know the
//! internal module structure. Instead of
//! `use request_orchestrator::engine::orchestrator::Orchestrator`, users can
//! write `use request_orchestrator::Orchestrator`.

// Core domain models (configuration rows and runtime records)
pub mod models;

// Engine implementations: registry, classification, execution, queueing
pub mod engine;

// Runtime configuration loaded from file + environment
pub mod config;

// HTTP submission API
pub mod api;

pub use config::OrchestratorConfig;

pub use models::{
    Actor, ActionMapping, Capability, CapabilityKey, ChainStep, CostPeriod, DebugTrace,
    ErrorKind, FunctionChain, Intent, OnError, QueueError, QueueItem, QueuePriority,
    QueueStatus, RequestBatch,
};

pub use engine::{
    ActorPipeline, BatchEngine, CapabilityInvoker, ChainResolver, CostRecorder, EventBus,
    IntentClassifier, Orchestrator, PriorityQueue, Registry, Scheduler,
};

pub use api::{ApiServer, ApiServerBuilder};

// Using the `thiserror` crate to make error handling easier
use thiserror::Error;
use uuid::Uuid;

/// Error types for orchestrator operations
///
/// The first group of variants is the request-level taxonomy that ends up on
/// terminal queue items (see [`ErrorKind`]). The rest are ambient failures:
/// bad configuration, storage problems, serialization.
///
/// ## Rust Learning Notes:
///
/// ### The `thiserror` Crate
/// - `#[derive(Error)]` implements the `std::error::Error` trait
/// - `#[error("...")]` provides human-readable error messages
/// - `#[from]` enables automatic conversion with the `?` operator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// No usable intent, mapping or chain (fallbacks included)
    #[error("No route available: {0}")]
    NoRouteAvailable(String),

    #[error("Capability disabled: {capability}")]
    CapabilityDisabled { capability: String },

    /// A single step's upstream call errored
    #[error("Step '{capability}' failed: {message}")]
    StepFailed { capability: String, message: String },

    /// The pipeline ran past its deadline
    #[error("Pipeline aborted: {0}")]
    PipelineAborted(String),

    #[error("Queue item {id} expired")]
    QueueExpired { id: Uuid },

    #[error("Retries exhausted for queue item {id}: {message}")]
    QueueRetriesExhausted { id: Uuid, message: String },

    /// Propagated uniformly to every member of a batch
    #[error("Batch upstream call failed: {0}")]
    BatchUpstreamFailed(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Load-time configuration problems (cycles, unknown references, bad tunables)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A worker reported on an item it no longer owns
    #[error("Lease lost on queue item {id} (worker {worker_id})")]
    LeaseLost { id: Uuid, worker_id: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Storage-related errors
    /// Using anyhow::Error for flexible error handling across storage backends
    #[error("Storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Map onto the taxonomy stored on queue items
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NoRouteAvailable(_) => ErrorKind::NoRouteAvailable,
            OrchestratorError::CapabilityDisabled { .. } => ErrorKind::CapabilityDisabled,
            OrchestratorError::StepFailed { .. } => ErrorKind::StepFailed,
            OrchestratorError::PipelineAborted(_) => ErrorKind::PipelineAborted,
            OrchestratorError::QueueExpired { .. } => ErrorKind::QueueExpired,
            OrchestratorError::QueueRetriesExhausted { .. } => ErrorKind::QueueRetriesExhausted,
            OrchestratorError::BatchUpstreamFailed(_) => ErrorKind::BatchUpstreamFailed,
            OrchestratorError::Cancelled(_) => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }

    /// Convert into the structured error stored on a queue item
    pub fn to_queue_error(&self) -> QueueError {
        QueueError::new(self.kind(), self.to_string())
    }
}

impl From<QueueError> for OrchestratorError {
    fn from(err: QueueError) -> Self {
        match err.kind {
            ErrorKind::NoRouteAvailable => OrchestratorError::NoRouteAvailable(err.message),
            ErrorKind::CapabilityDisabled => OrchestratorError::CapabilityDisabled {
                capability: err.message,
            },
            ErrorKind::PipelineAborted => OrchestratorError::PipelineAborted(err.message),
            ErrorKind::BatchUpstreamFailed => OrchestratorError::BatchUpstreamFailed(err.message),
            ErrorKind::Cancelled => OrchestratorError::Cancelled(err.message),
            _ => OrchestratorError::Internal(err.to_string()),
        }
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for OrchestratorError {
    fn from(err: sqlx::Error) -> Self {
        OrchestratorError::Storage(anyhow::Error::new(err))
    }
}

impl From<::config::ConfigError> for OrchestratorError {
    fn from(err: ::config::ConfigError) -> Self {
        OrchestratorError::Configuration(err.to_string())
    }
}

/// Type alias for Results that use our custom error type
pub type Result<T> = std::result::Result<T, OrchestratorError>;
