// Orchestration Engine
// Everything between a submitted request and its recorded outcome

//! # Orchestration Engine Module
//!
//! The engine turns configuration rows (in `models/`) into running requests.
//!
//! ## Architecture Overview
//!
//! - **Registry** (`registry`): validated, versioned snapshots of capabilities,
//!   intents, mappings, chains and actors, loaded through a `ConfigSource`
//! - **Routing** (`classifier`, `resolver`): request text → intent → step list
//! - **Execution** (`pipeline`, `invoker`, `supervisor`): runs steps against the
//!   capability invocation boundary
//! - **Scheduling** (`queue`, `postgres_queue`, `scheduler`): priority queue with
//!   leases and a worker pool
//! - **Batching** (`batching`, `postgres_batching`): one upstream call per group
//!   of equivalent requests
//! - **Telemetry** (`telemetry`, `postgres_telemetry`): debug traces and cost periods
//! - **Orchestrator** (`orchestrator`): the facade that wires all of the above
//!
//! ## Rust Learning Notes:
//!
//! ### Traits at the Storage Seams
//! Every store (`QueueStore`, `BatchStore`, `TelemetryStore`, `ConfigSource`) is
//! an `#[async_trait]` trait with an in-memory implementation. Components hold
//! `Arc<dyn Trait>`, so swapping the in-memory queue for Postgres is a builder
//! call, not a code change.

/// Dotted-path lookups into request context
pub mod context;

/// Registry snapshots and configuration sources
///
/// Contains:
/// - RegistryDocument: the raw configuration rows
/// - RegistrySnapshot: validated, immutable, versioned view
/// - Registry: TTL-cached handle with explicit reload
/// - ConfigSource trait with in-memory and JSON file implementations
pub mod registry;

/// Keyword intent classification
pub mod classifier;

/// Intent/actor to step list resolution, including fallback walks
pub mod resolver;

/// Broadcast event bus for orchestrator notifications
pub mod events;

/// Capability invocation boundary
///
/// Contains:
/// - CapabilityInvoker trait (plain and streaming calls)
/// - HttpCapabilityInvoker over reqwest with NDJSON streaming
pub mod invoker;

/// Supervision of fire-and-forget steps
pub mod supervisor;

/// Step execution with retries, timeouts and display modes
pub mod pipeline;

/// Priority queue storage contract, in-memory store and facade
pub mod queue;

/// Durable queue store on PostgreSQL
pub mod postgres_queue;

/// Worker pool, lease renewal, sweeper and callbacks
pub mod scheduler;

/// Similarity hashing and leader/follower batching
pub mod batching;

/// Durable batch store on PostgreSQL
pub mod postgres_batching;

/// Debug traces and cost period aggregation
pub mod telemetry;

/// Durable trace and cost period store on PostgreSQL
pub mod postgres_telemetry;

/// Facade wiring every component together
pub mod orchestrator;


// Re-export the types most callers need

pub use registry::{
    ConfigSource,          // Where configuration rows come from
    InMemoryConfigSource,  // Rows held in memory (tests, embedding)
    JsonFileConfigSource,  // Rows read from a JSON document
    Registry,              // Cached, reloadable snapshot handle
    RegistryDocument,      // Raw rows
    RegistrySnapshot,      // Validated view used by one request
};

pub use classifier::IntentClassifier;
pub use resolver::{ChainResolver, Route, RouteSource, Unroutable};
pub use events::{EventBus, OrchestratorEvent};
pub use invoker::{CapabilityInvoker, HttpCapabilityInvoker, InvocationOutput, StreamChunk};
pub use supervisor::{DetachedStatus, DetachedTaskSupervisor};
pub use pipeline::{ActorPipeline, DisplayEvent, PipelineInput, PipelineResult, PipelineSettings, StepState};

pub use queue::{ClaimOutcome, InMemoryQueueStore, PriorityQueue, QueueStore};
pub use postgres_queue::PostgresQueueStore;
pub use scheduler::{
    CallbackNotifier,      // Reports terminal outcomes to submitters
    HttpCallbackNotifier,  // POSTs to the item's callback_url
    JobHandler,            // What a worker runs per claimed item
    Scheduler,
    SchedulerHandle,
    SchedulerSettings,
};

pub use batching::{
    Admission, BatchEngine, BatchKey, BatchParticipation, BatchResolution, BatchSettings, BatchStore,
    InMemoryBatchStore,
};
pub use postgres_batching::PostgresBatchStore;
pub use telemetry::{CostRecorder, InMemoryTelemetryStore, TelemetryStore};
pub use postgres_telemetry::PostgresTelemetryStore;
pub use orchestrator::{OrchestrationRequest, Orchestrator, OrchestratorBuilder, Submission};
