// Core domain models for the Request Orchestrator
// These are the plain data structures shared by every engine component

//! # Domain Models Module
//!
//! This module contains the configuration and runtime records the orchestrator
//! works with. Configuration records (capabilities, intents, action mappings,
//! function chains, actors) are loaded read-only into the registry; runtime
//! records (queue items, request batches, cost periods, debug traces) are the
//! mutable state owned by the stores.
//!
//! ## Rust Learning Notes:
//!
//! ### Module Declarations
//! Each `pub mod` declaration pulls in the `.rs` file with the same name from
//! this directory and makes it publicly accessible.
//!
//! ### Re-exports for Clean APIs
//! The `pub use` statements at the bottom flatten the hierarchy so callers can
//! write `use request_orchestrator::models::QueueItem` instead of
//! `use request_orchestrator::models::queue::QueueItem`.

// Capability - a registered, invocable unit of functionality
pub mod capability;

// Intent and ActionMapping - classification targets and their bound actions
pub mod intent;

// FunctionChain and ChainStep - ordered capability invocations
pub mod chain;

// Actor - a configured caller profile with its own concrete sequence
pub mod actor;

// QueueItem - one scheduled execution and its lifecycle
pub mod queue;

// RequestBatch - a group of equivalent requests served by one upstream call
pub mod batch;

// CostPeriod and DebugTrace - telemetry records
pub mod telemetry;

/// Re-export capability types
pub use capability::{Capability, CapabilityKey, CapabilitySchema};

/// Re-export classification types
/// - Intent: what the request is trying to do
/// - ActionMapping: which chain or capability serves an intent
/// - ActionTarget: the concrete target of a mapping
pub use intent::{ActionMapping, ActionTarget, Intent};

/// Re-export chain types
pub use chain::{ChainStep, FunctionChain, OnError};

/// Re-export actor types
pub use actor::{Actor, DisplayMode};

/// Re-export queue types
/// - QueueItem: the scheduled unit of work
/// - QueuePriority / QueueStatus: tier and lifecycle state
/// - QueueError / ErrorKind: structured terminal errors
pub use queue::{
    priority_score, CancelOutcome, ErrorKind, NewQueueItem, QueueError, QueueItem,
    QueuePriority, QueueStats, QueueStatus,
};

/// Re-export batching types
pub use batch::{BatchStatus, MemberResponse, RequestBatch};

/// Re-export telemetry types
pub use telemetry::{BatchRole, CostDelta, CostPeriod, DebugTrace, Granularity, TokenUsage};
