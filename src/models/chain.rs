// Function chain domain models

//! # Function Chains
//!
//! A [`FunctionChain`] is a named, ordered list of [`ChainStep`]s. Chains form a
//! singly-linked fallback list through `fallback_chain_id`; the registry
//! rejects cyclic fallback relations when it loads configuration.
//!
//! Each step is a tagged record rather than an open dictionary, so a bad
//! `on_error` value or a missing function key is caught while loading instead
//! of while a request is running.

use serde::{Deserialize, Serialize};

use super::CapabilityKey;

/// How a step's own failure is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    /// Abort the remaining sequence
    #[default]
    Fail,
    /// Mark the step failed and move on
    Continue,
    /// Re-attempt while the pipeline retry budget lasts, then behave like `Fail`
    Retry,
}

/// One capability invocation inside a chain or actor sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub function: CapabilityKey,
    /// A failed required step always aborts the pipeline
    #[serde(default = "default_true")]
    pub required: bool,
    /// When false the step is dispatched as a detached task
    #[serde(default = "default_true")]
    pub wait_for_result: bool,
    /// Forward partial outputs to the display channel
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub on_error: OnError,
    /// Static arguments merged into the invocation arguments
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl ChainStep {
    /// A required, synchronous step that fails the pipeline on error
    pub fn required(function: impl Into<CapabilityKey>) -> Self {
        Self {
            function: function.into(),
            required: true,
            wait_for_result: true,
            stream: false,
            on_error: OnError::Fail,
            args: serde_json::Map::new(),
        }
    }

    /// An optional, synchronous step that is skipped over on error
    pub fn optional(function: impl Into<CapabilityKey>) -> Self {
        Self {
            required: false,
            on_error: OnError::Continue,
            ..Self::required(function)
        }
    }

    pub fn on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn detached(mut self) -> Self {
        self.wait_for_result = false;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }
}

/// A named, ordered list of capability invocations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionChain {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub function_sequence: Vec<ChainStep>,
    /// Intent keys this chain serves when no action mapping exists
    #[serde(default)]
    pub trigger_intents: Vec<String>,
    #[serde(default)]
    pub fallback_chain_id: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl FunctionChain {
    pub fn new(id: impl Into<String>, steps: Vec<ChainStep>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: None,
            function_sequence: steps,
            trigger_intents: Vec::new(),
            fallback_chain_id: None,
            enabled: true,
        }
    }

    pub fn with_fallback(mut self, chain_id: impl Into<String>) -> Self {
        self.fallback_chain_id = Some(chain_id.into());
        self
    }

    pub fn triggered_by(mut self, intent_key: impl Into<String>) -> Self {
        self.trigger_intents.push(intent_key.into());
        self
    }

    /// Capability keys in sequence order
    pub fn functions(&self) -> impl Iterator<Item = &CapabilityKey> {
        self.function_sequence.iter().map(|step| &step.function)
    }
}
