// Capability domain model
// A capability is one invocable function known to the registry

use serde::{Deserialize, Serialize};

/// Unique key for a capability (e.g. "list_items", "deploy")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityKey(String);

impl CapabilityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CapabilityKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CapabilityKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for CapabilityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialEq<&str> for CapabilityKey {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// JSON Schema definition for capability inputs/outputs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilitySchema {
    /// JSON Schema document
    #[serde(default)]
    pub schema: serde_json::Value,
    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,
}

/// A registered function the orchestrator can invoke
///
/// Capabilities are immutable at runtime. They only change through a registry
/// reload, never as a side effect of executing a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub key: CapabilityKey,
    #[serde(default)]
    pub description: Option<String>,
    /// Capabilities that must have succeeded earlier in the same pipeline run
    #[serde(default)]
    pub depends_on: Vec<CapabilityKey>,
    /// Event names published after a successful invocation
    #[serde(default)]
    pub events_emitted: Vec<String>,
    #[serde(default)]
    pub input_schema: Option<CapabilitySchema>,
    #[serde(default)]
    pub output_schema: Option<CapabilitySchema>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether the upstream can yield partial results
    #[serde(default)]
    pub supports_streaming: bool,
}

fn default_true() -> bool {
    true
}

impl Capability {
    /// Create an enabled capability with no dependencies
    pub fn new(key: impl Into<CapabilityKey>) -> Self {
        Self {
            key: key.into(),
            description: None,
            depends_on: Vec::new(),
            events_emitted: Vec::new(),
            input_schema: None,
            output_schema: None,
            enabled: true,
            supports_streaming: false,
        }
    }

    pub fn with_dependency(mut self, key: impl Into<CapabilityKey>) -> Self {
        self.depends_on.push(key.into());
        self
    }

    pub fn emitting(mut self, event: impl Into<String>) -> Self {
        self.events_emitted.push(event.into());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.supports_streaming = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
