use serde::{Deserialize, Serialize};

use super::{CapabilityKey, ChainStep};

/// How much of an actor's execution is surfaced to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// Forward partial streaming output and step progress
    #[default]
    Ui,
    /// Only step completions
    Minimal,
    /// Nothing
    Silent,
}

/// A configured caller profile
///
/// `allowed_functions` is the authorization set; `function_sequence` is the
/// execution order. A sequence entry outside the allowed set is an editing
/// inconsistency and gets dropped (with a warning) when the actor is resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub allowed_functions: Vec<CapabilityKey>,
    #[serde(default)]
    pub function_sequence: Vec<ChainStep>,
    #[serde(default)]
    pub display_mode: DisplayMode,
    /// Context values applied underneath the request context
    #[serde(default)]
    pub context_defaults: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub is_system: bool,
}

fn default_true() -> bool {
    true
}

impl Actor {
    pub fn new(id: impl Into<String>, steps: Vec<ChainStep>) -> Self {
        let id = id.into();
        let allowed_functions = steps.iter().map(|step| step.function.clone()).collect();
        Self {
            name: id.clone(),
            id,
            description: None,
            allowed_functions,
            function_sequence: steps,
            display_mode: DisplayMode::default(),
            context_defaults: serde_json::Map::new(),
            enabled: true,
            is_system: false,
        }
    }

    pub fn allows(&self, function: &CapabilityKey) -> bool {
        self.allowed_functions.iter().any(|allowed| allowed == function)
    }

    /// System actors are managed by the platform and cannot be deleted by users
    pub fn is_user_deletable(&self) -> bool {
        !self.is_system
    }
}
