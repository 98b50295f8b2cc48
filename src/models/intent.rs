// Intent and action mapping models

//! # Intents and Action Mappings
//!
//! An [`Intent`] is a classification target: the classifier picks at most one
//! intent per request using its keywords and priority. An [`ActionMapping`]
//! binds an intent to what should actually run - either a whole function chain
//! or a single capability.
//!
//! Creation order matters for both records: when two intents (or two mappings)
//! share a priority, the one created first wins. The registry keeps rows in the
//! order its configuration source returned them, which is creation order.

use serde::{Deserialize, Serialize};

use super::CapabilityKey;

/// A classified purpose behind an inbound request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    pub key: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Tie-break when multiple intents match; higher wins
    #[serde(default)]
    pub priority: i32,
    /// Trigger words or phrases
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Context fields (dotted paths) that must be present for this intent to apply
    #[serde(default)]
    pub context_needs: Vec<String>,
    /// Capabilities the intent needs when no mapping or chain serves it
    #[serde(default)]
    pub required_functions: Vec<CapabilityKey>,
    /// Ranked downstream targets (providers/models)
    #[serde(default)]
    pub preferred_targets: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Intent {
    pub fn new(key: impl Into<String>, priority: i32) -> Self {
        Self {
            key: key.into(),
            description: None,
            priority,
            keywords: Vec::new(),
            context_needs: Vec::new(),
            required_functions: Vec::new(),
            preferred_targets: Vec::new(),
            active: true,
        }
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords.extend(keywords.into_iter().map(Into::into));
        self
    }

    pub fn needing(mut self, field: impl Into<String>) -> Self {
        self.context_needs.push(field.into());
        self
    }

    pub fn requiring(mut self, function: impl Into<CapabilityKey>) -> Self {
        self.required_functions.push(function.into());
        self
    }

    pub fn preferring(mut self, target: impl Into<String>) -> Self {
        self.preferred_targets.push(target.into());
        self
    }
}

/// What an action mapping resolves to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionTarget {
    /// Run a named function chain (with its fallbacks)
    Chain { chain_id: String },
    /// Run a single capability as a one-step sequence
    Function { function: CapabilityKey },
}

/// Binds an intent to a concrete action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionMapping {
    pub id: String,
    pub intent_key: String,
    pub action_key: String,
    pub target: ActionTarget,
    /// Ordered parameter names extracted from the request context
    #[serde(default)]
    pub parameter_patterns: Vec<String>,
    /// Context fields (dotted paths) that must be present for this mapping
    #[serde(default)]
    pub required_context: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl ActionMapping {
    pub fn to_chain(
        id: impl Into<String>,
        intent_key: impl Into<String>,
        chain_id: impl Into<String>,
        priority: i32,
    ) -> Self {
        let chain_id = chain_id.into();
        Self {
            id: id.into(),
            intent_key: intent_key.into(),
            action_key: chain_id.clone(),
            target: ActionTarget::Chain { chain_id },
            parameter_patterns: Vec::new(),
            required_context: Vec::new(),
            priority,
            active: true,
        }
    }

    pub fn to_function(
        id: impl Into<String>,
        intent_key: impl Into<String>,
        function: impl Into<CapabilityKey>,
        priority: i32,
    ) -> Self {
        let function = function.into();
        Self {
            id: id.into(),
            intent_key: intent_key.into(),
            action_key: function.to_string(),
            target: ActionTarget::Function { function },
            parameter_patterns: Vec::new(),
            required_context: Vec::new(),
            priority,
            active: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_target_tagged_json() {
        let mapping: ActionMapping = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "intent_key": "list_items",
            "action_key": "list",
            "target": { "type": "function", "function": "list_items" },
            "priority": 5
        }))
        .unwrap();

        assert_eq!(
            mapping.target,
            ActionTarget::Function { function: CapabilityKey::from("list_items") }
        );
        assert!(mapping.active);
        assert!(mapping.parameter_patterns.is_empty());
    }
}
