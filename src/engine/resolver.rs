// Chain resolution
// Turns an intent, an actor, or the default route into a concrete step list

//! # Chain Resolver
//!
//! Resolution order for an intent:
//!
//! ```text
//! active action mappings (required_context satisfied, highest priority, then creation order)
//!   ├─ function target → one required step
//!   └─ chain target    → chain, walking fallback_chain_id links (hop-bounded)
//! no eligible mapping
//!   → first enabled chain whose trigger_intents contain the intent key
//!   → the intent's required_functions as an ad-hoc list of required steps
//!   → NoRouteAvailable
//! ```
//!
//! A chain is *usable* when it is enabled and at least one of its steps names a
//! known, enabled capability. Unusable chains are skipped in favour of their
//! fallback. Steps inside a usable chain that name disabled capabilities are
//! kept; the pipeline fails them with `CapabilityDisabled`.
//!
//! Every resolution, successful or not, reports the chain ids it tried.

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::context;
use super::registry::RegistrySnapshot;
use crate::models::{ActionMapping, ActionTarget, ChainStep, DisplayMode, FunctionChain, Intent};
use crate::OrchestratorError;

/// Where a route came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteSource {
    Mapping { mapping_id: String },
    TriggeredChain,
    RequiredFunctions,
    Actor { actor_id: String },
    Default,
}

/// A resolved, ready-to-execute step list
#[derive(Debug, Clone)]
pub struct Route {
    pub steps: Vec<ChainStep>,
    pub source: RouteSource,
    /// Chain ids tried in order, primary first
    pub tiers_attempted: Vec<String>,
    pub selected_chain: Option<String>,
    /// Parameters extracted from the context by the mapping's patterns
    pub parameters: Map<String, Value>,
    /// Ranked downstream targets from the intent
    pub preferred_targets: Vec<String>,
    pub display_mode: DisplayMode,
}

impl Route {
    fn new(steps: Vec<ChainStep>, source: RouteSource) -> Self {
        Self {
            steps,
            source,
            tiers_attempted: Vec::new(),
            selected_chain: None,
            parameters: Map::new(),
            preferred_targets: Vec::new(),
            display_mode: DisplayMode::default(),
        }
    }
}

/// Resolution failed; carries the tiers that were tried for telemetry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unroutable {
    pub reason: String,
    pub tiers_attempted: Vec<String>,
}

impl From<Unroutable> for OrchestratorError {
    fn from(failure: Unroutable) -> Self {
        OrchestratorError::NoRouteAvailable(failure.reason)
    }
}

pub type Resolution = std::result::Result<Route, Unroutable>;

#[derive(Debug, Clone)]
pub struct ChainResolver {
    max_fallback_hops: usize,
    default_chain_id: Option<String>,
}

impl ChainResolver {
    pub fn new(max_fallback_hops: usize, default_chain_id: Option<String>) -> Self {
        Self {
            max_fallback_hops,
            default_chain_id,
        }
    }

    pub fn resolve_intent(
        &self,
        snapshot: &RegistrySnapshot,
        intent: &Intent,
        context: &Map<String, Value>,
    ) -> Resolution {
        let mut tiers = Vec::new();

        if let Some(mapping) = select_mapping(snapshot, &intent.key, context) {
            debug!(intent = %intent.key, mapping = %mapping.id, "Selected action mapping");
            let mut route = match &mapping.target {
                ActionTarget::Function { function } => Route::new(
                    vec![ChainStep::required(function.clone())],
                    RouteSource::Mapping {
                        mapping_id: mapping.id.clone(),
                    },
                ),
                ActionTarget::Chain { chain_id } => {
                    let chain = self.walk(snapshot, chain_id, &mut tiers).map_err(|reason| {
                        Unroutable {
                            reason: format!("intent '{}': {}", intent.key, reason),
                            tiers_attempted: tiers.clone(),
                        }
                    })?;
                    let mut route = Route::new(
                        chain.function_sequence.clone(),
                        RouteSource::Mapping {
                            mapping_id: mapping.id.clone(),
                        },
                    );
                    route.selected_chain = Some(chain.id.clone());
                    route
                }
            };
            route.tiers_attempted = tiers;
            route.parameters = extract_parameters(mapping, context);
            route.preferred_targets = intent.preferred_targets.clone();
            return Ok(route);
        }

        let triggered = snapshot
            .chains()
            .iter()
            .find(|chain| chain.enabled && chain.trigger_intents.iter().any(|key| key == &intent.key));
        if let Some(chain) = triggered {
            match self.walk(snapshot, &chain.id, &mut tiers) {
                Ok(selected) => {
                    let mut route = Route::new(
                        selected.function_sequence.clone(),
                        RouteSource::TriggeredChain,
                    );
                    route.selected_chain = Some(selected.id.clone());
                    route.tiers_attempted = tiers;
                    route.preferred_targets = intent.preferred_targets.clone();
                    return Ok(route);
                }
                Err(reason) => {
                    warn!(intent = %intent.key, chain = %chain.id, %reason, "Triggered chain unusable");
                }
            }
        }

        if !intent.required_functions.is_empty() {
            let steps = intent
                .required_functions
                .iter()
                .cloned()
                .map(ChainStep::required)
                .collect();
            let mut route = Route::new(steps, RouteSource::RequiredFunctions);
            route.tiers_attempted = tiers;
            route.preferred_targets = intent.preferred_targets.clone();
            return Ok(route);
        }

        Err(Unroutable {
            reason: format!("no mapping, chain or required functions for intent '{}'", intent.key),
            tiers_attempted: tiers,
        })
    }

    pub fn resolve_actor(&self, snapshot: &RegistrySnapshot, actor_id: &str) -> Resolution {
        let actor = snapshot.actor(actor_id).ok_or_else(|| Unroutable {
            reason: format!("unknown actor '{}'", actor_id),
            tiers_attempted: Vec::new(),
        })?;
        if !actor.enabled {
            return Err(Unroutable {
                reason: format!("actor '{}' is disabled", actor_id),
                tiers_attempted: Vec::new(),
            });
        }

        let steps: Vec<ChainStep> = actor
            .function_sequence
            .iter()
            .filter(|step| {
                let allowed = actor.allows(&step.function);
                if !allowed {
                    warn!(
                        actor = %actor.id,
                        capability = %step.function,
                        "Dropping step outside the actor's allowed functions"
                    );
                }
                allowed
            })
            .cloned()
            .collect();

        if steps.is_empty() {
            return Err(Unroutable {
                reason: format!("actor '{}' has no runnable steps", actor_id),
                tiers_attempted: Vec::new(),
            });
        }

        let mut route = Route::new(
            steps,
            RouteSource::Actor {
                actor_id: actor.id.clone(),
            },
        );
        route.display_mode = actor.display_mode;
        Ok(route)
    }

    pub fn resolve_default(&self, snapshot: &RegistrySnapshot) -> Resolution {
        let chain_id = self.default_chain_id.as_deref().ok_or_else(|| Unroutable {
            reason: "no intent matched and no default chain is configured".to_string(),
            tiers_attempted: Vec::new(),
        })?;

        let mut tiers = Vec::new();
        let chain = self.walk(snapshot, chain_id, &mut tiers).map_err(|reason| Unroutable {
            reason: format!("default route: {}", reason),
            tiers_attempted: tiers.clone(),
        })?;

        let mut route = Route::new(chain.function_sequence.clone(), RouteSource::Default);
        route.selected_chain = Some(chain.id.clone());
        route.tiers_attempted = tiers;
        Ok(route)
    }

    /// Follow fallback links from `start` until a usable chain is found
    fn walk<'a>(
        &self,
        snapshot: &'a RegistrySnapshot,
        start: &str,
        tiers: &mut Vec<String>,
    ) -> std::result::Result<&'a FunctionChain, String> {
        let mut next = Some(start.to_string());
        let mut hops = 0;

        while let Some(chain_id) = next {
            if hops > self.max_fallback_hops {
                return Err(format!(
                    "fallback hop limit ({}) reached after {}",
                    self.max_fallback_hops,
                    tiers.join(" -> ")
                ));
            }
            tiers.push(chain_id.clone());

            let chain = match snapshot.chain(&chain_id) {
                Some(chain) => chain,
                None => return Err(format!("unknown chain '{}'", chain_id)),
            };
            if is_usable(snapshot, chain) {
                if hops > 0 {
                    debug!(chain = %chain.id, hops, "Resolved through fallback");
                }
                return Ok(chain);
            }

            warn!(chain = %chain.id, fallback = ?chain.fallback_chain_id, "Chain unusable, trying fallback");
            next = chain.fallback_chain_id.clone();
            hops += 1;
        }

        Err(format!("no usable chain in {}", tiers.join(" -> ")))
    }
}

fn is_usable(snapshot: &RegistrySnapshot, chain: &FunctionChain) -> bool {
    chain.enabled && chain.functions().any(|function| snapshot.is_usable(function))
}

fn select_mapping<'a>(
    snapshot: &'a RegistrySnapshot,
    intent_key: &'a str,
    context: &Map<String, Value>,
) -> Option<&'a ActionMapping> {
    let mut best: Option<&ActionMapping> = None;
    for mapping in snapshot.mappings_for(intent_key) {
        if !mapping.active || !context::all_present(context, &mapping.required_context) {
            continue;
        }
        if best.map_or(true, |current| mapping.priority > current.priority) {
            best = Some(mapping);
        }
    }
    best
}

fn extract_parameters(mapping: &ActionMapping, context: &Map<String, Value>) -> Map<String, Value> {
    let mut parameters = Map::new();
    for pattern in &mapping.parameter_patterns {
        match context::lookup(context, pattern) {
            Some(value) if !value.is_null() => {
                parameters.insert(pattern.clone(), value.clone());
            }
            _ => debug!(mapping = %mapping.id, parameter = %pattern, "Parameter missing from context"),
        }
    }
    parameters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::registry::RegistryDocument;
    use crate::models::{Actor, Capability, CapabilityKey};
    use serde_json::json;

    fn resolver() -> ChainResolver {
        ChainResolver::new(5, Some("general".to_string()))
    }

    fn base() -> RegistryDocument {
        RegistryDocument {
            capabilities: vec![
                Capability::new("search"),
                Capability::new("answer"),
                Capability::new("list_items"),
                Capability::new("legacy").disabled(),
            ],
            intents: vec![
                Intent::new("question", 5).with_keywords(["what"]),
                Intent::new("list", 9).with_keywords(["list"]),
            ],
            action_mappings: vec![],
            function_chains: vec![
                FunctionChain::new("general", vec![ChainStep::required("answer")]),
                FunctionChain::new("qa", vec![ChainStep::required("search"), ChainStep::required("answer")]),
            ],
            actors: vec![],
        }
    }

    fn build(doc: RegistryDocument) -> RegistrySnapshot {
        RegistrySnapshot::build(doc, 1).unwrap()
    }

    #[test]
    fn test_function_mapping_yields_one_step() {
        let mut doc = base();
        let mut mapping = ActionMapping::to_function("m1", "list", "list_items", 1);
        mapping.parameter_patterns = vec!["folder".into(), "limit".into()];
        doc.action_mappings.push(mapping);
        let snapshot = build(doc);

        let context = json!({ "folder": "inbox" }).as_object().cloned().unwrap();
        let route = resolver()
            .resolve_intent(&snapshot, snapshot.intent("list").unwrap(), &context)
            .unwrap();

        assert_eq!(route.steps.len(), 1);
        assert_eq!(route.steps[0].function, CapabilityKey::from("list_items"));
        assert_eq!(route.parameters.get("folder"), Some(&json!("inbox")));
        assert!(!route.parameters.contains_key("limit"));
    }

    #[test]
    fn test_highest_priority_mapping_with_satisfied_context_wins() {
        let mut doc = base();
        let mut gated = ActionMapping::to_chain("gated", "question", "qa", 10);
        gated.required_context = vec!["workspace".into()];
        doc.action_mappings.push(gated);
        doc.action_mappings
            .push(ActionMapping::to_chain("plain", "question", "general", 1));
        let snapshot = build(doc);
        let intent = snapshot.intent("question").unwrap();

        let route = resolver().resolve_intent(&snapshot, intent, &Map::new()).unwrap();
        assert_eq!(route.selected_chain.as_deref(), Some("general"));

        let context = json!({ "workspace": "w1" }).as_object().cloned().unwrap();
        let route = resolver().resolve_intent(&snapshot, intent, &context).unwrap();
        assert_eq!(route.selected_chain.as_deref(), Some("qa"));
    }

    #[test]
    fn test_disabled_chain_walks_fallback() {
        let mut doc = base();
        doc.function_chains.push(
            FunctionChain::new("primary", vec![ChainStep::required("legacy")]).with_fallback("qa"),
        );
        doc.action_mappings
            .push(ActionMapping::to_chain("m1", "question", "primary", 1));
        let snapshot = build(doc);

        let route = resolver()
            .resolve_intent(&snapshot, snapshot.intent("question").unwrap(), &Map::new())
            .unwrap();
        assert_eq!(route.tiers_attempted, vec!["primary".to_string(), "qa".to_string()]);
        assert_eq!(route.selected_chain.as_deref(), Some("qa"));
    }

    #[test]
    fn test_hop_bound_stops_long_fallback_lists() {
        let mut doc = base();
        for i in 0..4 {
            doc.function_chains.push(
                FunctionChain::new(format!("c{}", i), vec![ChainStep::required("legacy")])
                    .with_fallback(format!("c{}", i + 1)),
            );
        }
        doc.function_chains
            .push(FunctionChain::new("c4", vec![ChainStep::required("answer")]));
        doc.action_mappings
            .push(ActionMapping::to_chain("m1", "question", "c0", 1));
        let snapshot = build(doc);
        let intent = snapshot.intent("question").unwrap();

        let failure = ChainResolver::new(2, None)
            .resolve_intent(&snapshot, intent, &Map::new())
            .unwrap_err();
        assert_eq!(failure.tiers_attempted, vec!["c0", "c1", "c2"]);

        let route = ChainResolver::new(5, None)
            .resolve_intent(&snapshot, intent, &Map::new())
            .unwrap();
        assert_eq!(route.selected_chain.as_deref(), Some("c4"));
    }

    #[test]
    fn test_trigger_chain_then_required_functions() {
        let mut doc = base();
        doc.function_chains[1].trigger_intents.push("question".into());
        let snapshot = build(doc);
        let route = resolver()
            .resolve_intent(&snapshot, snapshot.intent("question").unwrap(), &Map::new())
            .unwrap();
        assert_eq!(route.source, RouteSource::TriggeredChain);
        assert_eq!(route.selected_chain.as_deref(), Some("qa"));

        let mut doc = base();
        doc.intents[0] = Intent::new("question", 5).requiring("search").requiring("answer");
        let snapshot = build(doc);
        let route = resolver()
            .resolve_intent(&snapshot, snapshot.intent("question").unwrap(), &Map::new())
            .unwrap();
        assert_eq!(route.source, RouteSource::RequiredFunctions);
        assert!(route.steps.iter().all(|step| step.required));
    }

    #[test]
    fn test_unmapped_intent_without_fallbacks_is_unroutable() {
        let snapshot = build(base());
        let failure = resolver()
            .resolve_intent(&snapshot, snapshot.intent("list").unwrap(), &Map::new())
            .unwrap_err();
        assert!(failure.reason.contains("list"));
    }

    #[test]
    fn test_actor_drops_disallowed_steps() {
        let mut doc = base();
        let mut actor = Actor::new("ops", vec![ChainStep::required("search")]);
        actor.function_sequence.push(ChainStep::required("answer"));
        actor.display_mode = DisplayMode::Minimal;
        doc.actors.push(actor);
        let snapshot = build(doc);

        let route = resolver().resolve_actor(&snapshot, "ops").unwrap();
        assert_eq!(route.steps.len(), 1);
        assert_eq!(route.display_mode, DisplayMode::Minimal);
    }

    #[test]
    fn test_disabled_actor_is_unroutable() {
        let mut doc = base();
        let mut actor = Actor::new("ops", vec![ChainStep::required("search")]);
        actor.enabled = false;
        doc.actors.push(actor);
        let snapshot = build(doc);

        assert!(resolver().resolve_actor(&snapshot, "ops").is_err());
    }

    #[test]
    fn test_default_route() {
        let snapshot = build(base());
        let route = resolver().resolve_default(&snapshot).unwrap();
        assert_eq!(route.selected_chain.as_deref(), Some("general"));
        assert_eq!(route.source, RouteSource::Default);

        assert!(ChainResolver::new(5, None).resolve_default(&snapshot).is_err());
    }
}
