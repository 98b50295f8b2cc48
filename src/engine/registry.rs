// Capability registry and configuration loading
// Typed, versioned, read-only snapshots of the routing configuration

//! # Registry
//!
//! The registry holds every configuration row the orchestrator routes with:
//! capabilities, intents, action mappings, function chains and actors. Rows come
//! from a [`ConfigSource`] and are validated once, when they are loaded, into an
//! immutable [`RegistrySnapshot`].
//!
//! ## Snapshots and Versions
//!
//! Request execution never mutates configuration. A request takes one
//! `Arc<RegistrySnapshot>` at the start and uses it for classification,
//! resolution and execution, so a reload in the middle of a request cannot
//! change what that request sees. Each successful load bumps the version.
//!
//! ## Load-time Validation
//!
//! Hard errors (the snapshot is rejected):
//! - duplicate keys/ids
//! - a cyclic `fallback_chain_id` relation
//! - a fallback or mapping that names an unknown chain
//! - a mapping for an unknown intent
//!
//! Warnings (logged and kept on the snapshot):
//! - steps or dependencies naming unknown capabilities
//! - actor sequence entries outside the actor's allowed set
//! - chains triggered by unknown intents
//!
//! ## Rust Learning Notes:
//!
//! ### `Arc` Snapshots Behind a Lock
//! `RwLock<Arc<T>>` is a common read-mostly pattern: readers hold the lock just
//! long enough to clone the `Arc` (a reference-count increment), then work on
//! the snapshot without holding any lock. A reload builds a whole new snapshot
//! and swaps the `Arc` in one write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::models::{ActionMapping, ActionTarget, Actor, Capability, CapabilityKey, FunctionChain, Intent};
use crate::{OrchestratorError, Result};

/// The raw configuration rows, in creation order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryDocument {
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub intents: Vec<Intent>,
    #[serde(default)]
    pub action_mappings: Vec<ActionMapping>,
    #[serde(default)]
    pub function_chains: Vec<FunctionChain>,
    #[serde(default)]
    pub actors: Vec<Actor>,
}

/// Where configuration rows come from
///
/// Implementations must return rows in creation order; the classifier and the
/// resolver break priority ties with it.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> Result<RegistryDocument>;

    /// Human-readable origin, used in log lines
    fn describe(&self) -> String;
}

/// Configuration held in memory (tests, embedded use)
pub struct InMemoryConfigSource {
    document: RwLock<RegistryDocument>,
}

impl InMemoryConfigSource {
    pub fn new(document: RegistryDocument) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }

    /// Replace the rows; takes effect on the next registry reload
    pub async fn replace(&self, document: RegistryDocument) {
        *self.document.write().await = document;
    }

    /// Edit the rows in place; takes effect on the next registry reload
    pub async fn update<F>(&self, edit: F)
    where
        F: FnOnce(&mut RegistryDocument),
    {
        let mut document = self.document.write().await;
        edit(&mut document);
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn load(&self) -> Result<RegistryDocument> {
        Ok(self.document.read().await.clone())
    }

    fn describe(&self) -> String {
        "in-memory".to_string()
    }
}

/// Configuration read from a JSON document on disk
pub struct JsonFileConfigSource {
    path: PathBuf,
}

impl JsonFileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for JsonFileConfigSource {
    async fn load(&self) -> Result<RegistryDocument> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            OrchestratorError::Configuration(format!(
                "cannot read registry file {}: {}",
                self.path.display(),
                e
            ))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            OrchestratorError::Configuration(format!(
                "invalid registry file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// A validated, immutable view of the configuration
#[derive(Debug)]
pub struct RegistrySnapshot {
    pub version: u64,
    pub loaded_at: DateTime<Utc>,
    capabilities: HashMap<CapabilityKey, Capability>,
    intents: Vec<Intent>,
    mappings: Vec<ActionMapping>,
    chains: Vec<FunctionChain>,
    chain_index: HashMap<String, usize>,
    actors: HashMap<String, Actor>,
    warnings: Vec<String>,
}

impl RegistrySnapshot {
    /// Validate a document and build a snapshot from it
    pub fn build(document: RegistryDocument, version: u64) -> Result<Self> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let mut capabilities = HashMap::new();
        for capability in document.capabilities {
            let key = capability.key.clone();
            if capabilities.insert(key.clone(), capability).is_some() {
                errors.push(format!("duplicate capability '{}'", key));
            }
        }

        let mut intent_keys = HashSet::new();
        for intent in &document.intents {
            if !intent_keys.insert(intent.key.as_str()) {
                errors.push(format!("duplicate intent '{}'", intent.key));
            }
        }

        let mut chain_index = HashMap::new();
        for (index, chain) in document.function_chains.iter().enumerate() {
            if chain_index.insert(chain.id.clone(), index).is_some() {
                errors.push(format!("duplicate function chain '{}'", chain.id));
            }
        }

        let mut actors = HashMap::new();
        for actor in document.actors {
            let id = actor.id.clone();
            if actors.insert(id.clone(), actor).is_some() {
                errors.push(format!("duplicate actor '{}'", id));
            }
        }

        let mut mapping_ids = HashSet::new();
        for mapping in &document.action_mappings {
            if !mapping_ids.insert(mapping.id.as_str()) {
                errors.push(format!("duplicate action mapping '{}'", mapping.id));
            }
            if !intent_keys.contains(mapping.intent_key.as_str()) {
                errors.push(format!(
                    "action mapping '{}' references unknown intent '{}'",
                    mapping.id, mapping.intent_key
                ));
            }
            match &mapping.target {
                ActionTarget::Chain { chain_id } if !chain_index.contains_key(chain_id) => {
                    errors.push(format!(
                        "action mapping '{}' references unknown chain '{}'",
                        mapping.id, chain_id
                    ));
                }
                ActionTarget::Function { function } if !capabilities.contains_key(function) => {
                    warnings.push(format!(
                        "action mapping '{}' targets unknown capability '{}'",
                        mapping.id, function
                    ));
                }
                _ => {}
            }
        }

        for chain in &document.function_chains {
            if let Some(fallback) = &chain.fallback_chain_id {
                if !chain_index.contains_key(fallback) {
                    errors.push(format!(
                        "chain '{}' falls back to unknown chain '{}'",
                        chain.id, fallback
                    ));
                }
            }
            for function in chain.functions() {
                if !capabilities.contains_key(function) {
                    warnings.push(format!(
                        "chain '{}' step references unknown capability '{}'",
                        chain.id, function
                    ));
                }
            }
            for intent in &chain.trigger_intents {
                if !intent_keys.contains(intent.as_str()) {
                    warnings.push(format!(
                        "chain '{}' is triggered by unknown intent '{}'",
                        chain.id, intent
                    ));
                }
            }
        }

        if let Some(cycle) = find_fallback_cycle(&document.function_chains, &chain_index) {
            errors.push(format!("fallback cycle: {}", cycle.join(" -> ")));
        }

        for capability in capabilities.values() {
            for dependency in &capability.depends_on {
                if !capabilities.contains_key(dependency) {
                    warnings.push(format!(
                        "capability '{}' depends on unknown capability '{}'",
                        capability.key, dependency
                    ));
                }
            }
        }

        for actor in actors.values() {
            for step in &actor.function_sequence {
                if !actor.allows(&step.function) {
                    warnings.push(format!(
                        "actor '{}' sequence includes '{}' outside its allowed functions",
                        actor.id, step.function
                    ));
                }
            }
        }

        for intent in &document.intents {
            for function in &intent.required_functions {
                if !capabilities.contains_key(function) {
                    warnings.push(format!(
                        "intent '{}' requires unknown capability '{}'",
                        intent.key, function
                    ));
                }
            }
        }

        if !errors.is_empty() {
            return Err(OrchestratorError::Configuration(errors.join("; ")));
        }

        warnings.sort();
        Ok(Self {
            version,
            loaded_at: Utc::now(),
            capabilities,
            intents: document.intents,
            mappings: document.action_mappings,
            chains: document.function_chains,
            chain_index,
            actors,
            warnings,
        })
    }

    pub fn capability(&self, key: &CapabilityKey) -> Option<&Capability> {
        self.capabilities.get(key)
    }

    /// Known and enabled
    pub fn is_usable(&self, key: &CapabilityKey) -> bool {
        self.capability(key).map_or(false, |capability| capability.enabled)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.capabilities.values()
    }

    /// Intents in creation order
    pub fn intents(&self) -> &[Intent] {
        &self.intents
    }

    pub fn intent(&self, key: &str) -> Option<&Intent> {
        self.intents.iter().find(|intent| intent.key == key)
    }

    /// Mappings for an intent, in creation order
    pub fn mappings_for<'a>(&'a self, intent_key: &'a str) -> impl Iterator<Item = &'a ActionMapping> {
        self.mappings
            .iter()
            .filter(move |mapping| mapping.intent_key == intent_key)
    }

    pub fn chain(&self, id: &str) -> Option<&FunctionChain> {
        self.chain_index.get(id).map(|index| &self.chains[*index])
    }

    /// Chains in creation order
    pub fn chains(&self) -> &[FunctionChain] {
        &self.chains
    }

    pub fn actor(&self, id: &str) -> Option<&Actor> {
        self.actors.get(id)
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

/// Walk every fallback list; report the first cycle found
fn find_fallback_cycle(
    chains: &[FunctionChain],
    index: &HashMap<String, usize>,
) -> Option<Vec<String>> {
    let mut cleared: HashSet<&str> = HashSet::new();

    for chain in chains {
        let mut path: Vec<&str> = Vec::new();
        let mut current = Some(chain);

        while let Some(link) = current {
            if cleared.contains(link.id.as_str()) {
                break;
            }
            if let Some(start) = path.iter().position(|id| *id == link.id) {
                let mut cycle: Vec<String> = path[start..].iter().map(|id| id.to_string()).collect();
                cycle.push(link.id.clone());
                return Some(cycle);
            }
            path.push(link.id.as_str());
            current = link
                .fallback_chain_id
                .as_ref()
                .and_then(|next| index.get(next))
                .map(|i| &chains[*i]);
        }

        cleared.extend(path);
    }

    None
}

struct CachedSnapshot {
    snapshot: Arc<RegistrySnapshot>,
    fetched_at: Instant,
}

/// Shared handle to the current registry snapshot
///
/// Snapshots are cached for `ttl`; the first read after the TTL refreshes from
/// the source. A refresh that fails validation keeps serving the previous
/// snapshot. [`Registry::reload`] forces a refresh and reports failures.
pub struct Registry {
    source: Arc<dyn ConfigSource>,
    cached: RwLock<CachedSnapshot>,
    ttl: Duration,
    next_version: AtomicU64,
}

impl Registry {
    /// Load and validate the initial snapshot
    pub async fn load(source: Arc<dyn ConfigSource>, ttl: Duration) -> Result<Self> {
        let document = source.load().await?;
        let snapshot = RegistrySnapshot::build(document, 1)?;
        log_snapshot(&snapshot, &source.describe());

        Ok(Self {
            source,
            cached: RwLock::new(CachedSnapshot {
                snapshot: Arc::new(snapshot),
                fetched_at: Instant::now(),
            }),
            ttl,
            next_version: AtomicU64::new(2),
        })
    }

    /// Build a registry over in-memory rows with no TTL refresh
    pub async fn from_document(document: RegistryDocument) -> Result<Self> {
        Self::load(
            Arc::new(InMemoryConfigSource::new(document)),
            Duration::from_secs(u32::MAX as u64),
        )
        .await
    }

    /// The current snapshot, refreshed when the TTL has passed
    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        {
            let cached = self.cached.read().await;
            if cached.fetched_at.elapsed() < self.ttl {
                return cached.snapshot.clone();
            }
        }

        match self.reload().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Registry refresh failed, keeping previous snapshot");
                let mut cached = self.cached.write().await;
                cached.fetched_at = Instant::now();
                cached.snapshot.clone()
            }
        }
    }

    /// The current snapshot without a TTL check
    pub async fn current(&self) -> Arc<RegistrySnapshot> {
        self.cached.read().await.snapshot.clone()
    }

    /// Re-read the source and swap in a new snapshot
    pub async fn reload(&self) -> Result<Arc<RegistrySnapshot>> {
        let document = self.source.load().await?;
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        let snapshot = Arc::new(RegistrySnapshot::build(document, version)?);
        log_snapshot(&snapshot, &self.source.describe());

        let mut cached = self.cached.write().await;
        cached.snapshot = snapshot.clone();
        cached.fetched_at = Instant::now();
        Ok(snapshot)
    }
}

fn log_snapshot(snapshot: &RegistrySnapshot, origin: &str) {
    info!(
        version = snapshot.version,
        origin,
        capabilities = snapshot.capabilities.len(),
        intents = snapshot.intents.len(),
        chains = snapshot.chains.len(),
        actors = snapshot.actors.len(),
        "📚 Registry loaded"
    );
    for warning in &snapshot.warnings {
        warn!(version = snapshot.version, "Configuration warning: {}", warning);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChainStep;

    fn document() -> RegistryDocument {
        RegistryDocument {
            capabilities: vec![Capability::new("search"), Capability::new("answer")],
            intents: vec![Intent::new("question", 5).with_keywords(["what"])],
            action_mappings: vec![ActionMapping::to_chain("m1", "question", "qa", 1)],
            function_chains: vec![FunctionChain::new(
                "qa",
                vec![ChainStep::required("search"), ChainStep::required("answer")],
            )],
            actors: vec![],
        }
    }

    #[test]
    fn test_valid_document_builds() {
        let snapshot = RegistrySnapshot::build(document(), 1).unwrap();
        assert!(snapshot.is_usable(&CapabilityKey::from("search")));
        assert_eq!(snapshot.mappings_for("question").count(), 1);
        assert!(snapshot.warnings().is_empty());
    }

    #[test]
    fn test_fallback_cycle_is_rejected() {
        let mut doc = document();
        doc.function_chains = vec![
            FunctionChain::new("a", vec![]).with_fallback("b"),
            FunctionChain::new("b", vec![]).with_fallback("c"),
            FunctionChain::new("c", vec![]).with_fallback("a"),
        ];
        doc.action_mappings.clear();

        match RegistrySnapshot::build(doc, 1) {
            Err(OrchestratorError::Configuration(message)) => {
                assert!(message.contains("fallback cycle"), "{}", message);
            }
            other => panic!("expected configuration error, got {:?}", other.map(|s| s.version)),
        }
    }

    #[test]
    fn test_self_fallback_is_a_cycle() {
        let mut doc = document();
        doc.function_chains.push(FunctionChain::new("loop", vec![]).with_fallback("loop"));
        assert!(RegistrySnapshot::build(doc, 1).is_err());
    }

    #[test]
    fn test_unknown_references_split_into_errors_and_warnings() {
        let mut doc = document();
        doc.action_mappings
            .push(ActionMapping::to_chain("m2", "question", "missing", 1));
        assert!(RegistrySnapshot::build(doc, 1).is_err());

        let mut doc = document();
        doc.function_chains[0]
            .function_sequence
            .push(ChainStep::optional("translate"));
        let snapshot = RegistrySnapshot::build(doc, 1).unwrap();
        assert_eq!(snapshot.warnings().len(), 1);
        assert!(snapshot.warnings()[0].contains("translate"));
    }

    #[tokio::test]
    async fn test_reload_bumps_version() {
        let source = Arc::new(InMemoryConfigSource::new(document()));
        let registry = Registry::load(source.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(registry.current().await.version, 1);

        source
            .update(|doc| doc.capabilities.push(Capability::new("translate")))
            .await;
        let snapshot = registry.reload().await.unwrap();

        assert_eq!(snapshot.version, 2);
        assert!(snapshot.capability(&CapabilityKey::from("translate")).is_some());
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_previous_snapshot() {
        let source = Arc::new(InMemoryConfigSource::new(document()));
        let registry = Registry::load(source.clone(), Duration::from_secs(60))
            .await
            .unwrap();

        source
            .update(|doc| doc.capabilities.push(Capability::new("search")))
            .await;

        assert!(registry.reload().await.is_err());
        assert_eq!(registry.current().await.version, 1);
    }

    #[tokio::test]
    async fn test_sample_registry_file_is_valid() {
        let source = JsonFileConfigSource::new(concat!(env!("CARGO_MANIFEST_DIR"), "/config/registry.json"));
        let snapshot = RegistrySnapshot::build(source.load().await.unwrap(), 1).unwrap();

        assert!(snapshot.warnings().is_empty(), "{:?}", snapshot.warnings());
        assert!(!snapshot.is_usable(&CapabilityKey::from("legacy_report")));
        assert_eq!(snapshot.chain("legacy_reports").unwrap().fallback_chain_id.as_deref(), Some("reports"));
        assert!(snapshot.actor("release-bot").unwrap().is_system);
    }
}
