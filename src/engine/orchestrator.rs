// Orchestrator facade
// Wires registry, classifier, resolver, pipeline, queue, batching and telemetry

//! # Orchestrator
//!
//! The entry point the API and the binaries use. Submission only enqueues; the
//! work happens when a worker claims the item and calls
//! [`JobHandler::handle`], which runs one request end to end:
//!
//! 1. take one registry snapshot for the whole attempt
//! 2. classify the text (skipped when an actor is named)
//! 3. resolve the step list: actor, intent, or the default chain
//! 4. run the pipeline, through the batching engine when batching applies
//! 5. keep the attempt's [`DebugTrace`] until the item reaches a terminal state
//!
//! The trace is recorded from [`JobHandler::finished`], so every request
//! yields exactly one whatever ended it: success, exhausted retries, expiry
//! between attempts or cancellation. An item that never ran gets a bare trace
//! carrying its terminal error.
//!
//! The pipeline context always carries the submitter's `user_id` and
//! `workspace_id`, overriding anything the request put there.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::batching::{estimate_tokens, BatchEngine, BatchKey, BatchSettings, BatchStore, InMemoryBatchStore};
use super::classifier::IntentClassifier;
use super::context;
use super::events::{EventBus, OrchestratorEvent};
use super::invoker::{CapabilityInvoker, HttpCapabilityInvoker};
use super::pipeline::{ActorPipeline, PipelineInput, PipelineResult, PipelineSettings};
use super::queue::{InMemoryQueueStore, PriorityQueue, QueueStore};
use super::registry::{ConfigSource, JsonFileConfigSource, Registry, RegistrySnapshot};
use super::resolver::{ChainResolver, Route};
use super::scheduler::{CallbackNotifier, JobHandler, Scheduler, SchedulerHandle, SchedulerSettings};
use super::supervisor::DetachedTaskSupervisor;
use super::telemetry::{CostRecorder, InMemoryTelemetryStore, TelemetryStore};
use crate::config::OrchestratorConfig;
use crate::models::{
    BatchRole, CancelOutcome, CostPeriod, DebugTrace, ErrorKind, Granularity, MemberResponse,
    NewQueueItem, QueueError, QueueItem, QueuePriority, QueueStats, QueueStatus, RequestBatch, TokenUsage,
};
use crate::{OrchestratorError, Result};

/// How long bookkeeping for finished detached steps is kept
const DETACHED_RETENTION_MINUTES: i64 = 10;

/// Attempt traces whose item never reached a terminal state here are dropped after this
const ATTEMPT_RETENTION_MINUTES: i64 = 60;

fn default_batchable() -> bool {
    true
}

/// What gets stored as a queue item's payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Run this actor's sequence instead of classifying the text
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default = "default_batchable")]
    pub batchable: bool,
}

impl OrchestrationRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: Map::new(),
            actor_id: None,
            batchable: true,
        }
    }

    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn for_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn unbatched(mut self) -> Self {
        self.batchable = false;
        self
    }
}

/// A request plus its scheduling envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    #[serde(flatten)]
    pub request: OrchestrationRequest,
    pub request_type: String,
    pub user_id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub priority: QueuePriority,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

impl Submission {
    pub fn new(
        request: OrchestrationRequest,
        request_type: impl Into<String>,
        user_id: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            request,
            request_type: request_type.into(),
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
            priority: QueuePriority::default(),
            max_retries: None,
            expires_at: None,
            callback_url: None,
        }
    }

    pub fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_callback(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: Arc<Registry>,
    classifier: IntentClassifier,
    resolver: ChainResolver,
    pipeline: ActorPipeline,
    queue: Arc<PriorityQueue>,
    batches: BatchEngine,
    recorder: CostRecorder,
    events: EventBus,
    notifier: Option<Arc<dyn CallbackNotifier>>,
    /// Latest attempt trace per item, recorded once the item is terminal
    attempts: DashMap<Uuid, DebugTrace>,
}

/// Builder for [`Orchestrator`]; every backend defaults to its in-memory version
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    config_source: Option<Arc<dyn ConfigSource>>,
    invoker: Option<Arc<dyn CapabilityInvoker>>,
    queue_store: Option<Arc<dyn QueueStore>>,
    batch_store: Option<Arc<dyn BatchStore>>,
    telemetry_store: Option<Arc<dyn TelemetryStore>>,
    notifier: Option<Arc<dyn CallbackNotifier>>,
}

impl OrchestratorBuilder {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            config_source: None,
            invoker: None,
            queue_store: None,
            batch_store: None,
            telemetry_store: None,
            notifier: None,
        }
    }

    pub fn with_config_source(mut self, source: Arc<dyn ConfigSource>) -> Self {
        self.config_source = Some(source);
        self
    }

    pub fn with_invoker(mut self, invoker: Arc<dyn CapabilityInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn with_queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue_store = Some(store);
        self
    }

    pub fn with_batch_store(mut self, store: Arc<dyn BatchStore>) -> Self {
        self.batch_store = Some(store);
        self
    }

    pub fn with_telemetry_store(mut self, store: Arc<dyn TelemetryStore>) -> Self {
        self.telemetry_store = Some(store);
        self
    }

    /// Report terminal outcomes to submitters that gave a `callback_url`
    pub fn with_notifier(mut self, notifier: Arc<dyn CallbackNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub async fn build(self) -> Result<Orchestrator> {
        let config = self.config;
        config.validate()?;

        let events = EventBus::new(config.event_buffer_size);
        let source: Arc<dyn ConfigSource> = match self.config_source {
            Some(source) => source,
            None => Arc::new(JsonFileConfigSource::new(&config.registry_path)),
        };
        let registry = Arc::new(Registry::load(source, config.registry_ttl()).await?);

        let invoker: Arc<dyn CapabilityInvoker> = match self.invoker {
            Some(invoker) => invoker,
            None => {
                let streaming: Vec<_> = registry
                    .current()
                    .await
                    .capabilities()
                    .filter(|capability| capability.supports_streaming)
                    .map(|capability| capability.key.clone())
                    .collect();
                Arc::new(HttpCapabilityInvoker::new(&config.capability_endpoint).with_streaming(streaming))
            }
        };

        let supervisor = Arc::new(DetachedTaskSupervisor::new(events.clone()));
        let pipeline = ActorPipeline::new(invoker, supervisor, events.clone(), PipelineSettings::from(&config));

        let queue_store: Arc<dyn QueueStore> = match self.queue_store {
            Some(store) => store,
            None => Arc::new(InMemoryQueueStore::new().with_retention(config.in_memory_retention)),
        };
        let queue = Arc::new(
            PriorityQueue::new(queue_store, config.lease_timeout(), events.clone())
                .with_default_expiry(config.default_expiry()),
        );

        let batch_store: Arc<dyn BatchStore> = match self.batch_store {
            Some(store) => store,
            None => Arc::new(InMemoryBatchStore::new().with_retention(config.in_memory_retention)),
        };
        let batches = BatchEngine::new(batch_store, BatchSettings::from(&config), events.clone());

        let telemetry_store: Arc<dyn TelemetryStore> = match self.telemetry_store {
            Some(store) => store,
            None => Arc::new(InMemoryTelemetryStore::new().with_retention(config.in_memory_retention)),
        };
        let recorder = CostRecorder::new(telemetry_store, config.cost_granularities.clone());

        info!(
            batching = config.batching_enabled,
            batch_window_ms = config.batch_window_ms,
            lease_timeout_ms = config.lease_timeout_ms,
            "🎼 Orchestrator ready"
        );

        Ok(Orchestrator {
            classifier: IntentClassifier::new(),
            resolver: ChainResolver::new(config.max_fallback_hops, config.default_chain_id.clone()),
            config,
            registry,
            pipeline,
            queue,
            batches,
            recorder,
            events,
            notifier: self.notifier,
            attempts: DashMap::new(),
        })
    }
}

impl Orchestrator {
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn supervisor(&self) -> &Arc<DetachedTaskSupervisor> {
        self.pipeline.supervisor()
    }

    /// Validate and enqueue; execution happens on a worker
    pub async fn submit(&self, submission: Submission) -> Result<QueueItem> {
        if submission.request.text.trim().is_empty() && submission.request.actor_id.is_none() {
            return Err(OrchestratorError::InvalidInput(
                "a request needs text or an actor_id".to_string(),
            ));
        }
        if submission.user_id.trim().is_empty() || submission.workspace_id.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "user_id and workspace_id are required".to_string(),
            ));
        }

        let payload = serde_json::to_value(&submission.request)?;
        let mut item = NewQueueItem::new(
            payload,
            submission.request_type,
            submission.user_id,
            submission.workspace_id,
        )
        .with_priority(submission.priority)
        .with_max_retries(submission.max_retries.unwrap_or(self.config.default_max_retries));
        item.expires_at = submission.expires_at;
        item.callback_url = submission.callback_url;

        self.queue.enqueue(item).await
    }

    pub async fn status(&self, id: Uuid) -> Result<QueueItem> {
        self.queue
            .get(id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("request {}", id)))
    }

    /// Cancel a request; a pending one is terminal at once, a processing one
    /// when its worker reports back
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome> {
        let (outcome, item) = self.queue.cancel(id).await?;
        if outcome == CancelOutcome::Cancelled {
            self.record_final(&item).await;
            self.notify(&item).await;
        }
        Ok(outcome)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.queue.stats().await
    }

    pub async fn batch(&self, id: Uuid) -> Result<Option<RequestBatch>> {
        self.batches.get(id).await
    }

    /// The current period for `granularity`
    pub async fn period(&self, granularity: Granularity) -> Result<CostPeriod> {
        self.recorder.period(granularity, Utc::now()).await
    }

    pub async fn traces(&self, limit: usize) -> Result<Vec<DebugTrace>> {
        self.recorder.traces(limit).await
    }

    /// Force a registry reload; returns the new snapshot version
    pub async fn reload_registry(&self) -> Result<u64> {
        let snapshot = self.registry.reload().await?;
        self.events.publish(OrchestratorEvent::RegistryReloaded {
            version: snapshot.version,
        });
        Ok(snapshot.version)
    }

    /// A scheduler whose workers run this orchestrator's requests
    pub fn scheduler(self: &Arc<Self>) -> Scheduler {
        let scheduler = Scheduler::new(
            self.queue.clone(),
            self.clone(),
            SchedulerSettings::from(&self.config),
        );
        match &self.notifier {
            Some(notifier) => scheduler.with_notifier(notifier.clone()),
            None => scheduler,
        }
    }

    pub fn start_workers(self: &Arc<Self>) -> SchedulerHandle {
        Arc::new(self.scheduler()).start()
    }

    /// Let detached steps finish within the step timeout, then cancel them
    pub async fn shutdown(&self) {
        self.supervisor().shutdown_gracefully(self.config.step_timeout()).await;
    }

    async fn execute(&self, item: &QueueItem) -> std::result::Result<Value, QueueError> {
        let started = Instant::now();
        let request: OrchestrationRequest = serde_json::from_value(item.payload.clone())
            .map_err(|e| QueueError::new(ErrorKind::Internal, format!("unreadable payload: {}", e)))?;
        let snapshot = self.registry.snapshot().await;

        let intent = match request.actor_id {
            Some(_) => None,
            None => self.classifier.classify(&snapshot, &request.text, &request.context),
        };
        let mut trace = DebugTrace::new(item.id);
        trace.intent = intent.map(|intent| intent.key.clone());

        let resolution = match (request.actor_id.as_deref(), intent) {
            (Some(actor_id), _) => self.resolver.resolve_actor(&snapshot, actor_id),
            (None, Some(intent)) => self.resolver.resolve_intent(&snapshot, intent, &request.context),
            (None, None) => self.resolver.resolve_default(&snapshot),
        };

        let outcome = match resolution {
            Ok(route) => {
                trace.tiers_attempted = route.tiers_attempted.clone();
                trace.selected_chain = route.selected_chain.clone();
                debug!(
                    request_id = %item.id,
                    source = ?route.source,
                    steps = route.steps.len(),
                    "Route resolved"
                );
                self.run_route(item, &request, &snapshot, &route, &mut trace).await
            }
            Err(unroutable) => {
                warn!(request_id = %item.id, reason = %unroutable.reason, "No route available");
                trace.tiers_attempted = unroutable.tiers_attempted;
                Err(QueueError::new(ErrorKind::NoRouteAvailable, unroutable.reason))
            }
        };

        trace.latency_ms = started.elapsed().as_millis() as u64;
        trace.created_at = Utc::now();
        self.attempts.insert(item.id, trace);
        outcome
    }

    async fn run_route(
        &self,
        item: &QueueItem,
        request: &OrchestrationRequest,
        snapshot: &RegistrySnapshot,
        route: &Route,
        trace: &mut DebugTrace,
    ) -> std::result::Result<Value, QueueError> {
        let mut context = match request.actor_id.as_deref().and_then(|id| snapshot.actor(id)) {
            Some(actor) => context::layered(&actor.context_defaults, &request.context),
            None => request.context.clone(),
        };
        context.insert("user_id".to_string(), Value::from(item.user_id.clone()));
        context.insert("workspace_id".to_string(), Value::from(item.workspace_id.clone()));
        if !route.preferred_targets.is_empty() {
            context.insert(
                "preferred_targets".to_string(),
                Value::from(route.preferred_targets.clone()),
            );
        }

        let mut input = PipelineInput::new(context)
            .for_request(item.id)
            .with_parameters(route.parameters.clone());
        input.display_mode = route.display_mode;

        if !(self.config.batching_enabled && request.batchable) {
            let run = self.pipeline.execute(snapshot, &route.steps, input).await;
            trace.usage = run.usage.clone();
            trace.selected_target = run.selected_target.clone();
            return run.into_outcome();
        }

        let key = BatchKey {
            text: &request.text,
            request_type: &item.request_type,
            user_id: &item.user_id,
            workspace_id: &item.workspace_id,
            actor_id: request.actor_id.as_deref(),
            intent: trace.intent.as_deref(),
            context: &request.context,
        };

        let mut leader_run: Option<PipelineResult> = None;
        let slot = &mut leader_run;
        let pipeline = &self.pipeline;
        let steps = &route.steps;

        let participation = self
            .batches
            .execute(&key, item.id, item.payload.clone(), move |_batch| async move {
                let run = pipeline.execute(snapshot, steps, input).await;
                let outcome = if run.success {
                    Ok(serde_json::json!({
                        "result": run.result_value(),
                        "usage": run.usage,
                        "target": run.selected_target,
                    }))
                } else {
                    Err(run.error.clone().unwrap_or_else(|| {
                        QueueError::new(ErrorKind::Internal, "pipeline failed without an error")
                    }))
                };
                *slot = Some(run);
                outcome
            })
            .await
            .map_err(|e| e.to_queue_error())?;

        let batch_id = participation.batch.id;
        if let Err(e) = self.queue.assign_batch(item.id, batch_id).await {
            warn!(request_id = %item.id, batch_id = %batch_id, error = %e, "Could not link request to batch");
        }

        if participation.is_leader {
            if let Some(run) = &leader_run {
                trace.usage = run.usage.clone();
                trace.selected_target = run.selected_target.clone();
            }
            trace.batch_role = BatchRole::Leader {
                batch_id,
                members: participation.batch.member_count() as u32,
            };
        }

        match participation.response {
            MemberResponse::Success { result } => {
                if !participation.is_leader {
                    let usage: TokenUsage = result
                        .get("usage")
                        .cloned()
                        .and_then(|usage| serde_json::from_value(usage).ok())
                        .unwrap_or_default();
                    trace.selected_target = result.get("target").and_then(Value::as_str).map(String::from);
                    trace.batch_role = BatchRole::Follower {
                        batch_id,
                        avoided_cost: usage.cost,
                        avoided_tokens: estimate_tokens(&item.payload),
                    };
                }
                Ok(result.get("result").cloned().unwrap_or(Value::Null))
            }
            MemberResponse::Failure { error } => {
                if !participation.is_leader {
                    trace.batch_role = BatchRole::Follower {
                        batch_id,
                        avoided_cost: 0.0,
                        avoided_tokens: 0,
                    };
                }
                Err(error)
            }
        }
    }

    /// Record the one trace for a terminal item
    async fn record_final(&self, item: &QueueItem) {
        let mut trace = self
            .attempts
            .remove(&item.id)
            .map(|(_, trace)| trace)
            .unwrap_or_else(|| DebugTrace::new(item.id));

        trace.success = item.status == QueueStatus::Completed;
        if trace.success {
            trace.error_kind = None;
            trace.error_message = None;
        } else if let Some(error) = &item.error {
            trace.error_kind = Some(error.kind);
            trace.error_message = Some(error.message.clone());
        }
        trace.created_at = Utc::now();

        if let Err(e) = self.recorder.record_outcome(trace).await {
            warn!(request_id = %item.id, error = %e, "Failed to record telemetry");
        }
    }

    async fn notify(&self, item: &QueueItem) {
        let (Some(notifier), Some(url)) = (&self.notifier, item.callback_url.as_deref()) else {
            return;
        };
        match notifier.notify(item).await {
            Ok(()) => debug!(queue_item_id = %item.id, %url, "Callback delivered"),
            Err(e) => warn!(queue_item_id = %item.id, %url, error = %e, "Callback failed"),
        }
    }
}

#[async_trait]
impl JobHandler for Orchestrator {
    async fn handle(&self, item: &QueueItem, worker_id: &str) -> std::result::Result<Value, QueueError> {
        debug!(request_id = %item.id, worker_id, attempt = item.retry_count + 1, "Running request");
        self.execute(item).await
    }

    async fn finished(&self, item: &QueueItem) {
        debug!(request_id = %item.id, status = ?item.status, "Request finished");
        self.record_final(item).await;
    }

    async fn housekeeping(&self) {
        self.supervisor()
            .prune_finished(chrono::Duration::minutes(DETACHED_RETENTION_MINUTES));

        let cutoff = Utc::now() - chrono::Duration::minutes(ATTEMPT_RETENTION_MINUTES);
        let before = self.attempts.len();
        self.attempts.retain(|_, trace| trace.created_at > cutoff);
        let dropped = before.saturating_sub(self.attempts.len());
        if dropped > 0 {
            debug!(dropped, "Dropped attempt traces of requests that never finished here");
        }
    }
}
