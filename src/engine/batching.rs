// Request batching and deduplication
// One upstream call per group of equivalent requests

//! # Batching Engine
//!
//! Requests that hash to the same similarity key while a batch window is open
//! share one upstream call.
//!
//! ```text
//! admit ──▶ no open batch with this hash ──▶ leader: open batch, wait for
//!   │                                          window or size cap, seal,
//!   │                                          run upstream once, fan out
//!   └──▶ open batch accepts members ──▶ follower: wait for the leader's
//!                                        resolution (bounded by a timeout)
//! ```
//!
//! Every member of a resolved batch has an entry in `response_map`. An upstream
//! failure resolves every member with `BatchUpstreamFailed` and the same
//! message. A follower that waits past `follower_timeout` fails the whole batch
//! so nobody waits forever. A leader whose own call later succeeds keeps its
//! result even when a follower already failed the batch.
//!
//! ## Similarity Hash
//!
//! SHA-256 over the normalized request text (lower-case, collapsed
//! whitespace) plus the fields that change routing or visibility: request
//! type, user, workspace, actor, intent and every context key that is not
//! volatile. Two users never share an answer.
//!
//! ## Retention
//!
//! [`InMemoryBatchStore`] keeps the most recent resolved batches (10 000 by
//! default) and drops the oldest beyond that. Open and processing batches are
//! never dropped.
//!
//! ## Rust Learning Notes:
//!
//! ### `watch` for "Has This Happened Yet?"
//! A `tokio::sync::watch` channel keeps its latest value, so a follower that
//! subscribes after the leader already announced resolution still sees it.
//! `Notify::notify_one` stores a permit for the same reason: the "batch is
//! full" signal is not lost if the leader is not waiting yet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventBus, OrchestratorEvent};
use crate::config::OrchestratorConfig;
use crate::models::{BatchStatus, ErrorKind, MemberResponse, QueueError, RequestBatch};
use crate::{OrchestratorError, Result};

/// Context keys that differ between otherwise identical requests
const VOLATILE_CONTEXT_KEYS: [&str; 6] = [
    "timestamp",
    "request_id",
    "requestId",
    "created_at",
    "nonce",
    "trace_id",
];

/// Fallback poll interval for followers whose leader lives in another process
const FOLLOWER_POLL: Duration = Duration::from_millis(100);

/// Fields that decide whether two requests are equivalent
#[derive(Debug, Clone, Copy)]
pub struct BatchKey<'a> {
    pub text: &'a str,
    pub request_type: &'a str,
    pub user_id: &'a str,
    pub workspace_id: &'a str,
    pub actor_id: Option<&'a str>,
    pub intent: Option<&'a str>,
    pub context: &'a Map<String, Value>,
}

impl BatchKey<'_> {
    pub fn similarity_hash(&self) -> String {
        let normalized = self
            .text
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ");

        let mut hasher = Sha256::new();
        for field in [
            normalized.as_str(),
            self.request_type,
            self.user_id,
            self.workspace_id,
            self.actor_id.unwrap_or(""),
            self.intent.unwrap_or(""),
        ] {
            hasher.update(field.as_bytes());
            hasher.update([0x1f]);
        }

        let mut keys: Vec<&String> = self
            .context
            .keys()
            .filter(|key| !VOLATILE_CONTEXT_KEYS.contains(&key.as_str()))
            .collect();
        keys.sort();
        for key in keys {
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(self.context[key].to_string().as_bytes());
            hasher.update([0x1e]);
        }

        format!("{:x}", hasher.finalize())
    }
}

/// Rough token estimate at four characters per token
pub fn estimate_tokens(payload: &Value) -> u64 {
    let chars = payload.to_string().chars().count() as u64;
    (chars + 3) / 4
}

/// Result of joining or opening a batch
#[derive(Debug, Clone)]
pub struct Admission {
    pub batch: RequestBatch,
    pub is_leader: bool,
}

/// How the leader's upstream call ended
#[derive(Debug, Clone)]
pub enum BatchResolution {
    Processed { combined_result: Value },
    Failed { message: String },
}

impl BatchResolution {
    /// Fill the response map for every member and mark the batch resolved
    pub fn apply(self, batch: &mut RequestBatch, now: DateTime<Utc>) {
        match self {
            BatchResolution::Processed { combined_result } => {
                for id in &batch.request_ids {
                    batch.response_map.insert(
                        *id,
                        MemberResponse::Success {
                            result: combined_result.clone(),
                        },
                    );
                }
                let estimated: u64 = batch.combined_payload.iter().map(estimate_tokens).sum();
                let upstream = batch.combined_payload.first().map(estimate_tokens).unwrap_or(0);
                batch.api_calls_saved = batch.request_ids.len().saturating_sub(1) as u32;
                batch.tokens_saved = estimated.saturating_sub(upstream);
                batch.combined_result = Some(combined_result);
                batch.status = BatchStatus::Processed;
            }
            BatchResolution::Failed { message } => {
                let error = QueueError::new(ErrorKind::BatchUpstreamFailed, message);
                for id in &batch.request_ids {
                    batch.response_map.insert(
                        *id,
                        MemberResponse::Failure {
                            error: error.clone(),
                        },
                    );
                }
                batch.status = BatchStatus::Failed;
            }
        }
        batch.processed_at = Some(now);
    }
}

/// Add a follower to an open batch
pub(crate) fn join(batch: &mut RequestBatch, request_id: Uuid, payload: Value) {
    batch.request_ids.push(request_id);
    batch.combined_payload.push(payload);
}

/// Storage contract for batches; `admit` and `resolve` are atomic
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Join the open batch for `hash` or open a new one with `request_id` as leader
    async fn admit(
        &self,
        hash: &str,
        request_id: Uuid,
        payload: Value,
        now: DateTime<Utc>,
        window: chrono::Duration,
        max_size: usize,
    ) -> Result<Admission>;

    /// Stop accepting members
    async fn seal(&self, batch_id: Uuid) -> Result<RequestBatch>;

    /// Fill the response map for every member; a no-op on an already resolved batch
    async fn resolve(
        &self,
        batch_id: Uuid,
        resolution: BatchResolution,
        now: DateTime<Utc>,
    ) -> Result<RequestBatch>;

    async fn get(&self, batch_id: Uuid) -> Result<Option<RequestBatch>>;
}

#[derive(Default)]
struct BatchState {
    batches: HashMap<Uuid, RequestBatch>,
    open_by_hash: HashMap<String, Uuid>,
    /// Resolved batch ids, oldest first
    resolved: VecDeque<Uuid>,
}

/// Resolved batches kept before the oldest is dropped
const DEFAULT_RETENTION: usize = 10_000;

pub struct InMemoryBatchStore {
    state: Mutex<BatchState>,
    retention: usize,
}

impl Default for InMemoryBatchStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBatchStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BatchState::default()),
            retention: DEFAULT_RETENTION,
        }
    }

    /// Keep at most `retention` resolved batches
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }
}

pub(crate) fn missing(batch_id: Uuid) -> OrchestratorError {
    OrchestratorError::NotFound(format!("batch {}", batch_id))
}

#[async_trait]
impl BatchStore for InMemoryBatchStore {
    async fn admit(
        &self,
        hash: &str,
        request_id: Uuid,
        payload: Value,
        now: DateTime<Utc>,
        window: chrono::Duration,
        max_size: usize,
    ) -> Result<Admission> {
        let mut state = self.state.lock().await;

        let open = state.open_by_hash.get(hash).copied();
        if let Some(batch) = open.and_then(|id| state.batches.get_mut(&id)) {
            if batch.accepts_members(now) {
                join(batch, request_id, payload);
                return Ok(Admission {
                    batch: batch.clone(),
                    is_leader: false,
                });
            }
        }

        let batch = RequestBatch::open(hash, request_id, payload, now + window, max_size.max(1), now);
        state.open_by_hash.insert(hash.to_string(), batch.id);
        state.batches.insert(batch.id, batch.clone());
        Ok(Admission {
            batch,
            is_leader: true,
        })
    }

    async fn seal(&self, batch_id: Uuid) -> Result<RequestBatch> {
        let mut state = self.state.lock().await;
        let batch = state.batches.get_mut(&batch_id).ok_or_else(|| missing(batch_id))?;
        if batch.status == BatchStatus::Open {
            batch.status = BatchStatus::Processing;
        }
        let sealed = batch.clone();
        if state.open_by_hash.get(&sealed.similarity_hash) == Some(&batch_id) {
            state.open_by_hash.remove(&sealed.similarity_hash);
        }
        Ok(sealed)
    }

    async fn resolve(
        &self,
        batch_id: Uuid,
        resolution: BatchResolution,
        now: DateTime<Utc>,
    ) -> Result<RequestBatch> {
        let mut state = self.state.lock().await;
        let batch = state.batches.get_mut(&batch_id).ok_or_else(|| missing(batch_id))?;
        if batch.status.is_resolved() {
            return Ok(batch.clone());
        }

        resolution.apply(batch, now);
        let resolved = batch.clone();
        if state.open_by_hash.get(&resolved.similarity_hash) == Some(&batch_id) {
            state.open_by_hash.remove(&resolved.similarity_hash);
        }

        state.resolved.push_back(batch_id);
        while state.resolved.len() > self.retention {
            if let Some(oldest) = state.resolved.pop_front() {
                state.batches.remove(&oldest);
            }
        }
        Ok(resolved)
    }

    async fn get(&self, batch_id: Uuid) -> Result<Option<RequestBatch>> {
        Ok(self.state.lock().await.batches.get(&batch_id).cloned())
    }
}
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub window: Duration,
    pub max_size: usize,
    pub follower_timeout: Duration,
}

impl From<&OrchestratorConfig> for BatchSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            window: config.batch_window(),
            max_size: config.batch_max_size,
            follower_timeout: config.follower_timeout(),
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

struct BatchSignals {
    full: Notify,
    resolved: watch::Sender<bool>,
}

impl BatchSignals {
    fn new() -> Self {
        let (resolved, _) = watch::channel(false);
        Self {
            full: Notify::new(),
            resolved,
        }
    }
}

/// What one request got out of batching
#[derive(Debug, Clone)]
pub struct BatchParticipation {
    pub batch: RequestBatch,
    pub is_leader: bool,
    pub response: MemberResponse,
}

fn participation(batch: RequestBatch, request_id: Uuid, is_leader: bool) -> Result<BatchParticipation> {
    let response = batch.response_for(&request_id).cloned().ok_or_else(|| {
        OrchestratorError::Internal(format!("batch {} has no response for {}", batch.id, request_id))
    })?;
    Ok(BatchParticipation {
        batch,
        is_leader,
        response,
    })
}

pub struct BatchEngine {
    store: Arc<dyn BatchStore>,
    signals: DashMap<Uuid, Arc<BatchSignals>>,
    settings: BatchSettings,
    events: EventBus,
}

impl BatchEngine {
    pub fn new(store: Arc<dyn BatchStore>, settings: BatchSettings, events: EventBus) -> Self {
        Self {
            store,
            signals: DashMap::new(),
            settings,
            events,
        }
    }

    fn signals(&self, batch_id: Uuid) -> Arc<BatchSignals> {
        self.signals
            .entry(batch_id)
            .or_insert_with(|| Arc::new(BatchSignals::new()))
            .clone()
    }

    pub async fn admit(&self, key: &BatchKey<'_>, request_id: Uuid, payload: Value) -> Result<Admission> {
        let hash = key.similarity_hash();
        let window = chrono::Duration::from_std(self.settings.window)
            .map_err(|e| OrchestratorError::Configuration(format!("batch window: {}", e)))?;

        let admission = self
            .store
            .admit(&hash, request_id, payload, Utc::now(), window, self.settings.max_size)
            .await?;
        let signals = self.signals(admission.batch.id);

        if admission.is_leader {
            debug!(batch_id = %admission.batch.id, request_id = %request_id, "Opened batch as leader");
        } else {
            debug!(
                batch_id = %admission.batch.id,
                request_id = %request_id,
                members = admission.batch.member_count(),
                "Joined batch as follower"
            );
            if admission.batch.is_full() {
                signals.full.notify_one();
            }
        }
        Ok(admission)
    }

    /// Leader side: wait out the window, seal, run `upstream` once, fan out
    pub async fn lead<F, Fut>(&self, batch: &RequestBatch, upstream: F) -> Result<BatchParticipation>
    where
        F: FnOnce(RequestBatch) -> Fut,
        Fut: Future<Output = std::result::Result<Value, QueueError>>,
    {
        let leader_id = batch.leader_request_id;
        let signals = self.signals(batch.id);
        let remaining = (batch.window_expires_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);

        if !batch.is_full() {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = signals.full.notified() => {}
            }
        }

        let sealed = self.store.seal(batch.id).await?;
        if sealed.status.is_resolved() {
            // A follower gave up on us before the window closed.
            self.finish(&signals, &sealed);
            return participation(sealed, leader_id, true);
        }

        let (resolution, own) = match upstream(sealed.clone()).await {
            Ok(combined_result) => (
                BatchResolution::Processed {
                    combined_result: combined_result.clone(),
                },
                Some(MemberResponse::Success {
                    result: combined_result,
                }),
            ),
            Err(error) => {
                warn!(batch_id = %sealed.id, error = %error, "Batch upstream call failed");
                (
                    BatchResolution::Failed {
                        message: error.message,
                    },
                    None,
                )
            }
        };

        let resolved = self.store.resolve(sealed.id, resolution, Utc::now()).await?;
        info!(
            batch_id = %resolved.id,
            status = ?resolved.status,
            members = resolved.member_count(),
            api_calls_saved = resolved.api_calls_saved,
            tokens_saved = resolved.tokens_saved,
            "📦 Batch resolved"
        );
        self.finish(&signals, &resolved);

        match own {
            Some(response) if resolved.status == BatchStatus::Failed => {
                warn!(
                    batch_id = %resolved.id,
                    "Batch was failed by a waiting follower; leader keeps its own result"
                );
                Ok(BatchParticipation {
                    batch: resolved,
                    is_leader: true,
                    response,
                })
            }
            _ => participation(resolved, leader_id, true),
        }
    }

    /// Follower side: wait for the leader's resolution
    pub async fn follow(&self, batch_id: Uuid) -> Result<RequestBatch> {
        let signals = self.signals(batch_id);
        let mut resolved_rx = signals.resolved.subscribe();
        let deadline = tokio::time::Instant::now() + self.settings.follower_timeout;

        loop {
            let batch = self.store.get(batch_id).await?.ok_or_else(|| missing(batch_id))?;
            if batch.status.is_resolved() {
                self.signals.remove(&batch_id);
                return Ok(batch);
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(batch_id = %batch_id, "Follower timed out waiting for the batch leader");
                let failed = self
                    .store
                    .resolve(
                        batch_id,
                        BatchResolution::Failed {
                            message: "timed out waiting for the batch leader".to_string(),
                        },
                        Utc::now(),
                    )
                    .await?;
                self.finish(&signals, &failed);
                return Ok(failed);
            }

            tokio::select! {
                _ = resolved_rx.changed() => {}
                _ = tokio::time::sleep(FOLLOWER_POLL) => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Admit, then lead or follow; `upstream` only runs for the leader
    pub async fn execute<F, Fut>(
        &self,
        key: &BatchKey<'_>,
        request_id: Uuid,
        payload: Value,
        upstream: F,
    ) -> Result<BatchParticipation>
    where
        F: FnOnce(RequestBatch) -> Fut,
        Fut: Future<Output = std::result::Result<Value, QueueError>>,
    {
        let admission = self.admit(key, request_id, payload).await?;
        if admission.is_leader {
            self.lead(&admission.batch, upstream).await
        } else {
            let batch = self.follow(admission.batch.id).await?;
            participation(batch, request_id, false)
        }
    }

    pub async fn get(&self, batch_id: Uuid) -> Result<Option<RequestBatch>> {
        self.store.get(batch_id).await
    }

    fn finish(&self, signals: &BatchSignals, batch: &RequestBatch) {
        signals.resolved.send_replace(true);
        self.signals.remove(&batch.id);
        self.events.publish(OrchestratorEvent::BatchResolved {
            batch_id: batch.id,
            status: batch.status,
            members: batch.member_count(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    fn key<'a>(text: &'a str, context: &'a Map<String, Value>) -> BatchKey<'a> {
        BatchKey {
            text,
            request_type: "chat",
            user_id: "u1",
            workspace_id: "w1",
            actor_id: None,
            intent: Some("general_query"),
            context,
        }
    }

    fn engine(settings: BatchSettings) -> Arc<BatchEngine> {
        Arc::new(BatchEngine::new(
            Arc::new(InMemoryBatchStore::new()),
            settings,
            EventBus::new(16),
        ))
    }

    fn settings(window_ms: u64, max_size: usize) -> BatchSettings {
        BatchSettings {
            window: Duration::from_millis(window_ms),
            max_size,
            follower_timeout: Duration::from_secs(120),
        }
    }

    #[test]
    fn test_hash_ignores_case_whitespace_and_volatile_keys() {
        let a = context(&[("project", Value::from("apollo")), ("timestamp", Value::from(1))]);
        let b = context(&[("project", Value::from("apollo")), ("timestamp", Value::from(2))]);
        let c = context(&[("project", Value::from("gemini"))]);

        assert_eq!(
            key("List   my Items", &a).similarity_hash(),
            key("list my items", &b).similarity_hash()
        );
        assert_ne!(key("list my items", &a).similarity_hash(), key("list my items", &c).similarity_hash());
        assert_eq!(key("x", &a).similarity_hash().len(), 64);
    }

    #[test]
    fn test_hash_separates_users() {
        let ctx = Map::new();
        let alice = key("show my invoices", &ctx);
        let bob = BatchKey {
            user_id: "u2",
            ..alice
        };

        assert_ne!(alice.similarity_hash(), bob.similarity_hash());
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens(&Value::from("abcdefgh")), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_requests_in_window_share_one_call() {
        let engine = engine(settings(2_000, 16));
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = Map::new();

        let leader_engine = engine.clone();
        let leader_calls = calls.clone();
        let leader_id = Uuid::new_v4();
        let leader = tokio::spawn(async move {
            let ctx = Map::new();
            leader_engine
                .execute(&key("hello", &ctx), leader_id, serde_json::json!({"text": "hello"}), |_| async move {
                    leader_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(serde_json::json!("shared answer"))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let follower_id = Uuid::new_v4();
        let follower = engine
            .execute(&key("hello", &ctx), follower_id, serde_json::json!({"text": "hello"}), |_| async {
                Ok(serde_json::json!("should not run"))
            })
            .await
            .unwrap();
        let leader = leader.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(leader.is_leader);
        assert!(!follower.is_leader);
        assert_eq!(follower.batch.id, leader.batch.id);
        assert_eq!(follower.batch.api_calls_saved, 1);
        assert!(follower.batch.has_no_orphans());
        assert_eq!(
            follower.response,
            MemberResponse::Success {
                result: serde_json::json!("shared answer")
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_failure_reaches_every_member() {
        let engine = engine(settings(2_000, 2));
        let ctx = Map::new();

        let leader_engine = engine.clone();
        let leader = tokio::spawn(async move {
            let ctx = Map::new();
            leader_engine
                .execute(&key("q", &ctx), Uuid::new_v4(), Value::from("q"), |_| async {
                    Err(QueueError::new(ErrorKind::StepFailed, "provider down"))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = engine
            .execute(&key("q", &ctx), Uuid::new_v4(), Value::from("q"), |_| async { Ok(Value::Null) })
            .await
            .unwrap();
        let leader = leader.await.unwrap().unwrap();

        for participation in [&leader, &follower] {
            match &participation.response {
                MemberResponse::Failure { error } => {
                    assert_eq!(error.kind, ErrorKind::BatchUpstreamFailed);
                    assert_eq!(error.message, "provider down");
                }
                other => panic!("unexpected response {:?}", other),
            }
        }
        assert_eq!(follower.batch.status, BatchStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_follower_timeout_fails_the_batch() {
        let engine = engine(BatchSettings {
            window: Duration::from_millis(2_000),
            max_size: 16,
            follower_timeout: Duration::from_secs(5),
        });
        let ctx = Map::new();

        // Leader admitted but never runs.
        let admission = engine.admit(&key("stuck", &ctx), Uuid::new_v4(), Value::Null).await.unwrap();
        assert!(admission.is_leader);
        let follower_id = Uuid::new_v4();
        let joined = engine.admit(&key("stuck", &ctx), follower_id, Value::Null).await.unwrap();
        assert!(!joined.is_leader);

        let batch = engine.follow(joined.batch.id).await.unwrap();
        assert_eq!(batch.status, BatchStatus::Failed);
        assert!(batch.has_no_orphans());
        assert!(matches!(
            batch.response_for(&follower_id),
            Some(MemberResponse::Failure { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_leader_keeps_its_result_after_follower_gives_up() {
        let engine = engine(BatchSettings {
            window: Duration::from_millis(2_000),
            max_size: 16,
            follower_timeout: Duration::from_secs(5),
        });
        let calls = Arc::new(AtomicUsize::new(0));
        let ctx = Map::new();

        let leader_engine = engine.clone();
        let leader_calls = calls.clone();
        let leader = tokio::spawn(async move {
            let ctx = Map::new();
            leader_engine
                .execute(&key("slow", &ctx), Uuid::new_v4(), Value::from("slow"), |_| async move {
                    leader_calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(serde_json::json!("late answer"))
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let follower = engine
            .execute(&key("slow", &ctx), Uuid::new_v4(), Value::from("slow"), |_| async {
                Ok(serde_json::json!("should not run"))
            })
            .await
            .unwrap();
        let leader = leader.await.unwrap().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(follower.response, MemberResponse::Failure { .. }));
        assert_eq!(follower.batch.status, BatchStatus::Failed);
        assert!(leader.is_leader);
        assert_eq!(
            leader.response,
            MemberResponse::Success {
                result: serde_json::json!("late answer")
            }
        );
    }

    #[tokio::test]
    async fn test_retention_drops_oldest_resolved_batches() {
        let store = InMemoryBatchStore::new().with_retention(2);
        let now = Utc::now();
        let window = chrono::Duration::seconds(2);

        let mut ids = Vec::new();
        for hash in ["a", "b", "c"] {
            let admission = store.admit(hash, Uuid::new_v4(), Value::Null, now, window, 16).await.unwrap();
            store
                .resolve(
                    admission.batch.id,
                    BatchResolution::Processed {
                        combined_result: Value::Null,
                    },
                    now,
                )
                .await
                .unwrap();
            ids.push(admission.batch.id);
        }
        let open = store.admit("d", Uuid::new_v4(), Value::Null, now, window, 16).await.unwrap();

        assert!(store.get(ids[0]).await.unwrap().is_none());
        assert!(store.get(ids[1]).await.unwrap().is_some());
        assert!(store.get(ids[2]).await.unwrap().is_some());
        assert!(store.get(open.batch.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sealed_batch_opens_a_new_one() {
        let store = InMemoryBatchStore::new();
        let now = Utc::now();
        let window = chrono::Duration::seconds(2);

        let first = store.admit("h", Uuid::new_v4(), Value::Null, now, window, 16).await.unwrap();
        store.seal(first.batch.id).await.unwrap();
        let second = store.admit("h", Uuid::new_v4(), Value::Null, now, window, 16).await.unwrap();

        assert!(second.is_leader);
        assert_ne!(first.batch.id, second.batch.id);
    }
}
