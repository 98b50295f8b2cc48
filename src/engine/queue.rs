// Priority queue storage and facade

//! # Priority Queue
//!
//! Two layers, following the repository pattern used across the engine:
//!
//! - [`QueueStore`]: the storage contract. Every method is one atomic
//!   conditional update (pending → processing only if still pending, complete
//!   only if still owned by the caller, ...). [`InMemoryQueueStore`] keeps all
//!   items behind one lock; `PostgresQueueStore` uses row locks and conditional
//!   `UPDATE`s.
//! - [`PriorityQueue`]: the facade the scheduler and the API use. It applies
//!   defaults, wakes idle workers through a [`Notify`] and publishes terminal
//!   transitions on the event bus.
//!
//! ## Claim Order
//!
//! Highest `priority_score` first, then lowest insertion sequence. Before
//! choosing, a claim lazily expires overdue items and returns stale leases to
//! `pending`, so an idle sweeper never delays either. Items expired this way
//! come back in [`ClaimOutcome::expired`] so the caller can report them.
//!
//! ## Retention
//!
//! [`InMemoryQueueStore`] keeps at most `retention` finished items and drops
//! the oldest finished ones first. Pending and processing items are never
//! dropped.
//!
//! ## Rust Learning Notes:
//!
//! ### Why One Lock?
//! The exactly-once claim guarantee needs "find the best pending item" and
//! "mark it processing" to happen without anyone else interleaving. Holding a
//! single mutex across both steps gives that for free in memory.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventBus, OrchestratorEvent};
use crate::models::{CancelOutcome, NewQueueItem, QueueError, QueueItem, QueueStats, QueueStatus};
use crate::{OrchestratorError, Result};

/// Result of one claim attempt
#[derive(Debug, Clone, Default)]
pub struct ClaimOutcome {
    pub claimed: Option<QueueItem>,
    /// Items this claim moved to `expired` before choosing
    pub expired: Vec<QueueItem>,
}

/// Storage contract for queue items
///
/// Implementations own the atomicity of each transition. The lifecycle rules
/// themselves live on [`QueueItem`] so every backend applies the same ones.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn insert(&self, item: NewQueueItem, now: DateTime<Utc>) -> Result<QueueItem>;

    /// Atomically move the best pending item to processing for `worker_id`
    async fn claim(&self, worker_id: &str, now: DateTime<Utc>, lease: Duration) -> Result<ClaimOutcome>;

    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<QueueItem>;

    /// Record a failed attempt; the returned item is pending again when it will be retried
    async fn fail(&self, id: Uuid, worker_id: &str, error: QueueError, now: DateTime<Utc>) -> Result<QueueItem>;

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<(CancelOutcome, QueueItem)>;

    async fn renew_lease(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>, lease: Duration) -> Result<QueueItem>;

    async fn assign_batch(&self, id: Uuid, batch_id: Uuid) -> Result<()>;

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>>;

    async fn reclaim_stale_leases(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>>;

    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>>;

    async fn stats(&self) -> Result<QueueStats>;
}

#[derive(Default)]
struct QueueState {
    items: HashMap<Uuid, QueueItem>,
    /// Finished items, oldest first
    finished: VecDeque<Uuid>,
    next_sequence: i64,
}

impl QueueState {
    fn expire_overdue(&mut self, now: DateTime<Utc>) -> Vec<QueueItem> {
        let mut expired = Vec::new();
        for item in self.items.values_mut() {
            if item.is_overdue(now) {
                item.mark_expired(now);
                expired.push(item.clone());
            }
        }
        for item in &expired {
            self.finished.push_back(item.id);
        }
        expired
    }

    /// Note a terminal item and drop the oldest ones past `retention`
    fn retire(&mut self, item: &QueueItem, retention: usize) {
        if item.status.is_terminal() {
            self.finished.push_back(item.id);
        }
        self.trim(retention);
    }

    fn trim(&mut self, retention: usize) {
        while self.finished.len() > retention {
            if let Some(id) = self.finished.pop_front() {
                self.items.remove(&id);
            }
        }
    }

    fn reclaim_stale(&mut self, now: DateTime<Utc>) -> Vec<QueueItem> {
        let mut reclaimed = Vec::new();
        for item in self.items.values_mut() {
            if item.lease_is_stale(now) {
                warn!(
                    queue_item_id = %item.id,
                    worker_id = ?item.processing_node,
                    "Lease expired, returning item to pending"
                );
                item.release(now);
                reclaimed.push(item.clone());
            }
        }
        reclaimed
    }

    fn owned_mut(&mut self, id: Uuid, worker_id: &str) -> Result<&mut QueueItem> {
        let item = self
            .items
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("queue item {}", id)))?;
        if !item.is_owned_by(worker_id) {
            return Err(OrchestratorError::LeaseLost {
                id,
                worker_id: worker_id.to_string(),
            });
        }
        Ok(item)
    }
}

const DEFAULT_RETENTION: usize = 10_000;

/// In-memory queue store; one mutex guards every transition
pub struct InMemoryQueueStore {
    state: Mutex<QueueState>,
    retention: usize,
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            retention: DEFAULT_RETENTION,
        }
    }

    /// Keep at most `retention` finished items
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert(&self, item: NewQueueItem, now: DateTime<Utc>) -> Result<QueueItem> {
        let mut state = self.state.lock().await;
        state.next_sequence += 1;
        let item = QueueItem::from_new(item, now, state.next_sequence);
        state.items.insert(item.id, item.clone());
        Ok(item)
    }

    async fn claim(&self, worker_id: &str, now: DateTime<Utc>, lease: Duration) -> Result<ClaimOutcome> {
        let mut state = self.state.lock().await;
        let expired = state.expire_overdue(now);
        state.trim(self.retention);
        state.reclaim_stale(now);

        let next = state
            .items
            .values()
            .filter(|item| item.status == QueueStatus::Pending)
            .min_by_key(|item| item.claim_order())
            .map(|item| item.id);

        let claimed = next.and_then(|id| {
            state.items.get_mut(&id).map(|item| {
                item.mark_claimed(worker_id, now, lease);
                item.clone()
            })
        });
        Ok(ClaimOutcome { claimed, expired })
    }

    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        let mut state = self.state.lock().await;
        let item = state.owned_mut(id, worker_id)?;
        item.mark_completed(result, now);
        let item = item.clone();
        state.retire(&item, self.retention);
        Ok(item)
    }

    async fn fail(&self, id: Uuid, worker_id: &str, error: QueueError, now: DateTime<Utc>) -> Result<QueueItem> {
        let mut state = self.state.lock().await;
        let item = state.owned_mut(id, worker_id)?;
        item.mark_failed_attempt(error, now);
        let item = item.clone();
        state.retire(&item, self.retention);
        Ok(item)
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<(CancelOutcome, QueueItem)> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("queue item {}", id)))?;

        let outcome = match item.status {
            QueueStatus::Pending => {
                item.mark_cancelled(now);
                CancelOutcome::Cancelled
            }
            QueueStatus::Processing => {
                item.cancel_requested = true;
                item.updated_at = now;
                CancelOutcome::Requested
            }
            _ => CancelOutcome::AlreadyTerminal,
        };
        let item = item.clone();
        if outcome == CancelOutcome::Cancelled {
            state.retire(&item, self.retention);
        }
        Ok((outcome, item))
    }

    async fn renew_lease(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>, lease: Duration) -> Result<QueueItem> {
        let mut state = self.state.lock().await;
        let item = state.owned_mut(id, worker_id)?;
        item.renew_lease(now, lease);
        Ok(item.clone())
    }

    async fn assign_batch(&self, id: Uuid, batch_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("queue item {}", id)))?;
        item.batch_id = Some(batch_id);
        Ok(())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>> {
        let mut state = self.state.lock().await;
        let expired = state.expire_overdue(now);
        state.trim(self.retention);
        Ok(expired)
    }

    async fn reclaim_stale_leases(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>> {
        Ok(self.state.lock().await.reclaim_stale(now))
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>> {
        Ok(self.state.lock().await.items.get(&id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for item in state.items.values() {
            stats.record(item.status);
        }
        Ok(stats)
    }
}

/// Queue facade shared by the scheduler, the orchestrator and the API
pub struct PriorityQueue {
    store: Arc<dyn QueueStore>,
    work_available: Notify,
    lease: Duration,
    default_expiry: Option<Duration>,
    events: EventBus,
}

impl PriorityQueue {
    pub fn new(store: Arc<dyn QueueStore>, lease: Duration, events: EventBus) -> Self {
        Self {
            store,
            work_available: Notify::new(),
            lease,
            default_expiry: None,
            events,
        }
    }

    /// Applied to submissions that carry no `expires_at`
    pub fn with_default_expiry(mut self, expiry: Option<Duration>) -> Self {
        self.default_expiry = expiry;
        self
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease
    }

    pub async fn enqueue(&self, mut item: NewQueueItem) -> Result<QueueItem> {
        let now = Utc::now();
        if item.expires_at.is_none() {
            item.expires_at = self.default_expiry.map(|expiry| now + expiry);
        }

        let item = self.store.insert(item, now).await?;
        info!(
            queue_item_id = %item.id,
            priority = %item.priority,
            request_type = %item.request_type,
            "📥 Request enqueued"
        );
        self.work_available.notify_one();
        Ok(item)
    }

    /// Claim the next item; items that expired on the way are announced and returned
    pub async fn claim(&self, worker_id: &str) -> Result<ClaimOutcome> {
        let outcome = self.store.claim(worker_id, Utc::now(), self.lease).await?;
        for item in &outcome.expired {
            self.announce_terminal(item);
        }
        if let Some(item) = &outcome.claimed {
            debug!(
                queue_item_id = %item.id,
                worker_id,
                retry_count = item.retry_count,
                "Claimed queue item"
            );
        }
        Ok(outcome)
    }

    pub async fn complete(&self, id: Uuid, worker_id: &str, result: serde_json::Value) -> Result<QueueItem> {
        let item = self.store.complete(id, worker_id, result, Utc::now()).await?;
        self.announce_terminal(&item);
        Ok(item)
    }

    pub async fn fail(&self, id: Uuid, worker_id: &str, error: QueueError) -> Result<QueueItem> {
        let item = self.store.fail(id, worker_id, error, Utc::now()).await?;
        if item.status == QueueStatus::Pending {
            info!(
                queue_item_id = %item.id,
                retry_count = item.retry_count,
                max_retries = item.max_retries,
                "🔁 Attempt failed, item re-queued"
            );
            self.work_available.notify_one();
        } else {
            self.announce_terminal(&item);
        }
        Ok(item)
    }

    pub async fn cancel(&self, id: Uuid) -> Result<(CancelOutcome, QueueItem)> {
        let (outcome, item) = self.store.cancel(id, Utc::now()).await?;
        if outcome == CancelOutcome::Cancelled {
            self.announce_terminal(&item);
        }
        Ok((outcome, item))
    }

    pub async fn renew_lease(&self, id: Uuid, worker_id: &str) -> Result<QueueItem> {
        self.store.renew_lease(id, worker_id, Utc::now(), self.lease).await
    }

    pub async fn assign_batch(&self, id: Uuid, batch_id: Uuid) -> Result<()> {
        self.store.assign_batch(id, batch_id).await
    }

    pub async fn expire_overdue(&self) -> Result<Vec<QueueItem>> {
        let expired = self.store.expire_overdue(Utc::now()).await?;
        for item in &expired {
            self.announce_terminal(item);
        }
        Ok(expired)
    }

    pub async fn reclaim_stale_leases(&self) -> Result<Vec<QueueItem>> {
        let reclaimed = self.store.reclaim_stale_leases(Utc::now()).await?;
        if !reclaimed.is_empty() {
            self.work_available.notify_waiters();
            self.work_available.notify_one();
        }
        Ok(reclaimed)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<QueueItem>> {
        self.store.get(id).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.stats().await
    }

    /// Park an idle worker until work is signalled or `timeout` passes
    pub async fn wait_for_work(&self, timeout: std::time::Duration) {
        let _ = tokio::time::timeout(timeout, self.work_available.notified()).await;
    }

    fn announce_terminal(&self, item: &QueueItem) {
        if item.status.is_terminal() {
            info!(queue_item_id = %item.id, status = %item.status, "Queue item finished");
            self.events.publish(OrchestratorEvent::QueueItemFinished {
                id: item.id,
                status: item.status,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorKind, QueuePriority};
    use tokio_test::{assert_err, assert_ok};

    fn request(priority: QueuePriority) -> NewQueueItem {
        NewQueueItem::new(serde_json::json!({ "text": "hi" }), "chat", "u1", "w1").with_priority(priority)
    }

    fn queue(store: Arc<InMemoryQueueStore>) -> PriorityQueue {
        PriorityQueue::new(store, Duration::seconds(30), EventBus::new(16))
    }

    #[tokio::test]
    async fn test_higher_tier_claimed_first() {
        let queue = queue(Arc::new(InMemoryQueueStore::new()));
        let low = queue.enqueue(request(QueuePriority::Low)).await.unwrap();
        let critical = queue.enqueue(request(QueuePriority::Critical)).await.unwrap();
        let normal = queue.enqueue(request(QueuePriority::Normal)).await.unwrap();

        let mut order = Vec::new();
        while let Some(item) = queue.claim("w").await.unwrap().claimed {
            order.push(item.id);
        }
        assert_eq!(order, vec![critical.id, normal.id, low.id]);
    }

    #[tokio::test]
    async fn test_same_tier_is_fifo() {
        let queue = queue(Arc::new(InMemoryQueueStore::new()));
        let first = queue.enqueue(request(QueuePriority::High)).await.unwrap();
        let second = queue.enqueue(request(QueuePriority::High)).await.unwrap();

        assert_eq!(queue.claim("w").await.unwrap().claimed.unwrap().id, first.id);
        assert_eq!(queue.claim("w").await.unwrap().claimed.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_non_owner_cannot_complete() {
        let queue = queue(Arc::new(InMemoryQueueStore::new()));
        let item = queue.enqueue(request(QueuePriority::Normal)).await.unwrap();
        queue.claim("owner").await.unwrap();

        let result = queue.complete(item.id, "intruder", serde_json::json!({})).await;
        assert!(matches!(result, Err(OrchestratorError::LeaseLost { .. })));
        assert_ok!(queue.complete(item.id, "owner", serde_json::json!({})).await);
    }

    #[tokio::test]
    async fn test_cancel_pending_and_processing() {
        let queue = queue(Arc::new(InMemoryQueueStore::new()));
        let pending = queue.enqueue(request(QueuePriority::Low)).await.unwrap();
        let running = queue.enqueue(request(QueuePriority::Critical)).await.unwrap();
        queue.claim("w").await.unwrap();

        let (outcome, cancelled) = queue.cancel(pending.id).await.unwrap();
        assert_eq!(outcome, CancelOutcome::Cancelled);
        assert_eq!(cancelled.status, QueueStatus::Cancelled);
        assert_eq!(queue.cancel(running.id).await.unwrap().0, CancelOutcome::Requested);

        let finished = queue.complete(running.id, "w", serde_json::json!("late")).await.unwrap();
        assert_eq!(finished.status, QueueStatus::Cancelled);
        assert_eq!(queue.cancel(running.id).await.unwrap().0, CancelOutcome::AlreadyTerminal);
    }

    #[tokio::test]
    async fn test_expired_items_are_never_claimed() {
        let store = Arc::new(InMemoryQueueStore::new());
        let queue = queue(store.clone());
        let item = queue
            .enqueue(request(QueuePriority::Normal).expiring_at(Utc::now() - Duration::seconds(1)))
            .await
            .unwrap();
        assert_eq!(item.status, QueueStatus::Pending);

        let mut events = queue.events.subscribe();
        let outcome = queue.claim("w").await.unwrap();
        assert!(outcome.claimed.is_none());
        assert_eq!(outcome.expired.len(), 1);
        assert_eq!(outcome.expired[0].id, item.id);
        assert_eq!(
            events.try_recv().unwrap(),
            OrchestratorEvent::QueueItemFinished {
                id: item.id,
                status: QueueStatus::Expired,
            }
        );

        let stored = queue.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Expired);
        assert_eq!(stored.error.unwrap().kind, ErrorKind::QueueExpired);
        assert!(queue.claim("w").await.unwrap().expired.is_empty());
    }

    #[tokio::test]
    async fn test_stale_lease_is_reclaimed_without_charging_a_retry() {
        let store = Arc::new(InMemoryQueueStore::new());
        let item = store.insert(request(QueuePriority::Normal), Utc::now()).await.unwrap();
        let claimed_at = Utc::now();
        store
            .claim("crashed", claimed_at, Duration::seconds(30))
            .await
            .unwrap()
            .claimed
            .unwrap();

        let later = claimed_at + Duration::seconds(31);
        let reclaimed = store
            .claim("healthy", later, Duration::seconds(30))
            .await
            .unwrap()
            .claimed
            .unwrap();

        assert_eq!(reclaimed.id, item.id);
        assert_eq!(reclaimed.retry_count, 0);
        assert_eq!(reclaimed.processing_node.as_deref(), Some("healthy"));
        assert_err!(store.complete(item.id, "crashed", serde_json::json!({}), later).await);
    }

    #[tokio::test]
    async fn test_stats_count_each_status() {
        let queue = queue(Arc::new(InMemoryQueueStore::new()));
        queue.enqueue(request(QueuePriority::Normal)).await.unwrap();
        let claimed = queue.enqueue(request(QueuePriority::High)).await.unwrap();
        queue.claim("w").await.unwrap();
        queue.complete(claimed.id, "w", serde_json::json!({})).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn test_retention_drops_oldest_finished_items() {
        let queue = queue(Arc::new(InMemoryQueueStore::new().with_retention(2)));
        let mut finished = Vec::new();
        for _ in 0..3 {
            let item = queue.enqueue(request(QueuePriority::Normal)).await.unwrap();
            queue.claim("w").await.unwrap();
            queue.complete(item.id, "w", serde_json::json!({})).await.unwrap();
            finished.push(item.id);
        }
        let waiting = queue.enqueue(request(QueuePriority::Low)).await.unwrap();
        let cancelled = queue.enqueue(request(QueuePriority::Low)).await.unwrap();
        queue.cancel(cancelled.id).await.unwrap();

        assert!(queue.get(finished[0]).await.unwrap().is_none());
        assert!(queue.get(finished[1]).await.unwrap().is_none());
        assert!(queue.get(finished[2]).await.unwrap().is_some());
        assert!(queue.get(cancelled.id).await.unwrap().is_some());
        assert!(queue.get(waiting.id).await.unwrap().is_some());

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.pending, 1);
    }
}
