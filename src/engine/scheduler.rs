// Worker pool driving the priority queue
// Claims, runs, renews leases, reports back

//! # Scheduler
//!
//! A fixed pool of tokio worker tasks plus one sweeper task.
//!
//! - Each worker loops: claim → run the [`JobHandler`] → complete or fail. While
//!   the handler runs, the worker renews its lease every `lease_timeout / 3`.
//! - Idle workers park on the queue's `Notify` (woken by enqueue, retries and
//!   lease reclamation) with `idle_wait` as an upper bound.
//! - The sweeper expires overdue items, reclaims stale leases and runs the
//!   handler's housekeeping every `sweep_interval`.
//! - Every item that reaches a terminal state here, whether it ran or expired
//!   first, is handed to [`JobHandler::finished`] and, when it carries a
//!   `callback_url`, reported through the [`CallbackNotifier`]. Callback
//!   failures are logged and never retried.
//!
//! Shutdown goes through a [`CancellationToken`]: workers finish the job in
//! hand, then exit.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::queue::PriorityQueue;
use crate::config::OrchestratorConfig;
use crate::models::{QueueError, QueueItem, QueueStatus};
use crate::{OrchestratorError, Result};

/// The unit of work a worker runs for one claimed item
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, item: &QueueItem, worker_id: &str) -> std::result::Result<Value, QueueError>;

    /// Called once per item when it reaches a terminal state, including items
    /// that expired before `handle` ever ran
    async fn finished(&self, _item: &QueueItem) {}

    /// Periodic upkeep, run by the sweeper
    async fn housekeeping(&self) {}
}

/// Reports terminal outcomes to submitters that asked for a callback
#[async_trait]
pub trait CallbackNotifier: Send + Sync {
    async fn notify(&self, item: &QueueItem) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct CallbackPayload<'a> {
    id: Uuid,
    status: QueueStatus,
    result: &'a Option<Value>,
    error: &'a Option<QueueError>,
}

/// POSTs `{id, status, result, error}` to the item's `callback_url`
pub struct HttpCallbackNotifier {
    client: Client,
}

impl HttpCallbackNotifier {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpCallbackNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CallbackNotifier for HttpCallbackNotifier {
    async fn notify(&self, item: &QueueItem) -> Result<()> {
        let Some(url) = item.callback_url.as_deref() else {
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(&CallbackPayload {
                id: item.id,
                status: item.status,
                result: &item.result,
                error: &item.error,
            })
            .send()
            .await
            .map_err(|e| OrchestratorError::Internal(format!("callback to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(OrchestratorError::Internal(format!(
                "callback to {} returned {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub worker_count: usize,
    pub sweep_interval: Duration,
    pub idle_wait: Duration,
}

impl From<&OrchestratorConfig> for SchedulerSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            sweep_interval: config.sweep_interval(),
            idle_wait: config.idle_wait(),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

pub struct Scheduler {
    queue: Arc<PriorityQueue>,
    handler: Arc<dyn JobHandler>,
    notifier: Option<Arc<dyn CallbackNotifier>>,
    settings: SchedulerSettings,
    node_id: String,
}

/// Running worker pool; drop-in handle for shutdown
pub struct SchedulerHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal every task and wait for them to exit
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Scheduler task panicked");
            }
        }
        info!("🛑 Scheduler stopped");
    }
}

impl Scheduler {
    pub fn new(queue: Arc<PriorityQueue>, handler: Arc<dyn JobHandler>, settings: SchedulerSettings) -> Self {
        Self {
            queue,
            handler,
            notifier: None,
            settings,
            node_id: format!("node-{}", &Uuid::new_v4().simple().to_string()[..8]),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn CallbackNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Prefix for worker ids; must be unique per process sharing a queue
    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    /// Spawn the worker pool and the sweeper
    pub fn start(self: Arc<Self>) -> SchedulerHandle {
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::with_capacity(self.settings.worker_count + 1);

        for index in 0..self.settings.worker_count {
            let worker_id = format!("{}-worker-{}", self.node_id, index);
            let scheduler = self.clone();
            let token = shutdown.child_token();
            tasks.push(tokio::spawn(async move {
                scheduler.worker_loop(worker_id, token).await;
            }));
        }

        let scheduler = self.clone();
        let token = shutdown.child_token();
        tasks.push(tokio::spawn(async move {
            scheduler.sweeper_loop(token).await;
        }));

        info!(
            node_id = %self.node_id,
            workers = self.settings.worker_count,
            sweep_interval_ms = self.settings.sweep_interval.as_millis() as u64,
            "🚀 Scheduler started"
        );

        SchedulerHandle { shutdown, tasks }
    }

    /// Claim and run at most one item; returns the item as it was reported
    pub async fn process_one(&self, worker_id: &str) -> Result<Option<QueueItem>> {
        let claim = self.queue.claim(worker_id).await?;
        for expired in &claim.expired {
            self.settle(expired).await;
        }
        let Some(item) = claim.claimed else {
            return Ok(None);
        };

        let outcome = self.run_with_lease(&item, worker_id).await;
        let reported = match outcome {
            Ok(result) => self.queue.complete(item.id, worker_id, result).await?,
            Err(error) => {
                debug!(queue_item_id = %item.id, worker_id, error = %error, "Job failed");
                self.queue.fail(item.id, worker_id, error).await?
            }
        };

        if reported.status.is_terminal() {
            self.settle(&reported).await;
        }
        Ok(Some(reported))
    }

    /// Expire overdue items, reclaim stale leases and run housekeeping once
    pub async fn sweep(&self) -> Result<()> {
        let expired = self.queue.expire_overdue().await?;
        for item in &expired {
            self.settle(item).await;
        }
        let reclaimed = self.queue.reclaim_stale_leases().await?;
        if !expired.is_empty() || !reclaimed.is_empty() {
            info!(expired = expired.len(), reclaimed = reclaimed.len(), "🧹 Queue sweep");
        }
        self.handler.housekeeping().await;
        Ok(())
    }

    async fn settle(&self, item: &QueueItem) {
        self.handler.finished(item).await;
        self.send_callback(item).await;
    }

    async fn run_with_lease(&self, item: &QueueItem, worker_id: &str) -> std::result::Result<Value, QueueError> {
        let renew_every = self
            .queue
            .lease_timeout()
            .to_std()
            .unwrap_or(Duration::from_secs(30))
            / 3;
        let renew_every = renew_every.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + renew_every, renew_every);

        let job = self.handler.handle(item, worker_id);
        tokio::pin!(job);

        loop {
            tokio::select! {
                outcome = &mut job => return outcome,
                _ = ticker.tick() => {
                    if let Err(e) = self.queue.renew_lease(item.id, worker_id).await {
                        warn!(queue_item_id = %item.id, worker_id, error = %e, "Lease renewal failed");
                    }
                }
            }
        }
    }

    async fn send_callback(&self, item: &QueueItem) {
        let (Some(notifier), Some(url)) = (&self.notifier, item.callback_url.as_deref()) else {
            return;
        };
        match notifier.notify(item).await {
            Ok(()) => debug!(queue_item_id = %item.id, %url, "Callback delivered"),
            Err(e) => warn!(queue_item_id = %item.id, %url, error = %e, "Callback failed"),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String, shutdown: CancellationToken) {
        debug!(worker_id = %worker_id, "Worker started");
        while !shutdown.is_cancelled() {
            match self.process_one(&worker_id).await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.queue.wait_for_work(self.settings.idle_wait) => {}
                    }
                }
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "Worker iteration failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.idle_wait) => {}
                    }
                }
            }
        }
        debug!(worker_id = %worker_id, "Worker stopped");
    }

    async fn sweeper_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "Queue sweep failed");
                    }
                }
            }
        }
    }
}
