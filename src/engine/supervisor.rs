// Supervisor for fire-and-forget pipeline steps

//! # Detached Task Supervisor
//!
//! Steps with `wait_for_result = false` are not awaited by the pipeline. They
//! are handed to this supervisor, which runs them on their own tokio task and
//! keeps them observable (status by id) and cancelable (individually or all at
//! shutdown). Completion is reported on the event bus as
//! [`OrchestratorEvent::DetachedStepFinished`]. Finished tasks stay visible
//! until [`DetachedTaskSupervisor::prune_finished`] drops them.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::{EventBus, OrchestratorEvent};
use super::invoker::InvocationOutput;
use crate::models::CapabilityKey;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DetachedStatus {
    Running,
    Succeeded,
    Failed { error: String },
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedTaskInfo {
    pub id: Uuid,
    pub capability: CapabilityKey,
    pub request_id: Option<Uuid>,
    pub status: DetachedStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct DetachedTaskSupervisor {
    tasks: Arc<DashMap<Uuid, DetachedTaskInfo>>,
    tokens: Arc<DashMap<Uuid, CancellationToken>>,
    shutdown: CancellationToken,
    events: EventBus,
}

impl DetachedTaskSupervisor {
    pub fn new(events: EventBus) -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            tokens: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
            events,
        }
    }

    /// Run `work` on its own task; returns the task id immediately
    pub fn spawn<F>(&self, capability: CapabilityKey, request_id: Option<Uuid>, work: F) -> Uuid
    where
        F: Future<Output = Result<InvocationOutput>> + Send + 'static,
    {
        let id = Uuid::new_v4();
        let token = self.shutdown.child_token();

        self.tasks.insert(
            id,
            DetachedTaskInfo {
                id,
                capability: capability.clone(),
                request_id,
                status: DetachedStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
            },
        );
        self.tokens.insert(id, token.clone());

        let tasks = self.tasks.clone();
        let tokens = self.tokens.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let status = tokio::select! {
                _ = token.cancelled() => DetachedStatus::Cancelled,
                outcome = work => match outcome {
                    Ok(_) => DetachedStatus::Succeeded,
                    Err(e) => {
                        warn!(task_id = %id, capability = %capability, error = %e, "Detached step failed");
                        DetachedStatus::Failed { error: e.to_string() }
                    }
                },
            };

            tokens.remove(&id);
            if let Some(mut info) = tasks.get_mut(&id) {
                info.status = status.clone();
                info.finished_at = Some(Utc::now());
            }
            debug!(task_id = %id, capability = %capability, ?status, "Detached step finished");

            let (success, error) = match status {
                DetachedStatus::Succeeded => (true, None),
                DetachedStatus::Failed { error } => (false, Some(error)),
                DetachedStatus::Cancelled => (false, Some("cancelled".to_string())),
                DetachedStatus::Running => (false, None),
            };
            events.publish(OrchestratorEvent::DetachedStepFinished {
                task_id: id,
                capability,
                request_id,
                success,
                error,
            });
        });

        id
    }

    pub fn status(&self, id: &Uuid) -> Option<DetachedTaskInfo> {
        self.tasks.get(id).map(|info| info.clone())
    }

    /// Returns false when the task is unknown or already finished
    pub fn cancel(&self, id: &Uuid) -> bool {
        match self.tokens.get(id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn running(&self) -> usize {
        self.tokens.len()
    }

    /// Cancel every running task
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Give running tasks up to `grace` to finish, then cancel the rest
    pub async fn shutdown_gracefully(&self, grace: Duration) {
        let drained = tokio::time::timeout(grace, async {
            while self.running() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(running = self.running(), "Cancelling detached steps still running at shutdown");
        }
        self.shutdown();
        info!("🛑 Detached step supervisor stopped");
    }

    /// Drop bookkeeping for tasks that finished more than `retention` ago
    pub fn prune_finished(&self, retention: chrono::Duration) {
        let cutoff = Utc::now() - retention;
        self.tasks.retain(|_, info| match info.finished_at {
            Some(finished_at) => finished_at > cutoff,
            None => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn wait_for_finish(
        receiver: &mut tokio::sync::broadcast::Receiver<OrchestratorEvent>,
    ) -> OrchestratorEvent {
        tokio::time::timeout(Duration::from_secs(5), receiver.recv())
            .await
            .expect("detached task did not finish")
            .unwrap()
    }

    #[tokio::test]
    async fn test_completion_is_reported() {
        let events = EventBus::new(16);
        let mut receiver = events.subscribe();
        let supervisor = DetachedTaskSupervisor::new(events);

        let id = supervisor.spawn(CapabilityKey::from("notify"), None, async {
            Ok(InvocationOutput::new(serde_json::json!("sent")))
        });

        match wait_for_finish(&mut receiver).await {
            OrchestratorEvent::DetachedStepFinished { task_id, success, .. } => {
                assert_eq!(task_id, id);
                assert!(success);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(supervisor.status(&id).unwrap().status, DetachedStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_running_task() {
        let events = EventBus::new(16);
        let mut receiver = events.subscribe();
        let supervisor = DetachedTaskSupervisor::new(events);

        let id = supervisor.spawn(CapabilityKey::from("index"), None, async {
            futures::future::pending::<Result<InvocationOutput>>().await
        });
        assert_eq!(supervisor.running(), 1);
        assert!(supervisor.cancel(&id));

        wait_for_finish(&mut receiver).await;
        assert_eq!(supervisor.status(&id).unwrap().status, DetachedStatus::Cancelled);
        assert_eq!(supervisor.running(), 0);
        assert!(!supervisor.cancel(&id));
    }

    #[tokio::test]
    async fn test_prune_keeps_running_and_recent_tasks() {
        let events = EventBus::new(16);
        let mut receiver = events.subscribe();
        let supervisor = DetachedTaskSupervisor::new(events);

        let done = supervisor.spawn(CapabilityKey::from("notify"), None, async {
            Ok(InvocationOutput::new(serde_json::json!("sent")))
        });
        wait_for_finish(&mut receiver).await;
        let running = supervisor.spawn(CapabilityKey::from("index"), None, async {
            futures::future::pending::<Result<InvocationOutput>>().await
        });

        supervisor.prune_finished(chrono::Duration::minutes(10));
        assert!(supervisor.status(&done).is_some());

        supervisor.prune_finished(chrono::Duration::zero());
        assert!(supervisor.status(&done).is_none());
        assert_eq!(supervisor.status(&running).unwrap().status, DetachedStatus::Running);
        supervisor.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn test_graceful_shutdown_cancels_stragglers() {
        let events = EventBus::new(16);
        let mut receiver = events.subscribe();
        let supervisor = DetachedTaskSupervisor::new(events);

        let id = supervisor.spawn(CapabilityKey::from("index"), None, async {
            futures::future::pending::<Result<InvocationOutput>>().await
        });
        supervisor.shutdown_gracefully(Duration::from_secs(1)).await;

        wait_for_finish(&mut receiver).await;
        assert_eq!(supervisor.status(&id).unwrap().status, DetachedStatus::Cancelled);
        assert_eq!(supervisor.running(), 0);
    }
}
