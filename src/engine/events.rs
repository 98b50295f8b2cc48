// Event bus for orchestrator notifications

//! # Event System
//!
//! Best-effort broadcast of things other components may want to react to:
//! - capability events (`events_emitted`) after a step succeeds
//! - detached (fire-and-forget) step completion
//! - queue items reaching a terminal state
//! - batches resolving
//! - registry reloads
//!
//! Publishing never fails the caller. With no subscribers, events are dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::models::{BatchStatus, CapabilityKey, QueueStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// A name from a capability's `events_emitted`
    Capability {
        name: String,
        capability: CapabilityKey,
        request_id: Option<Uuid>,
        output: serde_json::Value,
    },
    DetachedStepFinished {
        task_id: Uuid,
        capability: CapabilityKey,
        request_id: Option<Uuid>,
        success: bool,
        error: Option<String>,
    },
    QueueItemFinished {
        id: Uuid,
        status: QueueStatus,
    },
    BatchResolved {
        batch_id: Uuid,
        status: BatchStatus,
        members: usize,
    },
    RegistryReloaded {
        version: u64,
    },
}

/// Broadcast bus shared by every component
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to all current subscribers; returns how many received it
    pub fn publish(&self, event: OrchestratorEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                debug!(?event, "Event dropped, no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1_024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(OrchestratorEvent::RegistryReloaded { version: 2 }), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();

        bus.publish(OrchestratorEvent::QueueItemFinished {
            id: Uuid::nil(),
            status: QueueStatus::Completed,
        });

        match receiver.recv().await.unwrap() {
            OrchestratorEvent::QueueItemFinished { status, .. } => {
                assert_eq!(status, QueueStatus::Completed)
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
