use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use super::QueueError;

/// Lifecycle of a request batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Accepting members until the window closes or the size cap is hit
    Open,
    /// Sealed; the leader's upstream call is in flight
    Processing,
    Processed,
    Failed,
}

impl BatchStatus {
    pub fn is_resolved(self) -> bool {
        matches!(self, BatchStatus::Processed | BatchStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BatchStatus::Open => "open",
            BatchStatus::Processing => "processing",
            BatchStatus::Processed => "processed",
            BatchStatus::Failed => "failed",
        }
    }
}

/// What one member of a batch receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MemberResponse {
    Success { result: serde_json::Value },
    Failure { error: QueueError },
}

/// A group of semantically-equivalent requests served by one upstream call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBatch {
    pub id: Uuid,
    pub similarity_hash: String,
    /// Members in admission order; the first one is the leader
    pub request_ids: Vec<Uuid>,
    pub leader_request_id: Uuid,
    /// Member payloads in admission order
    pub combined_payload: Vec<serde_json::Value>,
    pub combined_result: Option<serde_json::Value>,
    pub response_map: HashMap<Uuid, MemberResponse>,
    pub status: BatchStatus,
    pub window_expires_at: DateTime<Utc>,
    pub max_size: usize,
    pub api_calls_saved: u32,
    pub tokens_saved: u64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl RequestBatch {
    pub fn open(
        similarity_hash: impl Into<String>,
        leader_request_id: Uuid,
        leader_payload: serde_json::Value,
        window_expires_at: DateTime<Utc>,
        max_size: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            similarity_hash: similarity_hash.into(),
            request_ids: vec![leader_request_id],
            leader_request_id,
            combined_payload: vec![leader_payload],
            combined_result: None,
            response_map: HashMap::new(),
            status: BatchStatus::Open,
            window_expires_at,
            max_size,
            api_calls_saved: 0,
            tokens_saved: 0,
            created_at: now,
            processed_at: None,
        }
    }

    /// Whether a new member may still join
    pub fn accepts_members(&self, now: DateTime<Utc>) -> bool {
        self.status == BatchStatus::Open
            && self.processed_at.is_none()
            && now < self.window_expires_at
            && self.request_ids.len() < self.max_size
    }

    pub fn is_full(&self) -> bool {
        self.request_ids.len() >= self.max_size
    }

    pub fn member_count(&self) -> usize {
        self.request_ids.len()
    }

    pub fn response_for(&self, request_id: &Uuid) -> Option<&MemberResponse> {
        self.response_map.get(request_id)
    }

    /// Every member has an entry in the response map
    pub fn has_no_orphans(&self) -> bool {
        self.request_ids
            .iter()
            .all(|id| self.response_map.contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_batch_closes_after_window() {
        let now = Utc::now();
        let batch = RequestBatch::open(
            "abc",
            Uuid::new_v4(),
            serde_json::json!({}),
            now + Duration::milliseconds(2000),
            8,
            now,
        );

        assert!(batch.accepts_members(now + Duration::milliseconds(200)));
        assert!(!batch.accepts_members(now + Duration::milliseconds(2000)));
    }

    #[test]
    fn test_orphan_detection() {
        let now = Utc::now();
        let leader = Uuid::new_v4();
        let mut batch =
            RequestBatch::open("abc", leader, serde_json::json!({}), now, 8, now);
        assert!(!batch.has_no_orphans());

        batch.response_map.insert(
            leader,
            MemberResponse::Success { result: serde_json::json!("done") },
        );
        assert!(batch.has_no_orphans());
    }
}
