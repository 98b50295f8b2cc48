// Queue item domain model

//! # Queue Items
//!
//! A [`QueueItem`] is one scheduled execution. Its lifecycle is:
//!
//! ```text
//! pending ──claim──▶ processing ──complete──▶ completed
//!    ▲                  │  │
//!    └──retry / lease───┘  ├──fail (retries exhausted)──▶ failed
//!                          ├──cancel requested──▶ cancelled
//!                          └──past expires_at──▶ expired
//! ```
//!
//! The transition helpers on `QueueItem` (`mark_claimed`, `mark_failed_attempt`,
//! ...) are the single definition of these rules. Stores call them while
//! holding whatever guard makes the update atomic for their backend.
//!
//! ## Priority score
//!
//! `priority_score` folds the tier and the creation time into one number:
//! `tier_weight × 10¹³ − created_at_millis`. Sorting by score descending gives
//! every higher tier precedence over every lower tier, and oldest-first order
//! inside a tier.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Width of one priority tier in the score space (milliseconds since epoch fit below it)
const TIER_SPAN: i64 = 10_000_000_000_000;

/// Priority tier requested by the submitter
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl QueuePriority {
    pub fn weight(self) -> i64 {
        match self {
            QueuePriority::Low => 1,
            QueuePriority::Normal => 2,
            QueuePriority::High => 3,
            QueuePriority::Critical => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueuePriority::Low => "low",
            QueuePriority::Normal => "normal",
            QueuePriority::High => "high",
            QueuePriority::Critical => "critical",
        }
    }
}

impl FromStr for QueuePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(QueuePriority::Low),
            "normal" => Ok(QueuePriority::Normal),
            "high" => Ok(QueuePriority::High),
            "critical" => Ok(QueuePriority::Critical),
            other => Err(format!("unknown queue priority '{}'", other)),
        }
    }
}

impl std::fmt::Display for QueuePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the numeric ordering key for a queue item
pub fn priority_score(priority: QueuePriority, created_at: DateTime<Utc>) -> i64 {
    let age_key = created_at.timestamp_millis().clamp(0, TIER_SPAN - 1);
    priority.weight() * TIER_SPAN - age_key
}

/// Lifecycle state of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Expired,
}

impl QueueStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueueStatus::Completed
                | QueueStatus::Failed
                | QueueStatus::Cancelled
                | QueueStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Cancelled => "cancelled",
            QueueStatus::Expired => "expired",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "completed" => Ok(QueueStatus::Completed),
            "failed" => Ok(QueueStatus::Failed),
            "cancelled" => Ok(QueueStatus::Cancelled),
            "expired" => Ok(QueueStatus::Expired),
            other => Err(format!("unknown queue status '{}'", other)),
        }
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy surfaced on terminal queue items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NoRouteAvailable,
    CapabilityDisabled,
    StepFailed,
    PipelineAborted,
    QueueExpired,
    QueueRetriesExhausted,
    BatchUpstreamFailed,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Whether a queue-level retry can change the outcome
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::StepFailed
                | ErrorKind::PipelineAborted
                | ErrorKind::BatchUpstreamFailed
                | ErrorKind::Internal
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Structured error stored on a queue item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueError {
    pub kind: ErrorKind,
    pub message: String,
    /// Extra context, e.g. partial streaming output delivered before the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl QueueError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Everything a submitter provides when enqueueing work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub payload: serde_json::Value,
    pub request_type: String,
    pub user_id: String,
    pub workspace_id: String,
    #[serde(default)]
    pub priority: QueuePriority,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub callback_url: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

impl NewQueueItem {
    pub fn new(
        payload: serde_json::Value,
        request_type: impl Into<String>,
        user_id: impl Into<String>,
        workspace_id: impl Into<String>,
    ) -> Self {
        Self {
            payload,
            request_type: request_type.into(),
            user_id: user_id.into(),
            workspace_id: workspace_id.into(),
            priority: QueuePriority::Normal,
            max_retries: default_max_retries(),
            expires_at: None,
            callback_url: None,
        }
    }

    pub fn with_priority(mut self, priority: QueuePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_callback(mut self, url: impl Into<String>) -> Self {
        self.callback_url = Some(url.into());
        self
    }
}

/// One scheduled execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub request_type: String,
    pub user_id: String,
    pub workspace_id: String,
    pub priority: QueuePriority,
    pub priority_score: i64,
    pub status: QueueStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub batch_id: Option<Uuid>,
    /// Worker currently holding the claim
    pub processing_node: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub callback_url: Option<String>,
    pub cancel_requested: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<QueueError>,
    /// Insertion order; breaks ties between equal scores
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn from_new(new: NewQueueItem, now: DateTime<Utc>, sequence: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            priority_score: priority_score(new.priority, now),
            payload: new.payload,
            request_type: new.request_type,
            user_id: new.user_id,
            workspace_id: new.workspace_id,
            priority: new.priority,
            status: QueueStatus::Pending,
            retry_count: 0,
            max_retries: new.max_retries,
            batch_id: None,
            processing_node: None,
            lease_expires_at: None,
            expires_at: new.expires_at,
            callback_url: new.callback_url,
            cancel_requested: false,
            result: None,
            error: None,
            sequence,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Past `expires_at` while still pending or processing
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.expires_at.map_or(false, |at| at <= now)
    }

    /// Claimed, but the owner stopped renewing its lease
    pub fn lease_is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == QueueStatus::Processing
            && self.lease_expires_at.map_or(false, |at| at <= now)
    }

    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status == QueueStatus::Processing
            && self.processing_node.as_deref() == Some(worker_id)
    }

    /// Ordering used by claim: higher score first, then insertion order
    pub fn claim_order(&self) -> (std::cmp::Reverse<i64>, i64) {
        (std::cmp::Reverse(self.priority_score), self.sequence)
    }

    pub fn mark_claimed(&mut self, worker_id: &str, now: DateTime<Utc>, lease: Duration) {
        self.status = QueueStatus::Processing;
        self.processing_node = Some(worker_id.to_string());
        self.lease_expires_at = Some(now + lease);
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub fn renew_lease(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.lease_expires_at = Some(now + lease);
        self.updated_at = now;
    }

    /// Give a stale claim back to the queue without charging a retry
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.status = QueueStatus::Pending;
        self.processing_node = None;
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, result: serde_json::Value, now: DateTime<Utc>) {
        if self.cancel_requested {
            // The unit of work finished; the caller still asked for cancellation.
            self.result = Some(result);
            self.mark_cancelled(now);
            return;
        }
        self.status = QueueStatus::Completed;
        self.result = Some(result);
        self.error = None;
        self.finish(now);
    }

    /// Record a failed attempt. Returns true when the item went back to pending.
    pub fn mark_failed_attempt(&mut self, error: QueueError, now: DateTime<Utc>) -> bool {
        if self.cancel_requested {
            self.error = Some(error);
            self.mark_cancelled(now);
            return false;
        }

        if error.kind.is_retryable() && self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.error = Some(error);
            self.release(now);
            return true;
        }

        let terminal = if error.kind.is_retryable() {
            QueueError::new(
                ErrorKind::QueueRetriesExhausted,
                format!(
                    "gave up after {} attempts: {}",
                    self.retry_count + 1,
                    error.message
                ),
            )
            .with_details(serde_json::json!({ "last_error": error }))
        } else {
            error
        };

        self.status = QueueStatus::Failed;
        self.error = Some(terminal);
        self.finish(now);
        false
    }

    pub fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = QueueStatus::Cancelled;
        self.cancel_requested = true;
        if self.error.as_ref().map_or(true, |e| e.kind != ErrorKind::Cancelled) {
            let previous = self.error.take();
            let mut error = QueueError::new(ErrorKind::Cancelled, "cancelled by request");
            if let Some(previous) = previous {
                error = error.with_details(serde_json::json!({ "last_error": previous }));
            }
            self.error = Some(error);
        }
        self.finish(now);
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) {
        self.status = QueueStatus::Expired;
        self.error = Some(QueueError::new(
            ErrorKind::QueueExpired,
            format!("expired before completion (expires_at {:?})", self.expires_at),
        ));
        self.finish(now);
    }

    fn finish(&mut self, now: DateTime<Utc>) {
        self.processing_node = None;
        self.lease_expires_at = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }
}

/// Outcome of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The item was pending and is now cancelled
    Cancelled,
    /// The item is processing; cancellation is honored when the worker reports back
    Requested,
    /// The item had already reached a terminal state
    AlreadyTerminal,
}

/// Counts of queue items per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub expired: usize,
}

impl QueueStats {
    pub fn record(&mut self, status: QueueStatus) {
        self.add(status, 1);
    }

    /// Add `count` items in `status`, e.g. one row of a grouped count
    pub fn add(&mut self, status: QueueStatus, count: usize) {
        let field = match status {
            QueueStatus::Pending => &mut self.pending,
            QueueStatus::Processing => &mut self.processing,
            QueueStatus::Completed => &mut self.completed,
            QueueStatus::Failed => &mut self.failed,
            QueueStatus::Cancelled => &mut self.cancelled,
            QueueStatus::Expired => &mut self.expired,
        };
        *field += count;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(priority: QueuePriority, created_at: DateTime<Utc>) -> QueueItem {
        QueueItem::from_new(
            NewQueueItem::new(serde_json::json!({}), "chat", "u1", "w1").with_priority(priority),
            created_at,
            0,
        )
    }

    #[test]
    fn test_higher_tier_always_outscores_lower_tier() {
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        let new = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

        assert!(priority_score(QueuePriority::High, new) > priority_score(QueuePriority::Normal, old));
        assert!(priority_score(QueuePriority::Normal, old) > priority_score(QueuePriority::Normal, new));
    }

    #[test]
    fn test_retry_then_exhaustion() {
        let now = Utc::now();
        let mut queued = item(QueuePriority::Normal, now);
        queued.max_retries = 1;
        queued.mark_claimed("w1", now, Duration::seconds(30));

        assert!(queued.mark_failed_attempt(QueueError::new(ErrorKind::StepFailed, "boom"), now));
        assert_eq!(queued.status, QueueStatus::Pending);
        assert_eq!(queued.retry_count, 1);

        queued.mark_claimed("w1", now, Duration::seconds(30));
        assert!(!queued.mark_failed_attempt(QueueError::new(ErrorKind::StepFailed, "boom"), now));
        assert_eq!(queued.status, QueueStatus::Failed);
        assert_eq!(queued.error.as_ref().unwrap().kind, ErrorKind::QueueRetriesExhausted);
    }

    #[test]
    fn test_non_retryable_error_keeps_its_kind() {
        let now = Utc::now();
        let mut queued = item(QueuePriority::Normal, now);
        queued.mark_claimed("w1", now, Duration::seconds(30));

        assert!(!queued.mark_failed_attempt(
            QueueError::new(ErrorKind::NoRouteAvailable, "no chain"),
            now
        ));
        assert_eq!(queued.status, QueueStatus::Failed);
        assert_eq!(queued.retry_count, 0);
        assert_eq!(queued.error.as_ref().unwrap().kind, ErrorKind::NoRouteAvailable);
    }

    #[test]
    fn test_cancel_requested_wins_over_completion() {
        let now = Utc::now();
        let mut queued = item(QueuePriority::Normal, now);
        queued.mark_claimed("w1", now, Duration::seconds(30));
        queued.cancel_requested = true;

        queued.mark_completed(serde_json::json!({"ok": true}), now);
        assert_eq!(queued.status, QueueStatus::Cancelled);
        assert_eq!(queued.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
    }

    #[test]
    fn test_stats_add_grouped_counts() {
        let mut stats = QueueStats::default();
        stats.add(QueueStatus::Completed, 40_000);
        stats.add(QueueStatus::Expired, 3);
        stats.record(QueueStatus::Completed);

        assert_eq!(stats.completed, 40_001);
        assert_eq!(stats.expired, 3);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [QueueStatus::Pending, QueueStatus::Expired] {
            assert_eq!(status.as_str().parse::<QueueStatus>().unwrap(), status);
        }
        assert!("archived".parse::<QueueStatus>().is_err());
    }
}
