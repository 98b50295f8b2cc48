// Cost and telemetry recording

//! # Cost & Telemetry Recorder
//!
//! Every top-level request produces exactly one [`DebugTrace`]. Recording a
//! trace also folds its figures into the current [`CostPeriod`] of every
//! configured granularity. Periods are created on their first write.
//!
//! [`InMemoryTelemetryStore`] keeps the newest `retention` traces; periods are
//! kept for good. `PostgresTelemetryStore` keeps everything.
//!
//! Savings are attributed to one of three buckets:
//! - **batching**: cost a follower avoided by reusing its leader's call
//! - **routing**: baseline cost minus actual cost reported by the invoker
//! - **context reuse**: cache savings reported by the invoker

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::{BatchRole, CostDelta, CostPeriod, DebugTrace, Granularity};
use crate::Result;

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn append_trace(&self, trace: DebugTrace) -> Result<()>;

    /// Apply `delta` to the period containing `at`, creating it if needed
    async fn apply_delta(&self, granularity: Granularity, at: DateTime<Utc>, delta: &CostDelta) -> Result<CostPeriod>;

    async fn period(&self, granularity: Granularity, at: DateTime<Utc>) -> Result<Option<CostPeriod>>;

    /// Newest first
    async fn recent_traces(&self, limit: usize) -> Result<Vec<DebugTrace>>;
}

#[derive(Default)]
struct TelemetryState {
    /// Oldest first
    traces: VecDeque<DebugTrace>,
    periods: HashMap<(Granularity, DateTime<Utc>), CostPeriod>,
}

const DEFAULT_RETENTION: usize = 10_000;

pub struct InMemoryTelemetryStore {
    state: Mutex<TelemetryState>,
    retention: usize,
}

impl Default for InMemoryTelemetryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTelemetryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TelemetryState::default()),
            retention: DEFAULT_RETENTION,
        }
    }

    /// Keep at most `retention` traces
    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }
}

#[async_trait]
impl TelemetryStore for InMemoryTelemetryStore {
    async fn append_trace(&self, trace: DebugTrace) -> Result<()> {
        let mut state = self.state.lock().await;
        state.traces.push_back(trace);
        while state.traces.len() > self.retention {
            state.traces.pop_front();
        }
        Ok(())
    }

    async fn apply_delta(&self, granularity: Granularity, at: DateTime<Utc>, delta: &CostDelta) -> Result<CostPeriod> {
        let (start, _) = granularity.bounds(at);
        let mut state = self.state.lock().await;
        let period = state
            .periods
            .entry((granularity, start))
            .or_insert_with(|| CostPeriod::starting(granularity, at));
        period.apply(delta, at);
        Ok(period.clone())
    }

    async fn period(&self, granularity: Granularity, at: DateTime<Utc>) -> Result<Option<CostPeriod>> {
        let (start, _) = granularity.bounds(at);
        Ok(self.state.lock().await.periods.get(&(granularity, start)).cloned())
    }

    async fn recent_traces(&self, limit: usize) -> Result<Vec<DebugTrace>> {
        let state = self.state.lock().await;
        Ok(state.traces.iter().rev().take(limit).cloned().collect())
    }
}

pub struct CostRecorder {
    store: Arc<dyn TelemetryStore>,
    granularities: Vec<Granularity>,
}

impl CostRecorder {
    pub fn new(store: Arc<dyn TelemetryStore>, granularities: Vec<Granularity>) -> Self {
        Self { store, granularities }
    }

    /// The period counters a trace contributes
    pub fn delta_for(trace: &DebugTrace) -> CostDelta {
        let mut delta = CostDelta {
            succeeded: trace.success,
            usage: trace.usage.clone(),
            routing_savings: trace.usage.routing_savings(),
            context_reuse_savings: trace.usage.cache_savings.unwrap_or(0.0),
            ..Default::default()
        };
        // A follower of a failed batch saved nothing.
        if let (
            true,
            BatchRole::Follower {
                avoided_cost,
                avoided_tokens,
                ..
            },
        ) = (trace.success, &trace.batch_role)
        {
            delta.batching_savings = *avoided_cost;
            delta.api_calls_saved = 1;
            delta.tokens_saved = *avoided_tokens;
        }
        delta
    }

    /// Append the trace, then update every configured period
    pub async fn record_outcome(&self, trace: DebugTrace) -> Result<()> {
        let delta = Self::delta_for(&trace);
        let at = trace.created_at;
        debug!(
            request_id = %trace.request_id,
            success = trace.success,
            cost = trace.usage.cost,
            "Recording request outcome"
        );

        self.store.append_trace(trace).await?;
        for granularity in &self.granularities {
            self.store.apply_delta(*granularity, at, &delta).await?;
        }
        Ok(())
    }

    /// The period containing `at`; an empty one if nothing was recorded yet
    pub async fn period(&self, granularity: Granularity, at: DateTime<Utc>) -> Result<CostPeriod> {
        Ok(self
            .store
            .period(granularity, at)
            .await?
            .unwrap_or_else(|| CostPeriod::starting(granularity, at)))
    }

    pub async fn traces(&self, limit: usize) -> Result<Vec<DebugTrace>> {
        self.store.recent_traces(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorKind, TokenUsage};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn trace(at: DateTime<Utc>, success: bool, usage: TokenUsage, role: BatchRole) -> DebugTrace {
        DebugTrace {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            intent: Some("list_items".to_string()),
            tiers_attempted: vec!["list".to_string()],
            selected_chain: Some("list".to_string()),
            selected_target: None,
            usage,
            latency_ms: 12,
            success,
            error_kind: (!success).then_some(ErrorKind::StepFailed),
            error_message: None,
            batch_role: role,
            created_at: at,
        }
    }

    fn recorder() -> CostRecorder {
        CostRecorder::new(
            Arc::new(InMemoryTelemetryStore::new()),
            vec![Granularity::Daily, Granularity::Monthly],
        )
    }

    #[tokio::test]
    async fn test_savings_attribution() {
        let recorder = recorder();
        let at = Utc.with_ymd_and_hms(2024, 5, 14, 10, 0, 0).unwrap();
        let batch_id = Uuid::new_v4();

        let leader_usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cached_tokens: 40,
            cost: 0.30,
            baseline_cost: Some(0.50),
            cache_savings: Some(0.05),
        };
        recorder
            .record_outcome(trace(at, true, leader_usage, BatchRole::Leader { batch_id, members: 2 }))
            .await
            .unwrap();
        recorder
            .record_outcome(trace(
                at,
                true,
                TokenUsage::default(),
                BatchRole::Follower {
                    batch_id,
                    avoided_cost: 0.30,
                    avoided_tokens: 150,
                },
            ))
            .await
            .unwrap();

        let daily = recorder.period(Granularity::Daily, at).await.unwrap();
        assert_eq!(daily.total_requests, 2);
        assert_eq!(daily.input_tokens, 100);
        assert_eq!(daily.api_calls_saved, 1);
        assert_eq!(daily.tokens_saved, 150);
        assert!((daily.batching_savings - 0.30).abs() < 1e-9);
        assert!((daily.routing_savings - 0.20).abs() < 1e-9);
        assert!((daily.context_reuse_savings - 0.05).abs() < 1e-9);

        let monthly = recorder.period(Granularity::Monthly, at).await.unwrap();
        assert_eq!(monthly.total_requests, 2);
    }

    #[tokio::test]
    async fn test_periods_split_by_day() {
        let recorder = recorder();
        let monday = Utc.with_ymd_and_hms(2024, 5, 13, 23, 59, 0).unwrap();
        let tuesday = Utc.with_ymd_and_hms(2024, 5, 14, 0, 1, 0).unwrap();

        recorder
            .record_outcome(trace(monday, true, TokenUsage::default(), BatchRole::Unbatched))
            .await
            .unwrap();
        recorder
            .record_outcome(trace(tuesday, false, TokenUsage::default(), BatchRole::Unbatched))
            .await
            .unwrap();

        let tuesday_period = recorder.period(Granularity::Daily, tuesday).await.unwrap();
        assert_eq!(tuesday_period.total_requests, 1);
        assert_eq!(tuesday_period.failed_requests, 1);
        assert_eq!(recorder.period(Granularity::Monthly, tuesday).await.unwrap().total_requests, 2);
    }

    #[tokio::test]
    async fn test_traces_are_newest_first() {
        let recorder = recorder();
        let at = Utc::now();
        let first = trace(at, true, TokenUsage::default(), BatchRole::Unbatched);
        let second = trace(at, true, TokenUsage::default(), BatchRole::Unbatched);
        let (first_id, second_id) = (first.id, second.id);

        recorder.record_outcome(first).await.unwrap();
        recorder.record_outcome(second).await.unwrap();

        let ids: Vec<Uuid> = recorder.traces(10).await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![second_id, first_id]);
        assert_eq!(recorder.traces(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_trace_retention_keeps_newest() {
        let recorder = CostRecorder::new(
            Arc::new(InMemoryTelemetryStore::new().with_retention(2)),
            vec![Granularity::Daily],
        );
        let at = Utc::now();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let trace = trace(at, true, TokenUsage::default(), BatchRole::Unbatched);
            ids.push(trace.id);
            recorder.record_outcome(trace).await.unwrap();
        }

        let kept: Vec<Uuid> = recorder.traces(10).await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(kept, vec![ids[2], ids[1]]);
        assert_eq!(recorder.period(Granularity::Daily, at).await.unwrap().total_requests, 3);
    }

    #[tokio::test]
    async fn test_empty_period_is_zeroed() {
        let period = recorder().period(Granularity::Daily, Utc::now()).await.unwrap();
        assert_eq!(period.total_requests, 0);
        assert_eq!(period.total_savings(), 0.0);
    }
}
