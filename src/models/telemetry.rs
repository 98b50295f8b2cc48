// Telemetry domain models

//! # Telemetry Records
//!
//! Two records leave the orchestrator for dashboards and admin tooling:
//!
//! - [`DebugTrace`]: one append-only row per top-level request
//! - [`CostPeriod`]: aggregated counters for a fixed-granularity period
//!   `[period_start, period_end)`, updated incrementally by [`CostDelta`]s

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use super::ErrorKind;

/// Period length for cost aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Daily,
    Monthly,
}

impl Granularity {
    /// The `[start, end)` period containing `at`
    pub fn bounds(self, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let date = at.date_naive();
        match self {
            Granularity::Daily => {
                let start = midnight(date, at);
                (start, start + Duration::days(1))
            }
            Granularity::Monthly => {
                let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date);
                let (next_year, next_month) = if date.month() == 12 {
                    (date.year() + 1, 1)
                } else {
                    (date.year(), date.month() + 1)
                };
                let next_first =
                    NaiveDate::from_ymd_opt(next_year, next_month, 1).unwrap_or(first);
                (midnight(first, at), midnight(next_first, at))
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Granularity::Daily => "daily",
            Granularity::Monthly => "monthly",
        }
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Granularity::Daily),
            "monthly" => Ok(Granularity::Monthly),
            other => Err(format!("unknown granularity '{}'", other)),
        }
    }
}

fn midnight(date: NaiveDate, fallback: DateTime<Utc>) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
        .unwrap_or(fallback)
}

/// Token and cost figures reported by capability invocations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Tokens served from reused context instead of being sent again
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub cost: f64,
    /// What the default target would have cost; set when routing picked a cheaper one
    #[serde(default)]
    pub baseline_cost: Option<f64>,
    /// Cost avoided through context reuse
    #[serde(default)]
    pub cache_savings: Option<f64>,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.cost += other.cost;
        if let Some(baseline) = other.baseline_cost {
            *self.baseline_cost.get_or_insert(0.0) += baseline;
        }
        if let Some(savings) = other.cache_savings {
            *self.cache_savings.get_or_insert(0.0) += savings;
        }
    }

    pub fn routing_savings(&self) -> f64 {
        self.baseline_cost
            .map(|baseline| (baseline - self.cost).max(0.0))
            .unwrap_or(0.0)
    }
}

/// A request's part in batching
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum BatchRole {
    #[default]
    Unbatched,
    /// Made the upstream call on behalf of `members` requests
    Leader { batch_id: Uuid, members: u32 },
    /// Reused the leader's result
    Follower {
        batch_id: Uuid,
        avoided_cost: f64,
        avoided_tokens: u64,
    },
}

/// One structured record per top-level request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugTrace {
    pub id: Uuid,
    pub request_id: Uuid,
    pub intent: Option<String>,
    /// Chain ids tried in order, primary first
    pub tiers_attempted: Vec<String>,
    pub selected_chain: Option<String>,
    pub selected_target: Option<String>,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub batch_role: BatchRole,
    pub created_at: DateTime<Utc>,
}

impl DebugTrace {
    /// An empty failed trace for `request_id`; routing fills it in as it goes
    pub fn new(request_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            intent: None,
            tiers_attempted: Vec::new(),
            selected_chain: None,
            selected_target: None,
            usage: TokenUsage::default(),
            latency_ms: 0,
            success: false,
            error_kind: None,
            error_message: None,
            batch_role: BatchRole::Unbatched,
            created_at: Utc::now(),
        }
    }
}

/// Incremental change applied to a cost period
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CostDelta {
    pub succeeded: bool,
    pub usage: TokenUsage,
    pub batching_savings: f64,
    pub routing_savings: f64,
    pub context_reuse_savings: f64,
    pub api_calls_saved: u64,
    pub tokens_saved: u64,
}

/// Aggregated counters for one period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostPeriod {
    pub id: Uuid,
    pub granularity: Granularity,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub total_cost: f64,
    pub batching_savings: f64,
    pub routing_savings: f64,
    pub context_reuse_savings: f64,
    pub api_calls_saved: u64,
    pub tokens_saved: u64,
    pub updated_at: DateTime<Utc>,
}

impl CostPeriod {
    pub fn starting(granularity: Granularity, at: DateTime<Utc>) -> Self {
        let (period_start, period_end) = granularity.bounds(at);
        Self {
            id: Uuid::new_v4(),
            granularity,
            period_start,
            period_end,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            total_cost: 0.0,
            batching_savings: 0.0,
            routing_savings: 0.0,
            context_reuse_savings: 0.0,
            api_calls_saved: 0,
            tokens_saved: 0,
            updated_at: at,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.period_start <= at && at < self.period_end
    }

    pub fn apply(&mut self, delta: &CostDelta, at: DateTime<Utc>) {
        self.total_requests += 1;
        if delta.succeeded {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.input_tokens += delta.usage.input_tokens;
        self.output_tokens += delta.usage.output_tokens;
        self.cached_tokens += delta.usage.cached_tokens;
        self.total_cost += delta.usage.cost;
        self.batching_savings += delta.batching_savings;
        self.routing_savings += delta.routing_savings;
        self.context_reuse_savings += delta.context_reuse_savings;
        self.api_calls_saved += delta.api_calls_saved;
        self.tokens_saved += delta.tokens_saved;
        self.updated_at = at;
    }

    pub fn total_savings(&self) -> f64 {
        self.batching_savings + self.routing_savings + self.context_reuse_savings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daily_bounds() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 17, 45, 0).unwrap();
        let (start, end) = Granularity::Daily.bounds(at);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_monthly_bounds_roll_over_the_year() {
        let at = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let (start, end) = Granularity::Monthly.bounds(at);
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_routing_savings_never_negative() {
        let usage = TokenUsage {
            cost: 0.5,
            baseline_cost: Some(0.2),
            ..Default::default()
        };
        assert_eq!(usage.routing_savings(), 0.0);
    }
}
