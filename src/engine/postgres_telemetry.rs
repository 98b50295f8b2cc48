// PostgreSQL-backed telemetry store

//! # PostgreSQL Telemetry Store
//!
//! Durable [`TelemetryStore`]. Traces are append-only rows carrying the full
//! [`DebugTrace`] as JSONB next to the columns dashboards filter on. Cost
//! periods are one row per `(granularity, period_start)`; a delta is applied
//! with a single `INSERT ... ON CONFLICT DO UPDATE` that adds to the stored
//! counters, so concurrent writers from several processes never lose an update.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::telemetry::TelemetryStore;
use crate::models::{CostDelta, CostPeriod, DebugTrace, Granularity};
use crate::{OrchestratorError, Result};

const SCHEMA: [&str; 3] = [
    r#"
    CREATE TABLE IF NOT EXISTS orchestrator_traces (
        id          UUID PRIMARY KEY,
        request_id  UUID NOT NULL,
        success     BOOLEAN NOT NULL,
        error_kind  TEXT,
        body        JSONB NOT NULL,
        sequence    BIGSERIAL,
        created_at  TIMESTAMPTZ NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS orchestrator_traces_recent_idx
        ON orchestrator_traces (created_at DESC, sequence DESC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orchestrator_cost_periods (
        id                    UUID NOT NULL,
        granularity           TEXT NOT NULL,
        period_start          TIMESTAMPTZ NOT NULL,
        period_end            TIMESTAMPTZ NOT NULL,
        total_requests        BIGINT NOT NULL,
        successful_requests   BIGINT NOT NULL,
        failed_requests       BIGINT NOT NULL,
        input_tokens          BIGINT NOT NULL,
        output_tokens         BIGINT NOT NULL,
        cached_tokens         BIGINT NOT NULL,
        total_cost            DOUBLE PRECISION NOT NULL,
        batching_savings      DOUBLE PRECISION NOT NULL,
        routing_savings       DOUBLE PRECISION NOT NULL,
        context_reuse_savings DOUBLE PRECISION NOT NULL,
        api_calls_saved       BIGINT NOT NULL,
        tokens_saved          BIGINT NOT NULL,
        updated_at            TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (granularity, period_start)
    )
    "#,
];

pub struct PostgresTelemetryStore {
    pool: PgPool,
}

impl PostgresTelemetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the trace and period tables if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("🗄️  Telemetry schema ready");
        Ok(())
    }
}

fn counter(row: &PgRow, column: &str) -> Result<u64> {
    Ok(row.try_get::<i64, _>(column)?.max(0) as u64)
}

fn period_from_row(row: &PgRow) -> Result<CostPeriod> {
    let granularity: String = row.try_get("granularity")?;
    Ok(CostPeriod {
        id: row.try_get("id")?,
        granularity: granularity.parse().map_err(OrchestratorError::Internal)?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        total_requests: counter(row, "total_requests")?,
        successful_requests: counter(row, "successful_requests")?,
        failed_requests: counter(row, "failed_requests")?,
        input_tokens: counter(row, "input_tokens")?,
        output_tokens: counter(row, "output_tokens")?,
        cached_tokens: counter(row, "cached_tokens")?,
        total_cost: row.try_get("total_cost")?,
        batching_savings: row.try_get("batching_savings")?,
        routing_savings: row.try_get("routing_savings")?,
        context_reuse_savings: row.try_get("context_reuse_savings")?,
        api_calls_saved: counter(row, "api_calls_saved")?,
        tokens_saved: counter(row, "tokens_saved")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl TelemetryStore for PostgresTelemetryStore {
    async fn append_trace(&self, trace: DebugTrace) -> Result<()> {
        let body = serde_json::to_value(&trace)?;
        sqlx::query(
            r#"
            INSERT INTO orchestrator_traces (id, request_id, success, error_kind, body, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(trace.id)
        .bind(trace.request_id)
        .bind(trace.success)
        .bind(trace.error_kind.map(|kind| kind.to_string()))
        .bind(body)
        .bind(trace.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn apply_delta(&self, granularity: Granularity, at: DateTime<Utc>, delta: &CostDelta) -> Result<CostPeriod> {
        let (period_start, period_end) = granularity.bounds(at);
        let row = sqlx::query(
            r#"
            INSERT INTO orchestrator_cost_periods AS p
                (id, granularity, period_start, period_end, total_requests, successful_requests,
                 failed_requests, input_tokens, output_tokens, cached_tokens, total_cost,
                 batching_savings, routing_savings, context_reuse_savings, api_calls_saved,
                 tokens_saved, updated_at)
            VALUES ($1, $2, $3, $4, 1, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (granularity, period_start) DO UPDATE
               SET total_requests        = p.total_requests + 1,
                   successful_requests   = p.successful_requests + EXCLUDED.successful_requests,
                   failed_requests       = p.failed_requests + EXCLUDED.failed_requests,
                   input_tokens          = p.input_tokens + EXCLUDED.input_tokens,
                   output_tokens         = p.output_tokens + EXCLUDED.output_tokens,
                   cached_tokens         = p.cached_tokens + EXCLUDED.cached_tokens,
                   total_cost            = p.total_cost + EXCLUDED.total_cost,
                   batching_savings      = p.batching_savings + EXCLUDED.batching_savings,
                   routing_savings       = p.routing_savings + EXCLUDED.routing_savings,
                   context_reuse_savings = p.context_reuse_savings + EXCLUDED.context_reuse_savings,
                   api_calls_saved       = p.api_calls_saved + EXCLUDED.api_calls_saved,
                   tokens_saved          = p.tokens_saved + EXCLUDED.tokens_saved,
                   updated_at            = EXCLUDED.updated_at
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(granularity.as_str())
        .bind(period_start)
        .bind(period_end)
        .bind(i64::from(delta.succeeded))
        .bind(i64::from(!delta.succeeded))
        .bind(delta.usage.input_tokens as i64)
        .bind(delta.usage.output_tokens as i64)
        .bind(delta.usage.cached_tokens as i64)
        .bind(delta.usage.cost)
        .bind(delta.batching_savings)
        .bind(delta.routing_savings)
        .bind(delta.context_reuse_savings)
        .bind(delta.api_calls_saved as i64)
        .bind(delta.tokens_saved as i64)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;
        period_from_row(&row)
    }

    async fn period(&self, granularity: Granularity, at: DateTime<Utc>) -> Result<Option<CostPeriod>> {
        let (period_start, _) = granularity.bounds(at);
        let row = sqlx::query(
            "SELECT * FROM orchestrator_cost_periods WHERE granularity = $1 AND period_start = $2",
        )
        .bind(granularity.as_str())
        .bind(period_start)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(period_from_row).transpose()
    }

    async fn recent_traces(&self, limit: usize) -> Result<Vec<DebugTrace>> {
        let rows = sqlx::query(
            "SELECT body FROM orchestrator_traces ORDER BY created_at DESC, sequence DESC LIMIT $1",
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let body: serde_json::Value = row.try_get("body")?;
                Ok(serde_json::from_value(body)?)
            })
            .collect()
    }
}
