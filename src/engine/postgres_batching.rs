// PostgreSQL-backed batch store

//! # PostgreSQL Batch Store
//!
//! Durable [`BatchStore`] so equivalent requests handled by different
//! orchestrator processes still share one upstream call. Each batch is one row
//! holding the full [`RequestBatch`] as JSONB; a second table points each
//! similarity hash at its open batch.
//!
//! - **admit** takes a transaction-scoped advisory lock on the hash, so two
//!   processes can never both open a batch for it, then joins or opens.
//! - **seal** and **resolve** lock the batch row (`SELECT ... FOR UPDATE`),
//!   apply the same rules as the in-memory store and drop the hash pointer.
//!
//! Followers in another process see the resolution through the engine's
//! periodic poll.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use super::batching::{join, missing, Admission, BatchResolution, BatchStore};
use crate::models::{BatchStatus, RequestBatch};
use crate::Result;

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS orchestrator_batches (
        id                UUID PRIMARY KEY,
        similarity_hash   TEXT NOT NULL,
        status            TEXT NOT NULL,
        window_expires_at TIMESTAMPTZ NOT NULL,
        body              JSONB NOT NULL,
        created_at        TIMESTAMPTZ NOT NULL,
        processed_at      TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS orchestrator_open_batches (
        similarity_hash TEXT PRIMARY KEY,
        batch_id        UUID NOT NULL
    )
    "#,
];

pub struct PostgresBatchStore {
    pool: PgPool,
}

impl PostgresBatchStore {
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

    /// Create the batch tables if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("🗄️  Batch schema ready");
        Ok(())
    }

    async fn locked(tx: &mut Transaction<'_, Postgres>, batch_id: Uuid) -> Result<RequestBatch> {
        let row = sqlx::query("SELECT body FROM orchestrator_batches WHERE id = $1 FOR UPDATE")
            .bind(batch_id)
            .fetch_optional(&mut **tx)
            .await?;
        match row {
            Some(row) => batch_from_body(row.try_get("body")?),
            None => Err(missing(batch_id)),
        }
    }

    async fn insert(tx: &mut Transaction<'_, Postgres>, batch: &RequestBatch) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO orchestrator_batches
                (id, similarity_hash, status, window_expires_at, body, created_at, processed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(batch.id)
        .bind(&batch.similarity_hash)
        .bind(batch.status.as_str())
        .bind(batch.window_expires_at)
        .bind(serde_json::to_value(batch)?)
        .bind(batch.created_at)
        .bind(batch.processed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn write_back(tx: &mut Transaction<'_, Postgres>, batch: &RequestBatch) -> Result<()> {
        sqlx::query("UPDATE orchestrator_batches SET status = $2, body = $3, processed_at = $4 WHERE id = $1")
            .bind(batch.id)
            .bind(batch.status.as_str())
            .bind(serde_json::to_value(batch)?)
            .bind(batch.processed_at)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn close_pointer(tx: &mut Transaction<'_, Postgres>, batch: &RequestBatch) -> Result<()> {
        sqlx::query("DELETE FROM orchestrator_open_batches WHERE similarity_hash = $1 AND batch_id = $2")
            .bind(&batch.similarity_hash)
            .bind(batch.id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

fn batch_from_body(body: Value) -> Result<RequestBatch> {
    Ok(serde_json::from_value(body)?)
}

#[async_trait]
impl BatchStore for PostgresBatchStore {
    async fn admit(
        &self,
        hash: &str,
        request_id: Uuid,
        payload: Value,
        now: DateTime<Utc>,
        window: chrono::Duration,
        max_size: usize,
    ) -> Result<Admission> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(hash)
            .execute(&mut *tx)
            .await?;

        let open = sqlx::query(
            r#"
            SELECT b.body FROM orchestrator_open_batches o
              JOIN orchestrator_batches b ON b.id = o.batch_id
             WHERE o.similarity_hash = $1
               FOR UPDATE OF b
            "#,
        )
        .bind(hash)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = open {
            let mut batch = batch_from_body(row.try_get("body")?)?;
            if batch.accepts_members(now) {
                join(&mut batch, request_id, payload);
                Self::write_back(&mut tx, &batch).await?;
                tx.commit().await?;
                return Ok(Admission {
                    batch,
                    is_leader: false,
                });
            }
        }

        let batch = RequestBatch::open(hash, request_id, payload, now + window, max_size.max(1), now);
        Self::insert(&mut tx, &batch).await?;
        sqlx::query(
            r#"
            INSERT INTO orchestrator_open_batches (similarity_hash, batch_id) VALUES ($1, $2)
            ON CONFLICT (similarity_hash) DO UPDATE SET batch_id = EXCLUDED.batch_id
            "#,
        )
        .bind(hash)
        .bind(batch.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(Admission {
            batch,
            is_leader: true,
        })
    }

    async fn seal(&self, batch_id: Uuid) -> Result<RequestBatch> {
        let mut tx = self.pool.begin().await?;
        let mut batch = Self::locked(&mut tx, batch_id).await?;
        if batch.status == BatchStatus::Open {
            batch.status = BatchStatus::Processing;
            Self::write_back(&mut tx, &batch).await?;
        }
        Self::close_pointer(&mut tx, &batch).await?;
        tx.commit().await?;
        Ok(batch)
    }

    async fn resolve(
        &self,
        batch_id: Uuid,
        resolution: BatchResolution,
        now: DateTime<Utc>,
    ) -> Result<RequestBatch> {
        let mut tx = self.pool.begin().await?;
        let mut batch = Self::locked(&mut tx, batch_id).await?;
        if batch.status.is_resolved() {
            return Ok(batch);
        }

        resolution.apply(&mut batch, now);
        Self::write_back(&mut tx, &batch).await?;
        Self::close_pointer(&mut tx, &batch).await?;
        tx.commit().await?;
        Ok(batch)
    }

    async fn get(&self, batch_id: Uuid) -> Result<Option<RequestBatch>> {
        let row = sqlx::query("SELECT body FROM orchestrator_batches WHERE id = $1")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| batch_from_body(row.try_get("body")?)).transpose()
    }
}
