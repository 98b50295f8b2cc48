// PostgreSQL-backed queue store

//! # PostgreSQL Queue Store
//!
//! Durable [`QueueStore`] for deployments with more than one orchestrator
//! process. Atomicity comes from the database:
//!
//! - **claim** is a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP LOCKED)
//!   AND status = 'pending' RETURNING *`, so two workers can never receive the
//!   same row and neither blocks on the other's lock.
//! - **expiry** and **lease reclamation** are bulk conditional updates.
//! - every other transition locks the row (`SELECT ... FOR UPDATE`), applies the
//!   same [`QueueItem`] rules the in-memory store uses, and writes the row back
//!   inside one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use super::queue::{ClaimOutcome, QueueStore};
use crate::models::{
    CancelOutcome, ErrorKind, NewQueueItem, QueueError, QueueItem, QueueStats, QueueStatus,
};
use crate::{OrchestratorError, Result};

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS orchestrator_queue (
        id               UUID PRIMARY KEY,
        payload          JSONB NOT NULL,
        request_type     TEXT NOT NULL,
        user_id          TEXT NOT NULL,
        workspace_id     TEXT NOT NULL,
        priority         TEXT NOT NULL,
        priority_score   BIGINT NOT NULL,
        status           TEXT NOT NULL,
        retry_count      INTEGER NOT NULL DEFAULT 0,
        max_retries      INTEGER NOT NULL,
        batch_id         UUID,
        processing_node  TEXT,
        lease_expires_at TIMESTAMPTZ,
        expires_at       TIMESTAMPTZ,
        callback_url     TEXT,
        cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
        result           JSONB,
        error            JSONB,
        sequence         BIGSERIAL,
        created_at       TIMESTAMPTZ NOT NULL,
        updated_at       TIMESTAMPTZ NOT NULL,
        started_at       TIMESTAMPTZ,
        completed_at     TIMESTAMPTZ
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS orchestrator_queue_claim_idx
        ON orchestrator_queue (status, priority_score DESC, sequence)
    "#,
];

pub struct PostgresQueueStore {
    pool: PgPool,
}

impl PostgresQueueStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Create the queue table and claim index if they do not exist
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("🗄️  Queue schema ready");
        Ok(())
    }

    async fn locked(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<QueueItem> {
        let row = sqlx::query("SELECT * FROM orchestrator_queue WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        match row {
            Some(row) => item_from_row(&row),
            None => Err(OrchestratorError::NotFound(format!("queue item {}", id))),
        }
    }

    async fn write_back(tx: &mut Transaction<'_, Postgres>, item: &QueueItem) -> Result<()> {
        let error = item.error.as_ref().map(serde_json::to_value).transpose()?;
        sqlx::query(
            r#"
            UPDATE orchestrator_queue
               SET status = $2, retry_count = $3, batch_id = $4, processing_node = $5,
                   lease_expires_at = $6, cancel_requested = $7, result = $8, error = $9,
                   updated_at = $10, started_at = $11, completed_at = $12
             WHERE id = $1
            "#,
        )
        .bind(item.id)
        .bind(item.status.as_str())
        .bind(item.retry_count as i32)
        .bind(item.batch_id)
        .bind(item.processing_node.as_deref())
        .bind(item.lease_expires_at)
        .bind(item.cancel_requested)
        .bind(item.result.clone())
        .bind(error)
        .bind(item.updated_at)
        .bind(item.started_at)
        .bind(item.completed_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Lock one row, apply `apply`, write it back; rolls back on error
    async fn transition<T, F>(&self, id: Uuid, apply: F) -> Result<T>
    where
        F: FnOnce(&mut QueueItem) -> Result<T> + Send,
        T: Send,
    {
        let mut tx = self.pool.begin().await?;
        let mut item = Self::locked(&mut tx, id).await?;
        let outcome = apply(&mut item)?;
        Self::write_back(&mut tx, &item).await?;
        tx.commit().await?;
        Ok(outcome)
    }
}

fn ensure_owner(item: &QueueItem, worker_id: &str) -> Result<()> {
    if item.is_owned_by(worker_id) {
        Ok(())
    } else {
        Err(OrchestratorError::LeaseLost {
            id: item.id,
            worker_id: worker_id.to_string(),
        })
    }
}

fn item_from_row(row: &PgRow) -> Result<QueueItem> {
    let priority: String = row.try_get("priority")?;
    let status: String = row.try_get("status")?;
    let error: Option<serde_json::Value> = row.try_get("error")?;

    Ok(QueueItem {
        id: row.try_get("id")?,
        payload: row.try_get("payload")?,
        request_type: row.try_get("request_type")?,
        user_id: row.try_get("user_id")?,
        workspace_id: row.try_get("workspace_id")?,
        priority: priority.parse().map_err(OrchestratorError::Internal)?,
        priority_score: row.try_get("priority_score")?,
        status: status.parse().map_err(OrchestratorError::Internal)?,
        retry_count: row.try_get::<i32, _>("retry_count")?.max(0) as u32,
        max_retries: row.try_get::<i32, _>("max_retries")?.max(0) as u32,
        batch_id: row.try_get("batch_id")?,
        processing_node: row.try_get("processing_node")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        expires_at: row.try_get("expires_at")?,
        callback_url: row.try_get("callback_url")?,
        cancel_requested: row.try_get("cancel_requested")?,
        result: row.try_get("result")?,
        error: error.map(serde_json::from_value).transpose()?,
        sequence: row.try_get("sequence")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn items_from_rows(rows: Vec<PgRow>) -> Result<Vec<QueueItem>> {
    rows.iter().map(item_from_row).collect()
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    async fn insert(&self, item: NewQueueItem, now: DateTime<Utc>) -> Result<QueueItem> {
        let item = QueueItem::from_new(item, now, 0);
        let row = sqlx::query(
            r#"
            INSERT INTO orchestrator_queue
                (id, payload, request_type, user_id, workspace_id, priority, priority_score,
                 status, retry_count, max_retries, expires_at, callback_url, cancel_requested,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10, $11, FALSE, $12, $12)
            RETURNING *
            "#,
        )
        .bind(item.id)
        .bind(&item.payload)
        .bind(&item.request_type)
        .bind(&item.user_id)
        .bind(&item.workspace_id)
        .bind(item.priority.as_str())
        .bind(item.priority_score)
        .bind(QueueStatus::Pending.as_str())
        .bind(item.max_retries as i32)
        .bind(item.expires_at)
        .bind(item.callback_url.as_deref())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        item_from_row(&row)
    }

    async fn claim(&self, worker_id: &str, now: DateTime<Utc>, lease: Duration) -> Result<ClaimOutcome> {
        let expired = self.expire_overdue(now).await?;
        self.reclaim_stale_leases(now).await?;

        let row = sqlx::query(
            r#"
            UPDATE orchestrator_queue
               SET status = 'processing', processing_node = $1, lease_expires_at = $2,
                   started_at = $3, updated_at = $3
             WHERE id = (
                    SELECT id FROM orchestrator_queue
                     WHERE status = 'pending'
                     ORDER BY priority_score DESC, sequence ASC
                     LIMIT 1
                     FOR UPDATE SKIP LOCKED
                   )
               AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now + lease)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(ClaimOutcome {
            claimed: row.as_ref().map(item_from_row).transpose()?,
            expired,
        })
    }

    async fn complete(
        &self,
        id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<QueueItem> {
        self.transition(id, move |item| {
            ensure_owner(item, worker_id)?;
            item.mark_completed(result, now);
            Ok(item.clone())
        })
        .await
    }

    async fn fail(&self, id: Uuid, worker_id: &str, error: QueueError, now: DateTime<Utc>) -> Result<QueueItem> {
        self.transition(id, move |item| {
            ensure_owner(item, worker_id)?;
            item.mark_failed_attempt(error, now);
            Ok(item.clone())
        })
        .await
    }

    async fn cancel(&self, id: Uuid, now: DateTime<Utc>) -> Result<(CancelOutcome, QueueItem)> {
        self.transition(id, move |item| {
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
            Ok((outcome, item.clone()))
        })
        .await
    }

    async fn renew_lease(&self, id: Uuid, worker_id: &str, now: DateTime<Utc>, lease: Duration) -> Result<QueueItem> {
        self.transition(id, move |item| {
            ensure_owner(item, worker_id)?;
            item.renew_lease(now, lease);
            Ok(item.clone())
        })
        .await
    }

    async fn assign_batch(&self, id: Uuid, batch_id: Uuid) -> Result<()> {
        let updated = sqlx::query("UPDATE orchestrator_queue SET batch_id = $2 WHERE id = $1")
            .bind(id)
            .bind(batch_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(OrchestratorError::NotFound(format!("queue item {}", id)));
        }
        Ok(())
    }

    async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>> {
        let error = serde_json::to_value(QueueError::new(
            ErrorKind::QueueExpired,
            "expired before completion",
        ))?;
        let rows = sqlx::query(
            r#"
            UPDATE orchestrator_queue
               SET status = 'expired', error = $2, processing_node = NULL,
                   lease_expires_at = NULL, completed_at = $1, updated_at = $1
             WHERE status IN ('pending', 'processing')
               AND expires_at IS NOT NULL
               AND expires_at <= $1
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(error)
        .fetch_all(&self.pool)
        .await?;
        items_from_rows(rows)
    }

    async fn reclaim_stale_leases(&self, now: DateTime<Utc>) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(
            r#"
            UPDATE orchestrator_queue
               SET status = 'pending', processing_node = NULL,
                   lease_expires_at = NULL, updated_at = $1
             WHERE status = 'processing'
               AND lease_expires_at IS NOT NULL
               AND lease_expires_at <= $1
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        items_from_rows(rows)
    }

    async fn get(&self, id: Uuid) -> Result<Option<QueueItem>> {
        let row = sqlx::query("SELECT * FROM orchestrator_queue WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(item_from_row).transpose()
    }

    async fn stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM orchestrator_queue GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            let status: QueueStatus = status.parse().map_err(OrchestratorError::Internal)?;
            stats.add(status, count.max(0) as usize);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueuePriority;

    /// Runs only when `DATABASE_URL` points at a scratch database
    async fn store() -> Option<PostgresQueueStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PostgresQueueStore::connect(&url).await.unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    #[tokio::test]
    async fn test_claim_round_trip_against_postgres() {
        let Some(store) = store().await else {
            return;
        };

        let now = Utc::now();
        let item = store
            .insert(
                NewQueueItem::new(serde_json::json!({"text": "pg"}), "chat", "u1", "w1")
                    .with_priority(QueuePriority::Critical),
                now,
            )
            .await
            .unwrap();

        let claimed = store
            .claim("pg-worker", now, Duration::seconds(30))
            .await
            .unwrap()
            .claimed
            .unwrap();
        assert_eq!(claimed.id, item.id);

        let done = store
            .complete(item.id, "pg-worker", serde_json::json!({"ok": true}), Utc::now())
            .await
            .unwrap();
        assert_eq!(done.status, QueueStatus::Completed);
        assert!(store.stats().await.unwrap().completed >= 1);
    }

    #[tokio::test]
    async fn test_claim_returns_items_it_expired() {
        let Some(store) = store().await else {
            return;
        };

        let now = Utc::now();
        let overdue = NewQueueItem::new(serde_json::json!({"text": "late"}), "chat", "u1", "w1")
            .expiring_at(now - Duration::seconds(1));
        let item = store.insert(overdue, now).await.unwrap();

        let outcome = store.claim("pg-worker", now, Duration::seconds(30)).await.unwrap();
        assert!(outcome.expired.iter().any(|expired| expired.id == item.id));
        assert_eq!(store.get(item.id).await.unwrap().unwrap().status, QueueStatus::Expired);
    }
}
