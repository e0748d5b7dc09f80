//! Postgres-backed outbox: a thin specialization of the work-queue engine.
//!
//! # Schema assumption
//!
//! ```sql
//! CREATE TABLE <schema>.outbox (
//!     id               UUID PRIMARY KEY,
//!     topic            TEXT NOT NULL,
//!     payload          JSONB NOT NULL,
//!     correlation_id   UUID,
//!     created_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     due_time_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     status           TEXT NOT NULL DEFAULT 'ready',
//!     retry_count      INTEGER NOT NULL DEFAULT 0,
//!     last_error       TEXT,
//!     next_attempt_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     owner_token      UUID,
//!     lease_expires_at TIMESTAMPTZ,
//!     processed_at     TIMESTAMPTZ,
//!     processed_by     TEXT
//! );
//! CREATE INDEX ON <schema>.outbox (next_attempt_at)
//!     WHERE status IN ('ready', 'in_progress');
//! ```
//!
//! Schema deployment itself is out of scope; this module assumes the table
//! already exists under `schema_name` (see [`coord_core::DatabaseSchemaManager`]).

use crate::backoff::BackoffPolicy;
use crate::ident::assert_valid_identifier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coord_core::{
    new_owner_token, Delivery, OutboxMessage, OutboxStatus, OwnerToken, Result, WorkQueueStats,
    WorkQueueStore,
};
use serde_json::Value;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

#[derive(Clone)]
pub struct OutboxStore {
    pool: PgPool,
    schema_name: String,
    backoff: BackoffPolicy,
}

impl OutboxStore {
    pub fn new(pool: PgPool, schema_name: impl Into<String>) -> Self {
        let schema_name = schema_name.into();
        assert_valid_identifier(&schema_name);
        Self {
            pool,
            schema_name,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(&self) -> String {
        format!("{}.outbox", self.schema_name)
    }

    /// Inserts a Ready row. If `tx` is supplied, the insert participates in
    /// the caller's transaction (producer-side transactional outbox).
    pub async fn enqueue(
        &self,
        topic: &str,
        payload: Value,
        correlation_id: Option<Uuid>,
        tx: Option<&mut Transaction<'_, Postgres>>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let sql = format!(
            r#"
            INSERT INTO {table} (id, topic, payload, correlation_id, created_at, due_time_at, status, next_attempt_at)
            VALUES ($1, $2, $3, $4, now(), now(), 'ready', now())
            "#,
            table = self.table()
        );
        let query = sqlx::query(&sql)
            .bind(id)
            .bind(topic)
            .bind(&payload)
            .bind(correlation_id);

        match tx {
            Some(tx) => {
                query.execute(&mut **tx).await?;
            }
            None => {
                query.execute(&self.pool).await?;
            }
        }
        Ok(id)
    }

    /// Claim(ownerToken, leaseSeconds, batchSize): a single atomic
    /// CTE + UPDATE ... RETURNING so two concurrent callers claim disjoint
    /// sets, mirroring the teacher's `pgqueue.rs` receive() query.
    pub async fn claim_due(&self, lease_seconds: i64, batch_size: i64) -> Result<Vec<OutboxMessage>> {
        let owner = new_owner_token();
        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM {table}
                WHERE (status = 'ready' AND next_attempt_at <= now())
                   OR (status = 'in_progress' AND lease_expires_at <= now())
                ORDER BY next_attempt_at ASC, created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} t
            SET status = 'in_progress',
                owner_token = $2,
                lease_expires_at = now() + make_interval(secs => $3)
            FROM claimable
            WHERE t.id = claimable.id
            RETURNING t.id, t.topic, t.payload, t.correlation_id, t.created_at, t.due_time_at,
                      t.status, t.retry_count, t.last_error, t.next_attempt_at, t.owner_token,
                      t.lease_expires_at, t.processed_at, t.processed_by
            "#,
            table = self.table()
        );

        let rows = sqlx::query(&sql)
            .bind(batch_size)
            .bind(owner)
            .bind(lease_seconds as f64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    /// Ack(ownerToken, ids): mismatches are silently ignored (idempotent).
    pub async fn ack(&self, owner_token: OwnerToken, ids: &[Uuid]) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'done', processed_at = now()
            WHERE id = ANY($1) AND owner_token = $2 AND status = 'in_progress'
            "#,
            table = self.table()
        );
        let result = sqlx::query(&sql)
            .bind(ids)
            .bind(owner_token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Abandon(ownerToken, ids, lastError?, delay?): always increments
    /// RetryCount, per the outer spec's explicit resolution of the
    /// Reschedule-vs-RetryCount open question.
    pub async fn abandon(
        &self,
        owner_token: OwnerToken,
        ids: &[Uuid],
        last_error: Option<&str>,
        delay: chrono::Duration,
    ) -> Result<u64> {
        let delay_secs = delay.num_milliseconds() as f64 / 1000.0;
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'ready',
                next_attempt_at = now() + make_interval(secs => $4),
                owner_token = NULL,
                lease_expires_at = NULL,
                retry_count = retry_count + 1,
                last_error = $3
            WHERE id = ANY($1) AND owner_token = $2 AND status = 'in_progress'
            "#,
            table = self.table()
        );
        let result = sqlx::query(&sql)
            .bind(ids)
            .bind(owner_token)
            .bind(last_error)
            .bind(delay_secs)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Fail(ownerToken, ids, error): terminal.
    pub async fn fail(&self, owner_token: OwnerToken, ids: &[Uuid], error: &str) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'failed',
                last_error = $3,
                processed_at = now(),
                processed_by = 'FAILED',
                owner_token = NULL,
                lease_expires_at = NULL
            WHERE id = ANY($1) AND owner_token = $2 AND status = 'in_progress'
            "#,
            table = self.table()
        );
        let result = sqlx::query(&sql)
            .bind(ids)
            .bind(owner_token)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Abandon-or-fail per the dispatcher's poison-detection rule: if
    /// `retry_count + 1 > max_attempts`, convert to terminal Fail instead.
    pub async fn abandon_or_fail(
        &self,
        owner_token: OwnerToken,
        id: Uuid,
        retry_count_before: i32,
        max_attempts: i32,
        error: &str,
    ) -> Result<()> {
        if retry_count_before + 1 > max_attempts {
            self.fail(owner_token, &[id], error).await?;
        } else {
            let delay = self.backoff.delay_for(retry_count_before + 1);
            self.abandon(owner_token, &[id], Some(error), delay).await?;
        }
        Ok(())
    }

    /// ReapExpired(): reclaims rows whose lease has expired back to Ready.
    pub async fn reap_expired(&self) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'ready',
                owner_token = NULL,
                lease_expires_at = NULL
            WHERE status = 'in_progress' AND lease_expires_at <= now()
            "#,
            table = self.table()
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Cleanup(retentionSeconds): deletes only terminal rows past retention.
    pub async fn cleanup(&self, retention: chrono::Duration) -> Result<u64> {
        let retention_secs = retention.num_seconds().max(0) as f64;
        let sql = format!(
            r#"
            DELETE FROM {table}
            WHERE status IN ('done', 'failed')
              AND processed_at IS NOT NULL
              AND processed_at <= now() - make_interval(secs => $1)
            "#,
            table = self.table()
        );
        let result = sqlx::query(&sql)
            .bind(retention_secs)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<WorkQueueStats> {
        let sql = format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'ready') AS ready,
                COUNT(*) FILTER (WHERE status = 'in_progress') AS in_progress,
                COUNT(*) FILTER (WHERE status = 'done') AS done,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed
            FROM {table}
            "#,
            table = self.table()
        );
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        Ok(WorkQueueStats {
            ready: row.try_get("ready")?,
            in_progress: row.try_get("in_progress")?,
            done: row.try_get("done")?,
            failed: row.try_get("failed")?,
        })
    }
}

#[async_trait]
impl WorkQueueStore for OutboxStore {
    type Message = OutboxMessage;

    fn id_of(message: &OutboxMessage) -> Uuid {
        message.id
    }

    fn retry_count_of(message: &OutboxMessage) -> i32 {
        message.retry_count
    }

    fn owner_token_of(message: &OutboxMessage) -> Option<OwnerToken> {
        message.owner_token
    }

    fn to_delivery(message: &OutboxMessage) -> Delivery {
        Delivery::from(message)
    }

    async fn claim_due(&self, lease_seconds: i64, batch_size: i64) -> Result<Vec<OutboxMessage>> {
        OutboxStore::claim_due(self, lease_seconds, batch_size).await
    }

    async fn ack(&self, owner_token: OwnerToken, ids: &[Uuid]) -> Result<u64> {
        OutboxStore::ack(self, owner_token, ids).await
    }

    async fn fail(&self, owner_token: OwnerToken, ids: &[Uuid], error: &str) -> Result<u64> {
        OutboxStore::fail(self, owner_token, ids, error).await
    }

    async fn abandon_or_fail(
        &self,
        owner_token: OwnerToken,
        id: Uuid,
        retry_count_before: i32,
        max_attempts: i32,
        error: &str,
    ) -> Result<()> {
        OutboxStore::abandon_or_fail(self, owner_token, id, retry_count_before, max_attempts, error).await
    }
}

fn row_to_message(row: sqlx::postgres::PgRow) -> Result<OutboxMessage> {
    let status_str: String = row.try_get("status")?;
    let status = match status_str.as_str() {
        "ready" => OutboxStatus::Ready,
        "in_progress" => OutboxStatus::InProgress,
        "done" => OutboxStatus::Done,
        "failed" => OutboxStatus::Failed,
        other => {
            return Err(coord_core::Error::from(anyhow::anyhow!(
                "unknown outbox status `{other}`"
            )))
        }
    };

    Ok(OutboxMessage {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        correlation_id: row.try_get("correlation_id")?,
        created_at: row.try_get("created_at")?,
        due_time_at: row.try_get("due_time_at")?,
        status,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        owner_token: row.try_get("owner_token")?,
        lease_expires_at: row.try_get::<Option<DateTime<Utc>>, _>("lease_expires_at")?,
        processed_at: row.try_get("processed_at")?,
        processed_by: row.try_get("processed_by")?,
    })
}
