//! Postgres-backed inbox, keyed by composite (source, message_id) identity.
//!
//! # Schema assumption
//!
//! ```sql
//! CREATE TABLE <schema>.inbox (
//!     id               UUID PRIMARY KEY DEFAULT gen_random_uuid(),
//!     source           TEXT NOT NULL,
//!     message_id       TEXT NOT NULL,
//!     topic            TEXT NOT NULL,
//!     payload          JSONB NOT NULL,
//!     hash             BYTEA,
//!     first_seen_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     last_seen_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     attempts         INTEGER NOT NULL DEFAULT 0,
//!     status           TEXT NOT NULL DEFAULT 'seen',
//!     processed_at     TIMESTAMPTZ,
//!     owner_token      UUID,
//!     lease_expires_at TIMESTAMPTZ,
//!     next_attempt_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
//!     retry_count      INTEGER NOT NULL DEFAULT 0,
//!     last_error       TEXT,
//!     UNIQUE (source, message_id)
//! );
//! ```
//!
//! `AlreadyProcessed` is the dedup entry point and does not itself claim a
//! row; the inbox dispatcher claims via the same five WorkQueue operations
//! the outbox uses, with `Fail` landing on `Dead` instead of `Failed`.

use crate::backoff::BackoffPolicy;
use crate::ident::assert_valid_identifier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coord_core::{
    new_owner_token, Delivery, InboxMessage, InboxStatus, OwnerToken, Result, WorkQueueStats,
    WorkQueueStore,
};
use serde_json::Value;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Clone)]
pub struct InboxStore {
    pool: PgPool,
    schema_name: String,
    backoff: BackoffPolicy,
}

impl InboxStore {
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

    fn table(&self) -> String {
        format!("{}.inbox", self.schema_name)
    }

    /// `true` iff this (source, message_id) has already reached `Done`.
    /// First observation always returns `false`.
    pub async fn already_processed(
        &self,
        source: &str,
        message_id: &str,
        topic: &str,
        payload: Value,
        hash: Option<&[u8]>,
    ) -> Result<bool> {
        let sql = format!(
            r#"
            INSERT INTO {table} (source, message_id, topic, payload, hash, first_seen_at, last_seen_at, attempts, status, next_attempt_at)
            VALUES ($1, $2, $3, $4, $5, now(), now(), 1, 'seen', now())
            ON CONFLICT (source, message_id) DO UPDATE
            SET attempts = {table}.attempts + 1,
                last_seen_at = now()
            RETURNING status
            "#,
            table = self.table()
        );

        let row = sqlx::query(&sql)
            .bind(source)
            .bind(message_id)
            .bind(topic)
            .bind(&payload)
            .bind(hash)
            .fetch_one(&self.pool)
            .await?;

        let status: String = row.try_get("status")?;
        Ok(status == "done")
    }

    pub async fn mark_processing(&self, source: &str, message_id: &str) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'processing'
            WHERE source = $1 AND message_id = $2 AND status = 'seen'
            "#,
            table = self.table()
        );
        sqlx::query(&sql)
            .bind(source)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_processed(&self, source: &str, message_id: &str) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'done', processed_at = now()
            WHERE source = $1 AND message_id = $2 AND status = 'processing'
            "#,
            table = self.table()
        );
        sqlx::query(&sql)
            .bind(source)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_dead(&self, source: &str, message_id: &str) -> Result<()> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'dead', processed_at = now()
            WHERE source = $1 AND message_id = $2
            "#,
            table = self.table()
        );
        sqlx::query(&sql)
            .bind(source)
            .bind(message_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Claim up to `batch_size` rows eligible for dispatch (mirrors
    /// `OutboxStore::claim_due`). Only rows already past `Seen` via
    /// `mark_processing`-free direct claim are eligible: the dispatcher
    /// claims `Seen` rows the same way the outbox claims `Ready` ones.
    pub async fn claim_due(&self, lease_seconds: i64, batch_size: i64) -> Result<Vec<InboxMessage>> {
        let owner = new_owner_token();
        let sql = format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM {table}
                WHERE (status = 'seen' AND next_attempt_at <= now())
                   OR (status = 'processing' AND lease_expires_at <= now())
                ORDER BY next_attempt_at ASC, first_seen_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table} t
            SET status = 'processing',
                owner_token = $2,
                lease_expires_at = now() + make_interval(secs => $3)
            FROM claimable
            WHERE t.id = claimable.id
            RETURNING t.id, t.source, t.message_id, t.topic, t.payload, t.hash, t.first_seen_at,
                      t.last_seen_at, t.attempts, t.retry_count, t.status, t.processed_at,
                      t.owner_token, t.lease_expires_at
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

    pub async fn ack(&self, owner_token: OwnerToken, ids: &[Uuid]) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'done', processed_at = now()
            WHERE id = ANY($1) AND owner_token = $2 AND status = 'processing'
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
            SET status = 'seen',
                next_attempt_at = now() + make_interval(secs => $4),
                owner_token = NULL,
                lease_expires_at = NULL,
                retry_count = retry_count + 1,
                last_error = $3
            WHERE id = ANY($1) AND owner_token = $2 AND status = 'processing'
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

    /// Fail lands on `Dead` — the inbox's terminal-failure status.
    pub async fn fail(&self, owner_token: OwnerToken, ids: &[Uuid], error: &str) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'dead',
                last_error = $3,
                processed_at = now(),
                owner_token = NULL,
                lease_expires_at = NULL
            WHERE id = ANY($1) AND owner_token = $2 AND status = 'processing'
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

    pub async fn reap_expired(&self) -> Result<u64> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET status = 'seen',
                owner_token = NULL,
                lease_expires_at = NULL
            WHERE status = 'processing' AND lease_expires_at <= now()
            "#,
            table = self.table()
        );
        let result = sqlx::query(&sql).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Deletes only rows with Status=Done and ProcessedAt ≤ now-retention;
    /// never deletes unprocessed rows irrespective of age (Dead rows are
    /// likewise preserved: only Done is eligible per the outer spec).
    pub async fn cleanup(&self, retention: chrono::Duration) -> Result<u64> {
        let retention_secs = retention.num_seconds().max(0) as f64;
        let sql = format!(
            r#"
            DELETE FROM {table}
            WHERE status = 'done'
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

    /// Same rollup shape as [`crate::outbox::OutboxStore::stats`], with
    /// `seen`/`processing`/`dead` read as the inbox's ready/in_progress/failed.
    pub async fn stats(&self) -> Result<WorkQueueStats> {
        let sql = format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'seen') AS ready,
                COUNT(*) FILTER (WHERE status = 'processing') AS in_progress,
                COUNT(*) FILTER (WHERE status = 'done') AS done,
                COUNT(*) FILTER (WHERE status = 'dead') AS failed
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
impl WorkQueueStore for InboxStore {
    type Message = InboxMessage;

    fn id_of(message: &InboxMessage) -> Uuid {
        message.id
    }

    fn retry_count_of(message: &InboxMessage) -> i32 {
        message.retry_count
    }

    fn owner_token_of(message: &InboxMessage) -> Option<OwnerToken> {
        message.owner_token
    }

    fn to_delivery(message: &InboxMessage) -> Delivery {
        Delivery::from(message)
    }

    async fn claim_due(&self, lease_seconds: i64, batch_size: i64) -> Result<Vec<InboxMessage>> {
        InboxStore::claim_due(self, lease_seconds, batch_size).await
    }

    async fn ack(&self, owner_token: OwnerToken, ids: &[Uuid]) -> Result<u64> {
        InboxStore::ack(self, owner_token, ids).await
    }

    /// Terminal Fail lands on `Dead` (see [`InboxStore::fail`]).
    async fn fail(&self, owner_token: OwnerToken, ids: &[Uuid], error: &str) -> Result<u64> {
        InboxStore::fail(self, owner_token, ids, error).await
    }

    async fn abandon_or_fail(
        &self,
        owner_token: OwnerToken,
        id: Uuid,
        retry_count_before: i32,
        max_attempts: i32,
        error: &str,
    ) -> Result<()> {
        InboxStore::abandon_or_fail(self, owner_token, id, retry_count_before, max_attempts, error).await
    }
}

fn row_to_message(row: sqlx::postgres::PgRow) -> Result<InboxMessage> {
    let status_str: String = row.try_get("status")?;
    let status = match status_str.as_str() {
        "seen" => InboxStatus::Seen,
        "processing" => InboxStatus::Processing,
        "done" => InboxStatus::Done,
        "dead" => InboxStatus::Dead,
        other => {
            return Err(coord_core::Error::from(anyhow::anyhow!(
                "unknown inbox status `{other}`"
            )))
        }
    };

    Ok(InboxMessage {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        message_id: row.try_get("message_id")?,
        topic: row.try_get("topic")?,
        payload: row.try_get("payload")?,
        hash: row.try_get("hash")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        attempts: row.try_get("attempts")?,
        retry_count: row.try_get("retry_count")?,
        status,
        processed_at: row.try_get("processed_at")?,
        owner_token: row.try_get("owner_token")?,
        lease_expires_at: row.try_get::<Option<DateTime<Utc>>, _>("lease_expires_at")?,
    })
}
