//! Periodic fan-out: on each configured policy's window boundary, enqueue
//! one slice message per shard under a lease keyed on
//! (FanoutTopic, WorkKey), then advance the policy's cursor.
//!
//! # Schema assumption
//!
//! `work_key` is stored as `''` rather than `NULL` so it can sit in a
//! composite primary key with `fanout_topic`; the Rust layer maps `''`
//! back to `None`.
//!
//! ```sql
//! CREATE TABLE <schema>.fanout_policies (
//!     fanout_topic           TEXT NOT NULL,
//!     work_key               TEXT NOT NULL DEFAULT '',
//!     cron                   TEXT,
//!     default_every_seconds  BIGINT NOT NULL,
//!     jitter_seconds         BIGINT NOT NULL DEFAULT 0,
//!     lease_duration_seconds BIGINT NOT NULL,
//!     shard_count            INTEGER NOT NULL DEFAULT 1,
//!     enabled                BOOLEAN NOT NULL DEFAULT true,
//!     PRIMARY KEY (fanout_topic, work_key)
//! );
//! CREATE TABLE <schema>.fanout_cursors (
//!     fanout_topic      TEXT NOT NULL,
//!     work_key          TEXT NOT NULL DEFAULT '',
//!     last_window_start TIMESTAMPTZ NOT NULL,
//!     PRIMARY KEY (fanout_topic, work_key)
//! );
//! ```

use chrono::{DateTime, Duration, TimeZone, Utc};
use coord_core::{Error, FanoutPolicy, Result};
use coord_store::{LeaseFactory, OutboxStore};
use rand::Rng;
use sqlx::{PgPool, Row};
use std::str::FromStr;
use uuid::Uuid;

pub struct FanoutEngine {
    pool: PgPool,
    schema_name: String,
    outbox: OutboxStore,
    lease_factory: LeaseFactory,
}

impl FanoutEngine {
    pub fn new(
        pool: PgPool,
        schema_name: impl Into<String>,
        outbox: OutboxStore,
        lease_factory: LeaseFactory,
    ) -> Self {
        Self {
            pool,
            schema_name: schema_name.into(),
            outbox,
            lease_factory,
        }
    }

    fn policies_table(&self) -> String {
        format!("{}.fanout_policies", self.schema_name)
    }

    fn cursors_table(&self) -> String {
        format!("{}.fanout_cursors", self.schema_name)
    }

    /// One fanout pass over every enabled policy. Returns the number of
    /// policies whose window advanced (a slice batch was enqueued).
    pub async fn run_once(&self) -> Result<usize> {
        let now = Utc::now();
        let mut advanced = 0;

        for policy in self.load_policies().await? {
            let window_start = current_window_start(&policy, now)?;
            let cursor = self.load_cursor(&policy).await?;

            if cursor.map(|c| window_start > c).unwrap_or(true) {
                if self.try_dispatch_window(&policy, window_start).await? {
                    advanced += 1;
                }
            }
        }

        Ok(advanced)
    }

    async fn try_dispatch_window(&self, policy: &FanoutPolicy, window_start: DateTime<Utc>) -> Result<bool> {
        let lease_name = lease_name_for(policy);
        let lease = self
            .lease_factory
            .acquire(
                &lease_name,
                Duration::seconds(policy.lease_duration_seconds),
                None,
                None,
            )
            .await?;
        let Some(lease) = lease else { return Ok(false) };

        let correlation_id = Uuid::new_v4();
        let topic = format!(
            "fanout:{}:{}",
            policy.fanout_topic,
            policy.work_key.as_deref().unwrap_or("")
        );

        for shard in 0..policy.shard_count.max(1) {
            let payload = serde_json::json!({
                "fanout_topic": policy.fanout_topic,
                "shard": shard,
                "work_key": policy.work_key,
                "window_start": window_start,
                "correlation_id": correlation_id,
            });
            self.outbox
                .enqueue(&topic, payload, Some(correlation_id), None)
                .await?;
        }

        self.advance_cursor(policy, window_start).await?;
        self.lease_factory.release(&lease).await?;

        tracing::debug!(
            event = "coord.fanout.window_dispatched",
            fanout_topic = %policy.fanout_topic,
            shard_count = policy.shard_count,
            %window_start
        );
        Ok(true)
    }

    async fn load_policies(&self) -> Result<Vec<FanoutPolicy>> {
        let sql = format!(
            r#"
            SELECT fanout_topic, work_key, cron, default_every_seconds, jitter_seconds,
                   lease_duration_seconds, shard_count
            FROM {table}
            WHERE enabled
            "#,
            table = self.policies_table()
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let work_key: String = row.try_get("work_key")?;
                Ok(FanoutPolicy {
                    fanout_topic: row.try_get("fanout_topic")?,
                    work_key: if work_key.is_empty() { None } else { Some(work_key) },
                    cron: row.try_get("cron")?,
                    default_every_seconds: row.try_get("default_every_seconds")?,
                    jitter_seconds: row.try_get("jitter_seconds")?,
                    lease_duration_seconds: row.try_get("lease_duration_seconds")?,
                    shard_count: row.try_get("shard_count")?,
                })
            })
            .collect()
    }

    async fn load_cursor(&self, policy: &FanoutPolicy) -> Result<Option<DateTime<Utc>>> {
        let sql = format!(
            "SELECT last_window_start FROM {table} WHERE fanout_topic = $1 AND work_key = $2",
            table = self.cursors_table()
        );
        let row = sqlx::query(&sql)
            .bind(&policy.fanout_topic)
            .bind(policy.work_key.as_deref().unwrap_or(""))
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("last_window_start")?),
            None => None,
        })
    }

    async fn advance_cursor(&self, policy: &FanoutPolicy, window_start: DateTime<Utc>) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {table} (fanout_topic, work_key, last_window_start)
            VALUES ($1, $2, $3)
            ON CONFLICT (fanout_topic, work_key) DO UPDATE SET last_window_start = $3
            "#,
            table = self.cursors_table()
        );
        sqlx::query(&sql)
            .bind(&policy.fanout_topic)
            .bind(policy.work_key.as_deref().unwrap_or(""))
            .bind(window_start)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn lease_name_for(policy: &FanoutPolicy) -> String {
    format!(
        "fanout:{}:{}",
        policy.fanout_topic,
        policy.work_key.as_deref().unwrap_or("")
    )
}

/// The latest cron tick ≤ now, or the latest whole `default_every_seconds`
/// boundary (epoch-aligned) when the policy has no cron expression.
fn current_window_start(policy: &FanoutPolicy, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match &policy.cron {
        Some(expr) => {
            let field_count = expr.split_whitespace().count();
            let normalized = if field_count == 5 {
                format!("0 {expr}")
            } else {
                expr.clone()
            };
            let schedule = cron::Schedule::from_str(&normalized)
                .map_err(|err| Error::invalid_argument(format!("invalid fanout cron `{expr}`: {err}")))?;

            // The `cron` crate only iterates forward, so the latest tick
            // at-or-before `now` is found by walking forward from a safely
            // distant anchor and keeping the last tick that hasn't passed
            // `now` yet. A year comfortably bounds any realistic schedule.
            let anchor = now - Duration::days(366);
            let mut latest = None;
            for tick in schedule.after(&anchor) {
                if tick > now {
                    break;
                }
                latest = Some(tick);
            }
            latest.ok_or_else(|| Error::invalid_argument(format!("cron `{expr}` has no tick at or before now")))
        }
        None => {
            let every = policy.default_every_seconds.max(1);
            let epoch_seconds = now.timestamp();
            let boundary = (epoch_seconds / every) * every;
            Ok(Utc
                .timestamp_opt(boundary, 0)
                .single()
                .unwrap_or(now))
        }
    }
}

/// Samples a uniform jitter delay in `[0, jitter_seconds]`, used by callers
/// that want to stagger dispatch across many policies sharing a boundary.
pub fn jitter_delay(jitter_seconds: i64) -> Duration {
    if jitter_seconds <= 0 {
        return Duration::zero();
    }
    Duration::seconds(rand::thread_rng().gen_range(0..=jitter_seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(cron: Option<&str>, every_seconds: i64) -> FanoutPolicy {
        FanoutPolicy {
            fanout_topic: "reindex".to_string(),
            work_key: None,
            cron: cron.map(|c| c.to_string()),
            default_every_seconds: every_seconds,
            jitter_seconds: 0,
            lease_duration_seconds: 30,
            shard_count: 4,
        }
    }

    #[test]
    fn every_seconds_window_aligns_to_epoch_boundary() {
        let p = policy(None, 300);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 7, 30).unwrap();
        let window = current_window_start(&p, now).unwrap();
        assert_eq!(window, Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn cron_window_is_latest_tick_at_or_before_now() {
        let p = policy(Some("*/5 * * * *"), 300);
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 7, 30).unwrap();
        let window = current_window_start(&p, now).unwrap();
        assert_eq!(window, Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn jitter_never_exceeds_configured_bound() {
        for _ in 0..50 {
            let d = jitter_delay(10);
            assert!(d >= Duration::zero());
            assert!(d <= Duration::seconds(10));
        }
    }
}
