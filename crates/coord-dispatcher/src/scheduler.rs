//! Recurring jobs (cron) and one-shot timers, fired into the outbox under
//! a named "scheduler" lease so exactly one scheduler instance advances a
//! given job/timer at a time.
//!
//! # Schema assumption
//!
//! ```sql
//! CREATE TABLE <schema>.jobs (
//!     id               UUID PRIMARY KEY,
//!     topic            TEXT NOT NULL,
//!     payload_template JSONB NOT NULL,
//!     cron             TEXT NOT NULL,
//!     next_fire_at     TIMESTAMPTZ NOT NULL,
//!     last_fire_at     TIMESTAMPTZ,
//!     enabled          BOOLEAN NOT NULL DEFAULT true
//! );
//! CREATE TABLE <schema>.timers (
//!     id        UUID PRIMARY KEY,
//!     topic     TEXT NOT NULL,
//!     payload   JSONB NOT NULL,
//!     due_time  TIMESTAMPTZ NOT NULL,
//!     status    TEXT NOT NULL DEFAULT 'ready'
//! );
//! ```

use chrono::{DateTime, Utc};
use coord_core::{Error, Job, Result, Timer, TimerStatus};
use coord_store::{LeaseFactory, OutboxStore};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration as StdDuration;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub lease_seconds: i64,
    pub batch_limit: i64,
    pub max_polling_interval: StdDuration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            lease_seconds: 30,
            batch_limit: 50,
            max_polling_interval: StdDuration::from_secs(30),
        }
    }
}

pub struct Scheduler {
    pool: PgPool,
    schema_name: String,
    outbox: OutboxStore,
    lease_factory: LeaseFactory,
    options: SchedulerOptions,
}

impl Scheduler {
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
            options: SchedulerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: SchedulerOptions) -> Self {
        self.options = options;
        self
    }

    fn jobs_table(&self) -> String {
        format!("{}.jobs", self.schema_name)
    }

    fn timers_table(&self) -> String {
        format!("{}.timers", self.schema_name)
    }

    /// One scheduler pass: fires every due job and timer exactly once,
    /// each inside the same transaction as its state advance, then
    /// returns how long the caller should sleep before the next pass.
    pub async fn run_once(&self) -> Result<StdDuration> {
        let lease = self
            .lease_factory
            .acquire(
                "scheduler",
                chrono::Duration::seconds(self.options.lease_seconds),
                None,
                None,
            )
            .await?;
        let Some(lease) = lease else {
            // Another instance holds the scheduler lease this pass.
            return Ok(self.options.max_polling_interval);
        };

        let now = Utc::now();

        for job in self.due_jobs(now).await? {
            self.fire_job(&job, now).await?;
        }
        for timer in self.due_timers(now).await? {
            self.fire_timer(&timer).await?;
        }

        self.lease_factory.release(&lease).await?;

        let next = self.earliest_upcoming().await?;
        Ok(sleep_hint(next, now, self.options.max_polling_interval))
    }

    async fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT id, topic, payload_template, cron, next_fire_at, last_fire_at, enabled
            FROM {table}
            WHERE enabled AND next_fire_at <= $1
            ORDER BY next_fire_at ASC
            LIMIT $2
            "#,
            table = self.jobs_table()
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(self.options.batch_limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Job {
                    id: row.try_get("id")?,
                    topic: row.try_get("topic")?,
                    payload_template: row.try_get("payload_template")?,
                    cron: row.try_get("cron")?,
                    next_fire_at: row.try_get("next_fire_at")?,
                    last_fire_at: row.try_get("last_fire_at")?,
                    enabled: row.try_get("enabled")?,
                })
            })
            .collect()
    }

    async fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<Timer>> {
        let sql = format!(
            r#"
            SELECT id, topic, payload, due_time, status
            FROM {table}
            WHERE status = 'ready' AND due_time <= $1
            ORDER BY due_time ASC
            LIMIT $2
            "#,
            table = self.timers_table()
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(self.options.batch_limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter()
            .map(|row| {
                let status_str: String = row.try_get("status")?;
                Ok(Timer {
                    id: row.try_get("id")?,
                    topic: row.try_get("topic")?,
                    payload: row.try_get("payload")?,
                    due_time: row.try_get("due_time")?,
                    status: match status_str.as_str() {
                        "ready" => TimerStatus::Ready,
                        "done" => TimerStatus::Done,
                        "cancelled" => TimerStatus::Cancelled,
                        other => {
                            return Err(Error::from(anyhow::anyhow!("unknown timer status `{other}`")))
                        }
                    },
                })
            })
            .collect()
    }

    /// Enqueues the job's payload and advances NextFireAt in the same
    /// transaction — the exactly-once-fire guarantee. Catch-up: if the
    /// system was down through several ticks, this collapses them into a
    /// single fire and jumps NextFireAt to the first tick strictly after
    /// both the old NextFireAt and `now`.
    async fn fire_job(&self, job: &Job, now: DateTime<Utc>) -> Result<()> {
        let next_fire_at = next_tick_after(&job.cron, job.next_fire_at, now)?;

        let mut tx = self.pool.begin().await?;
        self.outbox
            .enqueue(&job.topic, job.payload_template.clone(), None, Some(&mut tx))
            .await?;

        sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET next_fire_at = $2, last_fire_at = now()
            WHERE id = $1 AND next_fire_at = $3
            "#,
            table = self.jobs_table()
        ))
        .bind(job.id)
        .bind(next_fire_at)
        .bind(job.next_fire_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(
            event = "coord.scheduler.job_fired",
            job_id = %job.id,
            topic = %job.topic,
            next_fire_at = %next_fire_at
        );
        Ok(())
    }

    async fn fire_timer(&self, timer: &Timer) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        self.outbox
            .enqueue(&timer.topic, timer.payload.clone(), None, Some(&mut tx))
            .await?;

        sqlx::query(&format!(
            "UPDATE {table} SET status = 'done' WHERE id = $1 AND status = 'ready'",
            table = self.timers_table()
        ))
        .bind(timer.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::debug!(event = "coord.scheduler.timer_fired", timer_id = %timer.id, topic = %timer.topic);
        Ok(())
    }

    async fn earliest_upcoming(&self) -> Result<Option<DateTime<Utc>>> {
        let job_sql = format!(
            "SELECT MIN(next_fire_at) AS t FROM {table} WHERE enabled",
            table = self.jobs_table()
        );
        let timer_sql = format!(
            "SELECT MIN(due_time) AS t FROM {table} WHERE status = 'ready'",
            table = self.timers_table()
        );

        let job_row = sqlx::query(&job_sql).fetch_one(&self.pool).await?;
        let timer_row = sqlx::query(&timer_sql).fetch_one(&self.pool).await?;

        let job_t: Option<DateTime<Utc>> = job_row.try_get("t")?;
        let timer_t: Option<DateTime<Utc>> = timer_row.try_get("t")?;

        Ok(match (job_t, timer_t) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        })
    }
}

/// The least tick of `cron_expr` strictly greater than both
/// `previous_next_fire_at` and `now`. A bare 5-field crontab expression is
/// accepted by prefixing an implicit `0` seconds field.
fn next_tick_after(
    cron_expr: &str,
    previous_next_fire_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let schedule = parse_schedule(cron_expr)?;
    let mut candidate = schedule
        .after(&previous_next_fire_at)
        .next()
        .ok_or_else(|| Error::invalid_argument(format!("cron expression `{cron_expr}` has no future ticks")))?;

    while candidate <= now {
        candidate = schedule
            .after(&candidate)
            .next()
            .ok_or_else(|| Error::invalid_argument(format!("cron expression `{cron_expr}` has no future ticks")))?;
    }

    Ok(candidate)
}

fn parse_schedule(cron_expr: &str) -> Result<cron::Schedule> {
    let field_count = cron_expr.split_whitespace().count();
    let normalized = if field_count == 5 {
        format!("0 {cron_expr}")
    } else {
        cron_expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|err| Error::invalid_argument(format!("invalid cron expression `{cron_expr}`: {err}")))
}

fn sleep_hint(
    next: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    max_polling_interval: StdDuration,
) -> StdDuration {
    match next {
        None => max_polling_interval,
        Some(t) => {
            let millis = (t - now).num_milliseconds().max(0) as u64;
            StdDuration::from_millis(millis).min(max_polling_interval)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn catch_up_fires_once_and_jumps_past_missed_slots() {
        // Job was due every 5 minutes starting 00:00:00Z; the system comes
        // back up at 00:17:00Z having missed three ticks.
        let previous_next_fire_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 17, 0).unwrap();

        let next = next_tick_after("*/5 * * * *", previous_next_fire_at, now).unwrap();

        assert!(next > previous_next_fire_at);
        assert!(next > now);
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 20, 0).unwrap());
    }

    #[test]
    fn no_double_fire_when_already_caught_up() {
        let next_fire_at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();

        let next = next_tick_after("*/5 * * * *", next_fire_at, now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn bare_five_field_expression_is_accepted() {
        let schedule = parse_schedule("*/5 * * * *").unwrap();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let next = schedule.after(&start).next().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap());
    }
}
