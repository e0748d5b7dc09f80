//! Postgres-backed distributed leases with a monotone fencing token.
//!
//! # Schema assumption
//!
//! ```sql
//! CREATE TABLE <schema>.leases (
//!     resource_name  TEXT PRIMARY KEY,
//!     owner_token    UUID NOT NULL,
//!     fencing_token  BIGINT NOT NULL,
//!     lease_until_at TIMESTAMPTZ NOT NULL,
//!     context_json   JSONB
//! );
//! ```
//!
//! All comparisons use the database server's wall clock (`now()` in SQL),
//! never the caller's, so clock drift between workers cannot matter —
//! the same convention the teacher's `dispatcher.rs` uses for lease
//! expiry checks (`lease_expires_at > now()`).

use crate::ident::assert_valid_identifier;
use chrono::{DateTime, Utc};
use coord_core::{new_owner_token, Error, FencingToken, OwnerToken, Result};
use serde_json::Value;
use sqlx::{PgPool, Row};
use std::time::Duration as StdDuration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Lease {
    pub resource_name: String,
    pub owner_token: OwnerToken,
    pub fencing_token: FencingToken,
    pub lease_until_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LeaseFactory {
    pool: PgPool,
    schema_name: String,
}

impl LeaseFactory {
    pub fn new(pool: PgPool, schema_name: impl Into<String>) -> Self {
        let schema_name = schema_name.into();
        assert_valid_identifier(&schema_name);
        Self { pool, schema_name }
    }

    fn table(&self) -> String {
        format!("{}.leases", self.schema_name)
    }

    /// Acquire(name, duration, ownerToken?, contextJson?) -> Lease | none.
    ///
    /// Succeeds when the row is absent, expired, or already owned by the
    /// same owner token (reentrant extension). `FencingToken` always
    /// increments by exactly 1 on success.
    pub async fn acquire(
        &self,
        resource_name: &str,
        duration: chrono::Duration,
        owner_token: Option<OwnerToken>,
        context_json: Option<Value>,
    ) -> Result<Option<Lease>> {
        if resource_name.trim().is_empty() {
            return Err(Error::invalid_argument("resource_name must not be empty"));
        }
        let owner_token = owner_token.unwrap_or_else(new_owner_token);
        let duration_secs = duration.num_milliseconds() as f64 / 1000.0;

        let mut tx = self.pool.begin().await?;
        let table = self.table();

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO {table} (resource_name, owner_token, fencing_token, lease_until_at, context_json)
            VALUES ($1, $2, 1, now() + make_interval(secs => $3), $4)
            ON CONFLICT (resource_name) DO NOTHING
            RETURNING fencing_token, lease_until_at
            "#
        ))
        .bind(resource_name)
        .bind(owner_token)
        .bind(duration_secs)
        .bind(&context_json)
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = inserted {
            tx.commit().await?;
            return Ok(Some(Lease {
                resource_name: resource_name.to_string(),
                owner_token,
                fencing_token: row.try_get("fencing_token")?,
                lease_until_at: row.try_get("lease_until_at")?,
            }));
        }

        // Row already existed: succeed only if expired or same owner.
        let updated = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET owner_token = $2,
                fencing_token = fencing_token + 1,
                lease_until_at = now() + make_interval(secs => $3),
                context_json = COALESCE($4, context_json)
            WHERE resource_name = $1
              AND (lease_until_at <= now() OR owner_token = $2)
            RETURNING fencing_token, lease_until_at
            "#
        ))
        .bind(resource_name)
        .bind(owner_token)
        .bind(duration_secs)
        .bind(&context_json)
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(updated.map(|row| Lease {
            resource_name: resource_name.to_string(),
            owner_token,
            fencing_token: row.get("fencing_token"),
            lease_until_at: row.get("lease_until_at"),
        }))
    }

    /// Renew(lease) -> bool. Succeeds iff the row still shows the same
    /// owner. On success increments FencingToken and extends LeaseUntilAt.
    pub async fn renew(&self, lease: &Lease, duration: chrono::Duration) -> Result<Option<Lease>> {
        let duration_secs = duration.num_milliseconds() as f64 / 1000.0;
        let row = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET fencing_token = fencing_token + 1,
                lease_until_at = now() + make_interval(secs => $3)
            WHERE resource_name = $1 AND owner_token = $2
            RETURNING fencing_token, lease_until_at
            "#,
            table = self.table()
        ))
        .bind(&lease.resource_name)
        .bind(lease.owner_token)
        .bind(duration_secs)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Lease {
            resource_name: lease.resource_name.clone(),
            owner_token: lease.owner_token,
            fencing_token: row.get("fencing_token"),
            lease_until_at: row.get("lease_until_at"),
        }))
    }

    /// Release(lease): marks the row expired rather than deleting it, so
    /// `fencing_token` survives release and the next successful Acquire on
    /// this resource continues incrementing from it instead of resetting
    /// to 1 — deleting the row would lose the high-water fencing mark.
    pub async fn release(&self, lease: &Lease) -> Result<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET lease_until_at = now() - make_interval(secs => 1)
            WHERE resource_name = $1 AND owner_token = $2
            "#,
            table = self.table()
        ))
        .bind(&lease.resource_name)
        .bind(lease.owner_token)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Background auto-renew policy: renews at `renew_percent` of the lease
/// duration; two consecutive misses (or a single `renew` returning `None`)
/// transition the lease to Lost, signalled on `lost_rx`.
pub fn spawn_auto_renew(
    factory: LeaseFactory,
    mut lease: Lease,
    duration: chrono::Duration,
    renew_percent: f64,
) -> (watch::Receiver<bool>, JoinHandle<()>) {
    let (lost_tx, lost_rx) = watch::channel(false);
    let renew_percent = renew_percent.clamp(0.01, 0.99);
    let sleep_ms = (duration.num_milliseconds() as f64 * renew_percent).max(1.0) as u64;

    let handle = tokio::spawn(async move {
        let mut misses = 0u32;
        loop {
            tokio::time::sleep(StdDuration::from_millis(sleep_ms)).await;
            match factory.renew(&lease, duration).await {
                Ok(Some(renewed)) => {
                    lease = renewed;
                    misses = 0;
                }
                Ok(None) => {
                    misses += 1;
                    tracing::warn!(
                        event = "coord.lease.renew_miss",
                        resource_name = %lease.resource_name,
                        misses,
                        "lease renew did not match current owner"
                    );
                    if misses >= 2 {
                        let _ = lost_tx.send(true);
                        return;
                    }
                }
                Err(err) => {
                    misses += 1;
                    tracing::warn!(
                        event = "coord.lease.renew_error",
                        resource_name = %lease.resource_name,
                        error = %err,
                        "lease renew failed"
                    );
                    if misses >= 2 {
                        let _ = lost_tx.send(true);
                        return;
                    }
                }
            }
        }
    });

    (lost_rx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_struct_is_cloneable_and_debuggable() {
        let lease = Lease {
            resource_name: "scheduler".to_string(),
            owner_token: new_owner_token(),
            fencing_token: 1,
            lease_until_at: Utc::now(),
        };
        let cloned = lease.clone();
        assert_eq!(format!("{cloned:?}").contains("scheduler"), true);
    }
}
