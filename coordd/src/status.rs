use crate::config::CoordConfig;
use anyhow::Context;
use coord_core::WorkQueueStats;
use coord_store::{InboxStore, LeaseFactory, OutboxStore};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;

#[derive(Debug, Serialize)]
struct StatusReport {
    outbox: WorkQueueStatsView,
    inbox: WorkQueueStatsView,
}

#[derive(Debug, Serialize)]
struct WorkQueueStatsView {
    ready: i64,
    in_progress: i64,
    done: i64,
    failed: i64,
}

impl From<WorkQueueStats> for WorkQueueStatsView {
    fn from(stats: WorkQueueStats) -> Self {
        Self {
            ready: stats.ready,
            in_progress: stats.in_progress,
            done: stats.done,
            failed: stats.failed,
        }
    }
}

/// Prints a per-store WorkQueue snapshot as JSON, mirroring the teacher's
/// `status` subcommand.
pub async fn run(cfg: &CoordConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.tenant_database_url)
        .await
        .context("connect tenant db")?;

    let outbox = OutboxStore::new(pool.clone(), cfg.tenant_schema_name.clone());
    let inbox = InboxStore::new(pool.clone(), cfg.tenant_schema_name.clone());
    let _lease_factory = LeaseFactory::new(pool, cfg.tenant_schema_name.clone());

    let report = StatusReport {
        outbox: outbox.stats().await.context("query outbox stats")?.into(),
        inbox: inbox.stats().await.context("query inbox stats")?.into(),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
