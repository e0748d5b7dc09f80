use crate::config::CoordConfig;
use anyhow::Context;
use coord_core::{AssumeSchemaDeployed, DatabaseSchemaManager, StartupLatch};
use coord_dispatcher::{Dispatcher, DispatcherOptions, FanoutEngine, MapHandlerResolver, RoundRobin, Scheduler, SchedulerOptions};
use coord_store::{InboxStore, LeaseFactory, OutboxStore};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Runs the dispatcher, scheduler, and fanout loops concurrently until a
/// shutdown signal (ctrl-c) arrives. Background workers wait on the
/// startup latch before their first pass, the way §4.9 requires.
pub async fn run(cfg: &CoordConfig) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&cfg.tenant_database_url)
        .await
        .context("connect tenant db")?;

    let latch = StartupLatch::new();
    let mut handle = latch.register("ensure_tenant_schema");
    let schema_manager = AssumeSchemaDeployed;
    schema_manager
        .ensure_outbox_schema(&cfg.tenant_schema_name)
        .await
        .context("ensure outbox schema")?;
    schema_manager
        .ensure_inbox_schema(&cfg.tenant_schema_name)
        .await
        .context("ensure inbox schema")?;
    schema_manager
        .ensure_lease_schema(&cfg.tenant_schema_name)
        .await
        .context("ensure lease schema")?;
    schema_manager
        .ensure_scheduler_schema(&cfg.tenant_schema_name)
        .await
        .context("ensure scheduler schema")?;
    schema_manager
        .ensure_fanout_schema(&cfg.tenant_schema_name)
        .await
        .context("ensure fanout schema")?;
    handle.release();

    let outbox = OutboxStore::new(pool.clone(), cfg.tenant_schema_name.clone());
    let inbox = InboxStore::new(pool.clone(), cfg.tenant_schema_name.clone());
    let lease_factory = LeaseFactory::new(pool.clone(), cfg.tenant_schema_name.clone());

    let resolver: Arc<dyn coord_core::HandlerResolver> = Arc::new(MapHandlerResolver::new());

    let outbox_dispatcher = Dispatcher::new(
        vec![Arc::new(outbox.clone())],
        resolver.clone(),
        Arc::new(RoundRobin::new()),
        DispatcherOptions {
            lease_seconds: cfg.dispatcher_lease_seconds,
            batch_size: cfg.dispatcher_batch_size,
            max_attempts: cfg.dispatcher_max_attempts,
            poll_interval: cfg.dispatcher_poll_interval(),
        },
    );

    let inbox_dispatcher = Dispatcher::new(
        vec![Arc::new(inbox.clone())],
        resolver,
        Arc::new(RoundRobin::new()),
        DispatcherOptions {
            lease_seconds: cfg.dispatcher_lease_seconds,
            batch_size: cfg.dispatcher_batch_size,
            max_attempts: cfg.dispatcher_max_attempts,
            poll_interval: cfg.dispatcher_poll_interval(),
        },
    );

    let scheduler = Scheduler::new(pool.clone(), cfg.tenant_schema_name.clone(), outbox.clone(), lease_factory.clone())
        .with_options(SchedulerOptions {
            lease_seconds: cfg.scheduler_lease_seconds,
            batch_limit: 50,
            max_polling_interval: cfg.scheduler_max_polling_interval(),
        });

    let fanout = FanoutEngine::new(pool.clone(), cfg.tenant_schema_name.clone(), outbox, lease_factory);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let outbox_task = tokio::spawn(run_dispatcher_loop(outbox_dispatcher, shutdown_rx.clone()));
    let inbox_task = tokio::spawn(run_dispatcher_loop(inbox_dispatcher, shutdown_rx.clone()));
    let scheduler_task = tokio::spawn(run_scheduler_loop(scheduler, shutdown_rx.clone()));
    let fanout_task = tokio::spawn(run_fanout_loop(fanout, cfg.fanout_poll_interval(), shutdown_rx));

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    tracing::info!(event = "coord.coordd.shutdown_requested");
    let _ = shutdown_tx.send(true);

    let _ = tokio::join!(outbox_task, inbox_task, scheduler_task, fanout_task);
    Ok(())
}

async fn run_dispatcher_loop<S: coord_core::WorkQueueStore>(
    dispatcher: Dispatcher<S>,
    shutdown: watch::Receiver<bool>,
) {
    dispatcher.run_forever(shutdown).await;
}

async fn run_scheduler_loop(scheduler: Scheduler, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        let sleep_hint = match scheduler.run_once().await {
            Ok(duration) => duration,
            Err(err) => {
                tracing::error!(event = "coord.coordd.scheduler.pass_error", error = %err);
                Duration::from_secs(5)
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(sleep_hint) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn run_fanout_loop(fanout: FanoutEngine, poll_interval: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if let Err(err) = fanout.run_once().await {
            tracing::error!(event = "coord.coordd.fanout.pass_error", error = %err);
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
