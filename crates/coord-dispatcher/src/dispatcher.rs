//! The outbox/inbox dispatcher loop: claim a batch, route by topic,
//! translate the handler's outcome into a store transition. One generic
//! skeleton serves both store kinds via [`coord_core::WorkQueueStore`].

use crate::selection::SelectionStrategy;
use coord_core::{HandlerOutcome, HandlerResolver, Result, WorkQueueStore};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::watch;

/// One dispatcher pass's configuration. `max_attempts` governs the
/// poison-message conversion from Abandon to terminal Fail.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherOptions {
    pub lease_seconds: i64,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub poll_interval: StdDuration,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            lease_seconds: 30,
            batch_size: 20,
            max_attempts: 5,
            poll_interval: StdDuration::from_secs(2),
        }
    }
}

pub struct Dispatcher<S: WorkQueueStore> {
    stores: Vec<Arc<S>>,
    resolver: Arc<dyn HandlerResolver>,
    strategy: Arc<dyn SelectionStrategy>,
    options: DispatcherOptions,
}

impl<S: WorkQueueStore> Dispatcher<S> {
    pub fn new(
        stores: Vec<Arc<S>>,
        resolver: Arc<dyn HandlerResolver>,
        strategy: Arc<dyn SelectionStrategy>,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            stores,
            resolver,
            strategy,
            options,
        }
    }

    /// RunOnce(batchSize): selects a store via the configured strategy,
    /// claims a batch, dispatches each message to its handler, and
    /// translates the handler outcome into Ack/Abandon/Fail. Returns the
    /// count of messages processed in this pass.
    pub async fn run_once(&self) -> Result<usize> {
        if self.stores.is_empty() {
            return Ok(0);
        }

        let index = self.strategy.current(self.stores.len());
        let store = &self.stores[index];

        let claimed = store
            .claim_due(self.options.lease_seconds, self.options.batch_size)
            .await?;

        for message in &claimed {
            let delivery = S::to_delivery(message);
            let id = S::id_of(message);
            let retry_count = S::retry_count_of(message);
            let owner_token = match S::owner_token_of(message) {
                Some(token) => token,
                None => continue, // claimed row must always carry an owner; defensive skip
            };

            let outcome = match self.resolver.try_get(&delivery.topic) {
                Some(handler) => handler.handle(&delivery).await,
                None => HandlerOutcome::Permanent(format!("no handler for topic `{}`", delivery.topic)),
            };

            match outcome {
                HandlerOutcome::Success => {
                    store.ack(owner_token, &[id]).await?;
                    tracing::debug!(event = "coord.dispatcher.ack", topic = %delivery.topic, %id);
                }
                HandlerOutcome::Permanent(reason) => {
                    store.fail(owner_token, &[id], &reason).await?;
                    tracing::error!(event = "coord.dispatcher.fail", topic = %delivery.topic, %id, %reason);
                }
                HandlerOutcome::Transient(reason) => {
                    store
                        .abandon_or_fail(owner_token, id, retry_count, self.options.max_attempts, &reason)
                        .await?;
                    tracing::warn!(
                        event = "coord.dispatcher.abandon",
                        topic = %delivery.topic,
                        %id,
                        retry_count,
                        %reason
                    );
                }
            }
        }

        self.strategy.advance(claimed.len(), self.stores.len());
        Ok(claimed.len())
    }

    /// Runs `run_once` forever, sleeping `poll_interval` whenever a full
    /// rotation through every store returns nothing, until `shutdown`
    /// fires. Mirrors the teacher's `outbox_drain_loop`.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let processed = match self.run_once().await {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(event = "coord.dispatcher.pass_error", error = %err);
                    0
                }
            };

            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::RoundRobin;
    use async_trait::async_trait;
    use coord_core::{new_owner_token, Delivery, HandlerOutcome, OwnerToken};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Clone)]
    struct FakeMessage {
        id: Uuid,
        topic: String,
        retry_count: i32,
        owner_token: Option<OwnerToken>,
    }

    struct FakeStore {
        rows: Mutex<Vec<FakeMessage>>,
    }

    impl FakeStore {
        fn with_one_poison_row(topic: &str) -> Self {
            Self {
                rows: Mutex::new(vec![FakeMessage {
                    id: Uuid::new_v4(),
                    topic: topic.to_string(),
                    retry_count: 0,
                    owner_token: None,
                }]),
            }
        }
    }

    #[async_trait]
    impl WorkQueueStore for FakeStore {
        type Message = FakeMessage;

        fn id_of(message: &FakeMessage) -> Uuid {
            message.id
        }

        fn retry_count_of(message: &FakeMessage) -> i32 {
            message.retry_count
        }

        fn owner_token_of(message: &FakeMessage) -> Option<OwnerToken> {
            message.owner_token
        }

        fn to_delivery(message: &FakeMessage) -> Delivery {
            Delivery {
                id: message.id,
                topic: message.topic.clone(),
                payload: serde_json::json!({}),
                attempt: message.retry_count,
            }
        }

        async fn claim_due(&self, _lease_seconds: i64, batch_size: i64) -> Result<Vec<FakeMessage>> {
            let mut rows = self.rows.lock().unwrap();
            let owner = new_owner_token();
            let mut claimed = Vec::new();
            for row in rows.iter_mut() {
                if row.owner_token.is_none() && claimed.len() < batch_size as usize {
                    row.owner_token = Some(owner);
                    claimed.push(row.clone());
                }
            }
            Ok(claimed)
        }

        async fn ack(&self, _owner_token: OwnerToken, ids: &[Uuid]) -> Result<u64> {
            let mut rows = self.rows.lock().unwrap();
            rows.retain(|r| !ids.contains(&r.id));
            Ok(ids.len() as u64)
        }

        async fn fail(&self, _owner_token: OwnerToken, ids: &[Uuid], _error: &str) -> Result<u64> {
            let mut rows = self.rows.lock().unwrap();
            rows.retain(|r| !ids.contains(&r.id));
            Ok(ids.len() as u64)
        }

        async fn abandon_or_fail(
            &self,
            _owner_token: OwnerToken,
            id: Uuid,
            retry_count_before: i32,
            max_attempts: i32,
            _error: &str,
        ) -> Result<()> {
            let mut rows = self.rows.lock().unwrap();
            if retry_count_before + 1 > max_attempts {
                rows.retain(|r| r.id != id);
            } else if let Some(row) = rows.iter_mut().find(|r| r.id == id) {
                row.retry_count += 1;
                row.owner_token = None;
            }
            Ok(())
        }
    }

    struct AlwaysTransientResolver;

    impl HandlerResolver for AlwaysTransientResolver {
        fn try_get(&self, _topic: &str) -> Option<Arc<dyn coord_core::Handler>> {
            Some(Arc::new(|_delivery: Delivery| async move {
                HandlerOutcome::Transient("boom".to_string())
            }))
        }
    }

    #[tokio::test]
    async fn poison_message_becomes_terminal_after_max_attempts() {
        let store = Arc::new(FakeStore::with_one_poison_row("always.fails"));
        let dispatcher = Dispatcher::new(
            vec![store.clone()],
            Arc::new(AlwaysTransientResolver),
            Arc::new(RoundRobin::new()),
            DispatcherOptions {
                max_attempts: 3,
                ..Default::default()
            },
        );

        for _ in 0..3 {
            let processed = dispatcher.run_once().await.unwrap();
            assert_eq!(processed, 1);
        }

        let remaining = dispatcher.run_once().await.unwrap();
        assert_eq!(remaining, 0, "row must be terminal after max_attempts");
        assert!(store.rows.lock().unwrap().is_empty());
    }
}
