use crate::types::{HandlerOutcome, InboxMessage, OutboxMessage};
use crate::{OwnerToken, Result};
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// A single outbox or inbox message handed to a handler by the dispatcher.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: Uuid,
    pub topic: String,
    pub payload: Value,
    pub attempt: i32,
}

impl From<&OutboxMessage> for Delivery {
    fn from(m: &OutboxMessage) -> Self {
        Self {
            id: m.id,
            topic: m.topic.clone(),
            payload: m.payload.clone(),
            attempt: m.retry_count,
        }
    }
}

impl From<&InboxMessage> for Delivery {
    fn from(m: &InboxMessage) -> Self {
        Self {
            id: m.id,
            topic: m.topic.clone(),
            payload: m.payload.clone(),
            attempt: m.retry_count,
        }
    }
}

/// Generalizes the outbox and inbox stores behind the single skeleton
/// the dispatcher runs, per the outer spec's "two dispatchers, identical
/// skeleton" requirement.
#[async_trait]
pub trait WorkQueueStore: Send + Sync {
    type Message: Send + Sync + Clone;

    fn id_of(message: &Self::Message) -> Uuid;
    fn retry_count_of(message: &Self::Message) -> i32;
    fn owner_token_of(message: &Self::Message) -> Option<OwnerToken>;
    fn to_delivery(message: &Self::Message) -> Delivery;

    async fn claim_due(&self, lease_seconds: i64, batch_size: i64) -> Result<Vec<Self::Message>>;
    async fn ack(&self, owner_token: OwnerToken, ids: &[Uuid]) -> Result<u64>;
    async fn fail(&self, owner_token: OwnerToken, ids: &[Uuid], error: &str) -> Result<u64>;
    async fn abandon_or_fail(
        &self,
        owner_token: OwnerToken,
        id: Uuid,
        retry_count_before: i32,
        max_attempts: i32,
        error: &str,
    ) -> Result<()>;
}

/// A handler processes a single delivery and reports how it went.
///
/// Mirrors the teacher's `TryGet(topic) -> Handler` resolver pattern, but
/// expressed as a trait object so callers can register closures or full
/// structs uniformly.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerOutcome> + Send,
{
    async fn handle(&self, delivery: &Delivery) -> HandlerOutcome {
        (self)(delivery.clone()).await
    }
}

/// Resolves a handler by topic, case-insensitively.
pub trait HandlerResolver: Send + Sync {
    fn try_get(&self, topic: &str) -> Option<std::sync::Arc<dyn Handler>>;
}

/// A single-operation message broker sink: accept or reject an outbox
/// message for delivery to an external transport. Out of scope to
/// implement concretely; only the contract is fixed.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    async fn send_message(&self, message: &OutboxMessage) -> Result<bool>;
}

/// One discovered tenant database.
#[derive(Debug, Clone)]
pub struct DiscoveredDatabase {
    pub identifier: String,
    pub connection_spec: String,
    pub schema_name: String,
    pub enable_outbox: bool,
    pub enable_inbox: bool,
    pub enable_scheduler: bool,
}

/// Injected discovery operation for the dynamic store-provider strategy.
#[async_trait]
pub trait DatabaseDiscovery: Send + Sync {
    async fn discover_databases(&self) -> Result<Vec<DiscoveredDatabase>>;
}

/// Idempotent schema-ensure operations. Schema deployment SQL dialect is
/// out of scope; this trait only fixes the contract so the startup latch
/// has a real background step to register and release.
#[async_trait]
pub trait DatabaseSchemaManager: Send + Sync {
    async fn ensure_outbox_schema(&self, schema_name: &str) -> Result<()>;
    async fn ensure_inbox_schema(&self, schema_name: &str) -> Result<()>;
    async fn ensure_scheduler_schema(&self, schema_name: &str) -> Result<()>;
    async fn ensure_lease_schema(&self, schema_name: &str) -> Result<()>;
    async fn ensure_fanout_schema(&self, schema_name: &str) -> Result<()>;
}

/// A schema manager that assumes schema is already deployed (external,
/// pre-existing DDL per the outer spec's scope boundary) and treats every
/// ensure-call as a successful no-op.
pub struct AssumeSchemaDeployed;

#[async_trait]
impl DatabaseSchemaManager for AssumeSchemaDeployed {
    async fn ensure_outbox_schema(&self, _schema_name: &str) -> Result<()> {
        Ok(())
    }
    async fn ensure_inbox_schema(&self, _schema_name: &str) -> Result<()> {
        Ok(())
    }
    async fn ensure_scheduler_schema(&self, _schema_name: &str) -> Result<()> {
        Ok(())
    }
    async fn ensure_lease_schema(&self, _schema_name: &str) -> Result<()> {
        Ok(())
    }
    async fn ensure_fanout_schema(&self, _schema_name: &str) -> Result<()> {
        Ok(())
    }
}
