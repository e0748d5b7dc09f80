//! One tenant's bundle of per-subsystem handles, addressed by a stable
//! identifier. Equality of two `Arc<TenantStore>` handles is by pointer,
//! not by value: the router's replace-on-spec-change semantics depends on
//! consumers observing object identity, not field equality.

use coord_store::{InboxStore, LeaseFactory, OutboxStore};
use sqlx::PgPool;

#[derive(Clone)]
pub struct TenantStore {
    pub identifier: String,
    pub connection_spec: String,
    pub schema_name: String,
    pub pool: PgPool,
    pub outbox: Option<OutboxStore>,
    pub inbox: Option<InboxStore>,
    pub lease_factory: Option<LeaseFactory>,
}

impl TenantStore {
    pub fn new(identifier: impl Into<String>, connection_spec: impl Into<String>, schema_name: impl Into<String>, pool: PgPool) -> Self {
        let schema_name = schema_name.into();
        Self {
            identifier: identifier.into(),
            connection_spec: connection_spec.into(),
            outbox: Some(OutboxStore::new(pool.clone(), schema_name.clone())),
            inbox: Some(InboxStore::new(pool.clone(), schema_name.clone())),
            lease_factory: Some(LeaseFactory::new(pool.clone(), schema_name.clone())),
            schema_name,
            pool,
        }
    }
}
