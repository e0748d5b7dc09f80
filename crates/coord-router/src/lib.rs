//! Tenant store provider: resolves a stable key to the bundle of
//! per-subsystem handles (outbox, inbox, lease factory) for that tenant's
//! database, either from a fixed configured list or a periodically
//! re-discovered one.

mod router;
mod tenant_store;

pub use router::{ConfiguredRouter, DynamicRouter, Router, TenantStoreFactory};
pub use tenant_store::TenantStore;
