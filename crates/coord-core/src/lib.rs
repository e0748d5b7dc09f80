//! Shared types, traits, and process-local primitives for the coordination
//! platform: the error taxonomy, owner/fencing token types, handler and
//! broker contracts, the startup latch, and the metric aggregator.
//!
//! Subsystem crates (`coord-store`, `coord-dispatcher`, `coord-router`) and
//! the `coordd` binary all depend on this crate rather than redefining
//! these pieces.

mod error;
mod latch;
mod metrics;
mod traits;
mod types;

pub use error::{Error, ErrorKind, Result};
pub use latch::{LatchHandle, StartupLatch};
pub use metrics::{MetricAggregator, MetricRegistry, MetricSnapshot};
pub use traits::{
    AssumeSchemaDeployed, DatabaseDiscovery, DatabaseSchemaManager, Delivery, DiscoveredDatabase,
    Handler, HandlerResolver, MessageBroker, WorkQueueStore,
};
pub use types::{
    new_owner_token, FanoutCursor, FanoutPolicy, FencingToken, HandlerOutcome, InboxMessage,
    InboxStatus, Job, OutboxMessage, OutboxStatus, OwnerToken, Timer, TimerStatus, WorkQueueStats,
};
