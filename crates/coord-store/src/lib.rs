//! Postgres-backed implementations of the work-queue engine: outbox,
//! inbox, and the lease/fencing subsystem. Every atomic transition is a
//! single SQL statement (or a single transaction for the lease acquire
//! path), grounded in the same `FOR UPDATE SKIP LOCKED` / `UPDATE ...
//! RETURNING` idioms the teacher crate uses for its task-claim queries.

mod backoff;
mod ident;
mod inbox;
mod lease;
mod outbox;

pub use backoff::BackoffPolicy;
pub use inbox::InboxStore;
pub use lease::{spawn_auto_renew, Lease, LeaseFactory};
pub use outbox::OutboxStore;
