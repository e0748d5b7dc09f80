use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque 128-bit value identifying the worker currently holding a claim.
///
/// Owner tokens MUST be freshly generated per run-once pass: the same
/// worker issuing successive claim passes rotates its token so a stale
/// claim from a previous pass cannot ack by accident.
pub type OwnerToken = Uuid;

pub fn new_owner_token() -> OwnerToken {
    Uuid::new_v4()
}

/// Strictly monotone counter issued per successful lease acquire/renew.
pub type FencingToken = i64;

/// Status of a work-queue row (outbox flavor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Ready,
    InProgress,
    Done,
    Failed,
}

impl OutboxStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            OutboxStatus::Ready => "ready",
            OutboxStatus::InProgress => "in_progress",
            OutboxStatus::Done => "done",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// Status of an inbox row. `Dead` plays the role the outbox's `Failed` plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Seen,
    Processing,
    Done,
    Dead,
}

impl InboxStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            InboxStatus::Seen => "seen",
            InboxStatus::Processing => "processing",
            InboxStatus::Done => "done",
            InboxStatus::Dead => "dead",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub due_time_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: DateTime<Utc>,
    pub owner_token: Option<OwnerToken>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    pub id: Uuid,
    pub source: String,
    pub message_id: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub hash: Option<Vec<u8>>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub attempts: i32,
    pub retry_count: i32,
    pub status: InboxStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub owner_token: Option<OwnerToken>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

/// Outcome of a pass-level claim/reap over the work-queue control columns.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct WorkQueueStats {
    pub ready: i64,
    pub in_progress: i64,
    pub done: i64,
    pub failed: i64,
}

/// Result of [`crate::traits::Handler::handle`].
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    /// Processed successfully; caller should Ack.
    Success,
    /// Unrecoverable; caller should Fail (terminal) regardless of attempt count.
    Permanent(String),
    /// Transient failure; caller should Abandon with backoff, converting to
    /// Fail once max attempts is exceeded.
    Transient(String),
}

/// A recurring scheduler entry. NextFireAt is always computed from the
/// previous NextFireAt (never from `now`), so a late scheduler pass never
/// drifts the cadence forward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub topic: String,
    pub payload_template: serde_json::Value,
    pub cron: String,
    pub next_fire_at: DateTime<Utc>,
    pub last_fire_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

/// A one-shot scheduler entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    Ready,
    Done,
    Cancelled,
}

impl TimerStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            TimerStatus::Ready => "ready",
            TimerStatus::Done => "done",
            TimerStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub due_time: DateTime<Utc>,
    pub status: TimerStatus,
}

/// Periodic fan-out policy: every tick of `cron` (or every whole
/// `default_every_seconds` boundary when `cron` is absent), enqueue one
/// slice message per configured shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutPolicy {
    pub fanout_topic: String,
    pub work_key: Option<String>,
    pub cron: Option<String>,
    pub default_every_seconds: i64,
    pub jitter_seconds: i64,
    pub lease_duration_seconds: i64,
    pub shard_count: i32,
}

/// Cursor tracking the last fanout window dispatched for (FanoutTopic, WorkKey).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutCursor {
    pub fanout_topic: String,
    pub work_key: Option<String>,
    pub last_window_start: DateTime<Utc>,
}
