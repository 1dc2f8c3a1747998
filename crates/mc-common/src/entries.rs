//! Reliable-delivery entry types
//!
//! Rows persisted by the outbox, inbox, queue, and dead-letter stores.
//! The storage contracts move these between states; the types themselves
//! carry the status enums and transition predicates.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Envelope;

// ============================================================================
// Outbox
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Waiting for dispatch (or re-dispatch after a failure).
    Pending,
    /// Leased by a dispatcher worker.
    Publishing,
    /// Handed to the transport at least once.
    Published,
    /// Last attempt failed; will be retried after backoff.
    Failed,
    /// Retries exhausted; retained for manual inspection.
    DeadLettered,
}

impl OutboxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboxStatus::Published | OutboxStatus::DeadLettered)
    }
}

/// A store-and-forward row created inside the caller's transaction.
///
/// Each row carries its own retry policy so publishes with different
/// options coexist in one store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxEntry {
    pub id: Uuid,
    pub envelope: Envelope,
    pub destination: String,
    pub priority: i32,
    pub max_retries: u32,
    /// Fixed delay between attempts; exponential backoff when absent.
    pub retry_delay: Option<std::time::Duration>,
    pub created_at: DateTime<Utc>,
    pub status: OutboxStatus,
    pub attempt: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl OutboxEntry {
    pub fn new(envelope: Envelope, destination: &str, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            envelope,
            destination: destination.to_string(),
            priority,
            max_retries: 3,
            retry_delay: None,
            created_at: now,
            status: OutboxStatus::Pending,
            attempt: 0,
            next_attempt_at: now,
            last_error: None,
            lease_expires_at: None,
        }
    }

    pub fn from_options(envelope: Envelope, options: &crate::OutboxOptions) -> Self {
        let mut entry = Self::new(envelope, &options.destination, options.priority);
        entry.max_retries = options.max_retries;
        entry.retry_delay = options.retry_delay;
        entry
    }
}

// ============================================================================
// Inbox
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InboxStatus {
    Received,
    Processing,
    Processed,
    Failed,
}

/// Deduplication row keyed by `(message_id, source)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxEntry {
    pub message_id: Uuid,
    pub source: String,
    pub received_at: DateTime<Utc>,
    pub status: InboxStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempt: u32,
}

// ============================================================================
// Dead letters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterStatus {
    Active,
    Retried,
    Discarded,
    Expired,
}

impl DeadLetterStatus {
    /// Terminal entries never return to `Active`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeadLetterStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub envelope: Envelope,
    pub reason: String,
    /// Display form of the causing error.
    pub error: String,
    /// Stable error kind tag for statistics.
    pub error_kind: String,
    pub component: String,
    pub retry_count: u32,
    pub failure_time: DateTime<Utc>,
    pub status: DeadLetterStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Aggregate view over the dead-letter store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterStatistics {
    pub total: u64,
    pub active: u64,
    pub by_component: HashMap<String, u64>,
    pub by_reason: HashMap<String, u64>,
}

// ============================================================================
// Queue
// ============================================================================

/// A message persisted on a named queue.
///
/// Ready messages are leased ordered by priority descending, then
/// enqueue time ascending, then message id ascending for a deterministic
/// tie-break.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEnvelope {
    pub envelope: Envelope,
    pub queue_name: String,
    pub priority: i32,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub attempt: u32,
    pub lease_token: Option<Uuid>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl QueuedEnvelope {
    pub fn new(envelope: Envelope, queue_name: &str) -> Self {
        let now = Utc::now();
        Self {
            envelope,
            queue_name: queue_name.to_string(),
            priority: 0,
            enqueued_at: now,
            visible_at: now,
            attempt: 0,
            lease_token: None,
            lease_expires_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        match (self.lease_token, self.lease_expires_at) {
            (Some(_), Some(expires)) => expires > now,
            _ => false,
        }
    }
}

// ============================================================================
// Idempotency
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Success,
    Failure,
}

/// A cached handler outcome keyed by idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyResponse {
    pub key: String,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: IdempotencyStatus,
    pub success_data: Option<serde_json::Value>,
    pub failure_kind: Option<String>,
    pub failure_message: Option<String>,
}

impl IdempotencyResponse {
    /// A value read exactly at its expiry instant is already gone.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
