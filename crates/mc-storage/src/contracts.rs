//! Storage contracts
//!
//! The traits the core consumes. Semantics that every backend must honor:
//! - Leased items are invisible to other pollers until lease expiry or ack.
//! - TTL-expired items behave as deleted on subsequent reads.
//! - Ready ordering is priority descending, then creation/enqueue time
//!   ascending, then id ascending as the deterministic tie-break.

use std::time::Duration;

use async_trait::async_trait;
use mc_common::{
    DeadLetterEntry, DeadLetterStatistics, DeadLetterStatus, Envelope, InboxEntry,
    MessageKind, OutboxEntry, QueuedEnvelope,
};
use uuid::Uuid;

use crate::Result;

// ============================================================================
// Message store
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOrder {
    /// Timestamp ascending; equal timestamps order by id.
    #[default]
    TimestampAsc,
    TimestampDesc,
}

#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub message_type: Option<String>,
    pub kind: Option<MessageKind>,
    pub limit: Option<usize>,
    pub order: QueryOrder,
}

/// General-purpose envelope persistence.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Store an envelope, optionally expiring after `ttl`.
    async fn store(&self, envelope: Envelope, ttl: Option<Duration>) -> Result<()>;

    async fn retrieve(&self, message_id: Uuid) -> Result<Option<Envelope>>;

    async fn query(&self, query: MessageQuery) -> Result<Vec<Envelope>>;

    /// Replace a stored envelope; false when absent or expired.
    async fn update(&self, envelope: Envelope) -> Result<bool>;

    async fn delete(&self, message_id: Uuid) -> Result<bool>;

    async fn exists(&self, message_id: Uuid) -> Result<bool>;

    async fn count(&self) -> Result<u64>;

    async fn clear(&self) -> Result<()>;
}

// ============================================================================
// Outbox store
// ============================================================================

#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Persist a new entry. Callers bind this to their unit of work via
    /// the transactional scope on [`Storage`].
    async fn add(&self, entry: OutboxEntry) -> Result<()>;

    /// Lease up to `max` pending entries whose `next_attempt_at` has
    /// passed, marking them `Publishing` until `lease_for` elapses.
    /// Expired `Publishing` leases are first returned to `Pending`.
    async fn lease_ready(&self, max: usize, lease_for: Duration) -> Result<Vec<OutboxEntry>>;

    async fn mark_published(&self, id: Uuid) -> Result<()>;

    /// Record a transient failure: attempt += 1, back to `Pending`,
    /// eligible again after `retry_after`.
    async fn mark_failed(&self, id: Uuid, retry_after: Duration, error: &str) -> Result<()>;

    /// Terminal failure: retained with status `DeadLettered`.
    async fn mark_dead_lettered(&self, id: Uuid, error: &str) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>>;

    async fn pending_count(&self) -> Result<u64>;

    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Retention sweep over `Published` and `DeadLettered` rows older
    /// than the window. Returns the number removed.
    async fn purge_terminal(&self, older_than: Duration) -> Result<u64>;
}

// ============================================================================
// Inbox store
// ============================================================================

/// Outcome of an atomic inbox claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxClaim {
    /// First sighting inside the window; the row is now `Processing`.
    New,
    /// Another worker holds the claim.
    AlreadyProcessing,
    /// Already processed inside the window.
    AlreadyProcessed,
}

#[async_trait]
pub trait InboxStore: Send + Sync {
    /// Atomically claim `(message_id, source)` within the dedup window.
    async fn try_claim(
        &self,
        message_id: Uuid,
        source: &str,
        window: Duration,
    ) -> Result<InboxClaim>;

    async fn mark_processed(&self, message_id: Uuid, source: &str) -> Result<()>;

    async fn mark_failed(&self, message_id: Uuid, source: &str) -> Result<()>;

    async fn get(&self, message_id: Uuid, source: &str) -> Result<Option<InboxEntry>>;

    /// Drop entries older than the window. Returns the number removed.
    async fn purge_expired(&self, window: Duration) -> Result<u64>;
}

// ============================================================================
// Queue store
// ============================================================================

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(&self, message: QueuedEnvelope) -> Result<()>;

    /// Lease up to `max` visible messages from the named queue, ordered
    /// by priority desc, enqueue time asc, id asc.
    async fn lease_ready(
        &self,
        queue_name: &str,
        max: usize,
        lease_for: Duration,
    ) -> Result<Vec<QueuedEnvelope>>;

    /// Delete a leased message; false when the lease is no longer held.
    async fn acknowledge(&self, queue_name: &str, lease_token: Uuid) -> Result<bool>;

    async fn extend_lease(
        &self,
        queue_name: &str,
        lease_token: Uuid,
        extend_by: Duration,
    ) -> Result<bool>;

    /// Release a leased message for retry: attempt += 1, visible again
    /// after `delay`.
    async fn requeue(&self, queue_name: &str, lease_token: Uuid, delay: Duration) -> Result<bool>;

    /// Remove a leased message and hand it back (dead-letter path).
    async fn take(&self, queue_name: &str, lease_token: Uuid) -> Result<Option<QueuedEnvelope>>;

    async fn depth(&self, queue_name: &str) -> Result<u64>;

    async fn queue_names(&self) -> Result<Vec<String>>;
}

// ============================================================================
// Dead-letter store
// ============================================================================

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn add(&self, entry: DeadLetterEntry) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>>;

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>>;

    /// Apply a status change. Terminal entries are immutable: the call
    /// returns `InvalidTransition` rather than resurrecting them.
    async fn mark(&self, id: Uuid, status: DeadLetterStatus) -> Result<()>;

    async fn count(&self) -> Result<u64>;

    async fn statistics(&self) -> Result<DeadLetterStatistics>;
}

// ============================================================================
// Aggregate + transactions
// ============================================================================

/// Handle to an open transactional scope.
///
/// Backends without real transactions return a scope whose commit and
/// rollback are no-ops; the contract is still satisfied because callers
/// sequence their writes through it.
#[async_trait]
pub trait StorageTransaction: Send {
    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// A complete storage backend.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    fn messages(&self) -> &dyn MessageStore;

    fn outbox(&self) -> &dyn OutboxStore;

    fn inbox(&self) -> &dyn InboxStore;

    fn queues(&self) -> &dyn QueueStore;

    fn dead_letters(&self) -> &dyn DeadLetterStore;

    async fn begin_transaction(&self) -> Result<Box<dyn StorageTransaction>>;
}
