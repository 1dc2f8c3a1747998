//! In-memory storage backend
//!
//! One mutex per collection; every operation is a short critical section
//! and enumerations snapshot before returning. Transactions are no-op
//! scopes. Lease and TTL bookkeeping happens inline on access, so expired
//! leases return to the pool and expired messages read as deleted without
//! a background sweeper.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mc_common::{
    DeadLetterEntry, DeadLetterStatistics, DeadLetterStatus, Envelope, InboxEntry, InboxStatus,
    OutboxEntry, OutboxStatus, QueuedEnvelope,
};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::contracts::{
    DeadLetterStore, InboxClaim, InboxStore, MessageQuery, MessageStore, OutboxStore, QueryOrder,
    QueueStore, Storage, StorageTransaction,
};
use crate::{Result, StorageError};

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36500))
}

#[derive(Debug, Clone)]
struct StoredEnvelope {
    envelope: Envelope,
    stored_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredEnvelope {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// The default, fully in-process backend.
#[derive(Default)]
pub struct MemoryStorage {
    messages: Mutex<HashMap<Uuid, StoredEnvelope>>,
    outbox: Mutex<HashMap<Uuid, OutboxEntry>>,
    inbox: Mutex<HashMap<(Uuid, String), InboxEntry>>,
    queues: Mutex<HashMap<String, Vec<QueuedEnvelope>>>,
    dead_letters: Mutex<HashMap<Uuid, DeadLetterEntry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

// ============================================================================
// MessageStore
// ============================================================================

#[async_trait]
impl MessageStore for MemoryStorage {
    async fn store(&self, envelope: Envelope, ttl: Option<Duration>) -> Result<()> {
        let now = Utc::now();
        let stored = StoredEnvelope {
            expires_at: ttl.map(|t| now + to_chrono(t)),
            stored_at: now,
            envelope,
        };
        self.messages
            .lock()
            .insert(stored.envelope.message_id, stored);
        Ok(())
    }

    async fn retrieve(&self, message_id: Uuid) -> Result<Option<Envelope>> {
        let now = Utc::now();
        let mut messages = self.messages.lock();
        match messages.get(&message_id) {
            Some(stored) if stored.is_expired(now) => {
                messages.remove(&message_id);
                Ok(None)
            }
            Some(stored) => Ok(Some(stored.envelope.clone())),
            None => Ok(None),
        }
    }

    async fn query(&self, query: MessageQuery) -> Result<Vec<Envelope>> {
        let now = Utc::now();
        let mut snapshot: Vec<StoredEnvelope> = {
            let mut messages = self.messages.lock();
            messages.retain(|_, stored| !stored.is_expired(now));
            messages.values().cloned().collect()
        };

        snapshot.retain(|stored| {
            query
                .message_type
                .as_deref()
                .map(|t| stored.envelope.message_type == t)
                .unwrap_or(true)
                && query
                    .kind
                    .map(|k| stored.envelope.kind == k)
                    .unwrap_or(true)
        });

        // Equal timestamps order by id for a stable result.
        snapshot.sort_by(|a, b| {
            let ordering = a
                .envelope
                .occurred_at
                .cmp(&b.envelope.occurred_at)
                .then_with(|| a.envelope.message_id.cmp(&b.envelope.message_id));
            match query.order {
                QueryOrder::TimestampAsc => ordering,
                QueryOrder::TimestampDesc => ordering.reverse(),
            }
        });

        if let Some(limit) = query.limit {
            snapshot.truncate(limit);
        }

        Ok(snapshot.into_iter().map(|s| s.envelope).collect())
    }

    async fn update(&self, envelope: Envelope) -> Result<bool> {
        let now = Utc::now();
        let mut messages = self.messages.lock();
        match messages.get_mut(&envelope.message_id) {
            Some(stored) if !stored.is_expired(now) => {
                stored.envelope = envelope;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, message_id: Uuid) -> Result<bool> {
        Ok(self.messages.lock().remove(&message_id).is_some())
    }

    async fn exists(&self, message_id: Uuid) -> Result<bool> {
        let now = Utc::now();
        Ok(self
            .messages
            .lock()
            .get(&message_id)
            .map(|stored| !stored.is_expired(now))
            .unwrap_or(false))
    }

    async fn count(&self) -> Result<u64> {
        let now = Utc::now();
        let mut messages = self.messages.lock();
        messages.retain(|_, stored| !stored.is_expired(now));
        Ok(messages.len() as u64)
    }

    async fn clear(&self) -> Result<()> {
        self.messages.lock().clear();
        Ok(())
    }
}

// ============================================================================
// OutboxStore
// ============================================================================

#[async_trait]
impl OutboxStore for MemoryStorage {
    async fn add(&self, entry: OutboxEntry) -> Result<()> {
        self.outbox.lock().insert(entry.id, entry);
        Ok(())
    }

    async fn lease_ready(&self, max: usize, lease_for: Duration) -> Result<Vec<OutboxEntry>> {
        let now = Utc::now();
        let mut outbox = self.outbox.lock();

        // Expired leases first return to Pending.
        for entry in outbox.values_mut() {
            if entry.status == OutboxStatus::Publishing {
                let expired = entry
                    .lease_expires_at
                    .map(|at| at <= now)
                    .unwrap_or(true);
                if expired {
                    debug!(entry_id = %entry.id, "Outbox lease expired, returning to pending");
                    entry.status = OutboxStatus::Pending;
                    entry.lease_expires_at = None;
                }
            }
        }

        let mut ready: Vec<Uuid> = outbox
            .values()
            .filter(|e| e.status == OutboxStatus::Pending && e.next_attempt_at <= now)
            .map(|e| e.id)
            .collect();

        ready.sort_by(|a, b| {
            let ea = &outbox[a];
            let eb = &outbox[b];
            eb.priority
                .cmp(&ea.priority)
                .then_with(|| ea.created_at.cmp(&eb.created_at))
                .then_with(|| ea.id.cmp(&eb.id))
        });
        ready.truncate(max);

        let lease_until = now + to_chrono(lease_for);
        let mut leased = Vec::with_capacity(ready.len());
        for id in ready {
            if let Some(entry) = outbox.get_mut(&id) {
                entry.status = OutboxStatus::Publishing;
                entry.lease_expires_at = Some(lease_until);
                leased.push(entry.clone());
            }
        }
        Ok(leased)
    }

    async fn mark_published(&self, id: Uuid) -> Result<()> {
        let mut outbox = self.outbox.lock();
        let entry = outbox
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        entry.status = OutboxStatus::Published;
        entry.lease_expires_at = None;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, retry_after: Duration, error: &str) -> Result<()> {
        let now = Utc::now();
        let mut outbox = self.outbox.lock();
        let entry = outbox
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        entry.status = OutboxStatus::Pending;
        entry.attempt += 1;
        entry.next_attempt_at = now + to_chrono(retry_after);
        entry.last_error = Some(error.to_string());
        entry.lease_expires_at = None;
        Ok(())
    }

    async fn mark_dead_lettered(&self, id: Uuid, error: &str) -> Result<()> {
        let mut outbox = self.outbox.lock();
        let entry = outbox
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        entry.status = OutboxStatus::DeadLettered;
        entry.last_error = Some(error.to_string());
        entry.lease_expires_at = None;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEntry>> {
        Ok(self.outbox.lock().get(&id).cloned())
    }

    async fn pending_count(&self) -> Result<u64> {
        Ok(self
            .outbox
            .lock()
            .values()
            .filter(|e| matches!(e.status, OutboxStatus::Pending | OutboxStatus::Publishing))
            .count() as u64)
    }

    async fn list_dead_lettered(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let outbox = self.outbox.lock();
        let mut entries: Vec<OutboxEntry> = outbox
            .values()
            .filter(|e| e.status == OutboxStatus::DeadLettered)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn purge_terminal(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now() - to_chrono(older_than);
        let mut outbox = self.outbox.lock();
        let before = outbox.len();
        outbox.retain(|_, e| !(e.status.is_terminal() && e.created_at < cutoff));
        Ok((before - outbox.len()) as u64)
    }
}

// ============================================================================
// InboxStore
// ============================================================================

#[async_trait]
impl InboxStore for MemoryStorage {
    async fn try_claim(
        &self,
        message_id: Uuid,
        source: &str,
        window: Duration,
    ) -> Result<InboxClaim> {
        let now = Utc::now();
        let window_start = now - to_chrono(window);
        let key = (message_id, source.to_string());
        let mut inbox = self.inbox.lock();

        match inbox.get_mut(&key) {
            Some(entry) if entry.received_at >= window_start => match entry.status {
                InboxStatus::Processed => Ok(InboxClaim::AlreadyProcessed),
                InboxStatus::Processing => Ok(InboxClaim::AlreadyProcessing),
                InboxStatus::Received | InboxStatus::Failed => {
                    entry.status = InboxStatus::Processing;
                    entry.attempt += 1;
                    Ok(InboxClaim::New)
                }
            },
            _ => {
                // Absent, or the prior sighting fell out of the window.
                inbox.insert(
                    key,
                    InboxEntry {
                        message_id,
                        source: source.to_string(),
                        received_at: now,
                        status: InboxStatus::Processing,
                        processed_at: None,
                        attempt: 1,
                    },
                );
                Ok(InboxClaim::New)
            }
        }
    }

    async fn mark_processed(&self, message_id: Uuid, source: &str) -> Result<()> {
        let key = (message_id, source.to_string());
        let mut inbox = self.inbox.lock();
        let entry = inbox
            .get_mut(&key)
            .ok_or_else(|| StorageError::NotFound(message_id.to_string()))?;
        entry.status = InboxStatus::Processed;
        entry.processed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, message_id: Uuid, source: &str) -> Result<()> {
        let key = (message_id, source.to_string());
        let mut inbox = self.inbox.lock();
        let entry = inbox
            .get_mut(&key)
            .ok_or_else(|| StorageError::NotFound(message_id.to_string()))?;
        entry.status = InboxStatus::Failed;
        Ok(())
    }

    async fn get(&self, message_id: Uuid, source: &str) -> Result<Option<InboxEntry>> {
        let key = (message_id, source.to_string());
        Ok(self.inbox.lock().get(&key).cloned())
    }

    async fn purge_expired(&self, window: Duration) -> Result<u64> {
        let window_start = Utc::now() - to_chrono(window);
        let mut inbox = self.inbox.lock();
        let before = inbox.len();
        inbox.retain(|_, entry| entry.received_at >= window_start);
        Ok((before - inbox.len()) as u64)
    }
}

// ============================================================================
// QueueStore
// ============================================================================

#[async_trait]
impl QueueStore for MemoryStorage {
    async fn enqueue(&self, message: QueuedEnvelope) -> Result<()> {
        self.queues
            .lock()
            .entry(message.queue_name.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn lease_ready(
        &self,
        queue_name: &str,
        max: usize,
        lease_for: Duration,
    ) -> Result<Vec<QueuedEnvelope>> {
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(queue_name) else {
            return Ok(Vec::new());
        };

        let mut ready: Vec<usize> = queue
            .iter()
            .enumerate()
            .filter(|(_, m)| m.visible_at <= now && !m.is_leased(now))
            .map(|(i, _)| i)
            .collect();

        ready.sort_by(|&a, &b| {
            let ma = &queue[a];
            let mb = &queue[b];
            mb.priority
                .cmp(&ma.priority)
                .then_with(|| ma.enqueued_at.cmp(&mb.enqueued_at))
                .then_with(|| ma.envelope.message_id.cmp(&mb.envelope.message_id))
        });
        ready.truncate(max);

        let lease_until = now + to_chrono(lease_for);
        let mut leased = Vec::with_capacity(ready.len());
        for index in ready {
            let message = &mut queue[index];
            message.lease_token = Some(Uuid::new_v4());
            message.lease_expires_at = Some(lease_until);
            leased.push(message.clone());
        }
        Ok(leased)
    }

    async fn acknowledge(&self, queue_name: &str, lease_token: Uuid) -> Result<bool> {
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(queue_name) else {
            return Ok(false);
        };
        let before = queue.len();
        queue.retain(|m| !(m.lease_token == Some(lease_token) && m.is_leased(now)));
        Ok(queue.len() != before)
    }

    async fn extend_lease(
        &self,
        queue_name: &str,
        lease_token: Uuid,
        extend_by: Duration,
    ) -> Result<bool> {
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(queue_name) else {
            return Ok(false);
        };
        for message in queue.iter_mut() {
            if message.lease_token == Some(lease_token) && message.is_leased(now) {
                message.lease_expires_at = Some(now + to_chrono(extend_by));
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn requeue(&self, queue_name: &str, lease_token: Uuid, delay: Duration) -> Result<bool> {
        let now = Utc::now();
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(queue_name) else {
            return Ok(false);
        };
        for message in queue.iter_mut() {
            if message.lease_token == Some(lease_token) {
                message.attempt += 1;
                message.visible_at = now + to_chrono(delay);
                message.lease_token = None;
                message.lease_expires_at = None;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn take(&self, queue_name: &str, lease_token: Uuid) -> Result<Option<QueuedEnvelope>> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(queue_name) else {
            return Ok(None);
        };
        let position = queue.iter().position(|m| m.lease_token == Some(lease_token));
        Ok(position.map(|i| queue.remove(i)))
    }

    async fn depth(&self, queue_name: &str) -> Result<u64> {
        Ok(self
            .queues
            .lock()
            .get(queue_name)
            .map(|q| q.len() as u64)
            .unwrap_or(0))
    }

    async fn queue_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.queues.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

// ============================================================================
// DeadLetterStore
// ============================================================================

#[async_trait]
impl DeadLetterStore for MemoryStorage {
    async fn add(&self, entry: DeadLetterEntry) -> Result<()> {
        self.dead_letters.lock().insert(entry.id, entry);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        Ok(self.dead_letters.lock().get(&id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        let dead_letters = self.dead_letters.lock();
        let mut entries: Vec<DeadLetterEntry> = dead_letters.values().cloned().collect();
        entries.sort_by(|a, b| {
            a.failure_time
                .cmp(&b.failure_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        entries.truncate(limit);
        Ok(entries)
    }

    async fn mark(&self, id: Uuid, status: DeadLetterStatus) -> Result<()> {
        let mut dead_letters = self.dead_letters.lock();
        let entry = dead_letters
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if entry.status.is_terminal() {
            return Err(StorageError::InvalidTransition(format!(
                "dead letter {} is already {:?}",
                id, entry.status
            )));
        }
        entry.status = status;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.dead_letters.lock().len() as u64)
    }

    async fn statistics(&self) -> Result<DeadLetterStatistics> {
        let dead_letters = self.dead_letters.lock();
        let mut stats = DeadLetterStatistics {
            total: dead_letters.len() as u64,
            ..Default::default()
        };
        for entry in dead_letters.values() {
            if entry.status == DeadLetterStatus::Active {
                stats.active += 1;
            }
            *stats.by_component.entry(entry.component.clone()).or_insert(0) += 1;
            *stats.by_reason.entry(entry.reason.clone()).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

// ============================================================================
// Storage aggregate
// ============================================================================

/// No-op scope satisfying the transactional contract for memory.
struct NoopTransaction;

#[async_trait]
impl StorageTransaction for NoopTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn messages(&self) -> &dyn MessageStore {
        self
    }

    fn outbox(&self) -> &dyn OutboxStore {
        self
    }

    fn inbox(&self) -> &dyn InboxStore {
        self
    }

    fn queues(&self) -> &dyn QueueStore {
        self
    }

    fn dead_letters(&self) -> &dyn DeadLetterStore {
        self
    }

    async fn begin_transaction(&self) -> Result<Box<dyn StorageTransaction>> {
        Ok(Box::new(NoopTransaction))
    }
}
