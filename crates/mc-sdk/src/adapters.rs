//! Storage and transport adapters
//!
//! The processors want narrow trait objects (`OutboxStore`,
//! `DeadLetterStore`, `OutboxPublisher`); the facade holds the aggregate
//! `Storage` and `Transport`. These wrappers delegate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mc_common::{DeadLetterEntry, DeadLetterStatistics, DeadLetterStatus, Envelope, OutboxEntry};
use mc_outbox::OutboxPublisher;
use mc_storage::{DeadLetterStore, OutboxStore, Storage};
use mc_transport::Transport;
use uuid::Uuid;

pub(crate) struct StorageOutbox(pub Arc<dyn Storage>);

#[async_trait]
impl OutboxStore for StorageOutbox {
    async fn add(&self, entry: OutboxEntry) -> mc_storage::Result<()> {
        self.0.outbox().add(entry).await
    }

    async fn lease_ready(
        &self,
        max: usize,
        lease_for: Duration,
    ) -> mc_storage::Result<Vec<OutboxEntry>> {
        self.0.outbox().lease_ready(max, lease_for).await
    }

    async fn mark_published(&self, id: Uuid) -> mc_storage::Result<()> {
        self.0.outbox().mark_published(id).await
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        retry_after: Duration,
        error: &str,
    ) -> mc_storage::Result<()> {
        self.0.outbox().mark_failed(id, retry_after, error).await
    }

    async fn mark_dead_lettered(&self, id: Uuid, error: &str) -> mc_storage::Result<()> {
        self.0.outbox().mark_dead_lettered(id, error).await
    }

    async fn get(&self, id: Uuid) -> mc_storage::Result<Option<OutboxEntry>> {
        self.0.outbox().get(id).await
    }

    async fn pending_count(&self) -> mc_storage::Result<u64> {
        self.0.outbox().pending_count().await
    }

    async fn list_dead_lettered(&self, limit: usize) -> mc_storage::Result<Vec<OutboxEntry>> {
        self.0.outbox().list_dead_lettered(limit).await
    }

    async fn purge_terminal(&self, older_than: Duration) -> mc_storage::Result<u64> {
        self.0.outbox().purge_terminal(older_than).await
    }
}

pub(crate) struct StorageDeadLetters(pub Arc<dyn Storage>);

#[async_trait]
impl DeadLetterStore for StorageDeadLetters {
    async fn add(&self, entry: DeadLetterEntry) -> mc_storage::Result<()> {
        self.0.dead_letters().add(entry).await
    }

    async fn get(&self, id: Uuid) -> mc_storage::Result<Option<DeadLetterEntry>> {
        self.0.dead_letters().get(id).await
    }

    async fn list(&self, limit: usize) -> mc_storage::Result<Vec<DeadLetterEntry>> {
        self.0.dead_letters().list(limit).await
    }

    async fn mark(&self, id: Uuid, status: DeadLetterStatus) -> mc_storage::Result<()> {
        self.0.dead_letters().mark(id, status).await
    }

    async fn count(&self) -> mc_storage::Result<u64> {
        self.0.dead_letters().count().await
    }

    async fn statistics(&self) -> mc_storage::Result<DeadLetterStatistics> {
        self.0.dead_letters().statistics().await
    }
}

/// Bridges the outbox loop onto the configured transport.
pub(crate) struct TransportPublisher(pub Arc<dyn Transport>);

#[async_trait]
impl OutboxPublisher for TransportPublisher {
    async fn publish(&self, destination: &str, envelope: &Envelope) -> mc_common::Result<()> {
        self.0.send(destination, envelope.clone()).await
    }
}
