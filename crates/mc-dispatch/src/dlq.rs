//! Dead-letter service
//!
//! Wraps the dead-letter store with the operational surface: capture a
//! failed envelope with enough context to act on it later, list entries,
//! resubmit one through its original dispatch path, or discard it.
//! Terminal entries (`Retried`/`Discarded`/`Expired`) never return to
//! `Active`; the store enforces that invariant.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use mc_common::{
    DeadLetterEntry, DeadLetterStatistics, DeadLetterStatus, Envelope, MercuryError, Result,
};
use mc_storage::DeadLetterStore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dispatcher::Dispatcher;

pub struct DeadLetterService {
    store: Arc<dyn DeadLetterStore>,
    dispatcher: Arc<Dispatcher>,
}

impl DeadLetterService {
    pub fn new(store: Arc<dyn DeadLetterStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Capture a failed envelope.
    pub async fn send(
        &self,
        envelope: Envelope,
        reason: &str,
        error: &MercuryError,
        component: &str,
        retry_count: u32,
    ) -> Result<Uuid> {
        let entry = DeadLetterEntry {
            id: Uuid::new_v4(),
            envelope,
            reason: reason.to_string(),
            error: error.to_string(),
            error_kind: error.kind().to_string(),
            component: component.to_string(),
            retry_count,
            failure_time: Utc::now(),
            status: DeadLetterStatus::Active,
            metadata: HashMap::new(),
        };
        let id = entry.id;

        warn!(
            dead_letter_id = %id,
            message_id = %entry.envelope.message_id,
            component = %component,
            reason = %reason,
            "Message dead-lettered"
        );
        metrics::counter!("mercury.dlq.sent", "component" => component.to_string())
            .increment(1);

        self.store
            .add(entry)
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))?;
        Ok(id)
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<DeadLetterEntry>> {
        self.store
            .list(limit)
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))
    }

    /// Resubmit the entry's envelope through the dispatcher. The entry
    /// is marked `Retried` only when reprocessing succeeds; on failure
    /// it stays `Active` and the error is returned.
    pub async fn retry(&self, id: Uuid) -> Result<()> {
        let entry = self
            .store
            .get(id)
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))?
            .ok_or_else(|| MercuryError::internal(format!("dead letter {} not found", id)))?;

        if entry.status.is_terminal() {
            return Err(MercuryError::internal(format!(
                "dead letter {} is already {:?}",
                id, entry.status
            )));
        }

        info!(
            dead_letter_id = %id,
            message_id = %entry.envelope.message_id,
            "Resubmitting dead-lettered message"
        );

        let result = self.dispatcher.dispatch(entry.envelope.clone()).await?;
        result.into_result()?;

        self.store
            .mark(id, DeadLetterStatus::Retried)
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))?;
        metrics::counter!("mercury.dlq.retried").increment(1);
        Ok(())
    }

    pub async fn discard(&self, id: Uuid) -> Result<()> {
        self.store
            .mark(id, DeadLetterStatus::Discarded)
            .await
            .map_err(|e| match e {
                mc_storage::StorageError::InvalidTransition(detail) => {
                    MercuryError::internal(detail)
                }
                other => MercuryError::StorageUnavailable(other.to_string()),
            })?;
        metrics::counter!("mercury.dlq.discarded").increment(1);
        Ok(())
    }

    pub async fn count(&self) -> Result<u64> {
        self.store
            .count()
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))
    }

    pub async fn statistics(&self) -> Result<DeadLetterStatistics> {
        self.store
            .statistics()
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))
    }
}
