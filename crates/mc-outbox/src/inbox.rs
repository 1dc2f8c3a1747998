//! Inbox processor
//!
//! Deduplicated ingress. `process_incoming` atomically claims the
//! `(message_id, source)` pair inside the dedup window, dispatches the
//! envelope, and marks the claim processed or failed in the same
//! transactional scope. A second sighting of a processed message is a
//! silent no-op; a concurrent sighting while the first is in flight is
//! reported as a duplicate for the caller to retry later.

use std::sync::Arc;

use mc_common::{Envelope, InboxOptions, MercuryError, ProcessingResult, Result};
use mc_dispatch::Dispatcher;
use mc_storage::{InboxClaim, Storage};
use tracing::{debug, info, warn};

pub struct InboxProcessor {
    storage: Arc<dyn Storage>,
    dispatcher: Arc<Dispatcher>,
}

impl InboxProcessor {
    pub fn new(storage: Arc<dyn Storage>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            storage,
            dispatcher,
        }
    }

    /// Process an incoming envelope exactly once per dedup window.
    pub async fn process_incoming(
        &self,
        envelope: Envelope,
        options: InboxOptions,
    ) -> Result<ProcessingResult> {
        metrics::counter!("mercury.inbox.received").increment(1);

        if !options.require_idempotency {
            return self.dispatcher.dispatch(envelope).await;
        }

        let message_id = envelope.message_id;
        let claim = self
            .storage
            .inbox()
            .try_claim(message_id, &options.source, options.deduplication_window)
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))?;

        match claim {
            InboxClaim::AlreadyProcessed => {
                debug!(
                    message_id = %message_id,
                    source = %options.source,
                    "Duplicate delivery of processed message, skipping"
                );
                metrics::counter!("mercury.inbox.duplicates").increment(1);
                Ok(ProcessingResult::success())
            }
            InboxClaim::AlreadyProcessing => {
                warn!(
                    message_id = %message_id,
                    source = %options.source,
                    "Message already in flight"
                );
                metrics::counter!("mercury.inbox.in_flight_collisions").increment(1);
                Err(MercuryError::DuplicateMessage {
                    message_id,
                    source_name: options.source,
                })
            }
            InboxClaim::New => {
                let tx = self
                    .storage
                    .begin_transaction()
                    .await
                    .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))?;

                let result = self.dispatcher.dispatch(envelope).await?;

                match &result {
                    ProcessingResult::Success(_) => {
                        self.storage
                            .inbox()
                            .mark_processed(message_id, &options.source)
                            .await
                            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))?;
                        tx.commit()
                            .await
                            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))?;
                        info!(
                            message_id = %message_id,
                            source = %options.source,
                            "Incoming message processed"
                        );
                        metrics::counter!("mercury.inbox.processed").increment(1);
                    }
                    ProcessingResult::Failure { error, .. } => {
                        self.storage
                            .inbox()
                            .mark_failed(message_id, &options.source)
                            .await
                            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))?;
                        tx.rollback()
                            .await
                            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))?;
                        warn!(
                            message_id = %message_id,
                            source = %options.source,
                            error = %error,
                            "Incoming message failed"
                        );
                        metrics::counter!("mercury.inbox.failed").increment(1);
                    }
                }
                Ok(result)
            }
        }
    }

    /// Drop dedup entries older than the window.
    pub async fn purge_expired(&self, options: &InboxOptions) -> Result<u64> {
        self.storage
            .inbox()
            .purge_expired(options.deduplication_window)
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mc_common::{CommandMessage, ProcessingConfig, ProcessingContext};
    use mc_dispatch::{CommandHandler, DispatchMetrics, HandlerRegistry, PipelineBuilder};
    use mc_storage::MemoryStorage;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Debug, Serialize, Deserialize)]
    struct ApplyPayment {
        amount: f64,
    }

    impl CommandMessage for ApplyPayment {
        type Response = ();

        fn message_type() -> &'static str {
            "payments.apply"
        }
    }

    struct SlowCountingHandler {
        invocations: Arc<AtomicU32>,
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl CommandHandler<ApplyPayment> for SlowCountingHandler {
        async fn handle(&self, _command: ApplyPayment, _ctx: &ProcessingContext) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(MercuryError::handler("payment rejected"))
            } else {
                Ok(())
            }
        }
    }

    fn fixture(delay: Duration, fail: bool) -> (Arc<InboxProcessor>, Arc<AtomicU32>) {
        let invocations = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register_command::<ApplyPayment, _>(SlowCountingHandler {
                invocations: Arc::clone(&invocations),
                delay,
                fail,
            })
            .unwrap();
        let registry = Arc::new(registry);

        let config = ProcessingConfig {
            max_retries: 0,
            ..Default::default()
        };
        let pipeline = PipelineBuilder::new(config.clone())
            .with_registry(Arc::clone(&registry))
            .build();
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            pipeline,
            config,
            Arc::new(DispatchMetrics::default()),
        ));

        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        (
            Arc::new(InboxProcessor::new(storage, dispatcher)),
            invocations,
        )
    }

    fn envelope() -> Envelope {
        Envelope::command(&ApplyPayment { amount: 10.0 }).unwrap()
    }

    #[tokio::test]
    async fn sequential_duplicate_invokes_handler_once() {
        let (inbox, invocations) = fixture(Duration::ZERO, false);
        let envelope = envelope();
        let options = InboxOptions::from_source("billing");

        let first = inbox
            .process_incoming(envelope.clone(), options.clone())
            .await
            .unwrap();
        assert!(first.is_success());

        let second = inbox
            .process_incoming(envelope, options)
            .await
            .unwrap();
        assert!(second.is_success());

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_duplicate_is_rejected_while_in_flight() {
        let (inbox, invocations) = fixture(Duration::from_millis(100), false);
        let envelope = envelope();
        let options = InboxOptions::from_source("billing");

        let racing = {
            let inbox = Arc::clone(&inbox);
            let envelope = envelope.clone();
            let options = options.clone();
            tokio::spawn(async move { inbox.process_incoming(envelope, options).await })
        };

        // Let the first claim win, then collide.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = inbox.process_incoming(envelope, options).await;

        assert!(matches!(
            second,
            Err(MercuryError::DuplicateMessage { .. })
        ));
        assert!(racing.await.unwrap().unwrap().is_success());
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_processing_can_be_redelivered() {
        let (inbox, invocations) = fixture(Duration::ZERO, true);
        let envelope = envelope();
        let options = InboxOptions::from_source("billing");

        let result = inbox
            .process_incoming(envelope.clone(), options.clone())
            .await
            .unwrap();
        assert!(!result.is_success());

        // Failed entries are reclaimed on redelivery.
        let retried = inbox.process_incoming(envelope, options).await.unwrap();
        assert!(!retried.is_success());
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idempotency_can_be_opted_out() {
        let (inbox, invocations) = fixture(Duration::ZERO, false);
        let envelope = envelope();
        let options = InboxOptions {
            require_idempotency: false,
            ..InboxOptions::from_source("billing")
        };

        inbox
            .process_incoming(envelope.clone(), options.clone())
            .await
            .unwrap();
        inbox.process_incoming(envelope, options).await.unwrap();

        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }
}
