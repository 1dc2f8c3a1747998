//! Outbox processor
//!
//! Store-and-forward: `publish_to_outbox` persists a `Pending` entry in
//! the caller's transactional scope; the background loop leases ready
//! entries (priority desc, oldest first), hands each to the configured
//! publisher, and transitions it to `Published`, back to `Pending` with
//! backoff, or to `DeadLettered` once its retries are spent. Leases are
//! per-entry and time-bounded, so concurrent workers drain disjoint
//! batches and a crashed worker's lease simply expires.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mc_common::{Envelope, MercuryError, OutboxEntry, OutboxOptions, Result};
use mc_dispatch::{DeadLetterService, RetryDelay};
use mc_runtime::{Lifecycle, LifecycleState, PollLoop, PollLoopConfig, PollSource, WorkQueueConfig};
use mc_storage::OutboxStore;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Destination-addressed publishing seam the processor drives.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, destination: &str, envelope: &Envelope) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct OutboxProcessorConfig {
    /// Entries leased per poll.
    pub batch_size: usize,
    /// How long a leased entry stays invisible to other workers.
    pub lease_duration: Duration,
    /// Parallel publishes per poll batch.
    pub publish_parallelism: usize,
    pub poll: PollLoopConfig,
}

impl Default for OutboxProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 20,
            lease_duration: Duration::from_secs(30),
            publish_parallelism: 4,
            poll: PollLoopConfig::default(),
        }
    }
}

pub struct OutboxProcessor {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn OutboxPublisher>,
    dlq: Arc<DeadLetterService>,
    config: OutboxProcessorConfig,
    shutdown: broadcast::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
    lifecycle: Lifecycle,
}

impl OutboxProcessor {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn OutboxPublisher>,
        dlq: Arc<DeadLetterService>,
        config: OutboxProcessorConfig,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            store,
            publisher,
            dlq,
            config,
            shutdown,
            handle: Mutex::new(None),
            lifecycle: Lifecycle::new(),
        }
    }

    /// Persist an envelope for store-and-forward delivery.
    ///
    /// Callers bind this to their unit of work through the storage
    /// contract's transactional scope; the entry becomes visible to the
    /// background loop once that scope commits.
    pub async fn publish_to_outbox(
        &self,
        envelope: Envelope,
        options: OutboxOptions,
    ) -> Result<uuid::Uuid> {
        let entry = OutboxEntry::from_options(envelope, &options);
        let id = entry.id;
        debug!(
            entry_id = %id,
            destination = %entry.destination,
            priority = entry.priority,
            "Outbox entry persisted"
        );
        metrics::counter!("mercury.outbox.enqueued").increment(1);
        self.store
            .add(entry)
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))?;
        Ok(id)
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle.state().is_running()
    }

    /// Launch the background dispatch loop.
    pub fn start(&self) -> Result<()> {
        self.lifecycle
            .mark_started()
            .map_err(|e| MercuryError::internal(e.to_string()))?;

        let source = Arc::new(OutboxPollSource {
            store: Arc::clone(&self.store),
            publisher: Arc::clone(&self.publisher),
            dlq: Arc::clone(&self.dlq),
            batch_size: self.config.batch_size,
            lease_duration: self.config.lease_duration,
        });

        let mut poll_config = self.config.poll.clone();
        poll_config.work_queue = WorkQueueConfig::named("outbox")
            .with_parallelism(self.config.publish_parallelism)
            .with_capacity(self.config.batch_size.max(1) * 2);

        let handle = PollLoop::spawn("outbox", source, poll_config, self.shutdown.clone());
        *self.handle.lock() = Some(handle);

        info!(
            batch_size = self.config.batch_size,
            lease_secs = self.config.lease_duration.as_secs(),
            "Outbox processor started"
        );
        Ok(())
    }

    /// Stop the loop; in-flight publishes drain before this returns.
    pub async fn stop(&self) {
        if self.lifecycle.mark_stopped().is_err() {
            return;
        }
        let _ = self.shutdown.send(());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Outbox processor stopped");
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub async fn pending_count(&self) -> Result<u64> {
        self.store
            .pending_count()
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))
    }
}

struct OutboxPollSource {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn OutboxPublisher>,
    dlq: Arc<DeadLetterService>,
    batch_size: usize,
    lease_duration: Duration,
}

impl OutboxPollSource {
    fn backoff(entry: &OutboxEntry) -> Duration {
        match entry.retry_delay {
            Some(delay) => delay,
            None => RetryDelay::ExponentialBackoff {
                initial: Duration::from_secs(1),
                multiplier: 2.0,
                max: Duration::from_secs(300),
                jitter: true,
            }
            .for_attempt(entry.attempt),
        }
    }
}

#[async_trait]
impl PollSource for OutboxPollSource {
    type Item = OutboxEntry;

    async fn poll(&self) -> anyhow::Result<Vec<OutboxEntry>> {
        let leased = self
            .store
            .lease_ready(self.batch_size, self.lease_duration)
            .await?;
        Ok(leased)
    }

    async fn process(&self, entry: OutboxEntry) -> anyhow::Result<()> {
        match self
            .publisher
            .publish(&entry.destination, &entry.envelope)
            .await
        {
            Ok(()) => {
                debug!(entry_id = %entry.id, destination = %entry.destination, "Outbox entry published");
                metrics::counter!("mercury.outbox.published").increment(1);
                self.store.mark_published(entry.id).await?;
            }
            Err(error) if entry.attempt >= entry.max_retries => {
                warn!(
                    entry_id = %entry.id,
                    attempts = entry.attempt + 1,
                    error = %error,
                    "Outbox retries exhausted, dead-lettering"
                );
                metrics::counter!("mercury.outbox.dead_lettered").increment(1);
                self.store
                    .mark_dead_lettered(entry.id, &error.to_string())
                    .await?;
                let exhausted = MercuryError::RetryExhausted {
                    attempts: entry.attempt + 1,
                    last_error: error.to_string(),
                };
                self.dlq
                    .send(
                        entry.envelope.clone(),
                        "outbox retries exhausted",
                        &exhausted,
                        "outbox",
                        entry.attempt,
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!(e))?;
            }
            Err(error) => {
                let delay = Self::backoff(&entry);
                warn!(
                    entry_id = %entry.id,
                    attempt = entry.attempt + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Outbox publish failed, will retry"
                );
                metrics::counter!("mercury.outbox.retries").increment(1);
                self.store
                    .mark_failed(entry.id, delay, &error.to_string())
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_common::{MessageKind, OutboxStatus, ProcessingConfig};
    use mc_dispatch::{DispatchMetrics, Dispatcher, HandlerRegistry, PipelineBuilder};
    use mc_storage::{DeadLetterStore, MemoryStorage, Storage};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyPublisher {
        attempts: AtomicU32,
        fail_first: u32,
        published: Mutex<Vec<uuid::Uuid>>,
    }

    #[async_trait]
    impl OutboxPublisher for FlakyPublisher {
        async fn publish(&self, _destination: &str, envelope: &Envelope) -> Result<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_first {
                return Err(MercuryError::TransportUnavailable("transport down".into()));
            }
            self.published.lock().push(envelope.message_id);
            Ok(())
        }
    }

    fn envelope() -> Envelope {
        Envelope {
            message_id: uuid::Uuid::new_v4(),
            message_type: "orders.created".to_string(),
            kind: MessageKind::Event,
            body: serde_json::json!({"orderId": "o1"}),
            correlation_id: None,
            causation_id: None,
            occurred_at: chrono::Utc::now(),
            metadata: Default::default(),
        }
    }

    fn fixture(
        fail_first: u32,
    ) -> (
        Arc<MemoryStorage>,
        Arc<FlakyPublisher>,
        OutboxProcessor,
    ) {
        let storage = Arc::new(MemoryStorage::new());
        let publisher = Arc::new(FlakyPublisher {
            attempts: AtomicU32::new(0),
            fail_first,
            published: Mutex::new(Vec::new()),
        });

        let registry = Arc::new(HandlerRegistry::new());
        let config = ProcessingConfig::default();
        let pipeline = PipelineBuilder::new(config.clone())
            .with_registry(Arc::clone(&registry))
            .build();
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            pipeline,
            config,
            Arc::new(DispatchMetrics::default()),
        ));
        let dlq = Arc::new(DeadLetterService::new(
            Arc::clone(&storage) as Arc<dyn DeadLetterStore>,
            dispatcher,
        ));

        let processor_config = OutboxProcessorConfig {
            batch_size: 10,
            lease_duration: Duration::from_secs(5),
            publish_parallelism: 2,
            poll: PollLoopConfig {
                idle_delay: Duration::from_millis(5),
                busy_delay: Duration::from_millis(1),
                error_delay: Duration::from_millis(5),
                work_queue: WorkQueueConfig::default(),
            },
        };
        let processor = OutboxProcessor::new(
            Arc::clone(&storage) as Arc<dyn OutboxStore>,
            Arc::clone(&publisher) as Arc<dyn OutboxPublisher>,
            dlq,
            processor_config,
        );
        (storage, publisher, processor)
    }

    /// Fixed short retry delay so tests converge quickly.
    fn options() -> OutboxOptions {
        OutboxOptions {
            destination: "orders".to_string(),
            priority: 0,
            max_retries: 3,
            retry_delay: Some(Duration::from_millis(5)),
        }
    }

    #[tokio::test]
    async fn publishes_exactly_once_on_happy_path() {
        let (storage, publisher, processor) = fixture(0);

        let id = processor
            .publish_to_outbox(envelope(), options())
            .await
            .unwrap();
        processor.start().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        processor.stop().await;

        assert_eq!(publisher.published.lock().len(), 1);
        let entry = storage.outbox().get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Published);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let (storage, publisher, processor) = fixture(2);

        let id = processor
            .publish_to_outbox(envelope(), options())
            .await
            .unwrap();
        processor.start().unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        processor.stop().await;

        assert_eq!(publisher.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(publisher.published.lock().len(), 1);
        let entry = storage.outbox().get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::Published);
        assert_eq!(entry.attempt, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_with_component() {
        let (storage, publisher, processor) = fixture(10);

        let id = processor
            .publish_to_outbox(envelope(), options())
            .await
            .unwrap();
        processor.start().unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        processor.stop().await;

        // max_retries=3: attempts 1-4 fail, then dead-lettered.
        assert_eq!(publisher.attempts.load(Ordering::SeqCst), 4);
        let entry = storage.outbox().get(id).await.unwrap().unwrap();
        assert_eq!(entry.status, OutboxStatus::DeadLettered);

        let dead = storage.dead_letters().list(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].component, "outbox");
        assert_eq!(dead[0].retry_count, 3);

        let listed = storage.outbox().list_dead_lettered(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
    }
}
