//! Mercury facade
//!
//! The single entry point an application wires up: register handlers,
//! pick storage and transport (in-memory and in-process by default),
//! tune the pipeline, then send commands, publish events, enqueue work,
//! and drive the outbox/inbox. All the moving parts underneath come
//! from the focused crates; this crate only assembles them.

mod adapters;

use std::sync::Arc;
use std::time::Instant;

use mc_common::{
    CommandMessage, CoreConfig, EnqueueOptions, Envelope, EventMessage, HealthReport,
    HealthStatus, InboxOptions, MetricsSnapshot, OutboxOptions, ProcessingResult, QueryMessage,
    Result,
};
use mc_dispatch::{
    BreakerRegistry, CircuitBreakerConfig, CommandHandler, DeadLetterService, DefaultErrorHandler,
    DispatchMetrics, Dispatcher, ErrorHandler, EventHandler, HandlerRegistry, IdempotencyPolicy,
    PipelineBuilder, QueryHandler, SigningConfig,
};
use mc_outbox::{InboxProcessor, OutboxProcessor, OutboxProcessorConfig};
use mc_queue::{QueueEngine, QueueWorkerConfig};
use mc_storage::{IdempotencyStore, MemoryStorage, Storage};
use mc_transport::{InProcessTransport, Transport};
use tracing::info;
use uuid::Uuid;

use adapters::{StorageDeadLetters, StorageOutbox, TransportPublisher};

pub use mc_common as common;
pub use mc_dispatch::MessageSigner;
pub use mc_ring as ring;
pub use mc_transport::{
    ConsumerHandle, MessageHandler, SubscribeOptions, TopologyConfig, TransportState,
};

/// Builder mapping configuration onto the assembled core.
pub struct MercuryBuilder {
    config: CoreConfig,
    registry: HandlerRegistry,
    storage: Option<Arc<dyn Storage>>,
    transport: Option<Arc<dyn Transport>>,
    idempotency: Option<(Arc<dyn IdempotencyStore>, IdempotencyPolicy)>,
    signing: Option<SigningConfig>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    outbox_config: OutboxProcessorConfig,
    queue_config: QueueWorkerConfig,
}

impl MercuryBuilder {
    pub fn new() -> Self {
        Self {
            config: CoreConfig::default(),
            registry: HandlerRegistry::new(),
            storage: None,
            transport: None,
            idempotency: None,
            signing: None,
            error_handler: None,
            outbox_config: OutboxProcessorConfig::default(),
            queue_config: QueueWorkerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_idempotency(
        mut self,
        store: Arc<dyn IdempotencyStore>,
        policy: IdempotencyPolicy,
    ) -> Self {
        self.idempotency = Some((store, policy));
        self
    }

    pub fn with_signing(mut self, signing: SigningConfig) -> Self {
        self.signing = Some(signing);
        self
    }

    pub fn with_error_handler(mut self, error_handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(error_handler);
        self
    }

    pub fn with_outbox_config(mut self, config: OutboxProcessorConfig) -> Self {
        self.outbox_config = config;
        self
    }

    pub fn with_queue_config(mut self, config: QueueWorkerConfig) -> Self {
        self.queue_config = config;
        self
    }

    pub fn register_command<C, H>(mut self, handler: H) -> Result<Self>
    where
        C: CommandMessage,
        H: CommandHandler<C>,
    {
        self.registry.register_command::<C, H>(handler)?;
        Ok(self)
    }

    pub fn register_query<Q, H>(mut self, handler: H) -> Result<Self>
    where
        Q: QueryMessage,
        H: QueryHandler<Q>,
    {
        self.registry.register_query::<Q, H>(handler)?;
        Ok(self)
    }

    pub fn register_event<E, H>(mut self, handler: H) -> Self
    where
        E: EventMessage,
        H: EventHandler<E>,
    {
        self.registry.register_event::<E, H>(handler);
        self
    }

    pub fn registry_mut(&mut self) -> &mut HandlerRegistry {
        &mut self.registry
    }

    /// Assemble the core and connect the transport.
    pub async fn build(self) -> Result<Mercury> {
        let storage: Arc<dyn Storage> = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));
        let transport: Arc<dyn Transport> = self
            .transport
            .unwrap_or_else(|| Arc::new(InProcessTransport::default()));

        let registry = Arc::new(self.registry);
        let metrics = Arc::new(DispatchMetrics::default());

        let mut pipeline_builder = PipelineBuilder::new(self.config.processing.clone())
            .with_registry(Arc::clone(&registry))
            .with_retried_counter(Arc::clone(&metrics.retried))
            .with_breaker_registry(Arc::new(BreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold: self.config.processing.circuit_breaker_threshold,
                break_duration: self.config.processing.circuit_breaker_timeout,
            })));
        if let Some(signing) = self.signing {
            pipeline_builder = pipeline_builder.with_signer(MessageSigner::new(signing));
        }
        if let Some((store, policy)) = self.idempotency {
            pipeline_builder = pipeline_builder.with_idempotency(store, policy);
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            pipeline_builder.build(),
            self.config.processing.clone(),
            Arc::clone(&metrics),
        ));

        let dlq = Arc::new(DeadLetterService::new(
            Arc::new(StorageDeadLetters(Arc::clone(&storage))),
            Arc::clone(&dispatcher),
        ));

        let error_handler: Arc<dyn ErrorHandler> = self
            .error_handler
            .unwrap_or_else(|| Arc::new(DefaultErrorHandler::default()));

        let outbox = Arc::new(OutboxProcessor::new(
            Arc::new(StorageOutbox(Arc::clone(&storage))),
            Arc::new(TransportPublisher(Arc::clone(&transport))),
            Arc::clone(&dlq),
            self.outbox_config,
        ));

        let inbox = Arc::new(InboxProcessor::new(
            Arc::clone(&storage),
            Arc::clone(&dispatcher),
        ));

        let queues = Arc::new(QueueEngine::new(
            Arc::clone(&storage),
            Arc::clone(&dispatcher),
            Arc::clone(&dlq),
            error_handler,
            self.queue_config,
        ));

        transport.connect().await?;
        outbox.start()?;

        info!(
            handlers = registry.handler_count(),
            "Mercury assembled and started"
        );

        Ok(Mercury {
            storage,
            dispatcher,
            dlq,
            outbox,
            inbox,
            queues,
            transport,
            started_at: Instant::now(),
        })
    }
}

impl Default for MercuryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled messaging core.
pub struct Mercury {
    storage: Arc<dyn Storage>,
    dispatcher: Arc<Dispatcher>,
    dlq: Arc<DeadLetterService>,
    outbox: Arc<OutboxProcessor>,
    inbox: Arc<InboxProcessor>,
    queues: Arc<QueueEngine>,
    transport: Arc<dyn Transport>,
    started_at: Instant,
}

impl Mercury {
    pub fn builder() -> MercuryBuilder {
        MercuryBuilder::new()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    pub async fn send_command<C: CommandMessage>(&self, command: C) -> Result<C::Response> {
        self.dispatcher.send_command(command).await
    }

    pub async fn send_query<Q: QueryMessage>(&self, query: Q) -> Result<Q::Response> {
        self.dispatcher.send_query(query).await
    }

    /// Publish an event; one success flag per registered handler.
    pub async fn publish_event<E: EventMessage>(&self, event: E) -> Result<Vec<bool>> {
        let results = self.dispatcher.publish_event(event).await?;
        Ok(results.iter().map(ProcessingResult::is_success).collect())
    }

    /// Send a batch of commands; a parallel list of success flags.
    pub async fn send_batch<C: CommandMessage>(&self, commands: Vec<C>) -> Result<Vec<bool>> {
        let mut flags = Vec::with_capacity(commands.len());
        for command in commands {
            flags.push(self.dispatcher.send_command(command).await.is_ok());
        }
        Ok(flags)
    }

    /// Publish a batch of events; an event counts as successful when
    /// every one of its handlers succeeded.
    pub async fn publish_batch<E: EventMessage>(&self, events: Vec<E>) -> Result<Vec<bool>> {
        let mut flags = Vec::with_capacity(events.len());
        for event in events {
            let flag = match self.dispatcher.publish_event(event).await {
                Ok(results) => results.iter().all(ProcessingResult::is_success),
                Err(_) => false,
            };
            flags.push(flag);
        }
        Ok(flags)
    }

    // ========================================================================
    // Queues
    // ========================================================================

    pub async fn enqueue_command<C: CommandMessage>(
        &self,
        command: C,
        queue_name: &str,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        let envelope = Envelope::command(&command)?;
        self.queues.enqueue(envelope, queue_name, options).await
    }

    pub async fn enqueue_event<E: EventMessage>(
        &self,
        event: E,
        queue_name: &str,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        let envelope = Envelope::event(&event)?;
        self.queues.enqueue(envelope, queue_name, options).await
    }

    pub async fn enqueue_envelope(
        &self,
        envelope: Envelope,
        queue_name: &str,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        self.queues.enqueue(envelope, queue_name, options).await
    }

    pub fn start_queue(&self, queue_name: &str) -> Result<()> {
        self.queues.start_queue(queue_name)
    }

    pub async fn stop_queue(&self, queue_name: &str) -> Result<()> {
        self.queues.stop_queue(queue_name).await
    }

    pub fn queue_engine(&self) -> &Arc<QueueEngine> {
        &self.queues
    }

    // ========================================================================
    // Reliable delivery
    // ========================================================================

    pub async fn publish_to_outbox<E: EventMessage>(
        &self,
        event: E,
        options: OutboxOptions,
    ) -> Result<Uuid> {
        let envelope = Envelope::event(&event)?;
        self.outbox.publish_to_outbox(envelope, options).await
    }

    pub async fn publish_envelope_to_outbox(
        &self,
        envelope: Envelope,
        options: OutboxOptions,
    ) -> Result<Uuid> {
        self.outbox.publish_to_outbox(envelope, options).await
    }

    pub async fn process_incoming(
        &self,
        envelope: Envelope,
        options: InboxOptions,
    ) -> Result<ProcessingResult> {
        self.inbox.process_incoming(envelope, options).await
    }

    pub fn dead_letters(&self) -> &Arc<DeadLetterService> {
        &self.dlq
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    // ========================================================================
    // Observability
    // ========================================================================

    pub async fn get_metrics(&self) -> Result<MetricsSnapshot> {
        let mut snapshot = self.dispatcher.metrics().snapshot();
        snapshot.outbox_pending = self.outbox.pending_count().await.unwrap_or(0);
        snapshot.messages_dead_lettered = self.dlq.count().await.unwrap_or(0);
        for name in self.queues.queue_names().await.unwrap_or_default() {
            let depth = self.queues.depth(&name).await.unwrap_or(0);
            snapshot.queue_depths.insert(name, depth);
        }
        Ok(snapshot)
    }

    pub async fn get_health(&self) -> Result<HealthReport> {
        let transport_health = self.transport.health();
        let dead_letter_count = self.dlq.count().await.unwrap_or(0);
        let pending_outbox = self.outbox.pending_count().await.unwrap_or(0);
        let running = self.queues.running_queues();

        let mut issues = Vec::new();
        if transport_health.state != TransportState::Connected {
            issues.push(format!(
                "transport is {:?}",
                transport_health.state
            ));
        }
        if let Some(error) = &transport_health.last_error {
            issues.push(format!("transport error: {}", error));
        }
        if dead_letter_count > 0 {
            issues.push(format!("{} dead-lettered messages", dead_letter_count));
        }

        let status = if transport_health.state != TransportState::Connected {
            HealthStatus::Degraded
        } else if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Warning
        };

        Ok(HealthReport {
            status,
            transport_connected: transport_health.state == TransportState::Connected,
            active_consumers: transport_health.active_consumers,
            running_queues: running.len() as u32,
            pending_outbox,
            dead_letter_count,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            issues,
        })
    }

    /// Drain and stop everything: queues, outbox, dispatcher, transport.
    pub async fn shutdown(&self) -> Result<()> {
        self.queues.stop_all().await;
        self.outbox.stop().await;
        self.dispatcher.shutdown().await;
        self.transport.disconnect().await?;
        info!("Mercury shut down");
        Ok(())
    }
}

impl std::fmt::Debug for Mercury {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mercury")
            .field("uptime_secs", &self.started_at.elapsed().as_secs())
            .finish()
    }
}

// Re-export the error type at the crate root for callers.
pub use mc_common::{MercuryError as Error, Result as MercuryResult};
