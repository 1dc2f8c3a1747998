//! Dispatcher
//!
//! Routes envelopes to registered handlers through the pipeline.
//! Commands and queries of one type flow through a dedicated work queue
//! with parallelism 1 (unless sequential processing is relaxed), so
//! same-type sends stay strictly FIFO. Events fan out through a shared
//! bounded queue; each handler runs independently and one failure never
//! cancels its siblings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use mc_common::{
    CommandMessage, Envelope, EventMessage, MercuryError, MessageKind, MetricsSnapshot,
    ProcessingConfig, ProcessingContext, ProcessingResult, QueryMessage, Result,
};
use mc_runtime::{OverflowPolicy, WorkQueue, WorkQueueConfig};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::pipeline::Pipeline;
use crate::registry::{HandlerEntry, HandlerRegistry};

/// In-process dispatch counters snapshotted by the facade.
#[derive(Default)]
pub struct DispatchMetrics {
    pub commands_sent: AtomicU64,
    pub queries_sent: AtomicU64,
    pub events_published: AtomicU64,
    pub handled: AtomicU64,
    pub failed: AtomicU64,
    pub retried: Arc<AtomicU64>,
}

impl DispatchMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            queries_sent: self.queries_sent.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            messages_handled: self.handled.load(Ordering::Relaxed),
            messages_failed: self.failed.load(Ordering::Relaxed),
            messages_retried: self.retried.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    pipeline: Pipeline,
    config: ProcessingConfig,
    /// Per-message-type queues preserving same-type FIFO.
    type_queues: DashMap<String, Arc<WorkQueue>>,
    /// Shared fan-out queue for event handler invocations.
    event_queue: Arc<WorkQueue>,
    metrics: Arc<DispatchMetrics>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        pipeline: Pipeline,
        config: ProcessingConfig,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        let event_queue = Arc::new(WorkQueue::new(WorkQueueConfig {
            name: "dispatch:events".to_string(),
            max_parallelism: config.max_concurrency,
            capacity: (config.max_concurrency * 4).max(100),
            overflow: OverflowPolicy::Wait,
            ensure_ordered: false,
        }));
        Self {
            registry,
            pipeline,
            config,
            type_queues: DashMap::new(),
            event_queue,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<DispatchMetrics> {
        &self.metrics
    }

    fn base_context(&self) -> ProcessingContext {
        ProcessingContext::new("dispatcher")
            .with_deadline(std::time::Instant::now() + self.config.processing_timeout)
    }

    fn type_queue(&self, message_type: &str) -> Arc<WorkQueue> {
        self.type_queues
            .entry(message_type.to_string())
            .or_insert_with(|| {
                let parallelism = if self.config.sequential_processing {
                    1
                } else {
                    self.config.max_concurrency
                };
                debug!(
                    message_type = %message_type,
                    parallelism = parallelism,
                    "Creating dispatch queue for message type"
                );
                Arc::new(WorkQueue::new(WorkQueueConfig {
                    name: format!("dispatch:{}", message_type),
                    max_parallelism: parallelism,
                    capacity: 100,
                    overflow: OverflowPolicy::Wait,
                    ensure_ordered: self.config.sequential_processing,
                }))
            })
            .clone()
    }

    fn record(&self, result: &ProcessingResult) {
        match result {
            ProcessingResult::Success(_) => {
                self.metrics.handled.fetch_add(1, Ordering::Relaxed);
            }
            ProcessingResult::Failure { .. } => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Send a typed command and decode its typed response.
    pub async fn send_command<C: CommandMessage>(&self, command: C) -> Result<C::Response> {
        let envelope = Envelope::command(&command)?;
        self.metrics.commands_sent.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mercury.commands.sent").increment(1);

        let result = self.dispatch_single(envelope).await?;
        self.record(&result);
        decode_response::<C::Response>(result.into_result()?)
    }

    /// Send a typed query and decode its typed response.
    pub async fn send_query<Q: QueryMessage>(&self, query: Q) -> Result<Q::Response> {
        let envelope = Envelope::query(&query)?;
        self.metrics.queries_sent.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mercury.queries.sent").increment(1);

        let result = self.dispatch_single(envelope).await?;
        self.record(&result);
        decode_response::<Q::Response>(result.into_result()?)
    }

    /// Publish a typed event; returns one result per registered handler.
    pub async fn publish_event<E: EventMessage>(&self, event: E) -> Result<Vec<ProcessingResult>> {
        let envelope = Envelope::event(&event)?;
        self.publish_envelope(envelope).await
    }

    /// Dispatch a raw envelope, whatever its kind. Events collapse to a
    /// single result: success only when every handler succeeded.
    pub async fn dispatch(&self, envelope: Envelope) -> Result<ProcessingResult> {
        match envelope.kind {
            MessageKind::Command | MessageKind::Query => {
                let result = self.dispatch_single(envelope).await?;
                self.record(&result);
                Ok(result)
            }
            MessageKind::Event => {
                let results = self.publish_envelope(envelope).await?;
                let failure = results.iter().find(|r| !r.is_success()).cloned();
                Ok(failure.unwrap_or_else(ProcessingResult::success))
            }
        }
    }

    async fn dispatch_single(&self, envelope: Envelope) -> Result<ProcessingResult> {
        let entry: HandlerEntry = match envelope.kind {
            MessageKind::Command => self.registry.command(&envelope.message_type),
            MessageKind::Query => self.registry.query(&envelope.message_type),
            MessageKind::Event => None,
        }
        .cloned()
        .ok_or_else(|| MercuryError::HandlerMissing(envelope.message_type.clone()))?;

        let ctx = self
            .base_context()
            .with_handler_type(entry.handler.handler_name());
        let queue = self.type_queue(&envelope.message_type);

        let (tx, rx) = oneshot::channel();
        let pipeline = self.pipeline.clone();
        let handler = entry.handler;
        let timeout = self.config.processing_timeout;

        queue
            .submit(async move {
                let result = pipeline.execute(&envelope, &ctx, handler).await;
                let _ = tx.send(result);
                Ok(())
            })
            .await
            .map_err(|e| MercuryError::internal(format!("dispatch queue closed: {}", e)))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Ok(ProcessingResult::failure(MercuryError::internal(
                "dispatch result channel dropped",
            ))),
            Err(_) => Ok(ProcessingResult::failure(MercuryError::Timeout)),
        }
    }

    /// Fan an event envelope out to every registered handler.
    ///
    /// Handlers run through the shared event queue with bounded
    /// parallelism. Failures are reported per handler; publishing itself
    /// only fails when the envelope cannot be enqueued at all.
    pub async fn publish_envelope(&self, envelope: Envelope) -> Result<Vec<ProcessingResult>> {
        self.metrics.events_published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mercury.events.published").increment(1);

        let entries = self.registry.events(&envelope.message_type).to_vec();
        if entries.is_empty() {
            debug!(
                message_type = %envelope.message_type,
                "Event published with no subscribers"
            );
            return Ok(Vec::new());
        }

        let mut receivers = Vec::with_capacity(entries.len());
        for entry in entries {
            let (tx, rx) = oneshot::channel();
            let envelope = envelope.clone();
            let ctx = self
                .base_context()
                .with_handler_type(entry.handler.handler_name());
            let pipeline = self.pipeline.clone();
            let handler = entry.handler;

            self.event_queue
                .submit(async move {
                    let result = pipeline.execute(&envelope, &ctx, handler).await;
                    let _ = tx.send(result);
                    Ok(())
                })
                .await
                .map_err(|e| MercuryError::internal(format!("event queue closed: {}", e)))?;
            receivers.push(rx);
        }

        let timeout = self.config.processing_timeout;
        let mut results = Vec::with_capacity(receivers.len());
        for rx in receivers {
            let result = match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => ProcessingResult::failure(MercuryError::internal(
                    "event result channel dropped",
                )),
                Err(_) => ProcessingResult::failure(MercuryError::Timeout),
            };
            self.record(&result);
            results.push(result);
        }
        Ok(results)
    }

    /// Drain every dispatch queue and stop accepting work.
    pub async fn shutdown(&self) {
        let queues: Vec<Arc<WorkQueue>> = self
            .type_queues
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.type_queues.clear();

        for queue in queues {
            queue.complete().await;
        }
        self.event_queue.complete().await;
        warn!("Dispatcher shut down");
    }
}

fn decode_response<R: DeserializeOwned>(data: Option<serde_json::Value>) -> Result<R> {
    serde_json::from_value(data.unwrap_or(serde_json::Value::Null))
        .map_err(MercuryError::serialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineBuilder;
    use crate::registry::{CommandHandler, EventHandler};
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicU32;

    #[derive(Debug, Serialize, Deserialize)]
    struct CreateOrder {
        customer_id: String,
        amount: f64,
    }

    impl CommandMessage for CreateOrder {
        type Response = String;

        fn message_type() -> &'static str {
            "orders.create"
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: String,
    }

    impl EventMessage for OrderCreated {
        fn message_type() -> &'static str {
            "orders.created"
        }
    }

    struct CreateOrderHandler {
        invocations: Arc<AtomicU32>,
    }

    #[async_trait]
    impl CommandHandler<CreateOrder> for CreateOrderHandler {
        async fn handle(
            &self,
            _command: CreateOrder,
            _ctx: &ProcessingContext,
        ) -> Result<String> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            Ok("o1".to_string())
        }
    }

    struct RecordingEventHandler {
        invocations: Arc<AtomicU32>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler<OrderCreated> for RecordingEventHandler {
        async fn handle(&self, _event: OrderCreated, _ctx: &ProcessingContext) -> Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(MercuryError::handler("middle handler exploded"))
            } else {
                Ok(())
            }
        }
    }

    fn dispatcher_with(registry: HandlerRegistry) -> Dispatcher {
        let registry = Arc::new(registry);
        let config = ProcessingConfig {
            max_retries: 0,
            ..Default::default()
        };
        let metrics = Arc::new(DispatchMetrics::default());
        let pipeline = PipelineBuilder::new(config.clone())
            .with_registry(Arc::clone(&registry))
            .with_retried_counter(Arc::clone(&metrics.retried))
            .build();
        Dispatcher::new(registry, pipeline, config, metrics)
    }

    #[tokio::test]
    async fn command_happy_path() {
        let invocations = Arc::new(AtomicU32::new(0));
        let mut registry = HandlerRegistry::new();
        registry
            .register_command::<CreateOrder, _>(CreateOrderHandler {
                invocations: Arc::clone(&invocations),
            })
            .unwrap();
        let dispatcher = dispatcher_with(registry);

        let order_id = dispatcher
            .send_command(CreateOrder {
                customer_id: "c1".to_string(),
                amount: 9.99,
            })
            .await
            .unwrap();

        assert_eq!(order_id, "o1");
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
        let snapshot = dispatcher.metrics().snapshot();
        assert_eq!(snapshot.commands_sent, 1);
        assert_eq!(snapshot.messages_handled, 1);
    }

    #[tokio::test]
    async fn missing_handler_is_reported() {
        let dispatcher = dispatcher_with(HandlerRegistry::new());
        let err = dispatcher
            .send_command(CreateOrder {
                customer_id: "c1".to_string(),
                amount: 1.0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MercuryError::HandlerMissing(_)));
    }

    #[tokio::test]
    async fn event_fanout_isolates_failures() {
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));
        let third = Arc::new(AtomicU32::new(0));

        let mut registry = HandlerRegistry::new();
        registry.register_event::<OrderCreated, _>(RecordingEventHandler {
            invocations: Arc::clone(&first),
            fail: false,
        });
        registry.register_event::<OrderCreated, _>(RecordingEventHandler {
            invocations: Arc::clone(&second),
            fail: true,
        });
        registry.register_event::<OrderCreated, _>(RecordingEventHandler {
            invocations: Arc::clone(&third),
            fail: false,
        });
        let dispatcher = dispatcher_with(registry);

        let results = dispatcher
            .publish_event(OrderCreated {
                order_id: "o1".to_string(),
            })
            .await
            .unwrap();

        let flags: Vec<bool> = results.iter().map(|r| r.is_success()).collect();
        assert_eq!(flags, vec![true, false, true]);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(third.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn event_with_no_subscribers_is_a_noop() {
        let dispatcher = dispatcher_with(HandlerRegistry::new());
        let results = dispatcher
            .publish_event(OrderCreated {
                order_id: "o1".to_string(),
            })
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn same_type_commands_stay_ordered() {
        #[derive(Debug, Serialize, Deserialize)]
        struct Append {
            value: u32,
        }

        impl CommandMessage for Append {
            type Response = ();

            fn message_type() -> &'static str {
                "test.append"
            }
        }

        struct AppendHandler {
            seen: Arc<parking_lot::Mutex<Vec<u32>>>,
        }

        #[async_trait]
        impl CommandHandler<Append> for AppendHandler {
            async fn handle(&self, command: Append, _ctx: &ProcessingContext) -> Result<()> {
                // A sleep inversely proportional to the value would
                // reorder results if dispatch were not serialized.
                tokio::time::sleep(std::time::Duration::from_millis(
                    (5u64).saturating_sub(command.value as u64),
                ))
                .await;
                self.seen.lock().push(command.value);
                Ok(())
            }
        }

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut registry = HandlerRegistry::new();
        registry
            .register_command::<Append, _>(AppendHandler {
                seen: Arc::clone(&seen),
            })
            .unwrap();
        let dispatcher = Arc::new(dispatcher_with(registry));

        let mut handles = Vec::new();
        for value in 0..5u32 {
            let dispatcher = Arc::clone(&dispatcher);
            handles.push(tokio::spawn(async move {
                dispatcher.send_command(Append { value }).await.unwrap();
            }));
            // Give each send a moment to enqueue before the next.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }
}
