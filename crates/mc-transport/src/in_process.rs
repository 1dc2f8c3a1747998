//! In-process transport
//!
//! One bounded tokio channel per queue; competing consumers share the
//! receiver, so each message reaches exactly one of them. Topics keep a
//! sender list: publishing clones the envelope into every subscriber's
//! private queue. Overflow behavior per queue is wait (senders suspend)
//! or drop (new writes discarded, sender never blocks).

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use mc_common::{CancelToken, Envelope, MercuryError, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::contract::{
    ConsumerHandle, ConsumerMetrics, MessageHandler, QueueTopology, StateChange,
    SubscribeOptions, TopologyConfig, Transport, TransportHealth, TransportState,
};

const DEFAULT_QUEUE_LENGTH: usize = 10_000;

struct QueueChannel {
    tx: mpsc::Sender<Envelope>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    drop_when_full: bool,
    /// Messages sent but not yet received by a consumer.
    pending: Arc<AtomicI64>,
    dropped: AtomicU64,
}

impl QueueChannel {
    fn new(capacity: usize, drop_when_full: bool) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            drop_when_full,
            pending: Arc::new(AtomicI64::new(0)),
            dropped: AtomicU64::new(0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InProcessConfig {
    /// Channel capacity for queues not declared in the topology.
    pub default_queue_length: usize,
}

impl Default for InProcessConfig {
    fn default() -> Self {
        Self {
            default_queue_length: DEFAULT_QUEUE_LENGTH,
        }
    }
}

pub struct InProcessTransport {
    config: InProcessConfig,
    state: RwLock<TransportState>,
    state_tx: broadcast::Sender<StateChange>,
    queues: DashMap<String, Arc<QueueChannel>>,
    /// Topic -> private queue names of its subscribers.
    topics: DashMap<String, Vec<String>>,
    consumers: DashMap<Uuid, Arc<InProcessConsumer>>,
    connected_at: RwLock<Option<Instant>>,
    last_error: RwLock<Option<String>>,
}

impl InProcessTransport {
    pub fn new(config: InProcessConfig) -> Self {
        let (state_tx, _) = broadcast::channel(64);
        Self {
            config,
            state: RwLock::new(TransportState::Disconnected),
            state_tx,
            queues: DashMap::new(),
            topics: DashMap::new(),
            consumers: DashMap::new(),
            connected_at: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    fn transition(&self, to: TransportState) {
        let previous = {
            let mut state = self.state.write();
            let previous = *state;
            *state = to;
            previous
        };
        if previous != to {
            debug!(previous = ?previous, current = ?to, "Transport state changed");
            let _ = self.state_tx.send(StateChange {
                previous,
                current: to,
                at: chrono::Utc::now(),
            });
        }
    }

    fn require_connected(&self) -> Result<()> {
        let state = *self.state.read();
        if state != TransportState::Connected {
            return Err(MercuryError::TransportUnavailable(format!(
                "transport is {:?}",
                state
            )));
        }
        Ok(())
    }

    fn queue(&self, address: &str) -> Arc<QueueChannel> {
        self.queues
            .entry(address.to_string())
            .or_insert_with(|| {
                warn!(
                    queue = %address,
                    capacity = self.config.default_queue_length,
                    "Queue not declared in topology, using default bounded capacity"
                );
                Arc::new(QueueChannel::new(self.config.default_queue_length, false))
            })
            .clone()
    }

    async fn deliver(&self, address: &str, envelope: Envelope) -> Result<()> {
        let queue = self.queue(address);
        if queue.drop_when_full {
            match queue.tx.try_send(envelope) {
                Ok(()) => {
                    queue.pending.fetch_add(1, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    queue.dropped.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("mercury.transport.dropped", "queue" => address.to_string())
                        .increment(1);
                    debug!(queue = %address, "Queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(MercuryError::TransportUnavailable(format!(
                        "queue '{}' is closed",
                        address
                    )))
                }
            }
            return Ok(());
        }

        queue
            .tx
            .send(envelope)
            .await
            .map_err(|_| {
                MercuryError::TransportUnavailable(format!("queue '{}' is closed", address))
            })?;
        queue.pending.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// `send` variant that can be abandoned through the caller's token
    /// while waiting for space on a full queue.
    pub async fn send_cancellable(
        &self,
        address: &str,
        envelope: Envelope,
        cancel: &CancelToken,
    ) -> Result<()> {
        self.require_connected()?;
        tokio::select! {
            _ = cancel.cancelled() => Err(MercuryError::Cancelled),
            result = self.deliver(address, envelope) => result,
        }
    }

    fn spawn_consumer(
        &self,
        address: &str,
        queue: Arc<QueueChannel>,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Arc<InProcessConsumer> {
        let consumer = Arc::new(InProcessConsumer::new(address, options.clone()));
        let handle = {
            let consumer = Arc::clone(&consumer);
            let pending = Arc::clone(&queue.pending);
            let rx = Arc::clone(&queue.rx);
            let requeue_tx = queue.tx.clone();
            tokio::spawn(async move {
                consumer
                    .run(rx, pending, requeue_tx, handler)
                    .await;
            })
        };
        *consumer.handle.lock() = Some(handle);
        self.consumers.insert(consumer.id, Arc::clone(&consumer));
        consumer
    }
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new(InProcessConfig::default())
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn connect(&self) -> Result<()> {
        self.transition(TransportState::Connecting);
        *self.connected_at.write() = Some(Instant::now());
        self.transition(TransportState::Connected);
        info!("In-process transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.transition(TransportState::Disconnecting);

        let consumers: Vec<Arc<InProcessConsumer>> = self
            .consumers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for consumer in consumers {
            consumer.stop_internal().await;
        }
        self.consumers.clear();

        self.transition(TransportState::Disconnected);
        info!("In-process transport disconnected");
        Ok(())
    }

    async fn send(&self, address: &str, envelope: Envelope) -> Result<()> {
        self.require_connected()?;
        metrics::counter!("mercury.transport.sent", "queue" => address.to_string())
            .increment(1);
        self.deliver(address, envelope).await
    }

    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()> {
        self.require_connected()?;
        metrics::counter!("mercury.transport.published", "topic" => topic.to_string())
            .increment(1);

        let subscriber_queues = self
            .topics
            .get(topic)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        if subscriber_queues.is_empty() {
            debug!(topic = %topic, "Publish with no subscribers");
            return Ok(());
        }

        for queue_name in subscriber_queues {
            self.deliver(&queue_name, envelope.clone()).await?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        address: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<Arc<dyn ConsumerHandle>> {
        let queue = self.queue(address);
        let consumer = self.spawn_consumer(address, queue, handler, options);
        info!(queue = %address, consumer_id = %consumer.id, "Consumer subscribed");
        Ok(consumer)
    }

    async fn subscribe_topic(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<Arc<dyn ConsumerHandle>> {
        // Each topic subscriber gets a private delivery queue.
        let queue_name = format!("topic:{}:{}", topic, Uuid::new_v4());
        let queue = Arc::new(QueueChannel::new(self.config.default_queue_length, false));
        self.queues.insert(queue_name.clone(), Arc::clone(&queue));
        self.topics
            .entry(topic.to_string())
            .or_default()
            .push(queue_name.clone());

        let consumer = self.spawn_consumer(&queue_name, queue, handler, options);
        info!(topic = %topic, consumer_id = %consumer.id, "Topic subscriber added");
        Ok(consumer)
    }

    async fn configure_topology(&self, topology: TopologyConfig) -> Result<()> {
        for queue in topology.queues {
            let capacity = queue
                .max_length
                .unwrap_or(self.config.default_queue_length);
            self.queues
                .entry(queue.name.clone())
                .or_insert_with(|| Arc::new(QueueChannel::new(capacity, queue.drop_when_full)));
        }
        for topic in topology.topics {
            self.topics.entry(topic).or_default();
        }
        Ok(())
    }

    fn state(&self) -> TransportState {
        *self.state.read()
    }

    fn state_changes(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn health(&self) -> TransportHealth {
        let pending: i64 = self
            .queues
            .iter()
            .map(|entry| entry.value().pending.load(Ordering::Relaxed))
            .sum();
        let active_consumers = self
            .consumers
            .iter()
            .filter(|entry| entry.value().is_running())
            .count() as u32;
        TransportHealth {
            state: self.state(),
            active_connections: if self.state() == TransportState::Connected {
                1
            } else {
                0
            },
            active_consumers,
            pending_messages: pending.max(0) as u64,
            uptime: self
                .connected_at
                .read()
                .map(|at| at.elapsed())
                .unwrap_or_default(),
            last_error: self.last_error.read().clone(),
        }
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct InProcessConsumer {
    id: Uuid,
    address: String,
    options: SubscribeOptions,
    running: AtomicBool,
    started: Notify,
    cancel: CancelToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    received: AtomicU64,
    processed: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
}

impl InProcessConsumer {
    fn new(address: &str, options: SubscribeOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.to_string(),
            running: AtomicBool::new(options.start_immediately),
            options,
            started: Notify::new(),
            cancel: CancelToken::new(),
            handle: Mutex::new(None),
            received: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            acknowledged: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    async fn run(
        self: Arc<Self>,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
        pending: Arc<AtomicI64>,
        requeue_tx: mpsc::Sender<Envelope>,
        handler: Arc<dyn MessageHandler>,
    ) {
        debug!(consumer_id = %self.id, queue = %self.address, "Consumer loop started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if !self.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = self.started.notified() => continue,
                }
            }

            let envelope = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(envelope) => envelope,
                        None => break,
                    },
                }
            };
            pending.fetch_sub(1, Ordering::Relaxed);
            self.received.fetch_add(1, Ordering::Relaxed);

            let mut attempt: u32 = 0;
            let succeeded = loop {
                match handler.handle(envelope.clone()).await {
                    Ok(()) => break true,
                    Err(error) => {
                        attempt += 1;
                        if attempt >= self.options.retry.max_attempts.max(1) {
                            warn!(
                                consumer_id = %self.id,
                                message_id = %envelope.message_id,
                                attempts = attempt,
                                error = %error,
                                "Consumer handler exhausted retries"
                            );
                            break false;
                        }
                        let delay = self.options.retry.delay_for_attempt(attempt - 1);
                        debug!(
                            consumer_id = %self.id,
                            message_id = %envelope.message_id,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            "Consumer handler failed, retrying"
                        );
                        tokio::select! {
                            _ = self.cancel.cancelled() => break false,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            };

            if succeeded {
                self.processed.fetch_add(1, Ordering::Relaxed);
                if self.options.auto_acknowledge {
                    self.acknowledged.fetch_add(1, Ordering::Relaxed);
                }
            } else {
                self.failed.fetch_add(1, Ordering::Relaxed);
                // Unacknowledged: hand the message back to the queue so
                // another consumer (or a later lease) can take it.
                if requeue_tx.try_send(envelope).is_ok() {
                    pending.fetch_add(1, Ordering::Relaxed);
                } else {
                    warn!(
                        consumer_id = %self.id,
                        queue = %self.address,
                        "Could not return failed message to full queue"
                    );
                }
            }
        }
        debug!(consumer_id = %self.id, queue = %self.address, "Consumer loop exited");
    }

    async fn stop_internal(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[async_trait]
impl ConsumerHandle for InProcessConsumer {
    fn id(&self) -> Uuid {
        self.id
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn metrics(&self) -> ConsumerMetrics {
        ConsumerMetrics {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    fn start(&self) {
        if !self.running.swap(true, Ordering::SeqCst) {
            self.started.notify_one();
        }
    }

    async fn stop(&self) {
        self.stop_internal().await;
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::handler_fn;
    use mc_common::MessageKind;
    use std::collections::HashMap;
    use std::time::Duration;

    fn envelope(tag: &str) -> Envelope {
        Envelope {
            message_id: Uuid::new_v4(),
            message_type: tag.to_string(),
            kind: MessageKind::Event,
            body: serde_json::json!({}),
            correlation_id: None,
            causation_id: None,
            occurred_at: chrono::Utc::now(),
            metadata: HashMap::new(),
        }
    }

    async fn connected() -> InProcessTransport {
        let transport = InProcessTransport::default();
        transport.connect().await.unwrap();
        transport
    }

    #[tokio::test]
    async fn send_requires_connection() {
        let transport = InProcessTransport::default();
        let err = transport.send("orders", envelope("e")).await.unwrap_err();
        assert!(matches!(err, MercuryError::TransportUnavailable(_)));
    }

    #[tokio::test]
    async fn state_changes_are_broadcast() {
        let transport = InProcessTransport::default();
        let mut changes = transport.state_changes();

        transport.connect().await.unwrap();

        let first = changes.recv().await.unwrap();
        assert_eq!(first.previous, TransportState::Disconnected);
        assert_eq!(first.current, TransportState::Connecting);
        let second = changes.recv().await.unwrap();
        assert_eq!(second.current, TransportState::Connected);
    }

    #[tokio::test]
    async fn point_to_point_reaches_exactly_one_consumer() {
        let transport = connected().await;
        let seen = Arc::new(parking_lot::Mutex::new(Vec::<(u8, Uuid)>::new()));

        for consumer_index in 0u8..2 {
            let seen = Arc::clone(&seen);
            transport
                .subscribe(
                    "orders",
                    handler_fn(move |envelope: Envelope| {
                        let seen = Arc::clone(&seen);
                        async move {
                            seen.lock().push((consumer_index, envelope.message_id));
                            Ok(())
                        }
                    }),
                    SubscribeOptions::default(),
                )
                .await
                .unwrap();
        }

        let mut sent = Vec::new();
        for tag in 0..10 {
            let env = envelope(&format!("m{}", tag));
            sent.push(env.message_id);
            transport.send("orders", env).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = seen.lock();
        // Every message delivered exactly once across the group.
        let mut ids: Vec<Uuid> = seen.iter().map(|(_, id)| *id).collect();
        ids.sort();
        let mut expected = sent.clone();
        expected.sort();
        assert_eq!(ids, expected);
    }

    #[tokio::test]
    async fn topic_publish_fans_out_to_all_subscribers() {
        let transport = connected().await;
        let counts: Vec<Arc<AtomicU64>> =
            (0..3).map(|_| Arc::new(AtomicU64::new(0))).collect();

        for count in &counts {
            let count = Arc::clone(count);
            transport
                .subscribe_topic(
                    "order-events",
                    handler_fn(move |_| {
                        let count = Arc::clone(&count);
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                    SubscribeOptions::default(),
                )
                .await
                .unwrap();
        }

        transport
            .publish("order-events", envelope("e"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        for count in &counts {
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn drop_when_full_never_blocks() {
        let transport = connected().await;
        transport
            .configure_topology(TopologyConfig {
                queues: vec![QueueTopology {
                    name: "tiny".to_string(),
                    max_length: Some(2),
                    drop_when_full: true,
                }],
                topics: vec![],
            })
            .await
            .unwrap();

        // No consumer: the channel fills, later sends drop instantly.
        for tag in 0..5 {
            let before = Instant::now();
            transport
                .send("tiny", envelope(&format!("m{}", tag)))
                .await
                .unwrap();
            assert!(before.elapsed() < Duration::from_millis(50));
        }

        let health = transport.health();
        assert_eq!(health.pending_messages, 2);
    }

    #[tokio::test]
    async fn consumer_retries_then_leaves_message_unacknowledged() {
        let transport = connected().await;
        let attempts = Arc::new(AtomicU64::new(0));

        let consumer = {
            let attempts = Arc::clone(&attempts);
            transport
                .subscribe(
                    "flaky",
                    handler_fn(move |_| {
                        let attempts = Arc::clone(&attempts);
                        async move {
                            attempts.fetch_add(1, Ordering::SeqCst);
                            Err(MercuryError::handler("always fails"))
                        }
                    }),
                    SubscribeOptions {
                        retry: crate::contract::ConsumerRetryPolicy {
                            max_attempts: 3,
                            initial_delay: Duration::from_millis(1),
                            use_exponential_backoff: false,
                        },
                        ..Default::default()
                    },
                )
                .await
                .unwrap()
        };

        transport.send("flaky", envelope("e")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        consumer.stop().await;

        // 3 attempts for the first delivery; the message went back to
        // the queue, so one or more redeliveries may add multiples of 3.
        let observed = attempts.load(Ordering::SeqCst);
        assert!(observed >= 3 && observed % 3 == 0);

        let metrics = consumer.metrics();
        assert!(metrics.received >= 1);
        assert_eq!(metrics.processed, 0);
        assert_eq!(metrics.acknowledged, 0);
        assert!(metrics.failed >= 1);
        assert_eq!(metrics.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn deferred_start_holds_delivery() {
        let transport = connected().await;
        let count = Arc::new(AtomicU64::new(0));

        let consumer = {
            let count = Arc::clone(&count);
            transport
                .subscribe(
                    "deferred",
                    handler_fn(move |_| {
                        let count = Arc::clone(&count);
                        async move {
                            count.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    }),
                    SubscribeOptions {
                        start_immediately: false,
                        ..Default::default()
                    },
                )
                .await
                .unwrap()
        };

        transport.send("deferred", envelope("e")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!consumer.is_running());

        consumer.start();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_reports_consumers_and_uptime() {
        let transport = connected().await;
        transport
            .subscribe("q", handler_fn(|_| async { Ok(()) }), SubscribeOptions::default())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let health = transport.health();
        assert_eq!(health.state, TransportState::Connected);
        assert_eq!(health.active_connections, 1);
        assert_eq!(health.active_consumers, 1);
        assert!(health.uptime > Duration::ZERO);

        transport.disconnect().await.unwrap();
        let health = transport.health();
        assert_eq!(health.state, TransportState::Disconnected);
        assert_eq!(health.active_consumers, 0);
    }
}
