//! Transport contract
//!
//! The seam everything above the wire talks through. Implementations
//! report a connection state machine; transitions surface as
//! `StateChange` notifications on a broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mc_common::{Envelope, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Faulted,
    Disconnecting,
}

/// Raised on every state transition.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub previous: TransportState,
    pub current: TransportState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TransportHealth {
    pub state: TransportState,
    pub active_connections: u32,
    pub active_consumers: u32,
    pub pending_messages: u64,
    pub uptime: Duration,
    pub last_error: Option<String>,
}

/// Pre-declared queue shape.
#[derive(Debug, Clone)]
pub struct QueueTopology {
    pub name: String,
    /// Bounded channel capacity; `None` falls back to the transport
    /// default (with a warning, since unbounded growth is never free).
    pub max_length: Option<usize>,
    /// Drop new writes when full instead of making senders wait.
    pub drop_when_full: bool,
}

impl QueueTopology {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            max_length: None,
            drop_when_full: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TopologyConfig {
    pub queues: Vec<QueueTopology>,
    pub topics: Vec<String>,
}

/// Per-message retry applied by a consumer before giving up.
#[derive(Debug, Clone)]
pub struct ConsumerRetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub use_exponential_backoff: bool,
}

impl Default for ConsumerRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            use_exponential_backoff: true,
        }
    }
}

impl ConsumerRetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.use_exponential_backoff {
            let factor = 2u32.saturating_pow(attempt.min(16));
            self.initial_delay.saturating_mul(factor)
        } else {
            self.initial_delay
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Begin delivery as soon as the subscription exists.
    pub start_immediately: bool,
    /// Acknowledge automatically after a successful handler run.
    pub auto_acknowledge: bool,
    pub retry: ConsumerRetryPolicy,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            start_immediately: true,
            auto_acknowledge: true,
            retry: ConsumerRetryPolicy::default(),
        }
    }
}

/// Delivery counters for one consumer.
#[derive(Debug, Clone, Default)]
pub struct ConsumerMetrics {
    pub received: u64,
    pub processed: u64,
    pub acknowledged: u64,
    pub failed: u64,
}

impl ConsumerMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.received == 0 {
            return 1.0;
        }
        self.processed as f64 / self.received as f64
    }
}

/// Consumer-side message callback.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<()>> + Send,
{
    async fn handle(&self, envelope: Envelope) -> Result<()> {
        (self.0)(envelope).await
    }
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Handle to a running subscription.
#[async_trait]
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> Uuid;

    fn address(&self) -> &str;

    fn metrics(&self) -> ConsumerMetrics;

    /// Begin delivery for a consumer created with
    /// `start_immediately = false`.
    fn start(&self);

    /// Halt delivery; the in-flight handler completes first.
    async fn stop(&self);

    fn is_running(&self) -> bool;
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    /// Point-to-point: delivered to exactly one consumer of the queue.
    async fn send(&self, address: &str, envelope: Envelope) -> Result<()>;

    /// Fan-out: delivered to each live subscriber of the topic.
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()>;

    /// Join the competing consumers of a queue.
    async fn subscribe(
        &self,
        address: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<Arc<dyn ConsumerHandle>>;

    /// Subscribe to a topic with a private delivery queue.
    async fn subscribe_topic(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<Arc<dyn ConsumerHandle>>;

    async fn configure_topology(&self, topology: TopologyConfig) -> Result<()>;

    fn state(&self) -> TransportState;

    fn state_changes(&self) -> broadcast::Receiver<StateChange>;

    fn health(&self) -> TransportHealth;
}
