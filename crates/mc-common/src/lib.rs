use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod cancel;
pub mod entries;
pub mod logging;
pub mod serializer;

pub use cancel::CancelToken;
pub use entries::{
    DeadLetterEntry, DeadLetterStatistics, DeadLetterStatus, IdempotencyResponse,
    IdempotencyStatus, InboxEntry, InboxStatus, OutboxEntry, OutboxStatus, QueuedEnvelope,
};

// ============================================================================
// Core Message Types
// ============================================================================

/// The message category carried by an envelope.
///
/// Commands and queries resolve to exactly one handler; events fan out to
/// any number of handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Command,
    Query,
    Event,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageKind::Command => write!(f, "COMMAND"),
            MessageKind::Query => write!(f, "QUERY"),
            MessageKind::Event => write!(f, "EVENT"),
        }
    }
}

/// The opaque envelope that flows through every subsystem.
///
/// The typed message is carried as a JSON body together with a stable
/// type tag; the dispatch registry is keyed by that tag, so no runtime
/// type inspection is ever needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: Uuid,
    pub message_type: String,
    pub kind: MessageKind,
    pub body: serde_json::Value,
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    #[serde(default)]
    pub causation_id: Option<Uuid>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Envelope {
    fn new(message_type: &str, kind: MessageKind, body: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            message_type: message_type.to_string(),
            kind,
            body,
            correlation_id: None,
            causation_id: None,
            occurred_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Wrap a typed command.
    pub fn command<C: CommandMessage>(command: &C) -> Result<Self> {
        let body = serde_json::to_value(command).map_err(MercuryError::serialization)?;
        Ok(Self::new(C::message_type(), MessageKind::Command, body))
    }

    /// Wrap a typed query.
    pub fn query<Q: QueryMessage>(query: &Q) -> Result<Self> {
        let body = serde_json::to_value(query).map_err(MercuryError::serialization)?;
        Ok(Self::new(Q::message_type(), MessageKind::Query, body))
    }

    /// Wrap a typed event.
    pub fn event<E: EventMessage>(event: &E) -> Result<Self> {
        let body = serde_json::to_value(event).map_err(MercuryError::serialization)?;
        Ok(Self::new(E::message_type(), MessageKind::Event, body))
    }

    /// Deserialize the body back into its typed form.
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M> {
        serde_json::from_value(self.body.clone()).map_err(MercuryError::serialization)
    }

    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// A typed command: intent to mutate state, at most one handler, optional
/// typed response.
pub trait CommandMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Response: Serialize + DeserializeOwned + Send + 'static;

    fn message_type() -> &'static str;
}

/// A typed read-only query with exactly one handler and a typed response.
pub trait QueryMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Response: Serialize + DeserializeOwned + Send + 'static;

    fn message_type() -> &'static str;
}

/// A typed notification; fan-out to zero or more handlers, no response.
pub trait EventMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn message_type() -> &'static str;
}

// ============================================================================
// Processing Context
// ============================================================================

/// Immutable per-invocation context threaded through the pipeline.
///
/// Mutation is copy-with-update; clones are cheap (the metadata map is
/// behind an `Arc`). Cancellation and the optional deadline travel here so
/// every suspension point can honor them.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    component: Arc<str>,
    handler_type: Option<Arc<str>>,
    retry_count: u32,
    first_failure_at: Option<DateTime<Utc>>,
    metadata: Arc<HashMap<String, String>>,
    cancel: CancelToken,
    deadline: Option<Instant>,
}

impl ProcessingContext {
    pub fn new(component: &str) -> Self {
        Self {
            component: Arc::from(component),
            handler_type: None,
            retry_count: 0,
            first_failure_at: None,
            metadata: Arc::new(HashMap::new()),
            cancel: CancelToken::new(),
            deadline: None,
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn handler_type(&self) -> Option<&str> {
        self.handler_type.as_deref()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn first_failure_at(&self) -> Option<DateTime<Utc>> {
        self.first_failure_at
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn with_component(&self, component: &str) -> Self {
        let mut next = self.clone();
        next.component = Arc::from(component);
        next
    }

    pub fn with_handler_type(&self, handler_type: &str) -> Self {
        let mut next = self.clone();
        next.handler_type = Some(Arc::from(handler_type));
        next
    }

    pub fn with_retry_count(&self, retry_count: u32) -> Self {
        let mut next = self.clone();
        next.retry_count = retry_count;
        if retry_count > 0 && next.first_failure_at.is_none() {
            next.first_failure_at = Some(Utc::now());
        }
        next
    }

    pub fn with_metadata(&self, key: &str, value: &str) -> Self {
        let mut next = self.clone();
        let mut map = (*next.metadata).clone();
        map.insert(key.to_string(), value.to_string());
        next.metadata = Arc::new(map);
        next
    }

    pub fn with_cancel_token(&self, cancel: CancelToken) -> Self {
        let mut next = self.clone();
        next.cancel = cancel;
        next
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut next = self.clone();
        next.deadline = Some(deadline);
        next
    }

    /// Remaining time before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fails with `Cancelled` or `Timeout` when the context is no longer live.
    pub fn check_live(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(MercuryError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(MercuryError::Timeout);
            }
        }
        Ok(())
    }
}

impl Default for ProcessingContext {
    fn default() -> Self {
        Self::new("mercury")
    }
}

// ============================================================================
// Processing Result
// ============================================================================

/// Outcome of a pipeline invocation.
///
/// Expected failures travel as values; only cancellation and catastrophic
/// faults unwind.
#[derive(Debug, Clone)]
pub enum ProcessingResult {
    Success(Option<serde_json::Value>),
    Failure {
        error: MercuryError,
        message: Option<String>,
    },
}

impl ProcessingResult {
    pub fn success() -> Self {
        ProcessingResult::Success(None)
    }

    pub fn success_with(data: serde_json::Value) -> Self {
        ProcessingResult::Success(Some(data))
    }

    pub fn failure(error: MercuryError) -> Self {
        ProcessingResult::Failure {
            error,
            message: None,
        }
    }

    pub fn failure_with(error: MercuryError, message: &str) -> Self {
        ProcessingResult::Failure {
            error,
            message: Some(message.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingResult::Success(_))
    }

    pub fn data(&self) -> Option<&serde_json::Value> {
        match self {
            ProcessingResult::Success(data) => data.as_ref(),
            ProcessingResult::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&MercuryError> {
        match self {
            ProcessingResult::Success(_) => None,
            ProcessingResult::Failure { error, .. } => Some(error),
        }
    }

    /// Collapse into a `Result` for callers that want `?` propagation.
    pub fn into_result(self) -> Result<Option<serde_json::Value>> {
        match self {
            ProcessingResult::Success(data) => Ok(data),
            ProcessingResult::Failure { error, .. } => Err(error),
        }
    }
}

impl From<Result<Option<serde_json::Value>>> for ProcessingResult {
    fn from(value: Result<Option<serde_json::Value>>) -> Self {
        match value {
            Ok(data) => ProcessingResult::Success(data),
            Err(error) => ProcessingResult::failure(error),
        }
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Pipeline and dispatch tuning.
#[derive(Debug, Clone)]
pub struct ProcessingConfig {
    /// Upper bound on concurrently running handler invocations.
    pub max_concurrency: usize,
    /// Strict FIFO per message type when true.
    pub sequential_processing: bool,
    /// Per-operation deadline composed into the context.
    pub processing_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub enable_circuit_breaker: bool,
    /// Consecutive failures before the breaker opens.
    pub circuit_breaker_threshold: u32,
    /// Time the breaker stays open before a half-open probe.
    pub circuit_breaker_timeout: Duration,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            sequential_processing: true,
            processing_timeout: Duration::from_secs(300),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            enable_circuit_breaker: true,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
        }
    }
}

/// Options for enqueueing a message onto a named queue.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub priority: i32,
    /// Visibility delay; the message becomes leasable at `now + delay`.
    pub delay: Option<Duration>,
    pub metadata: HashMap<String, String>,
}

/// Options for a store-and-forward publish.
#[derive(Debug, Clone)]
pub struct OutboxOptions {
    pub destination: String,
    pub priority: i32,
    pub max_retries: u32,
    /// Fixed delay between attempts; exponential backoff when absent.
    pub retry_delay: Option<Duration>,
}

impl OutboxOptions {
    pub fn to_destination(destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            priority: 0,
            max_retries: 3,
            retry_delay: None,
        }
    }
}

/// Options for deduplicated ingress processing.
#[derive(Debug, Clone)]
pub struct InboxOptions {
    pub source: String,
    pub require_idempotency: bool,
    pub deduplication_window: Duration,
}

impl InboxOptions {
    pub fn from_source(source: &str) -> Self {
        Self {
            source: source.to_string(),
            require_idempotency: true,
            deduplication_window: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// Top-level configuration consumed by the facade.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub processing: ProcessingConfig,
}

// ============================================================================
// Health & Metrics Types
// ============================================================================

/// Overall system health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// All systems operational
    Healthy,
    /// Some issues detected but operational
    Warning,
    /// Significant issues affecting operations
    Degraded,
}

/// Aggregated health report surfaced by the facade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub transport_connected: bool,
    pub active_consumers: u32,
    pub running_queues: u32,
    pub pending_outbox: u64,
    pub dead_letter_count: u64,
    pub uptime_seconds: u64,
    pub issues: Vec<String>,
}

/// Point-in-time counters surfaced by the facade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub commands_sent: u64,
    pub queries_sent: u64,
    pub events_published: u64,
    pub messages_handled: u64,
    pub messages_failed: u64,
    pub messages_retried: u64,
    pub messages_dead_lettered: u64,
    pub outbox_pending: u64,
    pub queue_depths: HashMap<String, u64>,
}

// ============================================================================
// Error Types
// ============================================================================

/// Failure classes driving retry/dead-letter policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retryable with backoff.
    Transient,
    /// Will never succeed; discard or dead-letter.
    Permanent,
    /// Unexpected handler fault; dead-letter after retries.
    Programmatic,
    /// Propagate to the caller immediately.
    Fatal,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MercuryError {
    #[error("No handler registered for message type '{0}'")]
    HandlerMissing(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Message signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Circuit open for '{0}'")]
    CircuitOpen(String),

    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    #[error("Idempotency key collision for '{0}'")]
    IdempotencyCollision(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    Timeout,

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Duplicate message {message_id} from source '{source_name}'")]
    DuplicateMessage { message_id: Uuid, source_name: String },

    #[error("Queue '{0}' is not started")]
    QueueDisabled(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MercuryError {
    pub fn serialization(e: serde_json::Error) -> Self {
        MercuryError::Serialization(e.to_string())
    }

    pub fn handler(message: impl Into<String>) -> Self {
        MercuryError::Handler(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        MercuryError::Internal(message.into())
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            MercuryError::Timeout
            | MercuryError::TransportUnavailable(_)
            | MercuryError::StorageUnavailable(_)
            | MercuryError::CircuitOpen(_) => ErrorClass::Transient,

            MercuryError::HandlerMissing(_)
            | MercuryError::ValidationFailed(_)
            | MercuryError::SignatureInvalid(_)
            | MercuryError::IdempotencyCollision(_)
            | MercuryError::DuplicateMessage { .. }
            | MercuryError::QueueDisabled(_)
            | MercuryError::Serialization(_)
            | MercuryError::RetryExhausted { .. } => ErrorClass::Permanent,

            MercuryError::Handler(_) | MercuryError::Internal(_) => ErrorClass::Programmatic,

            MercuryError::Cancelled => ErrorClass::Fatal,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Stable tag for metrics labels and dead-letter statistics.
    pub fn kind(&self) -> &'static str {
        match self {
            MercuryError::HandlerMissing(_) => "handler_missing",
            MercuryError::ValidationFailed(_) => "validation_failed",
            MercuryError::SignatureInvalid(_) => "signature_invalid",
            MercuryError::CircuitOpen(_) => "circuit_open",
            MercuryError::RetryExhausted { .. } => "retry_exhausted",
            MercuryError::IdempotencyCollision(_) => "idempotency_collision",
            MercuryError::Cancelled => "cancelled",
            MercuryError::Timeout => "timeout",
            MercuryError::TransportUnavailable(_) => "transport_unavailable",
            MercuryError::StorageUnavailable(_) => "storage_unavailable",
            MercuryError::DuplicateMessage { .. } => "duplicate_message",
            MercuryError::QueueDisabled(_) => "queue_disabled",
            MercuryError::Serialization(_) => "serialization",
            MercuryError::Handler(_) => "handler_failed",
            MercuryError::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, MercuryError>;
