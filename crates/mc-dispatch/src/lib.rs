//! Message dispatch
//!
//! Resolves handlers by message-type tag from a registry built at
//! startup, invokes them through a linear pipeline of cross-cutting
//! stages, and coordinates execution through bounded per-type work
//! queues so commands of one type stay strictly ordered.
//!
//! The pipeline composition, outermost to innermost, is fixed:
//! logging, validation, signing, idempotency, circuit breaker, retry,
//! then the handler itself.

pub mod dispatcher;
pub mod dlq;
pub mod error_handler;
pub mod pipeline;
pub mod registry;
pub mod stages;

pub use dispatcher::{DispatchMetrics, Dispatcher};
pub use dlq::DeadLetterService;
pub use error_handler::{DefaultErrorHandler, ErrorAction, ErrorContext, ErrorHandler};
pub use pipeline::{Next, Pipeline, PipelineBuilder, PipelineStage};
pub use registry::{
    CommandHandler, ErasedHandler, EventHandler, HandlerEntry, HandlerRegistry, MessageValidator,
    QueryHandler,
};
pub use stages::circuit_breaker::{BreakerRegistry, BreakerState, CircuitBreakerConfig};
pub use stages::idempotency::{
    DefaultKeyGenerator, IdempotencyKeyGenerator, IdempotencyPolicy,
};
pub use stages::retry::{RetryDelay, RetryPolicy};
pub use stages::signing::{MessageSigner, SigningConfig};
