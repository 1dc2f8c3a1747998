//! Named-queue background processing engine
//!
//! Messages are persisted with priority, optional visibility delay, and
//! metadata; per-queue worker loops lease ready messages (priority desc,
//! oldest first), dispatch them, and acknowledge, requeue with backoff,
//! or dead-letter based on the error handler's decision. Queues start
//! and stop independently; stopping drains in-flight work.

pub mod engine;

pub use engine::{QueueEngine, QueueWorkerConfig};
