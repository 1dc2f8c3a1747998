//! Reliable delivery: outbox and inbox
//!
//! The outbox persists envelopes alongside the caller's business writes
//! and a background loop publishes them with per-entry retry and
//! dead-lettering. The inbox deduplicates ingress by `(message_id,
//! source)` within a window and marks processing atomically, giving
//! exactly-once semantics when the backing store's claim-then-mark is
//! transactional.

pub mod inbox;
pub mod processor;

pub use inbox::InboxProcessor;
pub use processor::{OutboxProcessor, OutboxProcessorConfig, OutboxPublisher};
