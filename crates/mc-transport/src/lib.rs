//! Transport contract and in-process implementation
//!
//! A transport is an opaque endpoint: point-to-point `send` delivers to
//! exactly one consumer of the addressed queue, `publish` fans out to
//! every live topic subscriber. The in-process implementation backs each
//! queue with one bounded channel (wait-or-drop on overflow), runs
//! consumers with per-message retry, and reports a connection state
//! machine plus health.

pub mod contract;
pub mod in_process;

pub use contract::{
    handler_fn, ConsumerHandle, ConsumerMetrics, ConsumerRetryPolicy, MessageHandler,
    QueueTopology, StateChange, SubscribeOptions, TopologyConfig, Transport, TransportHealth,
    TransportState,
};
pub use in_process::InProcessTransport;
