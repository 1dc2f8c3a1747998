//! Background execution building blocks
//!
//! - `WorkQueue`: a bounded execution block with configurable parallelism,
//!   wait-or-drop overflow behavior, and error-isolated work items
//! - `PollLoop`: a reusable poll-throttle-dispatch driver for everything
//!   that periodically drains a store (outbox dispatch, queue workers,
//!   retry timers)
//! - `Lifecycle`: the state machine every long-lived component reports
//!   through

mod lifecycle;
mod poll;
mod work_queue;

pub use lifecycle::{Lifecycle, LifecycleError, LifecycleState};
pub use poll::{PollLoop, PollLoopConfig, PollSource};
pub use work_queue::{OverflowPolicy, Submitted, WorkQueue, WorkQueueConfig, WorkQueueError};
