//! Lock-free inter-thread staging buffer
//!
//! A fixed-size power-of-two ring with sequencer-coordinated slot access:
//! - `Sequence`: cache-line padded monotonically increasing cursor
//! - `SingleProducerSequencer` / `MultiProducerSequencer`: slot claiming
//!   with gating against the slowest consumer
//! - `WaitStrategy`: busy-spin, yielding, sleeping, or blocking parks
//! - `RingBuffer`: the slot storage plus producer/consumer handles
//!
//! Producers never lap a registered consumer; consumers never observe a
//! slot whose availability generation does not match the sequence they
//! are reading.

mod buffer;
mod sequence;
mod sequencer;
mod wait;

pub use buffer::{RingBuffer, RingReader};
pub use sequence::{min_sequence, Sequence};
pub use sequencer::{
    GatingSequences, MultiProducerSequencer, Sequencer, SingleProducerSequencer,
};
pub use wait::{BlockingWait, BusySpinWait, SleepingWait, WaitStrategy, YieldingWait};

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("Ring capacity must be a power of two, got {0}")]
    CapacityNotPowerOfTwo(usize),

    #[error("Ring is full")]
    Full,
}

pub type Result<T> = std::result::Result<T, RingError>;
