//! Wait strategies
//!
//! How a consumer parks while the cursor trails the sequence it needs.
//! Busy-spin burns a core for the lowest latency; yielding and sleeping
//! trade latency for CPU; blocking parks on a condvar and relies on
//! producers signalling after publish.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::Sequence;

/// Policy governing how a waiter parks until `cursor >= sequence`.
pub trait WaitStrategy: Send + Sync + 'static {
    /// Block until the cursor reaches `sequence`; returns the cursor value
    /// observed, which may be beyond `sequence`.
    fn wait_for(&self, sequence: i64, cursor: &Sequence) -> i64;

    /// Wake any parked waiters. Only the blocking strategy needs this;
    /// spinning strategies observe the cursor directly.
    fn signal_all(&self) {}
}

/// Spin without yielding. Lowest latency, one core per waiter.
#[derive(Debug, Default)]
pub struct BusySpinWait;

impl WaitStrategy for BusySpinWait {
    fn wait_for(&self, sequence: i64, cursor: &Sequence) -> i64 {
        loop {
            let available = cursor.get();
            if available >= sequence {
                return available;
            }
            std::hint::spin_loop();
        }
    }
}

/// Spin a bounded number of times, then yield the thread.
#[derive(Debug)]
pub struct YieldingWait {
    spin_tries: u32,
}

impl YieldingWait {
    pub fn new(spin_tries: u32) -> Self {
        Self { spin_tries }
    }
}

impl Default for YieldingWait {
    fn default() -> Self {
        Self::new(100)
    }
}

impl WaitStrategy for YieldingWait {
    fn wait_for(&self, sequence: i64, cursor: &Sequence) -> i64 {
        let mut counter = self.spin_tries;
        loop {
            let available = cursor.get();
            if available >= sequence {
                return available;
            }
            if counter > 0 {
                counter -= 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }
}

/// Spin, then yield, then park for a fixed interval.
#[derive(Debug)]
pub struct SleepingWait {
    spin_tries: u32,
    park_interval: Duration,
}

impl SleepingWait {
    pub fn new(spin_tries: u32, park_interval: Duration) -> Self {
        Self {
            spin_tries,
            park_interval,
        }
    }
}

impl Default for SleepingWait {
    fn default() -> Self {
        Self::new(100, Duration::from_micros(50))
    }
}

impl WaitStrategy for SleepingWait {
    fn wait_for(&self, sequence: i64, cursor: &Sequence) -> i64 {
        let mut counter = self.spin_tries;
        loop {
            let available = cursor.get();
            if available >= sequence {
                return available;
            }
            if counter > 50 {
                counter -= 1;
                std::hint::spin_loop();
            } else if counter > 0 {
                counter -= 1;
                std::thread::yield_now();
            } else {
                std::thread::park_timeout(self.park_interval);
            }
        }
    }
}

/// Park on a condvar until a producer signals after publishing.
///
/// The wait is timed so that a signal racing ahead of the park can never
/// strand a waiter.
#[derive(Debug, Default)]
pub struct BlockingWait {
    lock: Mutex<()>,
    condvar: Condvar,
}

impl BlockingWait {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for BlockingWait {
    fn wait_for(&self, sequence: i64, cursor: &Sequence) -> i64 {
        loop {
            let available = cursor.get();
            if available >= sequence {
                return available;
            }
            let mut guard = self.lock.lock();
            if cursor.get() >= sequence {
                return cursor.get();
            }
            self.condvar
                .wait_for(&mut guard, Duration::from_millis(1));
        }
    }

    fn signal_all(&self) {
        let _guard = self.lock.lock();
        self.condvar.notify_all();
    }
}
