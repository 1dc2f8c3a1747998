//! Padded atomic sequence counters
//!
//! A `Sequence` is a 64-bit cursor padded out to its own cache line so
//! that producer and consumer cursors never false-share. Sequences start
//! at -1: the first claimed slot is sequence 0.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Cache-line padded monotonically increasing cursor.
#[repr(C, align(128))]
pub struct Sequence {
    value: AtomicI64,
}

impl Sequence {
    pub const INITIAL: i64 = -1;

    pub fn new(initial: i64) -> Self {
        Self {
            value: AtomicI64::new(initial),
        }
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Store without publishing semantics; used for producer-private state.
    #[inline]
    pub fn set_relaxed(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    #[inline]
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn add_and_get(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::AcqRel) + delta
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(Self::INITIAL)
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Sequence").field(&self.get()).finish()
    }
}

/// Minimum over a set of consumer cursors, or `default` when empty.
pub fn min_sequence(sequences: &[Arc<Sequence>], default: i64) -> i64 {
    sequences
        .iter()
        .map(|s| s.get())
        .min()
        .unwrap_or(default)
}
