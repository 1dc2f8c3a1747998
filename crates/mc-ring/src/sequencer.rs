//! Slot sequencers
//!
//! A sequencer hands out slot sequences to producers and tracks which
//! sequences have been published. Producers are gated on the minimum of
//! the registered consumer cursors: a claim that would overwrite an
//! unread slot spins until the slowest consumer advances.
//!
//! The single-producer variant needs no atomics to claim: it caches the
//! last observed gating minimum and only rescans when the claim would
//! wrap. The multi-producer variant CASes the cursor to claim and marks
//! per-slot availability with a generation stamp (`sequence >> log2(N)`),
//! so a consumer can never read a slot from the wrong lap.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::sequence::{min_sequence, Sequence};
use crate::wait::WaitStrategy;

/// Registered consumer cursors.
///
/// The list is an immutable snapshot swapped under a short write lock;
/// readers clone the `Arc` and never hold the lock while scanning.
#[derive(Default)]
pub struct GatingSequences {
    inner: RwLock<Arc<Vec<Arc<Sequence>>>>,
}

impl GatingSequences {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Vec::new())),
        }
    }

    pub fn add(&self, sequence: Arc<Sequence>) {
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        next.push(sequence);
        *guard = Arc::new(next);
    }

    pub fn remove(&self, sequence: &Arc<Sequence>) -> bool {
        let mut guard = self.inner.write();
        let before = guard.len();
        let next: Vec<Arc<Sequence>> = guard
            .iter()
            .filter(|s| !Arc::ptr_eq(s, sequence))
            .cloned()
            .collect();
        let removed = next.len() != before;
        *guard = Arc::new(next);
        removed
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<Sequence>>> {
        Arc::clone(&self.inner.read())
    }

    pub fn minimum(&self, default: i64) -> i64 {
        min_sequence(&self.snapshot(), default)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Coordinates slot claims between producers and consumers.
pub trait Sequencer: Send + Sync + 'static {
    fn buffer_size(&self) -> usize;

    /// Claim the next sequence, blocking while the ring is full.
    fn next(&self) -> i64 {
        self.next_n(1)
    }

    /// Claim `n` sequences; returns the highest claimed.
    fn next_n(&self, n: usize) -> i64;

    /// Claim without blocking; `None` when the ring lacks capacity.
    fn try_next_n(&self, n: usize) -> Option<i64>;

    /// Mark a claimed sequence available to consumers and wake waiters.
    fn publish(&self, sequence: i64);

    /// Publish an inclusive claimed range.
    fn publish_range(&self, low: i64, high: i64) {
        for sequence in low..=high {
            self.publish(sequence);
        }
    }

    /// Highest claimed sequence.
    fn cursor(&self) -> i64;

    /// The cursor cell itself, for wait strategies to park on.
    fn cursor_ref(&self) -> &Sequence;

    fn is_available(&self, sequence: i64) -> bool;

    /// Highest published sequence in `[low, high]` with no gaps below it;
    /// `low - 1` when `low` itself is unpublished.
    fn highest_published(&self, low: i64, high: i64) -> i64;

    fn add_gating_sequence(&self, sequence: Arc<Sequence>);

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool;

    fn minimum_gating_sequence(&self) -> i64;

    fn wait_strategy(&self) -> &Arc<dyn WaitStrategy>;
}

/// Sequencer for exactly one producer thread.
///
/// Claiming is plain arithmetic on producer-private state; only `publish`
/// performs a release store.
pub struct SingleProducerSequencer {
    buffer_size: usize,
    cursor: Sequence,
    /// Producer-private next claim; Relaxed is sufficient since only the
    /// single producer thread touches it.
    next_value: AtomicI64,
    cached_gating: AtomicI64,
    gating: GatingSequences,
    wait: Arc<dyn WaitStrategy>,
}

impl SingleProducerSequencer {
    pub fn new(buffer_size: usize, wait: Arc<dyn WaitStrategy>) -> Self {
        debug_assert!(buffer_size.is_power_of_two());
        Self {
            buffer_size,
            cursor: Sequence::default(),
            next_value: AtomicI64::new(Sequence::INITIAL),
            cached_gating: AtomicI64::new(Sequence::INITIAL),
            gating: GatingSequences::new(),
            wait,
        }
    }

    fn has_capacity(&self, next: i64) -> bool {
        let wrap_point = next - self.buffer_size as i64;
        if wrap_point <= self.cached_gating.load(Ordering::Relaxed) {
            return true;
        }
        let min = self.gating.minimum(self.cursor.get());
        self.cached_gating.store(min, Ordering::Relaxed);
        wrap_point <= min
    }
}

impl Sequencer for SingleProducerSequencer {
    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn next_n(&self, n: usize) -> i64 {
        debug_assert!(n >= 1 && n <= self.buffer_size);
        let next = self.next_value.load(Ordering::Relaxed) + n as i64;

        while !self.has_capacity(next) {
            std::thread::yield_now();
        }

        self.next_value.store(next, Ordering::Relaxed);
        next
    }

    fn try_next_n(&self, n: usize) -> Option<i64> {
        let next = self.next_value.load(Ordering::Relaxed) + n as i64;
        if !self.has_capacity(next) {
            return None;
        }
        self.next_value.store(next, Ordering::Relaxed);
        Some(next)
    }

    fn publish(&self, sequence: i64) {
        self.cursor.set(sequence);
        self.wait.signal_all();
    }

    fn publish_range(&self, _low: i64, high: i64) {
        self.cursor.set(high);
        self.wait.signal_all();
    }

    fn cursor(&self) -> i64 {
        self.cursor.get()
    }

    fn cursor_ref(&self) -> &Sequence {
        &self.cursor
    }

    fn is_available(&self, sequence: i64) -> bool {
        sequence <= self.cursor.get()
    }

    fn highest_published(&self, _low: i64, high: i64) -> i64 {
        high.min(self.cursor.get())
    }

    fn add_gating_sequence(&self, sequence: Arc<Sequence>) {
        self.gating.add(sequence);
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        self.gating.remove(sequence)
    }

    fn minimum_gating_sequence(&self) -> i64 {
        self.gating.minimum(self.cursor.get())
    }

    fn wait_strategy(&self) -> &Arc<dyn WaitStrategy> {
        &self.wait
    }
}

/// Sequencer for concurrent producers.
///
/// The cursor is claimed by CAS, so it can run ahead of what has been
/// published; per-slot generation stamps record publication. A consumer
/// only reads a slot once the stamp matches the expected lap.
pub struct MultiProducerSequencer {
    buffer_size: usize,
    index_mask: i64,
    index_shift: u32,
    cursor: Sequence,
    cached_gating: AtomicI64,
    available: Box<[AtomicI64]>,
    gating: GatingSequences,
    wait: Arc<dyn WaitStrategy>,
}

impl MultiProducerSequencer {
    pub fn new(buffer_size: usize, wait: Arc<dyn WaitStrategy>) -> Self {
        debug_assert!(buffer_size.is_power_of_two());
        let available = (0..buffer_size)
            .map(|_| AtomicI64::new(-1))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer_size,
            index_mask: buffer_size as i64 - 1,
            index_shift: buffer_size.trailing_zeros(),
            cursor: Sequence::default(),
            cached_gating: AtomicI64::new(Sequence::INITIAL),
            available,
            gating: GatingSequences::new(),
            wait,
        }
    }

    #[inline]
    fn availability_flag(&self, sequence: i64) -> i64 {
        sequence >> self.index_shift
    }

    #[inline]
    fn slot_index(&self, sequence: i64) -> usize {
        (sequence & self.index_mask) as usize
    }

    fn set_available(&self, sequence: i64) {
        let flag = self.availability_flag(sequence);
        self.available[self.slot_index(sequence)].store(flag, Ordering::Release);
    }

    fn has_capacity(&self, next: i64, current: i64) -> bool {
        let wrap_point = next - self.buffer_size as i64;
        if wrap_point <= self.cached_gating.load(Ordering::Relaxed) {
            return true;
        }
        let min = self.gating.minimum(current);
        self.cached_gating.store(min, Ordering::Relaxed);
        wrap_point <= min
    }
}

impl Sequencer for MultiProducerSequencer {
    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn next_n(&self, n: usize) -> i64 {
        debug_assert!(n >= 1 && n <= self.buffer_size);
        loop {
            let current = self.cursor.get();
            let next = current + n as i64;

            if !self.has_capacity(next, current) {
                std::thread::yield_now();
                continue;
            }

            if self.cursor.compare_and_set(current, next) {
                return next;
            }
            std::hint::spin_loop();
        }
    }

    fn try_next_n(&self, n: usize) -> Option<i64> {
        loop {
            let current = self.cursor.get();
            let next = current + n as i64;

            if !self.has_capacity(next, current) {
                return None;
            }

            if self.cursor.compare_and_set(current, next) {
                return Some(next);
            }
            std::hint::spin_loop();
        }
    }

    fn publish(&self, sequence: i64) {
        self.set_available(sequence);
        self.wait.signal_all();
    }

    fn publish_range(&self, low: i64, high: i64) {
        for sequence in low..=high {
            self.set_available(sequence);
        }
        self.wait.signal_all();
    }

    fn cursor(&self) -> i64 {
        self.cursor.get()
    }

    fn cursor_ref(&self) -> &Sequence {
        &self.cursor
    }

    fn is_available(&self, sequence: i64) -> bool {
        let flag = self.availability_flag(sequence);
        self.available[self.slot_index(sequence)].load(Ordering::Acquire) == flag
    }

    fn highest_published(&self, low: i64, high: i64) -> i64 {
        for sequence in low..=high {
            if !self.is_available(sequence) {
                return sequence - 1;
            }
        }
        high
    }

    fn add_gating_sequence(&self, sequence: Arc<Sequence>) {
        self.gating.add(sequence);
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        self.gating.remove(sequence)
    }

    fn minimum_gating_sequence(&self) -> i64 {
        self.gating.minimum(self.cursor.get())
    }

    fn wait_strategy(&self) -> &Arc<dyn WaitStrategy> {
        &self.wait
    }
}
