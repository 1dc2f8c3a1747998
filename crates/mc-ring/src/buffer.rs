//! Ring buffer storage and handles
//!
//! Slots are pre-allocated with `T::default()` and overwritten in place.
//! A producer claims a sequence from the sequencer, writes the slot at
//! `sequence & mask`, then publishes. A reader owns a gating `Sequence`
//! registered with the sequencer, so the producers can never lap it.

use std::cell::UnsafeCell;
use std::sync::Arc;

use crate::sequencer::{MultiProducerSequencer, Sequencer, SingleProducerSequencer};
use crate::wait::WaitStrategy;
use crate::{RingError, Result, Sequence};

struct RingInner<T> {
    slots: Box<[UnsafeCell<T>]>,
    mask: i64,
    sequencer: Arc<dyn Sequencer>,
}

// Safety: slot access is coordinated by the sequencer protocol. A slot is
// written only between claim and publish (exclusive to one producer) and
// read only at or below the published cursor while the reader's gating
// sequence prevents overwrites.
unsafe impl<T: Send> Send for RingInner<T> {}
unsafe impl<T: Send> Sync for RingInner<T> {}

/// Fixed-capacity staging buffer shared between threads.
pub struct RingBuffer<T> {
    inner: Arc<RingInner<T>>,
}

impl<T> Clone for RingBuffer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default + Send> RingBuffer<T> {
    /// Buffer for exactly one producer thread.
    pub fn single_producer(capacity: usize, wait: Arc<dyn WaitStrategy>) -> Result<Self> {
        Self::check_capacity(capacity)?;
        let sequencer: Arc<dyn Sequencer> =
            Arc::new(SingleProducerSequencer::new(capacity, wait));
        Ok(Self::with_sequencer(capacity, sequencer))
    }

    /// Buffer for concurrent producers.
    pub fn multi_producer(capacity: usize, wait: Arc<dyn WaitStrategy>) -> Result<Self> {
        Self::check_capacity(capacity)?;
        let sequencer: Arc<dyn Sequencer> =
            Arc::new(MultiProducerSequencer::new(capacity, wait));
        Ok(Self::with_sequencer(capacity, sequencer))
    }

    fn check_capacity(capacity: usize) -> Result<()> {
        if !capacity.is_power_of_two() || capacity == 0 {
            return Err(RingError::CapacityNotPowerOfTwo(capacity));
        }
        Ok(())
    }

    fn with_sequencer(capacity: usize, sequencer: Arc<dyn Sequencer>) -> Self {
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(T::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            inner: Arc::new(RingInner {
                slots,
                mask: capacity as i64 - 1,
                sequencer,
            }),
        }
    }
}

impl<T: Send> RingBuffer<T> {
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Published-but-unread slot count relative to the slowest reader.
    pub fn len(&self) -> usize {
        let produced = self.inner.sequencer.cursor();
        let consumed = self.inner.sequencer.minimum_gating_sequence();
        (produced - consumed).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn write_slot(&self, sequence: i64, value: T) {
        let index = (sequence & self.inner.mask) as usize;
        // Safety: the sequence was claimed from the sequencer, so this
        // producer has exclusive access to the slot and no gating reader
        // is at or below it.
        unsafe {
            *self.inner.slots[index].get() = value;
        }
    }

    /// Claim the next slot, write, publish. Blocks while the ring is full.
    pub fn push(&self, value: T) -> i64 {
        let sequence = self.inner.sequencer.next();
        self.write_slot(sequence, value);
        self.inner.sequencer.publish(sequence);
        sequence
    }

    /// Non-blocking push; hands the value back when the ring is full.
    pub fn try_push(&self, value: T) -> std::result::Result<i64, T> {
        match self.inner.sequencer.try_next_n(1) {
            Some(sequence) => {
                self.write_slot(sequence, value);
                self.inner.sequencer.publish(sequence);
                Ok(sequence)
            }
            None => Err(value),
        }
    }

    /// Register a new reader starting after everything already published.
    pub fn reader(&self) -> RingReader<T> {
        let sequence = Arc::new(Sequence::new(self.inner.sequencer.cursor()));
        self.inner
            .sequencer
            .add_gating_sequence(Arc::clone(&sequence));
        RingReader {
            inner: Arc::clone(&self.inner),
            sequence,
        }
    }
}

/// Consumer handle owning a gating sequence.
pub struct RingReader<T> {
    inner: Arc<RingInner<T>>,
    sequence: Arc<Sequence>,
}

impl<T: Clone + Send> RingReader<T> {
    /// Sequence of the last slot this reader consumed.
    pub fn sequence(&self) -> i64 {
        self.sequence.get()
    }

    #[inline]
    fn read_slot(&self, sequence: i64) -> T {
        let index = (sequence & self.inner.mask) as usize;
        // Safety: `sequence` is published and this reader's gating
        // sequence is below it, so no producer can be writing the slot.
        unsafe { (*self.inner.slots[index].get()).clone() }
    }

    /// Non-blocking read of the next published slot.
    pub fn try_recv(&self) -> Option<T> {
        let next = self.sequence.get() + 1;
        let cursor = self.inner.sequencer.cursor();
        if cursor < next {
            return None;
        }
        if self.inner.sequencer.highest_published(next, next) < next {
            return None;
        }
        let value = self.read_slot(next);
        self.sequence.set(next);
        Some(value)
    }

    /// Block (per the buffer's wait strategy) until the next slot is
    /// published, then read it.
    pub fn recv(&self) -> T {
        let next = self.sequence.get() + 1;
        let wait = Arc::clone(self.inner.sequencer.wait_strategy());
        loop {
            let available = wait.wait_for(next, self.inner.sequencer.cursor_ref());
            // With concurrent producers the cursor can run ahead of what
            // has been published; settle on the contiguous prefix.
            if self.inner.sequencer.highest_published(next, available) >= next {
                break;
            }
            std::hint::spin_loop();
        }
        let value = self.read_slot(next);
        self.sequence.set(next);
        value
    }

    /// Drain up to `max` published slots without blocking.
    pub fn drain(&self, max: usize) -> Vec<T> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.try_recv() {
                Some(value) => out.push(value),
                None => break,
            }
        }
        out
    }
}

impl<T> Drop for RingReader<T> {
    fn drop(&mut self) {
        // Unregister so a dropped reader can no longer stall producers.
        self.inner.sequencer.remove_gating_sequence(&self.sequence);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wait::{BlockingWait, BusySpinWait};

    #[test]
    fn rejects_non_power_of_two() {
        let result = RingBuffer::<u64>::single_producer(6, Arc::new(BusySpinWait));
        assert!(matches!(result, Err(RingError::CapacityNotPowerOfTwo(6))));
    }

    #[test]
    fn push_and_drain_in_order() {
        let ring = RingBuffer::<u64>::single_producer(8, Arc::new(BusySpinWait)).unwrap();
        let reader = ring.reader();

        for value in 1..=5u64 {
            ring.push(value);
        }

        assert_eq!(reader.drain(10), vec![1, 2, 3, 4, 5]);
        assert!(reader.try_recv().is_none());
    }

    #[test]
    fn try_push_reports_full_without_blocking() {
        let ring = RingBuffer::<u64>::single_producer(4, Arc::new(BusySpinWait)).unwrap();
        let reader = ring.reader();

        for value in 0..4u64 {
            assert!(ring.try_push(value).is_ok());
        }
        // Slowest reader has consumed nothing: full.
        assert_eq!(ring.try_push(99), Err(99));

        assert_eq!(reader.try_recv(), Some(0));
        assert!(ring.try_push(99).is_ok());
    }

    #[test]
    fn producer_never_laps_reader() {
        let ring = RingBuffer::<u64>::multi_producer(4, Arc::new(BusySpinWait)).unwrap();
        let reader = ring.reader();

        for value in 0..4u64 {
            ring.push(value);
        }
        assert!(ring.try_push(4).is_err());

        // Consuming one slot frees exactly one claim.
        assert_eq!(reader.try_recv(), Some(0));
        assert!(ring.try_push(4).is_ok());
        assert!(ring.try_push(5).is_err());

        assert_eq!(reader.drain(10), vec![1, 2, 3, 4]);
    }

    #[test]
    fn multi_producer_threads_deliver_everything() {
        let ring = RingBuffer::<u64>::multi_producer(64, Arc::new(BusySpinWait)).unwrap();
        let reader = ring.reader();

        let mut handles = Vec::new();
        for producer in 0..4u64 {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100u64 {
                    ring.push(producer * 1000 + i);
                }
            }));
        }

        let mut seen = Vec::new();
        while seen.len() < 400 {
            if let Some(value) = reader.try_recv() {
                seen.push(value);
            } else {
                std::thread::yield_now();
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 400);
    }

    #[test]
    fn blocking_reader_wakes_on_publish() {
        let ring = RingBuffer::<u64>::single_producer(8, Arc::new(BlockingWait::new())).unwrap();
        let reader = ring.reader();

        let writer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                ring.push(42);
            })
        };

        assert_eq!(reader.recv(), 42);
        writer.join().unwrap();
    }
}
