//! Bounded execution block
//!
//! Work items are opaque async jobs fed through a bounded channel to a
//! fixed set of workers. With parallelism 1 the block processes strictly
//! in submission order, which is how the dispatcher keeps per-message-type
//! FIFO. When the channel is full a submitter either waits (backpressure)
//! or has the item dropped, per the configured overflow policy.
//!
//! Item failures are isolated: a failing or panicking item is logged and
//! the block keeps draining. `complete()` closes the intake, drains what
//! was accepted, and joins the workers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type WorkItem = BoxFuture<'static, anyhow::Result<()>>;

/// What to do with a new item when the block is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Submitter waits for space.
    #[default]
    Wait,
    /// The new item is discarded; the submitter never blocks.
    Drop,
}

/// Outcome of a submit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Accepted,
    /// Only possible under `OverflowPolicy::Drop`.
    Dropped,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkQueueError {
    #[error("Work queue '{0}' is completed and no longer accepts items")]
    Closed(String),
}

#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// Name used in logs and metrics labels.
    pub name: String,
    /// Concurrent workers draining the block.
    pub max_parallelism: usize,
    /// Bounded channel capacity.
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    /// Forces effective parallelism to 1 regardless of `max_parallelism`.
    pub ensure_ordered: bool,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        Self {
            name: "work".to_string(),
            max_parallelism: 1,
            capacity: 100,
            overflow: OverflowPolicy::Wait,
            ensure_ordered: false,
        }
    }
}

impl WorkQueueConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    fn effective_parallelism(&self) -> usize {
        if self.ensure_ordered {
            1
        } else {
            self.max_parallelism.max(1)
        }
    }
}

/// Bounded work block with a fixed worker set.
pub struct WorkQueue {
    config: WorkQueueConfig,
    tx: SyncMutex<Option<mpsc::Sender<WorkItem>>>,
    workers: SyncMutex<Vec<JoinHandle<()>>>,
    accepted: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

impl WorkQueue {
    pub fn new(config: WorkQueueConfig) -> Self {
        let (tx, rx) = mpsc::channel::<WorkItem>(config.capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let accepted = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        let workers = (0..config.effective_parallelism())
            .map(|worker_index| {
                let rx = Arc::clone(&rx);
                let failed = Arc::clone(&failed);
                let name = config.name.clone();
                tokio::spawn(async move {
                    Self::run_worker(name, worker_index, rx, failed).await;
                })
            })
            .collect();

        Self {
            config,
            tx: SyncMutex::new(Some(tx)),
            workers: SyncMutex::new(workers),
            accepted,
            dropped,
            failed,
        }
    }

    async fn run_worker(
        name: String,
        worker_index: usize,
        rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
        failed: Arc<AtomicU64>,
    ) {
        debug!(queue = %name, worker = worker_index, "Work queue worker started");
        loop {
            // Hold the receiver lock only for the dequeue; siblings run
            // items concurrently.
            let item = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };

            let Some(item) = item else {
                break;
            };

            // Items run in an isolated scope; observing a panic from one
            // leaves the worker healthy, so asserting unwind safety is
            // sound here.
            match std::panic::AssertUnwindSafe(item).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    warn!(queue = %name, worker = worker_index, error = %e, "Work item failed");
                }
                Err(_) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    error!(queue = %name, worker = worker_index, "Work item panicked");
                }
            }
        }
        debug!(queue = %name, worker = worker_index, "Work queue worker exited");
    }

    /// Submit a work item.
    ///
    /// Under `OverflowPolicy::Wait` this suspends until the block has
    /// space; under `Drop` it returns `Submitted::Dropped` immediately
    /// when full.
    pub async fn submit<F>(&self, work: F) -> Result<Submitted, WorkQueueError>
    where
        F: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let item: WorkItem = work.boxed();
        let Some(tx) = self.tx.lock().clone() else {
            return Err(WorkQueueError::Closed(self.config.name.clone()));
        };
        match self.config.overflow {
            OverflowPolicy::Wait => match tx.send(item).await {
                Ok(()) => {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    Ok(Submitted::Accepted)
                }
                Err(_) => Err(WorkQueueError::Closed(self.config.name.clone())),
            },
            OverflowPolicy::Drop => match tx.try_send(item) {
                Ok(()) => {
                    self.accepted.fetch_add(1, Ordering::Relaxed);
                    Ok(Submitted::Accepted)
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(queue = %self.config.name, "Work queue full, item dropped");
                    Ok(Submitted::Dropped)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(WorkQueueError::Closed(self.config.name.clone()))
                }
            },
        }
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Close the intake, drain accepted items, and join the workers.
    pub async fn complete(&self) {
        drop(self.tx.lock().take());
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    error!(queue = %self.config.name, error = %e, "Work queue worker join failed");
                }
            }
        }
        debug!(queue = %self.config.name, "Work queue completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn processes_in_submission_order_with_single_worker() {
        let queue = WorkQueue::new(WorkQueueConfig::named("ordered"));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..10u32 {
            let seen = Arc::clone(&seen);
            queue
                .submit(async move {
                    seen.lock().push(i);
                    Ok(())
                })
                .await
                .unwrap();
        }

        queue.complete().await;
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn drop_policy_never_blocks() {
        let queue = WorkQueue::new(
            WorkQueueConfig::named("droppy")
                .with_capacity(1)
                .with_overflow(OverflowPolicy::Drop),
        );

        // Keep the single worker busy so the channel stays occupied.
        let gate = Arc::new(tokio::sync::Notify::new());
        let gate_clone = Arc::clone(&gate);
        queue
            .submit(async move {
                gate_clone.notified().await;
                Ok(())
            })
            .await
            .unwrap();

        // Fill the channel slot, then overflow.
        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(queue.submit(async { Ok(()) }).await.unwrap());
        }
        assert!(outcomes.contains(&Submitted::Dropped));
        assert!(queue.dropped_count() > 0);

        gate.notify_one();
        queue.complete().await;
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_block() {
        let queue = WorkQueue::new(WorkQueueConfig::named("isolated"));
        let completed = Arc::new(AtomicUsize::new(0));

        queue
            .submit(async { Err(anyhow::anyhow!("expected failure")) })
            .await
            .unwrap();

        let completed_clone = Arc::clone(&completed);
        queue
            .submit(async move {
                completed_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        queue.complete().await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panics_are_isolated() {
        let queue = WorkQueue::new(WorkQueueConfig::named("panicky"));
        let completed = Arc::new(AtomicUsize::new(0));

        let trip = true;
        queue
            .submit(async move {
                if trip {
                    panic!("boom");
                }
                Ok(())
            })
            .await
            .unwrap();

        let completed_clone = Arc::clone(&completed);
        queue
            .submit(async move {
                completed_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();

        // Give the worker time to run both items before completing.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.failed_count(), 1);

        queue.complete().await;
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn parallel_workers_drain_concurrently() {
        let queue = WorkQueue::new(
            WorkQueueConfig::named("wide")
                .with_parallelism(4)
                .with_capacity(16),
        );
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            queue
                .submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }

        queue.complete().await;
        assert!(peak.load(Ordering::SeqCst) > 1);
    }
}
