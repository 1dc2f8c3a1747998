//! Poll-throttle-dispatch loop
//!
//! The generic driver behind every background drain: poll a source for a
//! finite batch, feed the items to a bounded work queue, sleep the busy
//! or idle delay, repeat. Poll errors back off on their own delay. The
//! loop stops on the shutdown signal; accepted items are drained before
//! the task exits, so a graceful stop loses nothing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::work_queue::{WorkQueue, WorkQueueConfig};

/// A pollable source of work.
#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Fetch the next finite batch; an empty vec means idle.
    async fn poll(&self) -> anyhow::Result<Vec<Self::Item>>;

    /// Process one polled item.
    async fn process(&self, item: Self::Item) -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
pub struct PollLoopConfig {
    /// Sleep after an empty poll.
    pub idle_delay: Duration,
    /// Sleep after a productive poll.
    pub busy_delay: Duration,
    /// Sleep after a poll error.
    pub error_delay: Duration,
    pub work_queue: WorkQueueConfig,
}

impl Default for PollLoopConfig {
    fn default() -> Self {
        Self {
            idle_delay: Duration::from_secs(1),
            busy_delay: Duration::from_millis(100),
            error_delay: Duration::from_secs(5),
            work_queue: WorkQueueConfig::default(),
        }
    }
}

pub struct PollLoop;

impl PollLoop {
    /// Spawn the loop as a background task; it runs until `shutdown`
    /// fires, then drains its work queue and exits.
    pub fn spawn<S: PollSource>(
        name: &str,
        source: Arc<S>,
        config: PollLoopConfig,
        shutdown: broadcast::Sender<()>,
    ) -> JoinHandle<()> {
        let name = name.to_string();
        let mut shutdown_rx = shutdown.subscribe();

        tokio::spawn(async move {
            info!(
                poller = %name,
                idle_delay_ms = config.idle_delay.as_millis() as u64,
                busy_delay_ms = config.busy_delay.as_millis() as u64,
                "Poll loop started"
            );

            let mut work_queue_config = config.work_queue.clone();
            work_queue_config.name = name.clone();
            let queue = WorkQueue::new(work_queue_config);

            loop {
                let polled = tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    polled = source.poll() => polled,
                };

                let delay = match polled {
                    Ok(items) if !items.is_empty() => {
                        debug!(poller = %name, count = items.len(), "Polled work items");
                        metrics::counter!("mercury.poll.items", "poller" => name.clone())
                            .increment(items.len() as u64);

                        let mut closed = false;
                        for item in items {
                            let source = Arc::clone(&source);
                            let submit = queue
                                .submit(async move { source.process(item).await })
                                .await;
                            if submit.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                        config.busy_delay
                    }
                    Ok(_) => config.idle_delay,
                    Err(e) => {
                        error!(poller = %name, error = %e, "Poll failed");
                        metrics::counter!("mercury.poll.errors", "poller" => name.clone())
                            .increment(1);
                        config.error_delay
                    }
                };

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            // Graceful stop: everything accepted is processed before exit.
            queue.complete().await;
            info!(poller = %name, "Poll loop stopped");
        })
    }
}
