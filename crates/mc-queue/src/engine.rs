//! Queue engine
//!
//! One worker set per started queue, each worker a poll loop leasing
//! ready messages. Within a priority class messages lease in enqueue
//! order; higher priority overtakes older lower-priority messages. A
//! worker that dies mid-message simply lets the lease expire, so the
//! message returns to the pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mc_common::{
    EnqueueOptions, Envelope, MercuryError, ProcessingResult, QueuedEnvelope, Result,
};
use mc_dispatch::{
    DeadLetterService, Dispatcher, ErrorAction, ErrorContext, ErrorHandler,
};
use mc_runtime::{PollLoop, PollLoopConfig, PollSource, WorkQueueConfig};
use mc_storage::Storage;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueWorkerConfig {
    /// Worker loops per queue.
    pub workers: usize,
    pub max_retries: u32,
    pub lease_duration: Duration,
    /// Messages leased per worker poll.
    pub batch_size: usize,
    pub poll: PollLoopConfig,
}

impl Default for QueueWorkerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            max_retries: 3,
            lease_duration: Duration::from_secs(30),
            batch_size: 10,
            poll: PollLoopConfig::default(),
        }
    }
}

struct RunningQueue {
    shutdown: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

pub struct QueueEngine {
    storage: Arc<dyn Storage>,
    dispatcher: Arc<Dispatcher>,
    dlq: Arc<DeadLetterService>,
    error_handler: Arc<dyn ErrorHandler>,
    default_config: QueueWorkerConfig,
    configs: DashMap<String, QueueWorkerConfig>,
    running: DashMap<String, RunningQueue>,
}

impl QueueEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        dispatcher: Arc<Dispatcher>,
        dlq: Arc<DeadLetterService>,
        error_handler: Arc<dyn ErrorHandler>,
        default_config: QueueWorkerConfig,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            dlq,
            error_handler,
            default_config,
            configs: DashMap::new(),
            running: DashMap::new(),
        }
    }

    /// Override the worker configuration for one queue.
    pub fn configure_queue(&self, queue_name: &str, config: QueueWorkerConfig) {
        self.configs.insert(queue_name.to_string(), config);
    }

    fn config_for(&self, queue_name: &str) -> QueueWorkerConfig {
        self.configs
            .get(queue_name)
            .map(|c| c.clone())
            .unwrap_or_else(|| self.default_config.clone())
    }

    /// Persist a message on the named queue.
    pub async fn enqueue(
        &self,
        envelope: Envelope,
        queue_name: &str,
        options: EnqueueOptions,
    ) -> Result<Uuid> {
        let mut message = QueuedEnvelope::new(envelope, queue_name);
        message.priority = options.priority;
        if let Some(delay) = options.delay {
            message.visible_at = message.enqueued_at
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::days(36500));
        }
        message.metadata = options.metadata;

        let message_id = message.envelope.message_id;
        debug!(
            queue = %queue_name,
            message_id = %message_id,
            priority = message.priority,
            visible_at = %message.visible_at,
            "Message enqueued"
        );
        metrics::counter!("mercury.queue.enqueued", "queue" => queue_name.to_string())
            .increment(1);

        self.storage
            .queues()
            .enqueue(message)
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))?;
        Ok(message_id)
    }

    pub fn is_running(&self, queue_name: &str) -> bool {
        self.running.contains_key(queue_name)
    }

    /// Launch the worker loops for a queue. Starting a running queue is
    /// a no-op.
    pub fn start_queue(&self, queue_name: &str) -> Result<()> {
        if self.running.contains_key(queue_name) {
            return Ok(());
        }

        let config = self.config_for(queue_name);
        let (shutdown, _) = broadcast::channel(1);

        let mut handles = Vec::with_capacity(config.workers.max(1));
        for worker_index in 0..config.workers.max(1) {
            let source = Arc::new(QueueWorkerSource {
                storage: Arc::clone(&self.storage),
                dispatcher: Arc::clone(&self.dispatcher),
                dlq: Arc::clone(&self.dlq),
                error_handler: Arc::clone(&self.error_handler),
                queue_name: queue_name.to_string(),
                config: config.clone(),
            });

            let mut poll_config = config.poll.clone();
            poll_config.work_queue = WorkQueueConfig::named(queue_name)
                .with_capacity(config.batch_size.max(1) * 2);

            handles.push(PollLoop::spawn(
                &format!("queue:{}:{}", queue_name, worker_index),
                source,
                poll_config,
                shutdown.clone(),
            ));
        }

        self.running.insert(
            queue_name.to_string(),
            RunningQueue { shutdown, handles },
        );
        info!(queue = %queue_name, workers = config.workers.max(1), "Queue started");
        Ok(())
    }

    /// Signal the workers and wait for in-flight messages to complete.
    pub async fn stop_queue(&self, queue_name: &str) -> Result<()> {
        let (_, running) = self
            .running
            .remove(queue_name)
            .ok_or_else(|| MercuryError::QueueDisabled(queue_name.to_string()))?;

        let _ = running.shutdown.send(());
        for handle in running.handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!(queue = %queue_name, error = %e, "Queue worker join failed");
                }
            }
        }
        info!(queue = %queue_name, "Queue stopped");
        Ok(())
    }

    /// Stop every running queue.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.running.iter().map(|e| e.key().clone()).collect();
        for name in names {
            let _ = self.stop_queue(&name).await;
        }
    }

    pub async fn depth(&self, queue_name: &str) -> Result<u64> {
        self.storage
            .queues()
            .depth(queue_name)
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))
    }

    pub async fn queue_names(&self) -> Result<Vec<String>> {
        self.storage
            .queues()
            .queue_names()
            .await
            .map_err(|e| MercuryError::StorageUnavailable(e.to_string()))
    }

    pub fn running_queues(&self) -> Vec<String> {
        self.running.iter().map(|e| e.key().clone()).collect()
    }
}

struct QueueWorkerSource {
    storage: Arc<dyn Storage>,
    dispatcher: Arc<Dispatcher>,
    dlq: Arc<DeadLetterService>,
    error_handler: Arc<dyn ErrorHandler>,
    queue_name: String,
    config: QueueWorkerConfig,
}

#[async_trait]
impl PollSource for QueueWorkerSource {
    type Item = QueuedEnvelope;

    async fn poll(&self) -> anyhow::Result<Vec<QueuedEnvelope>> {
        let leased = self
            .storage
            .queues()
            .lease_ready(
                &self.queue_name,
                self.config.batch_size,
                self.config.lease_duration,
            )
            .await?;
        Ok(leased)
    }

    async fn process(&self, message: QueuedEnvelope) -> anyhow::Result<()> {
        let lease_token = message
            .lease_token
            .ok_or_else(|| anyhow::anyhow!("leased message without token"))?;

        let outcome = self.dispatcher.dispatch(message.envelope.clone()).await;
        let failure = match outcome {
            Ok(ProcessingResult::Success(_)) => {
                self.storage
                    .queues()
                    .acknowledge(&self.queue_name, lease_token)
                    .await?;
                metrics::counter!("mercury.queue.processed", "queue" => self.queue_name.clone())
                    .increment(1);
                return Ok(());
            }
            Ok(ProcessingResult::Failure { error, .. }) => error,
            Err(error) => error,
        };

        let ctx = ErrorContext {
            component: format!("queue:{}", self.queue_name),
            attempt: message.attempt + 1,
            max_retries: self.config.max_retries,
            first_failure_at: None,
        };
        let action = self
            .error_handler
            .decide(&message.envelope, &failure, &ctx);

        match action {
            ErrorAction::Retry { delay } => {
                warn!(
                    queue = %self.queue_name,
                    message_id = %message.envelope.message_id,
                    attempt = ctx.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Message failed, requeueing"
                );
                metrics::counter!("mercury.queue.retries", "queue" => self.queue_name.clone())
                    .increment(1);
                self.storage
                    .queues()
                    .requeue(&self.queue_name, lease_token, delay)
                    .await?;
            }
            ErrorAction::DeadLetter { reason } => {
                warn!(
                    queue = %self.queue_name,
                    message_id = %message.envelope.message_id,
                    attempts = ctx.attempt,
                    reason = %reason,
                    "Message dead-lettered"
                );
                metrics::counter!("mercury.queue.dead_lettered", "queue" => self.queue_name.clone())
                    .increment(1);
                if let Some(taken) = self
                    .storage
                    .queues()
                    .take(&self.queue_name, lease_token)
                    .await?
                {
                    self.dlq
                        .send(
                            taken.envelope,
                            &reason,
                            &failure,
                            &ctx.component,
                            taken.attempt,
                        )
                        .await
                        .map_err(|e| anyhow::anyhow!(e))?;
                }
            }
            ErrorAction::Discard { reason } => {
                debug!(
                    queue = %self.queue_name,
                    message_id = %message.envelope.message_id,
                    reason = %reason,
                    "Message discarded"
                );
                self.storage
                    .queues()
                    .acknowledge(&self.queue_name, lease_token)
                    .await?;
            }
            ErrorAction::Escalate => {
                // Leave the message leased; the lease will expire and the
                // message returns to the pool for the next worker.
                warn!(
                    queue = %self.queue_name,
                    message_id = %message.envelope.message_id,
                    error = %failure,
                    "Escalated failure, leaving message for lease expiry"
                );
            }
        }
        Ok(())
    }
}
