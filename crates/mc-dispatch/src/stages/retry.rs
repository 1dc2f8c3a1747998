//! Retry stage
//!
//! Re-runs the inner chain for transient failures only, up to the
//! configured attempt limit, sleeping a fixed or exponentially growing
//! delay (with optional jitter) between attempts. The original error is
//! preserved on final failure; cancellation is never retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mc_common::{Envelope, MercuryError, ProcessingConfig, ProcessingContext, ProcessingResult};
use rand::Rng;
use tracing::debug;

use crate::pipeline::{Next, PipelineStage};

#[derive(Debug, Clone)]
pub enum RetryDelay {
    Fixed(Duration),
    ExponentialBackoff {
        initial: Duration,
        multiplier: f64,
        max: Duration,
        jitter: bool,
    },
}

impl RetryDelay {
    /// Delay before retrying after the given zero-based attempt.
    pub fn for_attempt(&self, attempt: u32) -> Duration {
        match self {
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::ExponentialBackoff {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                let factor = multiplier.powi(attempt as i32);
                let raw = initial.as_millis() as f64 * factor;
                let capped = raw.min(max.as_millis() as f64);
                let millis = if *jitter {
                    // Half fixed, half random, so retries de-synchronize.
                    let half = capped / 2.0;
                    half + rand::thread_rng().gen_range(0.0..=half)
                } else {
                    capped
                };
                Duration::from_millis(millis as u64)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: RetryDelay,
}

impl RetryPolicy {
    pub fn from_processing_config(config: &ProcessingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: RetryDelay::ExponentialBackoff {
                initial: config.retry_delay,
                multiplier: 2.0,
                max: Duration::from_secs(60),
                jitter: true,
            },
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: RetryDelay::Fixed(Duration::ZERO),
        }
    }
}

pub struct RetryStage {
    policy: RetryPolicy,
    retried: Option<Arc<AtomicU64>>,
}

impl RetryStage {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retried: None,
        }
    }

    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.retried = Some(counter);
        self
    }
}

#[async_trait]
impl PipelineStage for RetryStage {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn execute(
        &self,
        envelope: &Envelope,
        ctx: &ProcessingContext,
        next: Next,
    ) -> ProcessingResult {
        let mut attempt: u32 = 0;

        loop {
            if let Err(error) = ctx.check_live() {
                return ProcessingResult::failure(error);
            }

            let attempt_ctx = ctx.with_retry_count(attempt);
            let result = next.run(envelope, &attempt_ctx).await;

            let error = match &result {
                ProcessingResult::Success(_) => return result,
                ProcessingResult::Failure { error, .. } => error,
            };

            if matches!(error, MercuryError::Cancelled) {
                return result;
            }
            if attempt >= self.policy.max_retries || !error.is_transient() {
                return result;
            }

            let delay = self.policy.delay.for_attempt(attempt);
            attempt += 1;
            debug!(
                message_id = %envelope.message_id,
                message_type = %envelope.message_type,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient failure"
            );
            metrics::counter!("mercury.retry.attempts").increment(1);
            if let Some(counter) = &self.retried {
                counter.fetch_add(1, Ordering::Relaxed);
            }

            tokio::select! {
                _ = ctx.cancel_token().cancelled() => {
                    return ProcessingResult::failure(MercuryError::Cancelled);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
