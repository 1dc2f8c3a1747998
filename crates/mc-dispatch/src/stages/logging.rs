//! Logging stage
//!
//! Records start, success with duration, and failure with the error.
//! Never swallows anything: the inner result passes through untouched.

use std::time::Instant;

use async_trait::async_trait;
use mc_common::{Envelope, ProcessingContext, ProcessingResult};
use tracing::{debug, error, info};

use crate::pipeline::{Next, PipelineStage};

pub struct LoggingStage;

impl LoggingStage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LoggingStage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PipelineStage for LoggingStage {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn execute(
        &self,
        envelope: &Envelope,
        ctx: &ProcessingContext,
        next: Next,
    ) -> ProcessingResult {
        debug!(
            message_id = %envelope.message_id,
            message_type = %envelope.message_type,
            kind = %envelope.kind,
            component = %ctx.component(),
            "Processing message"
        );

        let start = Instant::now();
        let result = next.run(envelope, ctx).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match &result {
            ProcessingResult::Success(_) => {
                info!(
                    message_id = %envelope.message_id,
                    message_type = %envelope.message_type,
                    duration_ms = duration_ms,
                    "Message processed"
                );
                metrics::histogram!("mercury.dispatch.duration_ms").record(duration_ms as f64);
            }
            ProcessingResult::Failure { error, message } => {
                error!(
                    message_id = %envelope.message_id,
                    message_type = %envelope.message_type,
                    duration_ms = duration_ms,
                    error = %error,
                    detail = ?message,
                    "Message processing failed"
                );
                metrics::counter!("mercury.dispatch.failures", "kind" => error.kind())
                    .increment(1);
            }
        }

        result
    }
}
