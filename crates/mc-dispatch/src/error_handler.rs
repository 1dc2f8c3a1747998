//! Failure classification
//!
//! After the pipeline reports a failure, the owning component (queue
//! worker, outbox dispatcher, inbox) asks the error handler what to do
//! with the message: retry later, dead-letter, discard, or escalate.

use std::time::Duration;

use chrono::{DateTime, Utc};
use mc_common::{Envelope, ErrorClass, MercuryError};

/// What to do with a failed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorAction {
    Retry { delay: Duration },
    DeadLetter { reason: String },
    Discard { reason: String },
    /// Propagate to the caller immediately.
    Escalate,
}

/// Failure context handed to the decision.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub component: String,
    /// Attempts already made, including the one that just failed.
    pub attempt: u32,
    pub max_retries: u32,
    pub first_failure_at: Option<DateTime<Utc>>,
}

pub trait ErrorHandler: Send + Sync {
    fn decide(&self, envelope: &Envelope, error: &MercuryError, ctx: &ErrorContext)
        -> ErrorAction;
}

/// Policy from the classification table: transient errors retry with
/// exponential backoff, permanent errors dead-letter (duplicates are
/// discarded), programmatic faults retry then dead-letter, fatal errors
/// escalate.
pub struct DefaultErrorHandler {
    base_delay: Duration,
    max_delay: Duration,
}

impl DefaultErrorHandler {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1).min(16));
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }
}

impl Default for DefaultErrorHandler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(300))
    }
}

impl ErrorHandler for DefaultErrorHandler {
    fn decide(
        &self,
        _envelope: &Envelope,
        error: &MercuryError,
        ctx: &ErrorContext,
    ) -> ErrorAction {
        match error.class() {
            ErrorClass::Fatal => ErrorAction::Escalate,
            ErrorClass::Transient | ErrorClass::Programmatic => {
                if ctx.attempt <= ctx.max_retries {
                    ErrorAction::Retry {
                        delay: self.backoff(ctx.attempt),
                    }
                } else {
                    ErrorAction::DeadLetter {
                        reason: format!("retries exhausted after {} attempts", ctx.attempt),
                    }
                }
            }
            ErrorClass::Permanent => match error {
                MercuryError::DuplicateMessage { .. } => ErrorAction::Discard {
                    reason: "duplicate message".to_string(),
                },
                _ => ErrorAction::DeadLetter {
                    reason: error.kind().to_string(),
                },
            },
        }
    }
}
