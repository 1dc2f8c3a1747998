//! Idempotency stage
//!
//! Generates a stable key for the envelope, consults the cache, and on a
//! hit returns the cached success payload or rehydrates the cached
//! failure without invoking the handler. On a miss the inner chain runs
//! and its outcome is stored per policy. Events are exempt: fan-out has
//! no single response to cache, and ingress dedup is the inbox's job.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mc_common::{
    Envelope, IdempotencyStatus, MercuryError, MessageKind, ProcessingContext, ProcessingResult,
};
use mc_storage::IdempotencyStore;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::pipeline::{Next, PipelineStage};

/// Derives the cache key for an envelope.
pub trait IdempotencyKeyGenerator: Send + Sync {
    fn key(&self, envelope: &Envelope) -> String;
}

/// SHA-256 over type tag, message id, and body.
pub struct DefaultKeyGenerator;

impl IdempotencyKeyGenerator for DefaultKeyGenerator {
    fn key(&self, envelope: &Envelope) -> String {
        let mut hasher = Sha256::new();
        hasher.update(envelope.message_type.as_bytes());
        hasher.update(envelope.message_id.as_bytes());
        hasher.update(envelope.body.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Clone)]
pub struct IdempotencyPolicy {
    pub key_generator: Arc<dyn IdempotencyKeyGenerator>,
    pub success_ttl: Duration,
    pub failure_ttl: Duration,
    pub cache_failures: bool,
}

impl Default for IdempotencyPolicy {
    fn default() -> Self {
        Self {
            key_generator: Arc::new(DefaultKeyGenerator),
            success_ttl: Duration::from_secs(24 * 3600),
            failure_ttl: Duration::from_secs(3600),
            cache_failures: false,
        }
    }
}

pub struct IdempotencyStage {
    store: Arc<dyn IdempotencyStore>,
    policy: IdempotencyPolicy,
}

impl IdempotencyStage {
    pub fn new(store: Arc<dyn IdempotencyStore>, policy: IdempotencyPolicy) -> Self {
        Self { store, policy }
    }

    /// Best-effort rehydration of a cached failure into its error kind.
    fn rehydrate(kind: Option<&str>, message: Option<&str>) -> MercuryError {
        let message = message.unwrap_or("cached failure").to_string();
        match kind {
            Some("validation_failed") => MercuryError::ValidationFailed(message),
            Some("handler_missing") => MercuryError::HandlerMissing(message),
            Some("signature_invalid") => MercuryError::SignatureInvalid(message),
            Some("timeout") => MercuryError::Timeout,
            Some("transport_unavailable") => MercuryError::TransportUnavailable(message),
            Some("storage_unavailable") => MercuryError::StorageUnavailable(message),
            Some("internal") => MercuryError::Internal(message),
            _ => MercuryError::Handler(message),
        }
    }
}

#[async_trait]
impl PipelineStage for IdempotencyStage {
    fn name(&self) -> &'static str {
        "idempotency"
    }

    async fn execute(
        &self,
        envelope: &Envelope,
        ctx: &ProcessingContext,
        next: Next,
    ) -> ProcessingResult {
        if envelope.kind == MessageKind::Event {
            return next.run(envelope, ctx).await;
        }

        let key = self.policy.key_generator.key(envelope);

        match self.store.get(&key).await {
            Ok(Some(cached)) => {
                debug!(
                    message_id = %envelope.message_id,
                    key = %key,
                    status = ?cached.status,
                    "Idempotency cache hit, handler skipped"
                );
                metrics::counter!("mercury.idempotency.hits").increment(1);
                return match cached.status {
                    IdempotencyStatus::Success => ProcessingResult::Success(cached.success_data),
                    IdempotencyStatus::Failure => ProcessingResult::failure(Self::rehydrate(
                        cached.failure_kind.as_deref(),
                        cached.failure_message.as_deref(),
                    )),
                };
            }
            Ok(None) => {}
            Err(e) => {
                // A broken cache must not block processing.
                warn!(key = %key, error = %e, "Idempotency store read failed");
            }
        }

        let result = next.run(envelope, ctx).await;

        match &result {
            ProcessingResult::Success(data) => {
                if let Err(e) = self
                    .store
                    .store_success(&key, data.clone(), self.policy.success_ttl)
                    .await
                {
                    warn!(key = %key, error = %e, "Failed to cache success response");
                }
            }
            ProcessingResult::Failure { error, message } => {
                // Cancellation is not an outcome worth caching.
                if self.policy.cache_failures
                    && !matches!(error, MercuryError::Cancelled)
                {
                    let detail = message.clone().unwrap_or_else(|| error.to_string());
                    if let Err(e) = self
                        .store
                        .store_failure(&key, error.kind(), &detail, self.policy.failure_ttl)
                        .await
                    {
                        warn!(key = %key, error = %e, "Failed to cache failure response");
                    }
                }
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ErasedHandler;
    use crate::Pipeline;
    use mc_storage::MemoryIdempotencyStore;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Serialize, Deserialize)]
    struct Charge {
        amount: f64,
    }

    impl mc_common::CommandMessage for Charge {
        type Response = String;

        fn message_type() -> &'static str {
            "test.charge"
        }
    }

    struct CountingHandler {
        invocations: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl ErasedHandler for CountingHandler {
        fn handler_name(&self) -> &str {
            "counting"
        }

        async fn invoke(
            &self,
            _envelope: &Envelope,
            _ctx: &ProcessingContext,
        ) -> ProcessingResult {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                ProcessingResult::failure(MercuryError::handler("boom"))
            } else {
                ProcessingResult::success_with(serde_json::json!("charged"))
            }
        }
    }

    fn stage(policy: IdempotencyPolicy) -> (Pipeline, Arc<MemoryIdempotencyStore>) {
        let store = Arc::new(MemoryIdempotencyStore::new());
        let pipeline = Pipeline::new(vec![Arc::new(IdempotencyStage::new(
            Arc::clone(&store) as Arc<dyn IdempotencyStore>,
            policy,
        ))]);
        (pipeline, store)
    }

    #[tokio::test]
    async fn duplicate_key_returns_cached_success_without_invoking() {
        let (pipeline, _store) = stage(IdempotencyPolicy::default());
        let handler = Arc::new(CountingHandler {
            invocations: AtomicU32::new(0),
            fail: false,
        });
        let envelope = Envelope::command(&Charge { amount: 5.0 }).unwrap();
        let ctx = ProcessingContext::new("test");

        let first = pipeline
            .execute(&envelope, &ctx, Arc::clone(&handler) as Arc<dyn ErasedHandler>)
            .await;
        let second = pipeline
            .execute(&envelope, &ctx, Arc::clone(&handler) as Arc<dyn ErasedHandler>)
            .await;

        assert_eq!(first.data(), second.data());
        assert_eq!(handler.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_cached_only_when_policy_allows() {
        let policy = IdempotencyPolicy {
            cache_failures: true,
            ..Default::default()
        };
        let (pipeline, _store) = stage(policy);
        let handler = Arc::new(CountingHandler {
            invocations: AtomicU32::new(0),
            fail: true,
        });
        let envelope = Envelope::command(&Charge { amount: 5.0 }).unwrap();
        let ctx = ProcessingContext::new("test");

        for _ in 0..2 {
            let result = pipeline
                .execute(&envelope, &ctx, Arc::clone(&handler) as Arc<dyn ErasedHandler>)
                .await;
            assert!(matches!(result.error(), Some(MercuryError::Handler(_))));
        }
        assert_eq!(handler.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_not_cached_by_default() {
        let (pipeline, _store) = stage(IdempotencyPolicy::default());
        let handler = Arc::new(CountingHandler {
            invocations: AtomicU32::new(0),
            fail: true,
        });
        let envelope = Envelope::command(&Charge { amount: 5.0 }).unwrap();
        let ctx = ProcessingContext::new("test");

        for _ in 0..2 {
            pipeline
                .execute(&envelope, &ctx, Arc::clone(&handler) as Arc<dyn ErasedHandler>)
                .await;
        }
        assert_eq!(handler.invocations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn default_key_is_stable_and_payload_sensitive() {
        let generator = DefaultKeyGenerator;
        let envelope = Envelope::command(&Charge { amount: 5.0 }).unwrap();

        assert_eq!(generator.key(&envelope), generator.key(&envelope));

        let mut other = envelope.clone();
        other.body = serde_json::json!({"amount": 6.0});
        assert_ne!(generator.key(&envelope), generator.key(&other));
    }
}
